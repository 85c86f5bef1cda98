//! Async chunk storage service and world maintenance tools on top of
//! `regionstore-engine`.

pub mod chunk_storage;
pub mod converter;
pub mod io_worker;
pub mod world_upgrader;
