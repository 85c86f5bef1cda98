//! Chunk storage core: region files, record codecs and the read-side schema
//! migration pipeline.
//!
//! This crate is synchronous. Sequencing disk access belongs to the caller
//! (see the server crate's I/O worker).

pub mod config;
pub mod document;
pub mod error;
pub mod migration;
pub mod storage;
pub mod world;

pub use config::StorageConfig;
pub use document::Document;
pub use error::{MigrationError, StorageError};
pub use world::position::{ChunkPos, RegionPos};
