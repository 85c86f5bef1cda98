pub mod codec;
pub mod region_cache;
pub mod region_file;
