use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::storage::codec::CodecId;

/// Upper bound on simultaneously open region files.
pub const MAX_OPEN_REGIONS: usize = 256;

/// Storage settings for one world dimension.
///
/// Every field has a default, so a config file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Region files, relative to the world directory.
    pub region_dir: PathBuf,
    /// Saved data (legacy structure files), relative to the world directory.
    pub data_dir: PathBuf,
    /// Region file extension: `mca` for Anvil, `mcr` for McRegion.
    pub extension: String,
    pub max_open_regions: usize,
    /// Codec used for newly written records.
    pub codec: CodecId,
    /// `fsync` each record as it is written.
    pub sync_writes: bool,
    pub dimension: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            region_dir: PathBuf::from("region"),
            data_dir: PathBuf::from("data"),
            extension: "mca".into(),
            max_open_regions: MAX_OPEN_REGIONS,
            codec: CodecId::DEFLATE,
            sync_writes: false,
            dimension: "minecraft:overworld".into(),
        }
    }
}

impl StorageConfig {
    pub fn region_path(&self, world: &Path) -> PathBuf {
        world.join(&self.region_dir)
    }

    pub fn data_path(&self, world: &Path) -> PathBuf {
        world.join(&self.data_dir)
    }
}
