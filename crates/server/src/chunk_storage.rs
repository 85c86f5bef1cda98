//! Chunk storage for one world dimension.
//!
//! Reads go through the I/O worker and are then migrated to the current data
//! version on the caller's task. Writes are never migrated: whatever the
//! simulation hands back is already current.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use regionstore_engine::migration::ChunkUpgrader;
use regionstore_engine::storage::region_cache::RegionCache;
use regionstore_engine::{ChunkPos, Document, RegionPos, StorageConfig, StorageError};

use crate::io_worker::IoWorker;

pub struct ChunkStorage {
    world: PathBuf,
    config: StorageConfig,
    worker: IoWorker,
    upgrader: Arc<ChunkUpgrader>,
}

impl ChunkStorage {
    /// Open storage for `world` with the built-in fixes and legacy structure
    /// index. Must be called inside a tokio runtime.
    pub fn open(world: impl Into<PathBuf>, config: StorageConfig) -> Self {
        let world = world.into();
        let upgrader = ChunkUpgrader::standard(&world, &config);
        Self::with_upgrader(world, config, upgrader)
    }

    pub fn with_upgrader(world: impl Into<PathBuf>, config: StorageConfig, upgrader: ChunkUpgrader) -> Self {
        let world = world.into();
        let cache = RegionCache::new(config.region_path(&world), &config);
        tracing::info!(
            "Opened chunk storage at {} ({}, up to {} open regions)",
            cache.dir().display(),
            config.dimension,
            cache.capacity()
        );
        Self {
            world,
            config,
            worker: IoWorker::spawn(cache),
            upgrader: Arc::new(upgrader),
        }
    }

    pub fn world(&self) -> &Path {
        &self.world
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn region_dir(&self) -> PathBuf {
        self.config.region_path(&self.world)
    }

    pub fn worker(&self) -> &IoWorker {
        &self.worker
    }

    pub fn upgrader(&self) -> &Arc<ChunkUpgrader> {
        &self.upgrader
    }

    /// Read a chunk and bring it up to the current data version.
    pub async fn read(&self, pos: ChunkPos) -> Result<Option<Document>, StorageError> {
        match self.worker.load(pos).await? {
            Some(raw) => self.upgrader.upgrade(pos, raw).map(Some),
            None => Ok(None),
        }
    }

    /// Read a chunk exactly as stored.
    pub async fn read_raw(&self, pos: ChunkPos) -> Result<Option<Document>, StorageError> {
        self.worker.load(pos).await
    }

    /// Queue `doc` for writing. The chunk's legacy structure data, if any, is
    /// considered handled from here on.
    pub async fn write(&self, pos: ChunkPos, doc: Document) -> Result<(), StorageError> {
        self.upgrader.forget_legacy(pos);
        self.worker.store(pos, Some(doc)).await
    }

    pub async fn delete(&self, pos: ChunkPos) -> Result<(), StorageError> {
        self.worker.store(pos, None).await
    }

    /// Chunks stored in `region`.
    pub async fn chunks_in(&self, region: RegionPos) -> Result<Vec<ChunkPos>, StorageError> {
        self.worker.chunks(region).await
    }

    /// Region files present on disk.
    pub fn regions(&self) -> Result<Vec<RegionPos>, StorageError> {
        let dir = self.region_dir();
        RegionCache::list_regions(&dir, &self.config.extension).map_err(|e| StorageError::io(&dir, e))
    }

    /// Write out every queued store and sync open region files.
    pub async fn flush(&self) -> Result<(), StorageError> {
        self.worker.synchronize(true).await
    }

    /// Drain queued stores, then close every region file.
    pub async fn close(&self) -> Result<(), StorageError> {
        self.worker.close().await?;
        tracing::info!("Closed chunk storage at {}", self.region_dir().display());
        Ok(())
    }
}
