//! Force-upgrade every stored chunk of a world to the current data version.
//!
//! Region by region: raw documents are loaded through the I/O worker,
//! migrated in parallel on the rayon pool, and stored back. A chunk that
//! fails to load or migrate is recorded in the report and skipped.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use regionstore_engine::{ChunkPos, Document, StorageError};
use serde::Serialize;

use crate::chunk_storage::ChunkStorage;

#[derive(Debug, Clone, Serialize)]
pub struct FailedChunk {
    pub x: i32,
    pub z: i32,
    pub corrupt: bool,
    pub error: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct UpgradeReport {
    pub regions: usize,
    pub chunks: usize,
    pub upgraded: usize,
    pub already_current: usize,
    pub failed: Vec<FailedChunk>,
    pub elapsed_ms: u64,
}

impl UpgradeReport {
    fn fail(&mut self, pos: ChunkPos, err: &StorageError) {
        tracing::warn!("Skipping chunk [{}, {}]: {}", pos.x, pos.z, err);
        self.failed.push(FailedChunk {
            x: pos.x,
            z: pos.z,
            corrupt: err.is_corruption(),
            error: err.to_string(),
        });
    }
}

pub async fn upgrade_world(storage: &ChunkStorage) -> Result<UpgradeReport> {
    let start = Instant::now();
    let current = storage.upgrader().current_version();
    let regions = storage.regions().context("listing region files")?;
    let mut report = UpgradeReport {
        regions: regions.len(),
        ..UpgradeReport::default()
    };
    tracing::info!(
        "Upgrading {} regions in {} to data version {}",
        regions.len(),
        storage.region_dir().display(),
        current
    );

    for (i, region) in regions.iter().enumerate() {
        let positions = storage
            .chunks_in(*region)
            .await
            .with_context(|| format!("listing chunks of r.{}.{}", region.x, region.z))?;

        // Queue every load before awaiting any of them.
        let loads: Vec<_> = positions
            .iter()
            .map(|&pos| (pos, storage.worker().load(pos)))
            .collect();
        let mut stale: Vec<(ChunkPos, Document)> = Vec::new();
        for (pos, load) in loads {
            report.chunks += 1;
            match load.await {
                Ok(Some(doc)) if doc.data_version().is_some_and(|v| v >= current) => {
                    report.already_current += 1;
                }
                Ok(Some(doc)) => stale.push((pos, doc)),
                Ok(None) => report.chunks -= 1,
                Err(e) => report.fail(pos, &e),
            }
        }

        let upgrader = Arc::clone(storage.upgrader());
        let results = tokio::task::spawn_blocking(move || upgrader.upgrade_many(stale))
            .await
            .context("migration task panicked")?;

        let mut stores = Vec::with_capacity(results.len());
        for (pos, result) in results {
            match result {
                Ok(doc) => {
                    storage.upgrader().forget_legacy(pos);
                    stores.push((pos, storage.worker().store(pos, Some(doc))));
                }
                Err(e) => report.fail(pos, &e),
            }
        }
        for (pos, store) in stores {
            match store.await {
                Ok(()) => report.upgraded += 1,
                Err(e) => report.fail(pos, &e),
            }
        }

        tracing::info!(
            "Region r.{}.{} done ({}/{}): {} chunks upgraded so far",
            region.x,
            region.z,
            i + 1,
            regions.len(),
            report.upgraded
        );
    }

    storage.flush().await.context("flushing upgraded regions")?;
    report.elapsed_ms = start.elapsed().as_millis() as u64;
    tracing::info!(
        "World upgrade complete: {} chunks, {} upgraded, {} already current, {} failed ({} ms)",
        report.chunks,
        report.upgraded,
        report.already_current,
        report.failed.len(),
        report.elapsed_ms
    );
    Ok(report)
}
