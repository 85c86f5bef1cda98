//! McRegion (`.mcr`) to Anvil (`.mca`) world conversion.
//!
//! Each McRegion file is converted into the Anvil file with the same region
//! coordinates, in parallel across regions. Converted chunks carry no data
//! version, so they are migrated from the oldest supported version the first
//! time they are read.

use std::io::Read;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use rayon::prelude::*;
use regionstore_engine::migration::old_chunk;
use regionstore_engine::storage::region_cache::RegionCache;
use regionstore_engine::storage::region_file::RegionFile;
use regionstore_engine::{Document, RegionPos, StorageConfig};
use serde::Serialize;

pub const MCREGION_EXTENSION: &str = "mcr";

#[derive(Debug, Default, Clone, Serialize)]
pub struct ConversionReport {
    pub regions: usize,
    pub chunks: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

impl ConversionReport {
    fn merge(mut self, other: Self) -> Self {
        self.regions += other.regions;
        self.chunks += other.chunks;
        self.failed += other.failed;
        self
    }
}

/// Convert every McRegion file in the world's region directory.
pub fn convert_world(world: &Path, config: &StorageConfig) -> Result<ConversionReport> {
    let start = Instant::now();
    let dir = config.region_path(world);
    let regions = RegionCache::list_regions(&dir, MCREGION_EXTENSION)
        .with_context(|| format!("listing McRegion files in {}", dir.display()))?;
    if regions.is_empty() {
        tracing::info!("No McRegion files found in {}", dir.display());
        return Ok(ConversionReport::default());
    }
    tracing::info!("Converting {} McRegion files in {}", regions.len(), dir.display());

    let mut report = regions
        .par_iter()
        .map(|&region| convert_region(&dir, region, config))
        .try_reduce(ConversionReport::default, |a, b| Ok(a.merge(b)))?;
    report.elapsed_ms = start.elapsed().as_millis() as u64;
    tracing::info!(
        "Conversion complete: {} chunks in {} regions, {} failed ({} ms)",
        report.chunks,
        report.regions,
        report.failed,
        report.elapsed_ms
    );
    Ok(report)
}

fn convert_region(dir: &Path, region: RegionPos, config: &StorageConfig) -> Result<ConversionReport> {
    let source_path = dir.join(region.file_name(MCREGION_EXTENSION));
    let target_path = dir.join(region.file_name(&config.extension));
    let mut source = RegionFile::open(region, &source_path, config.codec, false)
        .with_context(|| format!("opening {}", source_path.display()))?;
    let mut target = RegionFile::open(region, &target_path, config.codec, config.sync_writes)
        .with_context(|| format!("opening {}", target_path.display()))?;

    let mut report = ConversionReport {
        regions: 1,
        ..ConversionReport::default()
    };
    for pos in source.chunks() {
        let converted = source
            .read(pos)
            .map_err(anyhow::Error::from)
            .and_then(|stream| {
                let mut nbt = Vec::new();
                if let Some(mut stream) = stream {
                    stream.read_to_end(&mut nbt)?;
                }
                let doc = Document::from_nbt(&nbt)?;
                Ok(old_chunk::convert_to_anvil(&doc)?.to_nbt()?)
            });
        match converted {
            Ok(nbt) => {
                target
                    .write(pos, &nbt)
                    .with_context(|| format!("writing chunk [{}, {}]", pos.x, pos.z))?;
                report.chunks += 1;
            }
            Err(e) => {
                tracing::warn!("Skipping McRegion chunk [{}, {}]: {:#}", pos.x, pos.z, e);
                report.failed += 1;
            }
        }
    }

    source.close().with_context(|| format!("closing {}", source_path.display()))?;
    target.close().with_context(|| format!("closing {}", target_path.display()))?;
    tracing::debug!("Converted r.{}.{}: {} chunks", region.x, region.z, report.chunks);
    Ok(report)
}
