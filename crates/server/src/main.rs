use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use regionstore_engine::migration::legacy::LEGACY_STRUCTURE_FLAG;
use regionstore_engine::{ChunkPos, StorageConfig};
use regionstore_server::chunk_storage::ChunkStorage;
use regionstore_server::{converter, world_upgrader};
use serde::Serialize;

const USAGE: &str = "usage: regionstore <info|read|upgrade|convert> [--world DIR] [--config FILE] \
                     [--max-open N] [--chunk X Z] [--json]";

#[tokio::main]
async fn main() -> Result<()> {
    let command = std::env::args().nth(1).unwrap_or_else(|| "info".into());
    let world_dir: PathBuf = arg_value("--world").unwrap_or_else(|| "world".into()).into();
    let json = std::env::args().any(|a| a == "--json");

    // Logs go to stderr so `--json` output on stdout stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config()?;

    match command.as_str() {
        "info" => info(&world_dir, config, json).await,
        "read" => read(&world_dir, config, json).await,
        "upgrade" => upgrade(&world_dir, config, json).await,
        "convert" => convert(world_dir, config, json).await,
        "--help" | "-h" | "help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("unknown command '{}'\n{}", other, USAGE),
    }
}

fn arg_value(flag: &str) -> Option<String> {
    std::env::args().skip_while(|a| a != flag).nth(1)
}

/// Defaults, then `--config <file>` (JSON), then command-line overrides.
fn load_config() -> Result<StorageConfig> {
    let mut config = match arg_value("--config") {
        Some(path) => {
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading config {}", path))?;
            serde_json::from_str(&text).with_context(|| format!("parsing config {}", path))?
        }
        None => StorageConfig::default(),
    };
    if let Some(max_open) = arg_value("--max-open") {
        config.max_open_regions = max_open
            .parse()
            .with_context(|| format!("invalid --max-open value '{}'", max_open))?;
    }
    Ok(config)
}

fn chunk_arg() -> Result<ChunkPos> {
    let coords: Vec<String> = std::env::args().skip_while(|a| a != "--chunk").skip(1).take(2).collect();
    let [x, z] = coords.as_slice() else {
        bail!("read needs --chunk X Z");
    };
    let x: i32 = x.parse().with_context(|| format!("invalid chunk x '{}'", x))?;
    let z: i32 = z.parse().with_context(|| format!("invalid chunk z '{}'", z))?;
    Ok(ChunkPos::new(x, z))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("rendering JSON")?);
    Ok(())
}

#[derive(Debug, Default, Serialize)]
struct WorldInfo {
    regions: usize,
    chunks: usize,
    /// Stored data versions; `none` for chunks without one.
    data_versions: BTreeMap<String, usize>,
    legacy_structure_chunks: usize,
    unreadable: usize,
}

async fn info(world: &Path, config: StorageConfig, json: bool) -> Result<()> {
    let storage = ChunkStorage::open(world, config);
    let mut info = WorldInfo::default();
    let regions = storage.regions().context("listing region files")?;
    info.regions = regions.len();

    for region in regions {
        let positions = storage
            .chunks_in(region)
            .await
            .with_context(|| format!("listing chunks of r.{}.{}", region.x, region.z))?;
        for pos in positions {
            info.chunks += 1;
            match storage.read_raw(pos).await {
                Ok(Some(doc)) => {
                    let version = doc.data_version().map_or_else(|| "none".to_string(), |v| v.to_string());
                    *info.data_versions.entry(version).or_default() += 1;
                    let legacy = doc
                        .compound("Level")
                        .is_some_and(|level| level.contains_key(LEGACY_STRUCTURE_FLAG));
                    if legacy {
                        info.legacy_structure_chunks += 1;
                    }
                }
                Ok(None) => info.chunks -= 1,
                Err(e) => {
                    tracing::warn!("Chunk [{}, {}] is unreadable: {}", pos.x, pos.z, e);
                    info.unreadable += 1;
                }
            }
        }
    }
    storage.close().await.context("closing storage")?;

    if json {
        return print_json(&info);
    }
    tracing::info!("World {}", world.display());
    tracing::info!("  {} regions, {} chunks ({} unreadable)", info.regions, info.chunks, info.unreadable);
    for (version, count) in &info.data_versions {
        tracing::info!("  data version {}: {} chunks", version, count);
    }
    if info.legacy_structure_chunks > 0 {
        tracing::info!("  {} chunks still carry legacy structure data", info.legacy_structure_chunks);
    }
    Ok(())
}

async fn read(world: &Path, config: StorageConfig, json: bool) -> Result<()> {
    let pos = chunk_arg()?;
    let storage = ChunkStorage::open(world, config);
    let doc = storage
        .read(pos)
        .await
        .with_context(|| format!("reading chunk [{}, {}]", pos.x, pos.z));
    storage.close().await.context("closing storage")?;

    let Some(doc) = doc? else {
        bail!("chunk [{}, {}] is not stored", pos.x, pos.z);
    };
    if json {
        print_json(doc.root())
    } else {
        println!("{:#?}", doc.root());
        Ok(())
    }
}

async fn upgrade(world: &Path, config: StorageConfig, json: bool) -> Result<()> {
    let storage = ChunkStorage::open(world, config);
    let report = world_upgrader::upgrade_world(&storage).await;
    storage.close().await.context("closing storage")?;
    let report = report?;
    if json {
        print_json(&report)?;
    }
    Ok(())
}

async fn convert(world: PathBuf, config: StorageConfig, json: bool) -> Result<()> {
    let report = tokio::task::spawn_blocking(move || converter::convert_world(&world, &config))
        .await
        .context("conversion task panicked")??;
    if json {
        print_json(&report)?;
    }
    Ok(())
}
