//! End-to-end storage tests: documents go through the I/O worker into real
//! region files and come back migrated.

use std::path::Path;

use fastnbt::{IntArray, Value};
use regionstore_engine::document::{Compound, as_compound};
use regionstore_engine::migration::legacy::LEGACY_STRUCTURE_FLAG;
use regionstore_engine::migration::{CURRENT_DATA_VERSION, LEGACY_STRUCTURE_DATA_VERSION};
use regionstore_engine::storage::codec;
use regionstore_engine::{ChunkPos, Document, StorageConfig, StorageError};
use regionstore_server::chunk_storage::ChunkStorage;
use regionstore_server::world_upgrader;

fn legacy_chunk(pos: ChunkPos, version: i32) -> Document {
    let mut level = Compound::new();
    level.insert("xPos".into(), Value::Int(pos.x));
    level.insert("zPos".into(), Value::Int(pos.z));
    level.insert("TerrainPopulated".into(), Value::Byte(1));
    level.insert("Sections".into(), Value::List(Vec::new()));
    level.insert(LEGACY_STRUCTURE_FLAG.into(), Value::Byte(1));
    let mut doc = Document::new();
    doc.set_data_version(version);
    doc.insert("Level", Value::Compound(level));
    doc
}

fn current_chunk(pos: ChunkPos, marker: i32) -> Document {
    let mut doc = Document::new();
    doc.set_data_version(CURRENT_DATA_VERSION);
    doc.insert("xPos", Value::Int(pos.x));
    doc.insert("zPos", Value::Int(pos.z));
    doc.insert("Status", Value::String("minecraft:full".into()));
    doc.insert("marker", Value::Int(marker));
    doc
}

/// `data/Village.dat` with one village starting in chunk (3, 7).
fn write_village_data(world: &Path) {
    let mut start = Compound::new();
    start.insert("id".into(), Value::String("Village".into()));
    start.insert("ChunkX".into(), Value::Int(3));
    start.insert("ChunkZ".into(), Value::Int(7));
    start.insert("BB".into(), Value::IntArray(IntArray::new(vec![48, 60, 112, 79, 80, 127])));
    let mut features = Compound::new();
    features.insert("[3,7]".into(), Value::Compound(start));
    let mut data = Compound::new();
    data.insert("Features".into(), Value::Compound(features));
    let mut doc = Document::new();
    doc.insert("data", Value::Compound(data));

    let dir = world.join("data");
    std::fs::create_dir_all(&dir).unwrap();
    let bytes = codec::GZIP.encode(&doc.to_nbt().unwrap()).unwrap();
    std::fs::write(dir.join("Village.dat"), bytes).unwrap();
}

// ---------------------------------------------------------------------------
// Read path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn legacy_chunk_reads_back_current() {
    let world = tempfile::tempdir().unwrap();
    let storage = ChunkStorage::open(world.path(), StorageConfig::default());
    let pos = ChunkPos::new(3, 7);

    storage.write(pos, legacy_chunk(pos, 1200)).await.unwrap();
    let doc = storage.read(pos).await.unwrap().expect("chunk stored");

    assert_eq!(doc.data_version(), Some(CURRENT_DATA_VERSION));
    assert!(doc.get(LEGACY_STRUCTURE_FLAG).is_none());
    assert!(doc.get("Level").is_none());
    assert!(doc.get("__context").is_none());
    assert_eq!(doc.get("Status"), Some(&Value::String("minecraft:full".into())));

    // The stored bytes are untouched until the chunk is written back.
    let raw = storage.read_raw(pos).await.unwrap().unwrap();
    assert_eq!(raw.data_version(), Some(1200));
    storage.close().await.unwrap();
}

#[tokio::test]
async fn bare_legacy_chunk_reads_back_current() {
    let world = tempfile::tempdir().unwrap();
    write_village_data(world.path());
    let storage = ChunkStorage::open(world.path(), StorageConfig::default());
    let pos = ChunkPos::new(3, 7);

    // Only a version and the flag; the position comes from the tile.
    let mut level = Compound::new();
    level.insert(LEGACY_STRUCTURE_FLAG.into(), Value::Byte(1));
    let mut doc = Document::new();
    doc.set_data_version(1200);
    doc.insert("Level", Value::Compound(level));
    storage.write(pos, doc).await.unwrap();

    let doc = storage.read(pos).await.unwrap().expect("chunk stored");
    assert_eq!(doc.data_version(), Some(CURRENT_DATA_VERSION));
    assert!(doc.get(LEGACY_STRUCTURE_FLAG).is_none());
    assert_eq!((doc.get("xPos"), doc.get("zPos")), (Some(&Value::Int(3)), Some(&Value::Int(7))));
    let structures = as_compound(doc.get("structures").unwrap()).unwrap();
    assert!(as_compound(&structures["Starts"]).unwrap().contains_key("Village"));
    storage.close().await.unwrap();
}

#[tokio::test]
async fn legacy_structures_are_spliced_in() {
    let world = tempfile::tempdir().unwrap();
    write_village_data(world.path());
    let storage = ChunkStorage::open(world.path(), StorageConfig::default());

    let origin = ChunkPos::new(3, 7);
    let neighbour = ChunkPos::new(4, 7);
    storage.write(origin, legacy_chunk(origin, 1200)).await.unwrap();
    storage.write(neighbour, legacy_chunk(neighbour, 1200)).await.unwrap();

    let doc = storage.read(origin).await.unwrap().unwrap();
    let structures = as_compound(doc.get("structures").unwrap()).unwrap();
    assert!(as_compound(&structures["Starts"]).unwrap().contains_key("Village"));
    assert!(storage.upgrader().legacy_loaded());

    // Writing the origin back marks its start as handled.
    storage.write(origin, doc.clone()).await.unwrap();
    let mut again = legacy_chunk(origin, 1200);
    again.insert("retry", Value::Byte(1));
    storage.write(origin, again).await.unwrap();
    let doc = storage.read(origin).await.unwrap().unwrap();
    let structures = as_compound(doc.get("structures").unwrap()).unwrap();
    assert!(!structures.contains_key("Starts"));

    // The neighbour only references the start.
    let doc = storage.read(neighbour).await.unwrap().unwrap();
    let structures = as_compound(doc.get("structures").unwrap()).unwrap();
    let refs = as_compound(&structures["References"]).unwrap();
    match &refs["Village"] {
        Value::LongArray(arr) => assert_eq!(&arr[..], &[origin.to_long()]),
        other => panic!("unexpected references tag: {:?}", other),
    }
    storage.close().await.unwrap();
}

#[tokio::test]
async fn current_chunk_is_returned_unchanged() {
    let world = tempfile::tempdir().unwrap();
    let storage = ChunkStorage::open(world.path(), StorageConfig::default());
    let pos = ChunkPos::new(-40, 12);
    let doc = current_chunk(pos, 5);

    storage.write(pos, doc.clone()).await.unwrap();
    assert_eq!(storage.read(pos).await.unwrap(), Some(doc));
    assert!(!storage.upgrader().legacy_loaded());
    storage.close().await.unwrap();
}

#[tokio::test]
async fn missing_chunk_reads_as_none() {
    let world = tempfile::tempdir().unwrap();
    let storage = ChunkStorage::open(world.path(), StorageConfig::default());
    assert_eq!(storage.read(ChunkPos::new(100, 100)).await.unwrap(), None);
    assert!(storage.regions().unwrap().is_empty());
    storage.close().await.unwrap();
}

#[tokio::test]
async fn non_compound_level_fails_migration() {
    let world = tempfile::tempdir().unwrap();
    let storage = ChunkStorage::open(world.path(), StorageConfig::default());
    let pos = ChunkPos::new(0, 0);
    let mut doc = Document::new();
    doc.set_data_version(LEGACY_STRUCTURE_DATA_VERSION - 1);
    doc.insert("Level", Value::String("not a compound".into()));

    storage.write(pos, doc).await.unwrap();
    let err = storage.read(pos).await.unwrap_err();
    assert!(matches!(err, StorageError::Migration { .. }), "{}", err);
    storage.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn close_drains_queued_writes() {
    let world = tempfile::tempdir().unwrap();
    let positions: Vec<ChunkPos> = (0..40).map(|i| ChunkPos::new(i * 7, -i * 3)).collect();
    {
        let storage = ChunkStorage::open(world.path(), StorageConfig::default());
        // Queue without awaiting, then close.
        let writes: Vec<_> = positions
            .iter()
            .map(|&pos| storage.worker().store(pos, Some(current_chunk(pos, pos.x))))
            .collect();
        storage.close().await.unwrap();
        for write in writes {
            write.await.unwrap();
        }
    }

    let storage = ChunkStorage::open(world.path(), StorageConfig::default());
    for pos in positions {
        assert_eq!(storage.read(pos).await.unwrap(), Some(current_chunk(pos, pos.x)));
    }
    storage.close().await.unwrap();
}

#[tokio::test]
async fn operations_after_close_report_worker_closed() {
    let world = tempfile::tempdir().unwrap();
    let storage = ChunkStorage::open(world.path(), StorageConfig::default());
    storage.close().await.unwrap();
    let err = storage.write(ChunkPos::new(1, 1), current_chunk(ChunkPos::new(1, 1), 0)).await.unwrap_err();
    assert!(matches!(err, StorageError::WorkerClosed));
}

#[tokio::test]
async fn eviction_keeps_data_with_small_cache() {
    let world = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        max_open_regions: 2,
        ..StorageConfig::default()
    };
    let storage = ChunkStorage::open(world.path(), config);
    let positions: Vec<ChunkPos> = (0..6).map(|i| ChunkPos::new(i * 32, 0)).collect();
    for &pos in &positions {
        storage.write(pos, current_chunk(pos, pos.x)).await.unwrap();
    }
    for &pos in &positions {
        assert_eq!(storage.read(pos).await.unwrap(), Some(current_chunk(pos, pos.x)));
    }
    assert_eq!(storage.regions().unwrap().len(), 6);
    storage.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// World upgrade
// ---------------------------------------------------------------------------

#[tokio::test]
async fn world_upgrade_rewrites_stale_chunks() {
    let world = tempfile::tempdir().unwrap();
    let stale = [ChunkPos::new(0, 0), ChunkPos::new(33, -5), ChunkPos::new(-2, 70)];
    let fresh = ChunkPos::new(5, 5);
    let broken = ChunkPos::new(6, 6);
    {
        let storage = ChunkStorage::open(world.path(), StorageConfig::default());
        for pos in stale {
            storage.write(pos, legacy_chunk(pos, 1200)).await.unwrap();
        }
        storage.write(fresh, current_chunk(fresh, 1)).await.unwrap();
        let mut bad = Document::new();
        bad.set_data_version(1000);
        bad.insert("Level", Value::Int(0));
        storage.write(broken, bad).await.unwrap();
        storage.close().await.unwrap();
    }

    let storage = ChunkStorage::open(world.path(), StorageConfig::default());
    let report = world_upgrader::upgrade_world(&storage).await.unwrap();
    assert_eq!(report.chunks, 5);
    assert_eq!(report.upgraded, 3);
    assert_eq!(report.already_current, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!((report.failed[0].x, report.failed[0].z), (broken.x, broken.z));

    for pos in stale {
        let raw = storage.read_raw(pos).await.unwrap().unwrap();
        assert_eq!(raw.data_version(), Some(CURRENT_DATA_VERSION));
        assert!(raw.get("Level").is_none());
    }
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["upgraded"], 3);
    storage.close().await.unwrap();
}
