//! Region cache behaviour against real files in a temporary directory.

use fastnbt::Value;
use regionstore_engine::config::MAX_OPEN_REGIONS;
use regionstore_engine::storage::codec::CodecId;
use regionstore_engine::storage::region_cache::RegionCache;
use regionstore_engine::world::position::REGION_SIZE;
use regionstore_engine::{ChunkPos, Document, RegionPos, StorageConfig};

fn chunk_doc(pos: ChunkPos, marker: i64) -> Document {
    let mut doc = Document::new();
    doc.set_data_version(4189);
    doc.insert("xPos", Value::Int(pos.x));
    doc.insert("zPos", Value::Int(pos.z));
    doc.insert("marker", Value::Long(marker));
    doc
}

/// A chunk inside the region at index `i` along the x axis.
fn chunk_in_region(i: i32) -> ChunkPos {
    ChunkPos::new(i * REGION_SIZE + 5, -3)
}

// ---------------------------------------------------------------------------
// Lookup and eviction
// ---------------------------------------------------------------------------

#[test]
fn same_region_returns_same_container() {
    let dir = tempfile::tempdir().unwrap();
    let mut cache = RegionCache::new(dir.path(), &StorageConfig::default());

    let region = RegionPos::new(2, -1);
    let first = cache.container_for(region).unwrap().path().to_path_buf();
    let second = cache.container_for(region).unwrap().path().to_path_buf();
    assert_eq!(first, second);
    assert_eq!(cache.len(), 1);
    assert!(dir.path().join("r.2.-1.mca").exists());
}

#[test]
fn opening_past_capacity_evicts_least_recently_used() {
    let dir = tempfile::tempdir().unwrap();
    let mut cache = RegionCache::new(dir.path(), &StorageConfig::default());
    assert_eq!(cache.capacity(), MAX_OPEN_REGIONS);

    for i in 0..MAX_OPEN_REGIONS as i32 {
        cache.container_for(RegionPos::new(i, 0)).unwrap();
    }
    // Touch region 0 so region 1 becomes the oldest.
    cache.container_for(RegionPos::new(0, 0)).unwrap();

    cache.container_for(RegionPos::new(MAX_OPEN_REGIONS as i32, 0)).unwrap();
    assert_eq!(cache.len(), MAX_OPEN_REGIONS);
    assert!(!cache.is_open(RegionPos::new(1, 0)));
    assert!(cache.is_open(RegionPos::new(0, 0)));
    assert!(cache.is_open(RegionPos::new(2, 0)));
    assert_eq!(
        cache.regions_by_recency().first(),
        Some(&RegionPos::new(MAX_OPEN_REGIONS as i32, 0))
    );
}

#[test]
fn evicted_region_reads_back_written_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        max_open_regions: 4,
        ..StorageConfig::default()
    };
    let mut cache = RegionCache::new(dir.path(), &config);

    let pos = chunk_in_region(0);
    let doc = chunk_doc(pos, 77);
    cache.write(pos, Some(&doc)).unwrap();

    // Push region 0 out of the cache.
    for i in 1..=4 {
        cache.write(chunk_in_region(i), Some(&chunk_doc(chunk_in_region(i), i as i64))).unwrap();
    }
    assert!(!cache.is_open(pos.region()));

    assert_eq!(cache.read(pos).unwrap(), Some(doc));
    assert!(cache.is_open(pos.region()));
}

#[test]
fn chunks_survive_cache_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default();
    let positions = [ChunkPos::new(0, 0), ChunkPos::new(31, 31), ChunkPos::new(-1, -1), ChunkPos::new(40, -70)];

    {
        let mut cache = RegionCache::new(dir.path(), &config);
        for (i, pos) in positions.iter().enumerate() {
            cache.write(*pos, Some(&chunk_doc(*pos, i as i64))).unwrap();
        }
        cache.close().unwrap();
        assert!(cache.is_empty());
    }

    let mut cache = RegionCache::new(dir.path(), &config);
    for (i, pos) in positions.iter().enumerate() {
        assert_eq!(cache.read(*pos).unwrap(), Some(chunk_doc(*pos, i as i64)));
    }
    let mut regions = RegionCache::list_regions(dir.path(), "mca").unwrap();
    regions.sort();
    assert_eq!(
        regions,
        vec![RegionPos::new(-1, -1), RegionPos::new(0, 0), RegionPos::new(1, -3)]
    );
}

#[test]
fn deleting_a_chunk_removes_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut cache = RegionCache::new(dir.path(), &StorageConfig::default());
    let pos = ChunkPos::new(3, 7);

    cache.write(pos, Some(&chunk_doc(pos, 1))).unwrap();
    assert!(cache.has_chunk(pos).unwrap());
    cache.write(pos, None).unwrap();
    assert!(!cache.has_chunk(pos).unwrap());
    assert_eq!(cache.read(pos).unwrap(), None);
}

#[test]
fn overwrites_keep_only_latest_document() {
    let dir = tempfile::tempdir().unwrap();
    let mut cache = RegionCache::new(dir.path(), &StorageConfig::default());
    let pos = ChunkPos::new(-20, 9);

    for marker in 0..10 {
        cache.write(pos, Some(&chunk_doc(pos, marker))).unwrap();
    }
    assert_eq!(cache.read(pos).unwrap(), Some(chunk_doc(pos, 9)));
    assert_eq!(cache.chunks_in(pos.region()).unwrap(), vec![pos]);
}

// ---------------------------------------------------------------------------
// Codecs
// ---------------------------------------------------------------------------

#[test]
fn every_builtin_codec_round_trips_through_the_cache() {
    for codec in [CodecId::GZIP, CodecId::DEFLATE, CodecId::NONE] {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            codec,
            ..StorageConfig::default()
        };
        let pos = ChunkPos::new(12, 12);
        let doc = chunk_doc(pos, codec.0 as i64);

        let mut cache = RegionCache::new(dir.path(), &config);
        cache.write(pos, Some(&doc)).unwrap();
        cache.close().unwrap();

        // Reading does not depend on the configured write codec.
        let mut reader = RegionCache::new(dir.path(), &StorageConfig::default());
        assert_eq!(reader.read(pos).unwrap(), Some(doc), "codec {:?}", codec);
    }
}

#[test]
fn large_chunk_spills_to_external_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        codec: CodecId::NONE,
        ..StorageConfig::default()
    };
    let pos = ChunkPos::new(1, 2);
    let mut doc = chunk_doc(pos, 5);
    // Well over 255 sectors once stored uncompressed.
    doc.insert(
        "payload",
        Value::ByteArray(fastnbt::ByteArray::new(vec![7; 2 * 1024 * 1024])),
    );

    let mut cache = RegionCache::new(dir.path(), &config);
    cache.write(pos, Some(&doc)).unwrap();
    assert!(dir.path().join("c.1.2.mcc").exists());
    assert_eq!(cache.read(pos).unwrap(), Some(doc));

    // A small rewrite goes back inside the region and drops the side file.
    let small = chunk_doc(pos, 6);
    cache.write(pos, Some(&small)).unwrap();
    assert!(!dir.path().join("c.1.2.mcc").exists());
    assert_eq!(cache.read(pos).unwrap(), Some(small));
}
