//! Benchmark: sequential vs parallel chunk migration.
//!
//! Builds a grid of pre-1.13 chunk documents and measures how long it takes to
//! bring them to the current data version one by one and on the rayon pool.
//! Run with: `cargo run --release -p regionstore-server --example bench_upgrade`

use std::path::Path;
use std::time::Instant;

use fastnbt::{ByteArray, Value};
use regionstore_engine::document::Compound;
use regionstore_engine::migration::ChunkUpgrader;
use regionstore_engine::{ChunkPos, Document, StorageConfig};

fn main() {
    let side = 64;
    let chunks = (side * side) as usize;
    let sections_per_chunk = 8;

    println!("=== regionstore: Migration Benchmark ===\n");
    println!("  {} chunks ({}x{} grid), {} sections per chunk\n", chunks, side, side, sections_per_chunk);

    let config = StorageConfig::default();
    let docs = build_docs(side, sections_per_chunk);

    // --- Sequential ---
    let upgrader = ChunkUpgrader::standard(Path::new("bench-world"), &config);
    let t0 = Instant::now();
    let seq: Vec<_> = docs
        .clone()
        .into_iter()
        .map(|(pos, doc)| (pos, upgrader.upgrade(pos, doc)))
        .collect();
    let dt_seq = t0.elapsed();
    println!("  Sequential: {:>6} chunks in {:>8.2?}", seq.len(), dt_seq);

    // --- Parallel ---
    let upgrader = ChunkUpgrader::standard(Path::new("bench-world"), &config);
    let t0 = Instant::now();
    let par = upgrader.upgrade_many(docs);
    let dt_par = t0.elapsed();
    println!("  Parallel:   {:>6} chunks in {:>8.2?}", par.len(), dt_par);

    let speedup = dt_seq.as_secs_f64() / dt_par.as_secs_f64();
    println!("\n  Speedup: {:.2}x", speedup);

    // --- Verify identical ---
    let mismatches = seq
        .iter()
        .zip(&par)
        .filter(|((pa, a), (pb, b))| pa != pb || a.as_ref().ok() != b.as_ref().ok())
        .count();
    if mismatches == 0 {
        println!("  Verification: PASS (documents identical)");
    } else {
        println!("  Verification: FAIL ({} mismatches!)", mismatches);
    }
}

fn build_docs(side: i32, sections_per_chunk: i8) -> Vec<(ChunkPos, Document)> {
    let mut docs = Vec::new();
    for cx in 0..side {
        for cz in 0..side {
            let pos = ChunkPos::new(cx, cz);
            let sections = (0..sections_per_chunk)
                .map(|y| {
                    let mut section = Compound::new();
                    section.insert("Y".into(), Value::Byte(y));
                    section.insert("Blocks".into(), Value::ByteArray(ByteArray::new(vec![1; 4096])));
                    section.insert("Data".into(), Value::ByteArray(ByteArray::new(vec![0; 2048])));
                    Value::Compound(section)
                })
                .collect();
            let mut level = Compound::new();
            level.insert("xPos".into(), Value::Int(cx));
            level.insert("zPos".into(), Value::Int(cz));
            level.insert("TerrainPopulated".into(), Value::Byte(1));
            level.insert("Sections".into(), Value::List(sections));
            let mut doc = Document::new();
            doc.set_data_version(1200);
            doc.insert("Level", Value::Compound(level));
            docs.push((pos, doc));
        }
    }
    docs
}
