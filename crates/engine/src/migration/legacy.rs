//! One-time splice of pre-1.13 structure data into chunk documents.
//!
//! Before structure starts and references were stored per chunk, they lived
//! in per-feature saved-data files. Chunks written in that era carry
//! `Level.hasLegacyStructureData`; when such a chunk is upgraded, its starts
//! and references are copied in from an index over those files.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use dashmap::DashSet;
use fastnbt::{LongArray, Value};

use crate::document::{Compound, Document, as_compound, as_int, compound_entry};
use crate::error::MigrationError;
use crate::storage::codec;
use crate::world::position::ChunkPos;

/// Chunk-level flag marking documents that still need the splice.
pub const LEGACY_STRUCTURE_FLAG: &str = "hasLegacyStructureData";

/// Starts whose bounding box spans more chunks than this on either axis only
/// reference their own chunk.
const MAX_REFERENCE_SPAN: i32 = 64;

/// Builds the splice handler for a dimension. Called at most once per
/// storage session.
pub trait LegacySpliceBuilder: Send + Sync {
    fn build(&self, dimension: &str, data_dir: &Path) -> Result<Arc<dyn LegacySplice>, MigrationError>;
}

pub trait LegacySplice: Send + Sync {
    /// Copy legacy structure data for the document's chunk into it and clear
    /// the legacy flag.
    fn update_from_legacy(&self, doc: Document) -> Result<Document, MigrationError>;

    /// Mark the chunk at `packed` (see [`ChunkPos::to_long`]) as rewritten;
    /// its structure starts will not be spliced again.
    fn remove_index(&self, packed: i64);
}

/// Legacy feature files for a dimension.
pub fn legacy_features(dimension: &str) -> Option<&'static [&'static str]> {
    let name = dimension.strip_prefix("minecraft:").unwrap_or(dimension);
    match name {
        "overworld" => Some(&[
            "Monument",
            "Stronghold",
            "Village",
            "Mineshaft",
            "Temple",
            "Mansion",
        ]),
        "the_nether" => Some(&["Fortress"]),
        "the_end" => Some(&["EndCity"]),
        _ => None,
    }
}

/// Reads `<data_dir>/<Feature>.dat` (gzip NBT) for every legacy feature of
/// the dimension. Missing files are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructureIndexBuilder;

impl LegacySpliceBuilder for StructureIndexBuilder {
    fn build(&self, dimension: &str, data_dir: &Path) -> Result<Arc<dyn LegacySplice>, MigrationError> {
        let features = legacy_features(dimension)
            .ok_or_else(|| MigrationError::Legacy(format!("unknown dimension '{}'", dimension)))?;
        let mut index = StructureIndex::default();
        for &feature in features {
            let path = data_dir.join(format!("{}.dat", feature));
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(MigrationError::Legacy(format!("reading {}: {}", path.display(), e)));
                }
            };
            let nbt = codec::GZIP
                .decode(&bytes)
                .map_err(|e| MigrationError::Legacy(format!("decompressing {}: {}", path.display(), e)))?;
            let doc = Document::from_nbt(&nbt)
                .map_err(|e| MigrationError::Legacy(format!("parsing {}: {}", path.display(), e)))?;
            index.add_feature_file(feature, &doc);
        }
        tracing::info!(
            "Built legacy structure index for {}: {} chunks with starts, {} with references",
            dimension,
            index.remaining.len(),
            index.references.len()
        );
        Ok(Arc::new(index))
    }
}

/// Structure starts and references, keyed by packed chunk position.
#[derive(Debug, Default)]
pub struct StructureIndex {
    starts: HashMap<i64, Vec<(String, Compound)>>,
    references: HashMap<i64, Vec<(String, i64)>>,
    /// Chunks whose starts have not yet been written back.
    remaining: DashSet<i64>,
}

impl StructureIndex {
    /// Index one saved-data document: `{data: {Features: {<key>: <start>}}}`.
    pub fn add_feature_file(&mut self, feature: &str, doc: &Document) {
        let Some(features) = doc
            .compound("data")
            .and_then(|data| data.get("Features"))
            .and_then(as_compound)
        else {
            tracing::warn!("Legacy {} data has no Features compound", feature);
            return;
        };
        for start in features.values().filter_map(as_compound) {
            self.add_start(feature, start);
        }
    }

    pub fn add_start(&mut self, feature: &str, start: &Compound) {
        let id = match start.get("id") {
            Some(Value::String(id)) => id.as_str(),
            _ => "",
        };
        if id == "INVALID" {
            return;
        }
        let (Some(x), Some(z)) = (
            start.get("ChunkX").and_then(as_int),
            start.get("ChunkZ").and_then(as_int),
        ) else {
            tracing::warn!("Legacy {} start without chunk coordinates", feature);
            return;
        };
        let origin = ChunkPos::new(x, z).to_long();
        self.starts
            .entry(origin)
            .or_default()
            .push((feature.to_string(), start.clone()));
        self.remaining.insert(origin);

        for chunk in referenced_chunks(x, z, start.get("BB")) {
            self.references
                .entry(chunk.to_long())
                .or_default()
                .push((feature.to_string(), origin));
        }
    }

    /// Chunks with starts that have not been written back yet.
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }

    pub fn is_unhandled(&self, packed: i64) -> bool {
        self.remaining.contains(&packed)
    }
}

/// Every chunk covered by a start's block-space bounding box
/// `[x0, y0, z0, x1, y1, z1]`, or just the start chunk without one.
fn referenced_chunks(x: i32, z: i32, bb: Option<&Value>) -> Vec<ChunkPos> {
    let Some(Value::IntArray(bb)) = bb else {
        return vec![ChunkPos::new(x, z)];
    };
    if bb.len() != 6 {
        return vec![ChunkPos::new(x, z)];
    }
    let (x0, z0, x1, z1) = (bb[0] >> 4, bb[2] >> 4, bb[3] >> 4, bb[5] >> 4);
    if x1 < x0 || z1 < z0 || x1 - x0 > MAX_REFERENCE_SPAN || z1 - z0 > MAX_REFERENCE_SPAN {
        return vec![ChunkPos::new(x, z)];
    }
    let mut out = Vec::with_capacity(((x1 - x0 + 1) * (z1 - z0 + 1)) as usize);
    for cx in x0..=x1 {
        for cz in z0..=z1 {
            out.push(ChunkPos::new(cx, cz));
        }
    }
    out
}

impl LegacySplice for StructureIndex {
    fn update_from_legacy(&self, mut doc: Document) -> Result<Document, MigrationError> {
        let level = doc
            .compound_mut("Level")
            .ok_or_else(|| MigrationError::Malformed("legacy chunk has no Level compound".into()))?;
        let (Some(x), Some(z)) = (
            level.get("xPos").and_then(as_int),
            level.get("zPos").and_then(as_int),
        ) else {
            return Err(MigrationError::Malformed("legacy chunk has no position".into()));
        };
        let packed = ChunkPos::new(x, z).to_long();

        let structures = compound_entry(level, "Structures");
        if self.is_unhandled(packed) {
            if let Some(starts) = self.starts.get(&packed) {
                let out = compound_entry(structures, "Starts");
                for (feature, start) in starts {
                    out.insert(feature.clone(), Value::Compound(start.clone()));
                }
            }
        }
        if let Some(refs) = self.references.get(&packed) {
            let mut grouped: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
            for (feature, origin) in refs {
                grouped.entry(feature.as_str()).or_default().push(*origin);
            }
            let out = compound_entry(structures, "References");
            for (feature, origins) in grouped {
                out.insert(feature.to_string(), Value::LongArray(LongArray::new(origins)));
            }
        }

        level.remove(LEGACY_STRUCTURE_FLAG);
        Ok(doc)
    }

    fn remove_index(&self, packed: i64) {
        self.remaining.remove(&packed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastnbt::IntArray;

    fn start(x: i32, z: i32, bb: [i32; 6]) -> Compound {
        let mut start = Compound::new();
        start.insert("id".into(), Value::String("Village".into()));
        start.insert("ChunkX".into(), Value::Int(x));
        start.insert("ChunkZ".into(), Value::Int(z));
        start.insert("BB".into(), Value::IntArray(IntArray::new(bb.to_vec())));
        start
    }

    fn legacy_chunk(x: i32, z: i32) -> Document {
        let mut doc = Document::new();
        let level = compound_entry(doc.root_mut(), "Level");
        level.insert("xPos".into(), Value::Int(x));
        level.insert("zPos".into(), Value::Int(z));
        level.insert(LEGACY_STRUCTURE_FLAG.into(), Value::Byte(1));
        doc
    }

    fn index() -> StructureIndex {
        let mut index = StructureIndex::default();
        // Start at chunk (2, 2) covering blocks 32..=63 on both axes: chunks 2..=3.
        index.add_start("Village", &start(2, 2, [32, 60, 32, 63, 80, 63]));
        index
    }

    #[test]
    fn test_bounding_box_references() {
        let index = index();
        assert_eq!(index.remaining(), 1);
        for (x, z) in [(2, 2), (2, 3), (3, 2), (3, 3)] {
            assert!(index.references.contains_key(&ChunkPos::new(x, z).to_long()));
        }
        assert!(!index.references.contains_key(&ChunkPos::new(4, 2).to_long()));
    }

    #[test]
    fn test_splice_start_chunk() {
        let index = index();
        let doc = index.update_from_legacy(legacy_chunk(2, 2)).unwrap();
        let level = doc.compound("Level").unwrap();
        assert!(!level.contains_key(LEGACY_STRUCTURE_FLAG));
        let structures = as_compound(&level["Structures"]).unwrap();
        let starts = as_compound(&structures["Starts"]).unwrap();
        assert!(starts.contains_key("Village"));
        let refs = as_compound(&structures["References"]).unwrap();
        match &refs["Village"] {
            Value::LongArray(arr) => assert_eq!(&arr[..], &[ChunkPos::new(2, 2).to_long()]),
            other => panic!("unexpected references tag: {:?}", other),
        }
    }

    #[test]
    fn test_splice_reference_only_chunk() {
        let index = index();
        let doc = index.update_from_legacy(legacy_chunk(3, 2)).unwrap();
        let structures = as_compound(&doc.compound("Level").unwrap()["Structures"])
            .unwrap()
            .clone();
        assert!(!structures.contains_key("Starts"));
        assert!(structures.contains_key("References"));
    }

    #[test]
    fn test_removed_index_skips_starts() {
        let index = index();
        index.remove_index(ChunkPos::new(2, 2).to_long());
        assert_eq!(index.remaining(), 0);
        let doc = index.update_from_legacy(legacy_chunk(2, 2)).unwrap();
        let structures = as_compound(&doc.compound("Level").unwrap()["Structures"])
            .unwrap()
            .clone();
        assert!(!structures.contains_key("Starts"));
    }

    #[test]
    fn test_invalid_starts_ignored() {
        let mut index = StructureIndex::default();
        let mut bad = start(0, 0, [0, 0, 0, 15, 15, 15]);
        bad.insert("id".into(), Value::String("INVALID".into()));
        index.add_start("Village", &bad);
        assert_eq!(index.remaining(), 0);
    }

    #[test]
    fn test_missing_level_is_malformed() {
        let err = index().update_from_legacy(Document::new()).unwrap_err();
        assert!(matches!(err, MigrationError::Malformed(_)));
    }

    #[test]
    fn test_builder_reads_gzip_feature_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut features = Compound::new();
        features.insert("[5,6]".into(), Value::Compound(start(5, 6, [80, 0, 96, 95, 10, 111])));
        let mut data = Compound::new();
        data.insert("Features".into(), Value::Compound(features));
        let mut file = Document::new();
        file.insert("data", Value::Compound(data));
        let bytes = codec::GZIP.encode(&file.to_nbt().unwrap()).unwrap();
        std::fs::write(tmp.path().join("Village.dat"), bytes).unwrap();

        let handler = StructureIndexBuilder
            .build("minecraft:overworld", tmp.path())
            .unwrap();
        let doc = handler.update_from_legacy(legacy_chunk(5, 6)).unwrap();
        let structures = as_compound(&doc.compound("Level").unwrap()["Structures"])
            .unwrap()
            .clone();
        assert!(structures.contains_key("Starts"));

        assert!(StructureIndexBuilder.build("minecraft:moon", tmp.path()).is_err());
    }
}
