//! Bringing stored chunk documents up to the current data version.
//!
//! A read walks through these stages:
//!
//! 1. take `DataVersion`, or [`PRE_VERSIONING_DATA_VERSION`] if absent;
//! 2. below [`LEGACY_STRUCTURE_DATA_VERSION`], upgrade to that version and, if
//!    the chunk carries the legacy structure flag, splice in structure data;
//! 3. upgrade from `max(LEGACY_STRUCTURE_DATA_VERSION, version)` to current;
//! 4. stamp the current version if the document started out older.

pub mod fixes;
pub mod legacy;
pub mod old_chunk;
pub mod upgrader;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use fastnbt::Value;
use rayon::prelude::*;

use crate::config::StorageConfig;
use crate::document::{Compound, Document, as_bool, as_int};
use crate::error::{MigrationError, StorageError};
use crate::world::position::ChunkPos;

use legacy::{LEGACY_STRUCTURE_FLAG, LegacySplice, LegacySpliceBuilder, StructureIndexBuilder};
use upgrader::{SchemaTag, SchemaUpgrader};

/// The data version this build writes.
pub const CURRENT_DATA_VERSION: i32 = 4189;
/// First version that stores structure starts and references per chunk.
pub const LEGACY_STRUCTURE_DATA_VERSION: i32 = 1493;
/// Assumed version of documents written before versions were recorded.
pub const PRE_VERSIONING_DATA_VERSION: i32 = 1343;
/// Transient compound that gives fixes access to the chunk's surroundings.
pub const CONTEXT_KEY: &str = "__context";

/// Runs stored chunk documents through the schema transform and the one-time
/// legacy structure splice.
///
/// One `ChunkUpgrader` corresponds to one storage session: the splice handler
/// is built on first need and reused for every later chunk.
pub struct ChunkUpgrader {
    schema: Arc<dyn SchemaUpgrader>,
    legacy_builder: Arc<dyn LegacySpliceBuilder>,
    dimension: String,
    data_dir: PathBuf,
    current_version: i32,
    legacy: Mutex<Option<Arc<dyn LegacySplice>>>,
}

impl ChunkUpgrader {
    pub fn new(
        schema: Arc<dyn SchemaUpgrader>,
        legacy_builder: Arc<dyn LegacySpliceBuilder>,
        dimension: impl Into<String>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            schema,
            legacy_builder,
            dimension: dimension.into(),
            data_dir: data_dir.into(),
            current_version: CURRENT_DATA_VERSION,
            legacy: Mutex::new(None),
        }
    }

    /// The built-in fix set and structure index for a world directory.
    pub fn standard(world: &Path, config: &StorageConfig) -> Self {
        Self::new(
            Arc::new(fixes::standard()),
            Arc::new(StructureIndexBuilder),
            config.dimension.clone(),
            config.data_path(world),
        )
    }

    pub fn with_current_version(mut self, version: i32) -> Self {
        self.current_version = version;
        self
    }

    pub fn current_version(&self) -> i32 {
        self.current_version
    }

    pub fn dimension(&self) -> &str {
        &self.dimension
    }

    /// Upgrade one chunk document read from storage.
    pub fn upgrade(&self, pos: ChunkPos, doc: Document) -> Result<Document, StorageError> {
        self.upgrade_document(pos, doc).map_err(|source| match source {
            MigrationError::Malformed(reason) => StorageError::corrupt(pos, reason),
            source => {
                tracing::warn!("Migration of chunk [{}, {}] failed: {}", pos.x, pos.z, source);
                StorageError::Migration { pos, source }
            }
        })
    }

    /// Upgrade a batch of documents on the rayon pool. Failures are per chunk.
    pub fn upgrade_many(
        &self,
        docs: Vec<(ChunkPos, Document)>,
    ) -> Vec<(ChunkPos, Result<Document, StorageError>)> {
        docs.into_par_iter()
            .map(|(pos, doc)| (pos, self.upgrade(pos, doc)))
            .collect()
    }

    /// Called when a chunk is written back: its legacy structure data has
    /// been persisted and must not be spliced again.
    pub fn forget_legacy(&self, pos: ChunkPos) {
        let handler = self
            .legacy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler.remove_index(pos.to_long());
        }
    }

    /// Whether the splice handler has been built this session.
    pub fn legacy_loaded(&self) -> bool {
        self.legacy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn upgrade_document(&self, pos: ChunkPos, mut doc: Document) -> Result<Document, MigrationError> {
        let version = doc.data_version().unwrap_or(PRE_VERSIONING_DATA_VERSION);
        if version > self.current_version {
            tracing::warn!(
                "Chunk data version {} is newer than supported version {}, leaving it untouched",
                version,
                self.current_version
            );
            return Ok(doc);
        }

        let mut context = Compound::new();
        context.insert("dimension".into(), Value::String(self.dimension.clone()));
        doc.insert(CONTEXT_KEY, Value::Compound(context));

        if version < LEGACY_STRUCTURE_DATA_VERSION {
            doc = self.schema.upgrade(
                SchemaTag::CHUNK,
                doc,
                version,
                LEGACY_STRUCTURE_DATA_VERSION,
            )?;
            if has_legacy_flag(&doc) {
                fill_position(&mut doc, pos);
                doc = self.legacy_handler()?.update_from_legacy(doc)?;
            }
        }

        doc = self.schema.upgrade(
            SchemaTag::CHUNK,
            doc,
            version.max(LEGACY_STRUCTURE_DATA_VERSION),
            self.current_version,
        )?;
        doc.remove(CONTEXT_KEY);

        if version < self.current_version {
            doc.set_data_version(self.current_version);
        }
        Ok(doc)
    }

    fn legacy_handler(&self) -> Result<Arc<dyn LegacySplice>, MigrationError> {
        let mut guard = self.legacy.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handler) = guard.as_ref() {
            return Ok(handler.clone());
        }
        let handler = self.legacy_builder.build(&self.dimension, &self.data_dir)?;
        *guard = Some(handler.clone());
        Ok(handler)
    }
}

fn has_legacy_flag(doc: &Document) -> bool {
    doc.compound("Level")
        .and_then(|level| level.get(LEGACY_STRUCTURE_FLAG))
        .is_some_and(as_bool)
}

/// The splice is keyed by the tile's position; older chunks do not always
/// record it in `Level`.
fn fill_position(doc: &mut Document, pos: ChunkPos) {
    if let Some(level) = doc.compound_mut("Level") {
        for (key, coord) in [("xPos", pos.x), ("zPos", pos.z)] {
            if level.get(key).and_then(as_int).is_none() {
                level.insert(key.into(), Value::Int(coord));
            }
        }
    }
}
