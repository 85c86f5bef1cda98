//! Bounded cache of open region files.
//!
//! The cache owns every open [`RegionFile`]. Files live in a slot arena and
//! are threaded on a doubly linked list in access order, so lookup, promotion
//! and eviction of the least recently used file are all O(1).

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use slotmap::{SlotMap, new_key_type};

use crate::config::StorageConfig;
use crate::document::Document;
use crate::error::{CloseFailures, StorageError};
use crate::storage::codec::CodecId;
use crate::storage::region_file::RegionFile;
use crate::world::position::{ChunkPos, RegionPos};

new_key_type! {
    struct SlotKey;
}

struct Slot {
    region: RegionPos,
    file: RegionFile,
    newer: Option<SlotKey>,
    older: Option<SlotKey>,
}

pub struct RegionCache {
    dir: PathBuf,
    extension: String,
    codec: CodecId,
    sync: bool,
    capacity: usize,
    slots: SlotMap<SlotKey, Slot>,
    index: HashMap<RegionPos, SlotKey>,
    newest: Option<SlotKey>,
    oldest: Option<SlotKey>,
    /// Eviction close failures not yet reported to a caller.
    close_failures: CloseFailures,
}

impl RegionCache {
    /// A cache over the region files in `dir`. Nothing is opened until first use.
    pub fn new(dir: impl Into<PathBuf>, config: &StorageConfig) -> Self {
        Self {
            dir: dir.into(),
            extension: config.extension.clone(),
            codec: config.codec,
            sync: config.sync_writes,
            capacity: config.max_open_regions.max(1),
            slots: SlotMap::with_key(),
            index: HashMap::new(),
            newest: None,
            oldest: None,
            close_failures: CloseFailures::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_open(&self, region: RegionPos) -> bool {
        self.index.contains_key(&region)
    }

    /// Open regions, most recently used first.
    pub fn regions_by_recency(&self) -> Vec<RegionPos> {
        let mut out = Vec::with_capacity(self.slots.len());
        let mut cursor = self.newest;
        while let Some(key) = cursor {
            let slot = &self.slots[key];
            out.push(slot.region);
            cursor = slot.older;
        }
        out
    }

    pub fn region_path(&self, region: RegionPos) -> PathBuf {
        self.dir.join(region.file_name(&self.extension))
    }

    /// The open file for `region`, opening (and creating) it if needed.
    ///
    /// At capacity, the least recently used file is closed first. A failure
    /// to close it does not stop the new file from opening; it is reported
    /// when the calling operation completes.
    pub fn container_for(&mut self, region: RegionPos) -> Result<&mut RegionFile, StorageError> {
        if let Some(&key) = self.index.get(&region) {
            self.promote(key);
            return Ok(&mut self.slots[key].file);
        }

        if self.slots.len() >= self.capacity {
            self.evict_oldest();
        }

        fs::create_dir_all(&self.dir).map_err(|e| StorageError::io(&self.dir, e))?;
        let path = self.region_path(region);
        let file = RegionFile::open(region, &path, self.codec, self.sync)
            .map_err(|e| StorageError::io(&path, e))?;
        tracing::debug!("Opened region file {}", path.display());

        let key = self.slots.insert(Slot {
            region,
            file,
            newer: None,
            older: None,
        });
        self.index.insert(region, key);
        self.push_front(key);
        Ok(&mut self.slots[key].file)
    }

    /// Read and parse a chunk. Missing region files are not created.
    pub fn read(&mut self, pos: ChunkPos) -> Result<Option<Document>, StorageError> {
        let result = self.read_inner(pos);
        self.finish(result)
    }

    /// Store a chunk, or delete it when `doc` is `None`.
    pub fn write(&mut self, pos: ChunkPos, doc: Option<&Document>) -> Result<(), StorageError> {
        let result = self.write_inner(pos, doc);
        self.finish(result)
    }

    pub fn has_chunk(&mut self, pos: ChunkPos) -> Result<bool, StorageError> {
        let result = match self.existing(pos.region()) {
            Ok(Some(file)) => Ok(file.has_chunk(pos)),
            Ok(None) => Ok(false),
            Err(e) => Err(e),
        };
        self.finish(result)
    }

    /// Chunks stored in `region`.
    pub fn chunks_in(&mut self, region: RegionPos) -> Result<Vec<ChunkPos>, StorageError> {
        let result = match self.existing(region) {
            Ok(Some(file)) => Ok(file.chunks()),
            Ok(None) => Ok(Vec::new()),
            Err(e) => Err(e),
        };
        self.finish(result)
    }

    /// Sync every open file. All files are attempted; the first failure is returned.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        let mut first = None;
        for slot in self.slots.values_mut() {
            if let Err(e) = slot.file.flush() {
                tracing::error!("Failed to flush {}: {}", slot.file.path().display(), e);
                first.get_or_insert_with(|| StorageError::io(slot.file.path(), e));
            }
        }
        let result = first.map_or(Ok(()), Err);
        self.finish(result)
    }

    /// Close every open file, including ones whose siblings failed to close.
    pub fn close(&mut self) -> Result<(), StorageError> {
        let mut failures = std::mem::take(&mut self.close_failures);
        let count = self.slots.len();
        self.index.clear();
        self.newest = None;
        self.oldest = None;
        for (_, slot) in self.slots.drain() {
            if let Err(e) = slot.file.close() {
                tracing::error!("Failed to close region r.{}.{}: {}", slot.region.x, slot.region.z, e);
                failures.push(slot.region, e);
            }
        }
        tracing::debug!("Closed {} region files in {}", count, self.dir.display());
        failures.into_result()
    }

    /// Region files with the given extension present in `dir`.
    pub fn list_regions(dir: &Path, extension: &str) -> io::Result<Vec<RegionPos>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut regions = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            match RegionPos::parse_file_name(&name, extension) {
                Some(region) => regions.push(region),
                None if name.ends_with(extension) => {
                    tracing::warn!("Skipping unexpected file in region dir: {}", name);
                }
                None => {}
            }
        }
        regions.sort();
        Ok(regions)
    }

    fn read_inner(&mut self, pos: ChunkPos) -> Result<Option<Document>, StorageError> {
        let Some(file) = self.existing(pos.region())? else {
            return Ok(None);
        };
        let Some(mut stream) = file.read(pos)? else {
            return Ok(None);
        };
        let mut nbt = Vec::new();
        stream
            .read_to_end(&mut nbt)
            .map_err(|e| StorageError::corrupt(pos, format!("decompression failed: {}", e)))?;
        let doc = Document::from_nbt(&nbt)
            .map_err(|e| StorageError::corrupt(pos, format!("malformed NBT: {}", e)))?;
        Ok(Some(doc))
    }

    fn write_inner(&mut self, pos: ChunkPos, doc: Option<&Document>) -> Result<(), StorageError> {
        match doc {
            Some(doc) => {
                let nbt = doc
                    .to_nbt()
                    .map_err(|e| StorageError::corrupt(pos, format!("unserializable document: {}", e)))?;
                self.container_for(pos.region())?.write(pos, &nbt)
            }
            None => match self.existing(pos.region())? {
                Some(file) => file.clear(pos),
                None => Ok(()),
            },
        }
    }

    /// Like [`Self::container_for`], but does not create a missing file.
    fn existing(&mut self, region: RegionPos) -> Result<Option<&mut RegionFile>, StorageError> {
        if !self.index.contains_key(&region) && !self.region_path(region).exists() {
            return Ok(None);
        }
        self.container_for(region).map(Some)
    }

    /// Attach eviction close failures to the outcome of the triggering operation.
    ///
    /// If the operation itself failed, its error wins and the close failures
    /// stay queued for the next operation.
    fn finish<T>(&mut self, result: Result<T, StorageError>) -> Result<T, StorageError> {
        if result.is_err() || self.close_failures.is_empty() {
            return result;
        }
        Err(StorageError::CloseFailed(std::mem::take(&mut self.close_failures)))
    }

    fn evict_oldest(&mut self) {
        let Some(key) = self.oldest else {
            return;
        };
        self.unlink(key);
        let Some(slot) = self.slots.remove(key) else {
            return;
        };
        self.index.remove(&slot.region);
        tracing::debug!("Evicting region r.{}.{}", slot.region.x, slot.region.z);
        if let Err(e) = slot.file.close() {
            tracing::error!(
                "Failed to close evicted region r.{}.{}: {}",
                slot.region.x,
                slot.region.z,
                e
            );
            self.close_failures.push(slot.region, e);
        }
    }

    fn promote(&mut self, key: SlotKey) {
        if self.newest != Some(key) {
            self.unlink(key);
            self.push_front(key);
        }
    }

    fn unlink(&mut self, key: SlotKey) {
        let (newer, older) = {
            let slot = &self.slots[key];
            (slot.newer, slot.older)
        };
        match newer {
            Some(n) => self.slots[n].older = older,
            None => self.newest = older,
        }
        match older {
            Some(o) => self.slots[o].newer = newer,
            None => self.oldest = newer,
        }
    }

    fn push_front(&mut self, key: SlotKey) {
        let previous = self.newest;
        {
            let slot = &mut self.slots[key];
            slot.newer = None;
            slot.older = previous;
        }
        match previous {
            Some(p) => self.slots[p].newer = Some(key),
            None => self.oldest = Some(key),
        }
        self.newest = Some(key);
    }
}

impl Drop for RegionCache {
    fn drop(&mut self) {
        if !self.slots.is_empty() {
            tracing::warn!(
                "Region cache for {} dropped with {} open files, closing them",
                self.dir.display(),
                self.slots.len()
            );
            if let Err(e) = self.close() {
                tracing::error!("{}", e);
            }
        }
    }
}
