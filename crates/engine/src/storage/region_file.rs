//! A single region file holding up to 32x32 chunk records.
//!
//! Layout (compatible with vanilla Anvil tooling):
//!
//! | Sector | Content |
//! |--------|---------|
//! | 0 | 1024 big-endian `u32` locations: `sector_offset << 8 \| sector_count` |
//! | 1 | 1024 big-endian `u32` last-write timestamps (seconds) |
//! | 2.. | records, each padded to a whole number of 4 KiB sectors |
//!
//! A record is a big-endian `u32` length (counting the codec byte), the codec
//! byte, then the compressed NBT. Records needing more than 255 sectors are
//! written to `c.<x>.<z>.mcc` next to the region file, and the in-region record
//! keeps only the codec byte with [`EXTERNAL_FLAG`] set.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::StorageError;
use crate::storage::codec::{self, Codec, CodecId, EXTERNAL_FLAG};
use crate::world::position::{ChunkPos, LocalChunkPos, REGION_CHUNK_COUNT, RegionPos};

/// The number of bytes in a sector (4 KiB).
pub const SECTOR_BYTES: usize = 4096;
/// The sector count field of a location entry is 8 bits wide.
pub const MAX_RECORD_SECTORS: usize = 255;

const HEADER_SECTORS: u32 = 2;
const HEADER_BYTES: usize = SECTOR_BYTES * HEADER_SECTORS as usize;
/// Length prefix plus codec byte.
const RECORD_HEADER_BYTES: usize = 5;

pub struct RegionFile {
    region: RegionPos,
    path: PathBuf,
    dir: PathBuf,
    file: File,
    locations: Box<[u32; REGION_CHUNK_COUNT]>,
    timestamps: Box<[u32; REGION_CHUNK_COUNT]>,
    used: SectorBitmap,
    codec: &'static Codec,
    sync: bool,
    /// Header writes left to fail.
    #[cfg(test)]
    fail_header_writes: u32,
}

impl RegionFile {
    /// Open the region file at `path`, creating it if absent.
    ///
    /// Location entries that point outside the file, into the header, or
    /// into sectors already claimed by another entry are dropped.
    pub fn open(region: RegionPos, path: &Path, codec: CodecId, sync: bool) -> io::Result<Self> {
        let codec = codec::from_id(codec).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unregistered codec id {}", codec.0),
            )
        })?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut len = file.metadata()?.len();
        if len < HEADER_BYTES as u64 {
            if len > 0 {
                tracing::warn!(
                    "Region file {} has a truncated header ({} bytes), resetting it",
                    path.display(),
                    len
                );
            }
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&[0u8; HEADER_BYTES])?;
            len = HEADER_BYTES as u64;
        }

        let mut header = vec![0u8; HEADER_BYTES];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;

        let mut locations = Box::new([0u32; REGION_CHUNK_COUNT]);
        let mut timestamps = Box::new([0u32; REGION_CHUNK_COUNT]);
        for i in 0..REGION_CHUNK_COUNT {
            locations[i] = read_be_u32(&header, i * 4);
            timestamps[i] = read_be_u32(&header, SECTOR_BYTES + i * 4);
        }

        let file_sectors = len.div_ceil(SECTOR_BYTES as u64);
        let mut used = SectorBitmap::default();
        used.mark(0, HEADER_SECTORS);
        let mut dropped = Vec::new();
        for (i, entry) in locations.iter_mut().enumerate() {
            if *entry == 0 {
                continue;
            }
            let offset = *entry >> 8;
            let count = *entry & 0xFF;
            let problem = if offset < HEADER_SECTORS {
                Some("points into the header")
            } else if count == 0 {
                Some("has zero length")
            } else if u64::from(offset) + u64::from(count) > file_sectors {
                Some("points past the end of the file")
            } else if used.any_used(offset, count) {
                Some("overlaps another chunk")
            } else {
                None
            };
            match problem {
                Some(reason) => {
                    tracing::warn!(
                        "Region {}: dropping chunk slot {} whose location {}",
                        path.display(),
                        i,
                        reason
                    );
                    *entry = 0;
                    dropped.push(i);
                }
                None => used.mark(offset, count),
            }
        }

        let mut region_file = Self {
            region,
            path: path.to_path_buf(),
            dir,
            file,
            locations,
            timestamps,
            used,
            codec,
            sync,
            #[cfg(test)]
            fail_header_writes: 0,
        };
        for index in dropped {
            region_file.write_header_entry(index)?;
        }
        Ok(region_file)
    }

    pub fn region(&self) -> RegionPos {
        self.region
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_chunk(&self, pos: ChunkPos) -> bool {
        self.locations[self.slot(pos)] != 0
    }

    /// Seconds since the epoch when the chunk was last written.
    pub fn timestamp(&self, pos: ChunkPos) -> Option<u32> {
        let slot = self.slot(pos);
        (self.locations[slot] != 0).then(|| self.timestamps[slot])
    }

    /// All chunks with a record in this file.
    pub fn chunks(&self) -> Vec<ChunkPos> {
        self.locations
            .iter()
            .enumerate()
            .filter(|&(_, &entry)| entry != 0)
            .map(|(i, _)| self.region.chunk(LocalChunkPos::from_index(i)))
            .collect()
    }

    /// Open a decompressing stream over the chunk's stored NBT.
    pub fn read(&mut self, pos: ChunkPos) -> Result<Option<Box<dyn Read>>, StorageError> {
        let entry = self.locations[self.slot(pos)];
        if entry == 0 {
            return Ok(None);
        }
        let offset = u64::from(entry >> 8) * SECTOR_BYTES as u64;
        let count = (entry & 0xFF) as usize;

        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| StorageError::io(&self.path, e))?;
        // The last record of an unpadded file may end mid-sector.
        let mut buf = Vec::with_capacity(count * SECTOR_BYTES);
        (&mut self.file)
            .take((count * SECTOR_BYTES) as u64)
            .read_to_end(&mut buf)
            .map_err(|e| StorageError::io(&self.path, e))?;
        if buf.len() < RECORD_HEADER_BYTES {
            return Err(StorageError::corrupt(pos, "record is truncated"));
        }

        let length = read_be_u32(&buf, 0) as usize;
        if length == 0 {
            return Err(StorageError::corrupt(pos, "record is allocated but empty"));
        }
        if length > buf.len() - 4 {
            return Err(StorageError::corrupt(
                pos,
                format!("record length {} exceeds {} allocated sectors", length, count),
            ));
        }

        let codec_byte = buf[4];
        let codec_id = CodecId(codec_byte & !EXTERNAL_FLAG);
        let Some(codec) = codec::from_id(codec_id) else {
            return Err(StorageError::corrupt(
                pos,
                format!("unknown compression codec {}", codec_id.0),
            ));
        };

        let payload = if codec_byte & EXTERNAL_FLAG != 0 {
            if length != 1 {
                tracing::warn!(
                    "Chunk {:?} has both internal and external data, using external",
                    pos
                );
            }
            let external = self.external_path(pos);
            fs::read(&external).map_err(|e| StorageError::io(external, e))?
        } else {
            buf.truncate(4 + length);
            buf.drain(..RECORD_HEADER_BYTES);
            buf
        };

        Ok(Some(codec.wrap_for_read(Box::new(Cursor::new(payload)))))
    }

    /// Compress and store the chunk's NBT, replacing any previous record.
    ///
    /// The new record is written to freshly allocated sectors before the old
    /// ones are released.
    pub fn write(&mut self, pos: ChunkPos, nbt: &[u8]) -> Result<(), StorageError> {
        let slot = self.slot(pos);
        let payload = self
            .codec
            .encode(nbt)
            .map_err(|e| StorageError::io(&self.path, e))?;

        let codec_byte = self.codec.id().0;
        let sectors_needed = (RECORD_HEADER_BYTES + payload.len()).div_ceil(SECTOR_BYTES);
        let (record, external) = if sectors_needed > MAX_RECORD_SECTORS {
            let external = self.external_path(pos);
            write_external(&external, &payload).map_err(|e| StorageError::io(&external, e))?;
            let mut record = Vec::with_capacity(RECORD_HEADER_BYTES);
            record.extend_from_slice(&1u32.to_be_bytes());
            record.push(codec_byte | EXTERNAL_FLAG);
            (record, true)
        } else {
            let mut record = Vec::with_capacity(RECORD_HEADER_BYTES + payload.len());
            record.extend_from_slice(&(payload.len() as u32 + 1).to_be_bytes());
            record.push(codec_byte);
            record.extend_from_slice(&payload);
            (record, false)
        };

        let sectors = record.len().div_ceil(SECTOR_BYTES) as u32;
        let start = self.used.allocate(sectors);
        self.write_record(slot, start, sectors, record)?;

        if !external {
            remove_if_exists(&self.external_path(pos))
                .map_err(|e| StorageError::io(self.external_path(pos), e))?;
        }
        Ok(())
    }

    /// Remove the chunk's record, if any.
    pub fn clear(&mut self, pos: ChunkPos) -> Result<(), StorageError> {
        let slot = self.slot(pos);
        let old = self.locations[slot];
        if old != 0 {
            self.locations[slot] = 0;
            self.timestamps[slot] = 0;
            self.write_header_entry(slot)
                .map_err(|e| StorageError::io(&self.path, e))?;
            self.used.free(old >> 8, old & 0xFF);
        }
        let external = self.external_path(pos);
        remove_if_exists(&external).map_err(|e| StorageError::io(external, e))
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Pad the file to a whole sector and sync it to disk.
    pub fn close(mut self) -> io::Result<()> {
        let len = self.file.metadata()?.len();
        let rem = len % SECTOR_BYTES as u64;
        if rem != 0 {
            self.file.seek(SeekFrom::End(0))?;
            self.file
                .write_all(&vec![0u8; SECTOR_BYTES - rem as usize])?;
        }
        self.file.sync_all()
    }

    /// Store `record` in the already allocated `start..start + sectors` and
    /// point the slot at it. On failure the slot keeps its previous record
    /// and the new sectors are released only once nothing refers to them.
    fn write_record(
        &mut self,
        slot: usize,
        start: u32,
        sectors: u32,
        mut record: Vec<u8>,
    ) -> Result<(), StorageError> {
        record.resize(sectors as usize * SECTOR_BYTES, 0);
        let written = self
            .file
            .seek(SeekFrom::Start(u64::from(start) * SECTOR_BYTES as u64))
            .and_then(|_| self.file.write_all(&record));
        if let Err(e) = written {
            self.used.free(start, sectors);
            return Err(StorageError::io(&self.path, e));
        }

        let (old, old_time) = (self.locations[slot], self.timestamps[slot]);
        self.locations[slot] = (start << 8) | sectors;
        self.timestamps[slot] = now_secs();
        if let Err(e) = self.commit_header_entry(slot) {
            self.locations[slot] = old;
            self.timestamps[slot] = old_time;
            match self.write_header_entry(slot) {
                Ok(()) => self.used.free(start, sectors),
                // The on-disk entry may still name the new sectors.
                Err(restore) => tracing::warn!(
                    "Region {}: could not restore header entry {} ({}), keeping sectors {}..{} reserved",
                    self.path.display(),
                    slot,
                    restore,
                    start,
                    start + sectors
                ),
            }
            return Err(StorageError::io(&self.path, e));
        }

        if old != 0 {
            self.used.free(old >> 8, old & 0xFF);
        }
        Ok(())
    }

    fn commit_header_entry(&mut self, slot: usize) -> io::Result<()> {
        self.write_header_entry(slot)?;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn write_header_entry(&mut self, slot: usize) -> io::Result<()> {
        #[cfg(test)]
        if self.fail_header_writes > 0 {
            self.fail_header_writes -= 1;
            return Err(io::Error::other("header write failed"));
        }
        self.file.seek(SeekFrom::Start((slot * 4) as u64))?;
        self.file.write_all(&self.locations[slot].to_be_bytes())?;
        self.file
            .seek(SeekFrom::Start((SECTOR_BYTES + slot * 4) as u64))?;
        self.file.write_all(&self.timestamps[slot].to_be_bytes())
    }

    fn slot(&self, pos: ChunkPos) -> usize {
        debug_assert_eq!(pos.region(), self.region, "chunk is not in this region");
        pos.local().index()
    }

    fn external_path(&self, pos: ChunkPos) -> PathBuf {
        self.dir.join(format!("c.{}.{}.mcc", pos.x, pos.z))
    }
}

/// Write through a temporary file so a crash never leaves a half-written record.
fn write_external(path: &Path, payload: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("mcc.tmp");
    fs::write(&tmp, payload)?;
    fs::rename(&tmp, path)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn read_be_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Used/free state of each sector in a region file.
#[derive(Default, Debug)]
struct SectorBitmap {
    words: Vec<u64>,
}

impl SectorBitmap {
    fn is_used(&self, sector: u32) -> bool {
        let (word, bit) = (sector as usize / 64, sector % 64);
        self.words.get(word).is_some_and(|w| w & (1 << bit) != 0)
    }

    fn any_used(&self, start: u32, count: u32) -> bool {
        (start..start + count).any(|s| self.is_used(s))
    }

    fn mark(&mut self, start: u32, count: u32) {
        for sector in start..start + count {
            let word = sector as usize / 64;
            if word >= self.words.len() {
                self.words.resize(word + 1, 0);
            }
            self.words[word] |= 1 << (sector % 64);
        }
    }

    fn free(&mut self, start: u32, count: u32) {
        for sector in start..start + count {
            if let Some(w) = self.words.get_mut(sector as usize / 64) {
                *w &= !(1 << (sector % 64));
            }
        }
    }

    /// First-fit allocation of `count` contiguous sectors.
    fn allocate(&mut self, count: u32) -> u32 {
        let mut from = 0;
        loop {
            let start = self.next_free(from);
            let end = self.next_used(start);
            if end - start >= count {
                self.mark(start, count);
                return start;
            }
            from = end;
        }
    }

    fn next_free(&self, mut sector: u32) -> u32 {
        while self.is_used(sector) {
            sector += 1;
        }
        sector
    }

    /// Next used sector at or after `sector`, or `u32::MAX` if the rest is free.
    fn next_used(&self, mut sector: u32) -> u32 {
        let end = (self.words.len() * 64) as u32;
        while sector < end {
            if self.is_used(sector) {
                return sector;
            }
            sector += 1;
        }
        u32::MAX
    }
}
