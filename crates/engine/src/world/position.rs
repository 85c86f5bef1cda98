/// Number of chunks along each horizontal axis of a region.
pub const REGION_SIZE: i32 = 32;
/// Number of chunk slots in one region file.
pub const REGION_CHUNK_COUNT: usize = (REGION_SIZE * REGION_SIZE) as usize;

/// Chunk column position (each chunk is 16x16 blocks horizontally).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// The region file this chunk lives in.
    pub const fn region(&self) -> RegionPos {
        RegionPos {
            x: self.x.div_euclid(REGION_SIZE),
            z: self.z.div_euclid(REGION_SIZE),
        }
    }

    /// Position within the region (0..32 each axis).
    pub const fn local(&self) -> LocalChunkPos {
        LocalChunkPos {
            x: self.x.rem_euclid(REGION_SIZE) as u8,
            z: self.z.rem_euclid(REGION_SIZE) as u8,
        }
    }

    /// Pack into a single `i64`: x in the low 32 bits, z in the high 32 bits.
    pub const fn to_long(&self) -> i64 {
        (self.x as u32 as i64) | ((self.z as u32 as i64) << 32)
    }

    pub const fn from_long(packed: i64) -> Self {
        Self {
            x: packed as i32,
            z: (packed >> 32) as i32,
        }
    }
}

/// Region position: one region covers a 32x32 block of chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionPos {
    pub x: i32,
    pub z: i32,
}

impl RegionPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// File name of this region: `r.<x>.<z>.<ext>`.
    pub fn file_name(&self, ext: &str) -> String {
        format!("r.{}.{}.{}", self.x, self.z, ext)
    }

    /// Parse a region file name produced by [`RegionPos::file_name`].
    pub fn parse_file_name(name: &str, ext: &str) -> Option<Self> {
        let stem = name.strip_suffix(ext)?.strip_suffix('.')?;
        let mut parts = stem.split('.');
        if parts.next()? != "r" {
            return None;
        }
        let x = parts.next()?.parse().ok()?;
        let z = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { x, z })
    }

    /// The absolute chunk at a local slot of this region.
    pub const fn chunk(&self, local: LocalChunkPos) -> ChunkPos {
        ChunkPos {
            x: self.x * REGION_SIZE + local.x as i32,
            z: self.z * REGION_SIZE + local.z as i32,
        }
    }
}

/// Chunk position local to a region (x, z in 0..32).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalChunkPos {
    pub x: u8,
    pub z: u8,
}

impl LocalChunkPos {
    /// Slot index into the region header tables.
    pub const fn index(&self) -> usize {
        self.x as usize + self.z as usize * REGION_SIZE as usize
    }

    pub const fn from_index(index: usize) -> Self {
        Self {
            x: (index % REGION_SIZE as usize) as u8,
            z: (index / REGION_SIZE as usize) as u8,
        }
    }
}
