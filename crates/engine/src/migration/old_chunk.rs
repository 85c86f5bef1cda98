//! Conversion of pre-Anvil (McRegion) chunk columns into Anvil sections.
//!
//! McRegion stores a whole 16x16x128 column in flat arrays indexed
//! `x << 11 | z << 7 | y`. Anvil splits the column into 16-high sections
//! indexed `y << 8 | z << 4 | x`, and leaves all-air sections out.

use fastnbt::{ByteArray, IntArray, Value};

use crate::document::{Compound, Document, as_bool, as_int};
use crate::error::MigrationError;
use crate::world::nibble::NibbleArray;

/// Column height is `1 << 7` blocks.
pub const OLD_DEPTH_BITS: u32 = 7;
const OLD_HEIGHT: u32 = 1 << OLD_DEPTH_BITS;
const COLUMN_VOLUME: usize = 16 * 16 * OLD_HEIGHT as usize;
const SECTION_VOLUME: usize = 16 * 16 * 16;

/// Biome byte meaning "not yet computed".
const UNSET_BIOME: i8 = -1;

/// A McRegion chunk column.
pub struct OldChunk {
    pub x: i32,
    pub z: i32,
    pub last_update: i64,
    pub terrain_populated: bool,
    pub height_map: Vec<u8>,
    pub blocks: Vec<u8>,
    pub data: NibbleArray,
    pub sky_light: NibbleArray,
    pub block_light: NibbleArray,
    pub entities: Option<Value>,
    pub tile_entities: Option<Value>,
    pub tile_ticks: Option<Value>,
}

impl OldChunk {
    /// Read the `Level` compound of a McRegion chunk document.
    pub fn read(doc: &Document) -> Result<Self, MigrationError> {
        let level = doc
            .compound("Level")
            .ok_or_else(|| MigrationError::Malformed("McRegion chunk has no Level compound".into()))?;
        let int = |key: &str| {
            level
                .get(key)
                .and_then(as_int)
                .ok_or_else(|| MigrationError::Malformed(format!("McRegion chunk has no {}", key)))
        };
        let last_update = match level.get("LastUpdate") {
            Some(Value::Long(v)) => *v,
            _ => 0,
        };

        let blocks = bytes(level, "Blocks", COLUMN_VOLUME)?;
        let nibbles = |key: &str| -> Result<NibbleArray, MigrationError> {
            Ok(NibbleArray::new(bytes(level, key, COLUMN_VOLUME / 2)?, OLD_DEPTH_BITS))
        };
        let height_map = match level.get("HeightMap") {
            Some(_) => bytes(level, "HeightMap", 256)?,
            None => vec![0; 256],
        };

        Ok(Self {
            x: int("xPos")?,
            z: int("zPos")?,
            last_update,
            terrain_populated: level.get("TerrainPopulated").is_some_and(as_bool),
            height_map,
            blocks,
            data: nibbles("Data")?,
            sky_light: nibbles("SkyLight")?,
            block_light: nibbles("BlockLight")?,
            entities: level.get("Entities").cloned(),
            tile_entities: level.get("TileEntities").cloned(),
            tile_ticks: level.get("TileTicks").cloned(),
        })
    }

    fn block(&self, x: u32, y: u32, z: u32) -> u8 {
        self.blocks[((x << (OLD_DEPTH_BITS + 4)) | (z << OLD_DEPTH_BITS) | y) as usize]
    }

    fn section_is_empty(&self, section_y: u32) -> bool {
        let base = section_y * 16;
        (0..16).all(|x| (0..16).all(|z| (0..16).all(|y| self.block(x, base + y, z) == 0)))
    }

    /// Build the equivalent Anvil chunk document.
    pub fn to_anvil(&self) -> Document {
        let mut sections = Vec::new();
        for section_y in 0..OLD_HEIGHT / 16 {
            if self.section_is_empty(section_y) {
                continue;
            }
            sections.push(Value::Compound(self.section(section_y)));
        }

        let mut level = Compound::new();
        level.insert("xPos".into(), Value::Int(self.x));
        level.insert("zPos".into(), Value::Int(self.z));
        level.insert("LastUpdate".into(), Value::Long(self.last_update));
        level.insert(
            "HeightMap".into(),
            Value::IntArray(IntArray::new(self.height_map.iter().map(|&h| i32::from(h)).collect())),
        );
        level.insert("TerrainPopulated".into(), Value::Byte(self.terrain_populated as i8));
        level.insert("Sections".into(), Value::List(sections));
        level.insert(
            "Biomes".into(),
            Value::ByteArray(ByteArray::new(vec![UNSET_BIOME; 256])),
        );
        level.insert(
            "Entities".into(),
            self.entities.clone().unwrap_or(Value::List(Vec::new())),
        );
        level.insert(
            "TileEntities".into(),
            self.tile_entities.clone().unwrap_or(Value::List(Vec::new())),
        );
        if let Some(ticks) = &self.tile_ticks {
            level.insert("TileTicks".into(), ticks.clone());
        }

        let mut doc = Document::new();
        doc.insert("Level", Value::Compound(level));
        doc
    }

    fn section(&self, section_y: u32) -> Compound {
        let base = section_y * 16;
        let mut blocks = vec![0i8; SECTION_VOLUME];
        let mut data = vec![0u8; SECTION_VOLUME / 2];
        let mut sky = vec![0u8; SECTION_VOLUME / 2];
        let mut block_light = vec![0u8; SECTION_VOLUME / 2];
        for x in 0..16u32 {
            for z in 0..16u32 {
                for y in 0..16u32 {
                    let index = ((y << 8) | (z << 4) | x) as usize;
                    blocks[index] = self.block(x, base + y, z) as i8;
                    put_nibble(&mut data, index, self.data.get(x, base + y, z));
                    put_nibble(&mut sky, index, self.sky_light.get(x, base + y, z));
                    put_nibble(&mut block_light, index, self.block_light.get(x, base + y, z));
                }
            }
        }

        let mut section = Compound::new();
        section.insert("Y".into(), Value::Byte(section_y as i8));
        section.insert("Blocks".into(), Value::ByteArray(ByteArray::new(blocks)));
        section.insert("Data".into(), byte_array(data));
        section.insert("SkyLight".into(), byte_array(sky));
        section.insert("BlockLight".into(), byte_array(block_light));
        section
    }
}

/// Convert a McRegion chunk document to Anvil.
pub fn convert_to_anvil(doc: &Document) -> Result<Document, MigrationError> {
    Ok(OldChunk::read(doc)?.to_anvil())
}

fn bytes(level: &Compound, key: &str, len: usize) -> Result<Vec<u8>, MigrationError> {
    match level.get(key) {
        Some(Value::ByteArray(arr)) if arr.len() == len => Ok(arr.iter().map(|&b| b as u8).collect()),
        Some(Value::ByteArray(arr)) => Err(MigrationError::Malformed(format!(
            "{} has {} bytes, expected {}",
            key,
            arr.len(),
            len
        ))),
        _ => Err(MigrationError::Malformed(format!("McRegion chunk has no {} array", key))),
    }
}

fn byte_array(bytes: Vec<u8>) -> Value {
    Value::ByteArray(ByteArray::new(bytes.into_iter().map(|b| b as i8).collect()))
}

fn put_nibble(buf: &mut [u8], index: usize, value: u8) {
    let byte = &mut buf[index >> 1];
    if index & 1 == 0 {
        *byte = (*byte & 0xF0) | (value & 0xF);
    } else {
        *byte = (*byte & 0x0F) | ((value & 0xF) << 4);
    }
}
