//! Record compression codecs, selected by the leading byte of each stored chunk.
//!
//! The registry is process-wide and append-only. Ids already written to disk
//! must keep meaning the same transform forever, so [`register`] refuses to
//! reuse an id.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{LazyLock, PoisonError, RwLock};

use flate2::Compression;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Codec tag stored as the first byte of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodecId(pub u8);

impl CodecId {
    pub const GZIP: Self = Self(1);
    /// zlib-wrapped deflate stream.
    pub const DEFLATE: Self = Self(2);
    pub const NONE: Self = Self(3);
}

/// Set on the codec byte when the payload lives in an external `.mcc` file.
pub const EXTERNAL_FLAG: u8 = 0x80;

/// A compressing writer that must be finished to emit its trailer.
pub trait CodecWrite: Write {
    fn finish(self: Box<Self>) -> io::Result<()>;
}

impl<W: Write> CodecWrite for GzEncoder<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        GzEncoder::finish(*self).map(drop)
    }
}

impl<W: Write> CodecWrite for ZlibEncoder<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        ZlibEncoder::finish(*self).map(drop)
    }
}

/// Pass-through writer for uncompressed records.
pub struct Stored<W>(pub W);

impl<W: Write> Write for Stored<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write> CodecWrite for Stored<W> {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.0.flush()
    }
}

pub type ReadWrapper = for<'a> fn(Box<dyn Read + 'a>) -> Box<dyn Read + 'a>;
pub type WriteWrapper = for<'a> fn(Box<dyn Write + 'a>) -> Box<dyn CodecWrite + 'a>;

/// A symmetric stream transform. Codecs carry no state of their own.
pub struct Codec {
    id: CodecId,
    name: &'static str,
    wrap_read: ReadWrapper,
    wrap_write: WriteWrapper,
}

impl Codec {
    pub const fn new(
        id: CodecId,
        name: &'static str,
        wrap_read: ReadWrapper,
        wrap_write: WriteWrapper,
    ) -> Self {
        Self {
            id,
            name,
            wrap_read,
            wrap_write,
        }
    }

    pub fn id(&self) -> CodecId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn wrap_for_read<'a>(&self, raw: Box<dyn Read + 'a>) -> Box<dyn Read + 'a> {
        (self.wrap_read)(raw)
    }

    pub fn wrap_for_write<'a>(&self, sink: Box<dyn Write + 'a>) -> Box<dyn CodecWrite + 'a> {
        (self.wrap_write)(sink)
    }

    /// Compress a whole buffer.
    pub fn encode(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() / 2);
        let mut writer = self.wrap_for_write(Box::new(&mut out));
        writer.write_all(data)?;
        writer.finish()?;
        Ok(out)
    }

    /// Decompress a whole buffer.
    pub fn decode(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.wrap_for_read(Box::new(data)).read_to_end(&mut out)?;
        Ok(out)
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("id", &self.id.0)
            .field("name", &self.name)
            .finish()
    }
}

fn gzip_read<'a>(raw: Box<dyn Read + 'a>) -> Box<dyn Read + 'a> {
    Box::new(GzDecoder::new(raw))
}

fn gzip_write<'a>(sink: Box<dyn Write + 'a>) -> Box<dyn CodecWrite + 'a> {
    Box::new(GzEncoder::new(sink, Compression::default()))
}

fn deflate_read<'a>(raw: Box<dyn Read + 'a>) -> Box<dyn Read + 'a> {
    Box::new(ZlibDecoder::new(raw))
}

fn deflate_write<'a>(sink: Box<dyn Write + 'a>) -> Box<dyn CodecWrite + 'a> {
    Box::new(ZlibEncoder::new(sink, Compression::default()))
}

fn stored_read<'a>(raw: Box<dyn Read + 'a>) -> Box<dyn Read + 'a> {
    raw
}

fn stored_write<'a>(sink: Box<dyn Write + 'a>) -> Box<dyn CodecWrite + 'a> {
    Box::new(Stored(sink))
}

pub static GZIP: Codec = Codec::new(CodecId::GZIP, "gzip", gzip_read, gzip_write);
pub static DEFLATE: Codec = Codec::new(CodecId::DEFLATE, "deflate", deflate_read, deflate_write);
pub static NONE: Codec = Codec::new(CodecId::NONE, "none", stored_read, stored_write);

static REGISTRY: LazyLock<RwLock<HashMap<u8, &'static Codec>>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    for codec in [&GZIP, &DEFLATE, &NONE] {
        map.insert(codec.id.0, codec);
    }
    RwLock::new(map)
});

/// Look up a codec. `None` means the id was never registered; readers must
/// treat that as corruption.
pub fn from_id(id: CodecId) -> Option<&'static Codec> {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&id.0)
        .copied()
}

pub fn is_valid(id: CodecId) -> bool {
    from_id(id).is_some()
}

/// Add a codec under a fresh id. Existing ids are never reassigned.
pub fn register(codec: Codec) -> Result<&'static Codec, CodecError> {
    let id = codec.id.0;
    if id == 0 || id & EXTERNAL_FLAG != 0 {
        return Err(CodecError::Reserved(id));
    }
    let mut registry = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    if registry.contains_key(&id) {
        return Err(CodecError::IdTaken(id));
    }
    let codec: &'static Codec = Box::leak(Box::new(codec));
    registry.insert(id, codec);
    tracing::info!("Registered chunk codec '{}' with id {}", codec.name, id);
    Ok(codec)
}
