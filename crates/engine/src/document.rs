//! Tree-shaped chunk documents.
//!
//! A [`Document`] is the root compound of a stored chunk's NBT. The storage
//! layer only cares about the `DataVersion` stamp; everything else is left to
//! schema fixes and the caller.

use std::collections::HashMap;

use fastnbt::Value;

/// An NBT compound.
pub type Compound = HashMap<String, Value>;

/// Key of the schema-version stamp at the document root.
pub const DATA_VERSION_KEY: &str = "DataVersion";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Document {
    root: Compound,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_compound(root: Compound) -> Self {
        Self { root }
    }

    /// Parse uncompressed NBT bytes. The root tag must be a compound.
    pub fn from_nbt(bytes: &[u8]) -> fastnbt::error::Result<Self> {
        Ok(Self {
            root: fastnbt::from_bytes(bytes)?,
        })
    }

    /// Serialize to uncompressed NBT bytes.
    pub fn to_nbt(&self) -> fastnbt::error::Result<Vec<u8>> {
        fastnbt::to_bytes(&self.root)
    }

    /// The stored schema version, if the document carries one.
    pub fn data_version(&self) -> Option<i32> {
        match self.root.get(DATA_VERSION_KEY)? {
            Value::Int(v) => Some(*v),
            Value::Short(v) => Some(i32::from(*v)),
            Value::Byte(v) => Some(i32::from(*v)),
            _ => None,
        }
    }

    pub fn set_data_version(&mut self, version: i32) {
        self.root
            .insert(DATA_VERSION_KEY.to_string(), Value::Int(version));
    }

    pub fn root(&self) -> &Compound {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Compound {
        &mut self.root
    }

    pub fn into_compound(self) -> Compound {
        self.root
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.root.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.root.remove(key)
    }

    pub fn compound(&self, key: &str) -> Option<&Compound> {
        as_compound(self.root.get(key)?)
    }

    pub fn compound_mut(&mut self, key: &str) -> Option<&mut Compound> {
        match self.root.get_mut(key)? {
            Value::Compound(c) => Some(c),
            _ => None,
        }
    }
}

impl From<Compound> for Document {
    fn from(root: Compound) -> Self {
        Self::from_compound(root)
    }
}

pub fn as_compound(value: &Value) -> Option<&Compound> {
    match value {
        Value::Compound(c) => Some(c),
        _ => None,
    }
}

/// Read an integral tag as `i32`, accepting any of the integer tag widths.
pub fn as_int(value: &Value) -> Option<i32> {
    match value {
        Value::Byte(v) => Some(i32::from(*v)),
        Value::Short(v) => Some(i32::from(*v)),
        Value::Int(v) => Some(*v),
        Value::Long(v) => i32::try_from(*v).ok(),
        _ => None,
    }
}

/// NBT has no boolean tag; booleans are bytes where any non-zero value is true.
pub fn as_bool(value: &Value) -> bool {
    as_int(value).is_some_and(|v| v != 0)
}

/// Get the compound at `key`, inserting an empty one if absent or of another type.
pub fn compound_entry<'a>(parent: &'a mut Compound, key: &str) -> &'a mut Compound {
    let slot = parent
        .entry(key.to_string())
        .or_insert_with(|| Value::Compound(Compound::new()));
    if !matches!(slot, Value::Compound(_)) {
        *slot = Value::Compound(Compound::new());
    }
    match slot {
        Value::Compound(c) => c,
        _ => unreachable!("slot was just set to a compound"),
    }
}
