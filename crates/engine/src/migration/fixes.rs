//! Built-in chunk schema fixes.

use fastnbt::Value;

use crate::document::{Compound, Document, as_bool};
use crate::migration::upgrader::{SchemaTag, StepUpgrader};

/// Population flags become a generation status.
pub const PROTO_CHUNK_VERSION: i32 = 1466;
/// Intermediate status names collapse into `full`.
pub const STATUS_RENAME_VERSION: i32 = 1925;
/// The `Level` wrapper is removed and its fields move to the root.
pub const LEVEL_FLATTEN_VERSION: i32 = 2842;

/// The standard chunk fix set.
pub fn standard() -> StepUpgrader {
    StepUpgrader::builder()
        .fix(PROTO_CHUNK_VERSION, SchemaTag::CHUNK, "proto_chunk_status", proto_chunk_status)
        .fix(STATUS_RENAME_VERSION, SchemaTag::CHUNK, "status_rename", status_rename)
        .fix(LEVEL_FLATTEN_VERSION, SchemaTag::CHUNK, "level_flatten", level_flatten)
        .build()
}

fn level_mut(doc: &mut Document) -> Result<Option<&mut Compound>, String> {
    match doc.root_mut().get_mut("Level") {
        None => Ok(None),
        Some(Value::Compound(level)) => Ok(Some(level)),
        Some(_) => Err("Level is not a compound".into()),
    }
}

fn proto_chunk_status(doc: &mut Document) -> Result<(), String> {
    let Some(level) = level_mut(doc)? else {
        return Ok(());
    };
    let populated = level.remove("TerrainPopulated").is_some_and(|v| as_bool(&v));
    level.remove("LightPopulated");
    if !level.contains_key("Status") {
        let status = if populated { "mobs_spawned" } else { "empty" };
        level.insert("Status".into(), Value::String(status.into()));
    }
    Ok(())
}

fn status_rename(doc: &mut Document) -> Result<(), String> {
    let Some(level) = level_mut(doc)? else {
        return Ok(());
    };
    if let Some(Value::String(status)) = level.get_mut("Status") {
        let renamed = match status.as_str() {
            "mobs_spawned" | "finalized" | "postprocessed" | "fullchunk" => "full",
            "decorated" => "features",
            "lighted" => "light",
            _ => return Ok(()),
        };
        *status = renamed.to_string();
    }
    Ok(())
}

fn level_flatten(doc: &mut Document) -> Result<(), String> {
    if level_mut(doc)?.is_none() {
        return Ok(());
    }
    let Some(Value::Compound(level)) = doc.remove("Level") else {
        return Ok(());
    };
    for (key, value) in level {
        let key = match key.as_str() {
            "Sections" => "sections".to_string(),
            "TileEntities" => "block_entities".to_string(),
            "Structures" => "structures".to_string(),
            "TileTicks" => "block_ticks".to_string(),
            "LiquidTicks" => "fluid_ticks".to_string(),
            _ => key,
        };
        doc.root_mut().entry(key).or_insert(value);
    }
    if let Some(Value::String(status)) = doc.root_mut().get_mut("Status") {
        if !status.contains(':') {
            *status = format!("minecraft:{}", status);
        }
    }
    Ok(())
}
