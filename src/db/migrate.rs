//! Step-wise schema migrations
//!
//! Each step moves a raw document exactly one version up or down, so a
//! document of any older version reaches the current layout by applying
//! the steps in sequence.

use serde_json::{json, Map, Value};
use tracing::debug;

use super::DbError;
use crate::cache::extension;
use crate::inode::InodeID;

type Step = fn(&mut Map<String, Value>);

/// `UPGRADES[n]` moves a document from version `n` to `n + 1`
const UPGRADES: [Step; 3] = [create_tables, add_bind_handle, add_extension];

/// `DOWNGRADES[n]` moves a document from version `n + 1` to `n`
const DOWNGRADES: [Step; 3] = [drop_tables, drop_bind_handle, drop_extension];

/// Latest version migrations know how to reach
pub const LATEST: u32 = UPGRADES.len() as u32;

/// Version recorded in a raw document; documents without one are version 0
pub fn version(document: &Value) -> u32 {
    document
        .get("version")
        .and_then(Value::as_u64)
        .map_or(0, |version| version as u32)
}

fn object(document: &mut Value) -> Result<&mut Map<String, Value>, DbError> {
    if document.is_null() {
        *document = Value::Object(Map::new());
    }
    document
        .as_object_mut()
        .ok_or_else(|| DbError::Corrupt("document is not an object".into()))
}

/// Bring `document` up to `target`
pub fn upgrade(document: &mut Value, target: u32) -> Result<(), DbError> {
    let mut current = version(document);
    if target > LATEST || current > LATEST {
        return Err(DbError::Version {
            found: current.max(target),
            supported: LATEST,
        });
    }

    let map = object(document)?;
    while current < target {
        debug!(from = current, to = current + 1, "Upgrading database");
        UPGRADES[current as usize](map);
        current += 1;
        map.insert("version".into(), json!(current));
    }
    Ok(())
}

/// Take `document` back down to `target`
pub fn downgrade(document: &mut Value, target: u32) -> Result<(), DbError> {
    let mut current = version(document);
    if current > LATEST {
        return Err(DbError::Version {
            found: current,
            supported: LATEST,
        });
    }

    let map = object(document)?;
    while current > target {
        debug!(from = current, to = current - 1, "Downgrading database");
        DOWNGRADES[current as usize - 1](map);
        current -= 1;
        if current > 0 {
            map.insert("version".into(), json!(current));
        }
    }
    Ok(())
}

fn inodes(map: &mut Map<String, Value>) -> impl Iterator<Item = &mut Map<String, Value>> {
    map.get_mut("inodes")
        .and_then(Value::as_array_mut)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object_mut)
}

fn create_tables(map: &mut Map<String, Value>) {
    map.insert("inode_id".into(), json!({ "next": InodeID::FIRST.get() }));
    map.insert("inodes".into(), json!([]));
    map.insert("mounts".into(), json!([]));
}

fn drop_tables(map: &mut Map<String, Value>) {
    map.clear();
}

fn add_bind_handle(map: &mut Map<String, Value>) {
    for inode in inodes(map) {
        inode.entry("bind_handle").or_insert(Value::Null);
    }
}

fn drop_bind_handle(map: &mut Map<String, Value>) {
    for inode in inodes(map) {
        inode.remove("bind_handle");
    }
}

fn add_extension(map: &mut Map<String, Value>) {
    for inode in inodes(map) {
        let name = inode.get("name").and_then(Value::as_str).unwrap_or_default();
        let ext = extension(name);
        inode.insert("extension".into(), json!(ext));
    }
}

fn drop_extension(map: &mut Map<String, Value>) {
    for inode in inodes(map) {
        inode.remove("extension");
    }
}
