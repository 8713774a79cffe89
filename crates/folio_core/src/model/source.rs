//! Persisted source data helpers.
//!
//! # Responsibility
//! - Define the JSON object shape every document is persisted as.
//! - Generate and validate document ids.
//! - Merge incremental update payloads into a source snapshot.
//!
//! # Invariants
//! - Every persisted source object carries its id under `_id`.
//! - Ids are 16 ASCII alphanumerics and never change once assigned.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Stable document identifier, unique within its owning collection.
pub type DocumentId = String;

/// Last-persisted snapshot of a document.
pub type SourceData = Map<String, Value>;

/// Recomputed, never-persisted state produced by the preparation pipeline.
pub type DerivedData = Map<String, Value>;

/// Key under which every source object stores its id.
pub const ID_KEY: &str = "_id";

const ID_LENGTH: usize = 16;
const DELETE_PREFIX: &str = "-=";

/// Keys removed when a document leaves its home collection.
const LOCAL_IDENTITY_KEYS: &[&str] = &[ID_KEY, "folder", "permission", "sort"];

static ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]{16}$").expect("valid id regex"));

/// Generates a fresh random document id.
pub fn random_id() -> DocumentId {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(ID_LENGTH);
    id
}

/// Strict format of generated ids and ids kept with `keep_id`.
pub fn is_valid_id(value: &str) -> bool {
    ID_RE.is_match(value)
}

/// Ids already held by a backend only need to be non-blank.
pub fn is_stored_id(value: &str) -> bool {
    !value.trim().is_empty()
}

/// Returns the `_id` of a source object when it is a string.
pub fn source_id(source: &SourceData) -> Option<&str> {
    source.get(ID_KEY).and_then(Value::as_str)
}

/// Returns the `_id` of a JSON value holding a source object.
pub fn value_id(value: &Value) -> Option<&str> {
    value.as_object().and_then(source_id)
}

/// Removes keys that only make sense inside the collection the data came from.
pub fn strip_local_identity(source: &mut SourceData) {
    for key in LOCAL_IDENTITY_KEYS {
        source.remove(*key);
    }
}

/// Recursively merges `changes` into `target`.
///
/// Nested objects merge key by key; any other value replaces the target
/// value. A key written as `-=name` removes `name` from the target.
pub fn merge_object(target: &mut SourceData, changes: &SourceData) {
    for (key, value) in changes {
        if let Some(removed) = key.strip_prefix(DELETE_PREFIX) {
            target.remove(removed);
            continue;
        }
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_object(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Projects a source onto `_id` plus the listed top-level fields.
pub fn project(source: &SourceData, fields: &[String]) -> SourceData {
    let mut projection = SourceData::new();
    if let Some(id) = source.get(ID_KEY) {
        projection.insert(ID_KEY.to_string(), id.clone());
    }
    for field in fields {
        if let Some(value) = source.get(field) {
            projection.insert(field.clone(), value.clone());
        }
    }
    projection
}
