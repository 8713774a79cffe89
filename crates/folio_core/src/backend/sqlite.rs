//! SQLite implementation of [`Backend`] and [`SettingsStore`].
//!
//! # Responsibility
//! - Store each top-level document as one JSON row keyed by
//!   `(collection, id)`, embedded children inline in the parent row.
//! - Store settings entries as JSON values keyed by name.
//!
//! # Invariants
//! - Every batch runs in one transaction: it applies fully or not at all.
//! - Row order within a collection is creation order (`sort_order, id`).

use super::{
    Backend, BackendError, BackendResult, ModificationOptions, ParentSegment, Query, Scope,
    SettingsStore,
};
use crate::db::{open_db, open_db_in_memory, DbResult};
use crate::model::source::{merge_object, source_id, value_id, DocumentId, SourceData};
use async_trait::async_trait;
use log::{debug, error};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Wraps an already migrated connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        Ok(Self::new(open_db(path)?))
    }

    pub fn open_in_memory() -> DbResult<Self> {
        Ok(Self::new(open_db_in_memory()?))
    }

    fn with_tx<T>(
        &self,
        operation: &'static str,
        scope: &Scope,
        work: impl FnOnce(&Connection) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let mut conn = self.conn.lock();
        let result = conn
            .transaction()
            .map_err(transport)
            .and_then(|tx| {
                let value = work(&tx)?;
                tx.commit().map_err(transport)?;
                Ok(value)
            });
        match &result {
            Ok(_) => debug!(
                "event=backend_{operation} module=backend status=ok collection={} embedded={}",
                scope.collection,
                scope.is_embedded()
            ),
            Err(err) => error!(
                "event=backend_{operation} module=backend status=error collection={} error={}",
                scope.collection, err
            ),
        }
        result
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn get_documents(&self, scope: &Scope, query: &Query) -> BackendResult<Vec<SourceData>> {
        self.with_tx("get", scope, |conn| {
            let candidates = match scope.parent.split_first() {
                None => load_collection(conn, &scope.collection)?,
                Some((root, _)) => {
                    let Some(row) = load_row(conn, &scope.collection, &root.id)? else {
                        return Err(BackendError::ParentNotFound(root.id.clone()));
                    };
                    embedded_array(&row, &scope.parent)?
                        .iter()
                        .filter_map(|value| value.as_object().cloned())
                        .collect()
                }
            };
            Ok(candidates
                .into_iter()
                .filter(|source| query.matches(source))
                .map(|source| query.shape(source))
                .collect())
        })
    }

    async fn create_documents(
        &self,
        scope: &Scope,
        data: Vec<SourceData>,
        _options: &ModificationOptions,
    ) -> BackendResult<Vec<SourceData>> {
        self.with_tx("create", scope, |conn| {
            for source in &data {
                if source_id(source).is_none() {
                    return Err(BackendError::Rejected("created data must carry `_id`".into()));
                }
            }

            match scope.parent.split_first() {
                None => {
                    let mut next_sort = next_sort_order(conn, &scope.collection)?;
                    for source in &data {
                        let id = source_id(source).unwrap_or_default();
                        if load_row(conn, &scope.collection, id)?.is_some() {
                            return Err(BackendError::Rejected(format!(
                                "document `{id}` already exists in `{}`",
                                scope.collection
                            )));
                        }
                        conn.execute(
                            "INSERT INTO documents (collection, id, data, sort_order)
                             VALUES (?1, ?2, ?3, ?4);",
                            params![scope.collection, id, to_json(source)?, next_sort],
                        )
                        .map_err(transport)?;
                        next_sort += 1;
                    }
                }
                Some((root, _)) => {
                    let mut row = require_row(conn, &scope.collection, root)?;
                    let children = embedded_array_mut(&mut row, &scope.parent)?;
                    for source in &data {
                        let id = source_id(source).unwrap_or_default();
                        if children.iter().any(|child| value_id(child) == Some(id)) {
                            return Err(BackendError::Rejected(format!(
                                "embedded document `{id}` already exists"
                            )));
                        }
                        children.push(Value::Object(source.clone()));
                    }
                    write_row(conn, &scope.collection, &root.id, &row)?;
                }
            }
            Ok(data)
        })
    }

    async fn update_documents(
        &self,
        scope: &Scope,
        updates: Vec<SourceData>,
        _options: &ModificationOptions,
    ) -> BackendResult<Vec<SourceData>> {
        self.with_tx("update", scope, |conn| {
            match scope.parent.split_first() {
                None => {
                    for changes in &updates {
                        let id = require_id(changes)?;
                        let Some(mut row) = load_row(conn, &scope.collection, id)? else {
                            return Err(BackendError::Rejected(format!(
                                "document `{id}` does not exist in `{}`",
                                scope.collection
                            )));
                        };
                        merge_object(&mut row, changes);
                        write_row(conn, &scope.collection, id, &row)?;
                    }
                }
                Some((root, _)) => {
                    let mut row = require_row(conn, &scope.collection, root)?;
                    let children = embedded_array_mut(&mut row, &scope.parent)?;
                    for changes in &updates {
                        let id = require_id(changes)?;
                        let child = children
                            .iter_mut()
                            .find(|child| value_id(child) == Some(id))
                            .and_then(Value::as_object_mut)
                            .ok_or_else(|| {
                                BackendError::Rejected(format!(
                                    "embedded document `{id}` does not exist"
                                ))
                            })?;
                        merge_object(child, changes);
                    }
                    write_row(conn, &scope.collection, &root.id, &row)?;
                }
            }
            Ok(updates)
        })
    }

    async fn delete_documents(
        &self,
        scope: &Scope,
        ids: Vec<DocumentId>,
        _options: &ModificationOptions,
    ) -> BackendResult<Vec<DocumentId>> {
        self.with_tx("delete", scope, |conn| {
            let mut deleted = Vec::with_capacity(ids.len());
            match scope.parent.split_first() {
                None => {
                    for id in ids {
                        let changed = conn
                            .execute(
                                "DELETE FROM documents WHERE collection = ?1 AND id = ?2;",
                                params![scope.collection, id],
                            )
                            .map_err(transport)?;
                        if changed > 0 {
                            deleted.push(id);
                        }
                    }
                }
                Some((root, _)) => {
                    let mut row = require_row(conn, &scope.collection, root)?;
                    let children = embedded_array_mut(&mut row, &scope.parent)?;
                    for id in ids {
                        let before = children.len();
                        children.retain(|child| value_id(child) != Some(id.as_str()));
                        if children.len() < before {
                            deleted.push(id);
                        }
                    }
                    write_row(conn, &scope.collection, &root.id, &row)?;
                }
            }
            Ok(deleted)
        })
    }
}

#[async_trait]
impl SettingsStore for SqliteBackend {
    async fn get_setting(&self, key: &str) -> BackendResult<Option<Value>> {
        let conn = self.conn.lock();
        let text: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1;",
                [key],
                |row| row.get(0),
            )
            .optional()
            .map_err(transport)?;
        text.map(|text| serde_json::from_str(&text).map_err(transport))
            .transpose()
    }

    async fn set_setting(&self, key: &str, value: Value) -> BackendResult<()> {
        let text = serde_json::to_string(&value).map_err(transport)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = (strftime('%s', 'now') * 1000);",
            params![key, text],
        )
        .map_err(transport)?;
        Ok(())
    }
}

fn transport(err: impl std::fmt::Display) -> BackendError {
    BackendError::Transport(err.to_string())
}

fn to_json(source: &SourceData) -> BackendResult<String> {
    serde_json::to_string(source).map_err(transport)
}

fn parse_row(text: &str) -> BackendResult<SourceData> {
    match serde_json::from_str(text).map_err(transport)? {
        Value::Object(source) => Ok(source),
        _ => Err(BackendError::Transport(
            "stored document is not a JSON object".to_string(),
        )),
    }
}

fn require_id(changes: &SourceData) -> BackendResult<&str> {
    source_id(changes)
        .ok_or_else(|| BackendError::Rejected("update payload must carry `_id`".to_string()))
}

fn load_collection(conn: &Connection, collection: &str) -> BackendResult<Vec<SourceData>> {
    let mut stmt = conn
        .prepare(
            "SELECT data FROM documents
             WHERE collection = ?1
             ORDER BY sort_order ASC, id ASC;",
        )
        .map_err(transport)?;
    let mut rows = stmt.query([collection]).map_err(transport)?;
    let mut sources = Vec::new();
    while let Some(row) = rows.next().map_err(transport)? {
        let text: String = row.get(0).map_err(transport)?;
        sources.push(parse_row(&text)?);
    }
    Ok(sources)
}

fn load_row(conn: &Connection, collection: &str, id: &str) -> BackendResult<Option<SourceData>> {
    let text: Option<String> = conn
        .query_row(
            "SELECT data FROM documents WHERE collection = ?1 AND id = ?2;",
            params![collection, id],
            |row| row.get(0),
        )
        .optional()
        .map_err(transport)?;
    text.as_deref().map(parse_row).transpose()
}

fn require_row(conn: &Connection, collection: &str, root: &ParentSegment) -> BackendResult<SourceData> {
    load_row(conn, collection, &root.id)?
        .ok_or_else(|| BackendError::ParentNotFound(root.id.clone()))
}

fn write_row(conn: &Connection, collection: &str, id: &str, source: &SourceData) -> BackendResult<()> {
    conn.execute(
        "UPDATE documents
         SET data = ?1, updated_at = (strftime('%s', 'now') * 1000)
         WHERE collection = ?2 AND id = ?3;",
        params![to_json(source)?, collection, id],
    )
    .map_err(transport)?;
    Ok(())
}

fn next_sort_order(conn: &Connection, collection: &str) -> BackendResult<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM documents WHERE collection = ?1;",
        [collection],
        |row| row.get(0),
    )
    .map_err(transport)
}

/// Walks `path` (first segment = the row itself) down to the target array.
fn embedded_array<'a>(row: &'a SourceData, path: &[ParentSegment]) -> BackendResult<&'a [Value]> {
    let Some((first, rest)) = path.split_first() else {
        return Ok(&[]);
    };
    let mut array: &'a [Value] = child_array(row, &first.embedded_name)?;
    for segment in rest {
        let parent = array
            .iter()
            .find(|value| value_id(value) == Some(segment.id.as_str()))
            .and_then(Value::as_object)
            .ok_or_else(|| BackendError::ParentNotFound(segment.id.clone()))?;
        array = child_array(parent, &segment.embedded_name)?;
    }
    Ok(array)
}

fn child_array<'a>(source: &'a SourceData, key: &str) -> BackendResult<&'a [Value]> {
    match source.get(key) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(values)) => Ok(values.as_slice()),
        Some(_) => Err(BackendError::Transport(format!(
            "stored embedded collection `{key}` is not an array"
        ))),
    }
}

fn embedded_array_mut<'a>(
    row: &'a mut SourceData,
    path: &[ParentSegment],
) -> BackendResult<&'a mut Vec<Value>> {
    let (first, rest) = path
        .split_first()
        .ok_or_else(|| BackendError::Rejected("embedded scope without parent".to_string()))?;
    let mut array = child_array_mut(row, &first.embedded_name)?;
    for segment in rest {
        let current: &'a mut Vec<Value> = array;
        let parent = current
            .iter_mut()
            .find(|value| value_id(value) == Some(segment.id.as_str()))
            .and_then(Value::as_object_mut)
            .ok_or_else(|| BackendError::ParentNotFound(segment.id.clone()))?;
        array = child_array_mut(parent, &segment.embedded_name)?;
    }
    Ok(array)
}

fn child_array_mut<'a>(source: &'a mut SourceData, key: &str) -> BackendResult<&'a mut Vec<Value>> {
    let slot = source
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if slot.is_null() {
        *slot = Value::Array(Vec::new());
    }
    slot.as_array_mut().ok_or_else(|| {
        BackendError::Transport(format!("stored embedded collection `{key}` is not an array"))
    })
}
