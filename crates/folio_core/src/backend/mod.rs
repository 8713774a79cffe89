//! Remote persistence contracts.
//!
//! # Responsibility
//! - Define the opaque asynchronous store every collection delegates to.
//! - Define the external settings store used for compendium configuration.
//!
//! # Invariants
//! - The backend is the only source of truth; collections hold copies.
//! - A rejected call leaves persisted state unchanged.

use crate::model::source::{project, source_id, DocumentId, SourceData};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod sqlite;

pub use sqlite::SqliteBackend;

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend transport failure: {0}")]
    Transport(String),
    #[error("backend rejected request: {0}")]
    Rejected(String),
    #[error("embedded parent not found: {0}")]
    ParentNotFound(DocumentId),
}

/// One step from a top-level document down to an embedded collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentSegment {
    pub id: DocumentId,
    pub embedded_name: String,
}

/// Addresses a set of documents in the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    /// Collection key: a document type name for world collections, a
    /// `<package>.<pack>` key for compendium packs.
    pub collection: String,
    /// Empty for top-level documents.
    pub parent: Vec<ParentSegment>,
}

impl Scope {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            parent: Vec::new(),
        }
    }

    pub fn embedded(mut self, parent_id: impl Into<DocumentId>, embedded_name: impl Into<String>) -> Self {
        self.parent.push(ParentSegment {
            id: parent_id.into(),
            embedded_name: embedded_name.into(),
        });
        self
    }

    pub fn is_embedded(&self) -> bool {
        !self.parent.is_empty()
    }
}

/// Selector passed through to `get_documents`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Restricts results to these ids when set.
    pub ids: Option<Vec<DocumentId>>,
    /// Top-level equality filter.
    pub filter: SourceData,
    /// Projects results onto `_id` plus these fields when set.
    pub index_fields: Option<Vec<String>>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<DocumentId>) -> Self {
        Self::by_ids(vec![id.into()])
    }

    pub fn by_ids(ids: Vec<DocumentId>) -> Self {
        Self {
            ids: Some(ids),
            ..Self::default()
        }
    }

    pub fn index(fields: &[String]) -> Self {
        Self {
            index_fields: Some(fields.to_vec()),
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.filter.insert(key.into(), value);
        self
    }

    pub fn matches(&self, source: &SourceData) -> bool {
        if let Some(ids) = &self.ids {
            match source_id(source) {
                Some(id) if ids.iter().any(|wanted| wanted == id) => {}
                _ => return false,
            }
        }
        self.filter
            .iter()
            .all(|(key, value)| source.get(key) == Some(value))
    }

    /// Applies the index projection, if any.
    pub fn shape(&self, source: SourceData) -> SourceData {
        match &self.index_fields {
            Some(fields) => project(&source, fields),
            None => source,
        }
    }
}

/// Options forwarded with every modification request.
#[derive(Debug, Clone, PartialEq)]
pub struct ModificationOptions {
    /// Keep a caller-supplied `_id` instead of generating one.
    pub keep_id: bool,
    /// Render observers after the change.
    pub render: bool,
    /// Free-form options passed through to hooks and the backend.
    pub extra: SourceData,
}

impl Default for ModificationOptions {
    fn default() -> Self {
        Self {
            keep_id: false,
            render: true,
            extra: SourceData::new(),
        }
    }
}

impl ModificationOptions {
    pub fn keep_id() -> Self {
        Self {
            keep_id: true,
            ..Self::default()
        }
    }
}

/// Opaque asynchronous document store.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get_documents(&self, scope: &Scope, query: &Query) -> BackendResult<Vec<SourceData>>;

    /// Persists full source objects (each with `_id`) and returns them as stored.
    async fn create_documents(
        &self,
        scope: &Scope,
        data: Vec<SourceData>,
        options: &ModificationOptions,
    ) -> BackendResult<Vec<SourceData>>;

    /// Applies incremental payloads (each with `_id`) and returns the
    /// payloads actually applied.
    async fn update_documents(
        &self,
        scope: &Scope,
        updates: Vec<SourceData>,
        options: &ModificationOptions,
    ) -> BackendResult<Vec<SourceData>>;

    /// Deletes by id and returns the ids actually removed.
    async fn delete_documents(
        &self,
        scope: &Scope,
        ids: Vec<DocumentId>,
        options: &ModificationOptions,
    ) -> BackendResult<Vec<DocumentId>>;
}

/// Named external settings entries. No exclusive access is implied:
/// read-merge-write callers must re-read before merging.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> BackendResult<Option<Value>>;
    async fn set_setting(&self, key: &str, value: Value) -> BackendResult<()>;
}
