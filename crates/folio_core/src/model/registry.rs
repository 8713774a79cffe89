//! Explicit registry of document types.
//!
//! Replaces process-wide configuration: whoever builds collections passes a
//! shared `Arc<DocumentTypeRegistry>` to them.

use crate::model::client::{BasicDocument, ClientDocument};
use crate::model::error::{DocumentError, DocumentResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Built-in type used to file imported documents.
pub const FOLDER_DOCUMENT: &str = "Folder";

/// Fields kept in a compendium index besides `_id`.
pub const DEFAULT_INDEX_FIELDS: &[&str] = &["name", "type", "img"];

/// One embedded collection of a parent type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedSpec {
    /// Key holding the child array inside the parent's source.
    pub key: String,
    /// Document type of the children.
    pub document_name: String,
}

#[derive(Clone)]
pub struct DocumentType {
    name: String,
    embedded: Vec<EmbeddedSpec>,
    index_fields: Vec<String>,
    behavior: Arc<dyn ClientDocument>,
}

impl DocumentType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            embedded: Vec::new(),
            index_fields: DEFAULT_INDEX_FIELDS.iter().map(|f| f.to_string()).collect(),
            behavior: Arc::new(BasicDocument),
        }
    }

    pub fn with_embedded(mut self, key: impl Into<String>, document_name: impl Into<String>) -> Self {
        self.embedded.push(EmbeddedSpec {
            key: key.into(),
            document_name: document_name.into(),
        });
        self
    }

    pub fn with_index_fields(mut self, fields: &[&str]) -> Self {
        self.index_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_behavior(mut self, behavior: Arc<dyn ClientDocument>) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn embedded(&self) -> &[EmbeddedSpec] {
        &self.embedded
    }

    pub fn embedded_spec(&self, key: &str) -> Option<&EmbeddedSpec> {
        self.embedded.iter().find(|spec| spec.key == key)
    }

    pub fn index_fields(&self) -> &[String] {
        &self.index_fields
    }

    pub fn behavior(&self) -> &Arc<dyn ClientDocument> {
        &self.behavior
    }
}

impl std::fmt::Debug for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentType")
            .field("name", &self.name)
            .field("embedded", &self.embedded)
            .field("index_fields", &self.index_fields)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("document type already registered: {0}")]
    DuplicateType(String),
    #[error("{parent} embeds unregistered document type `{child}`")]
    UnknownEmbeddedType { parent: String, child: String },
}

#[derive(Debug)]
pub struct DocumentTypeRegistry {
    types: BTreeMap<String, DocumentType>,
}

impl Default for DocumentTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentTypeRegistry {
    /// Creates a registry holding only the built-in `Folder` type.
    pub fn new() -> Self {
        let mut types = BTreeMap::new();
        types.insert(
            FOLDER_DOCUMENT.to_string(),
            DocumentType::new(FOLDER_DOCUMENT).with_index_fields(&["name", "type"]),
        );
        Self { types }
    }

    /// Registers a type. Embedded child types must be registered first.
    pub fn register(&mut self, document_type: DocumentType) -> Result<(), RegistryError> {
        if self.types.contains_key(document_type.name()) {
            return Err(RegistryError::DuplicateType(document_type.name().to_string()));
        }
        if let Some(missing) = document_type
            .embedded()
            .iter()
            .find(|spec| !self.types.contains_key(&spec.document_name))
        {
            return Err(RegistryError::UnknownEmbeddedType {
                parent: document_type.name().to_string(),
                child: missing.document_name.clone(),
            });
        }
        self.types
            .insert(document_type.name().to_string(), document_type);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&DocumentType> {
        self.types.get(name)
    }

    pub fn require(&self, name: &str) -> DocumentResult<&DocumentType> {
        self.get(name)
            .ok_or_else(|| DocumentError::UnknownDocumentType(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
