//! Error kinds shared by every document operation.

use crate::backend::BackendError;
use crate::model::permission::PermissionLevel;
use crate::model::source::DocumentId;
use thiserror::Error;

pub type DocumentResult<T> = Result<T, DocumentError>;

/// Failure of a document, collection or compendium operation.
///
/// `Clone` so that callers sharing one de-duplicated fetch all receive the
/// same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    /// Source data failed shape constraints during the base preparation phase.
    #[error("invalid {document_name} data: {message}")]
    Validation {
        document_name: String,
        message: String,
    },
    /// The acting user's resolved level is below what the action requires.
    #[error("user {user_id} may not {action} (requires {required:?}, has {actual:?})")]
    Permission {
        user_id: String,
        action: String,
        required: PermissionLevel,
        actual: PermissionLevel,
    },
    /// The compendium pack is locked against edits.
    #[error("compendium pack `{0}` is locked")]
    LockedPack(String),
    /// Absent from both the in-memory collection and the backend.
    #[error("{document_name} not found: {id}")]
    NotFound {
        document_name: String,
        id: DocumentId,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("unknown document type `{0}`")]
    UnknownDocumentType(String),
    #[error("{document_name} has no embedded collection `{embedded_name}`")]
    UnknownEmbeddedCollection {
        document_name: String,
        embedded_name: String,
    },
    #[error("invalid document id `{0}`")]
    InvalidId(String),
    #[error("document `{id}` already exists in `{collection}`")]
    DuplicateDocument { collection: String, id: DocumentId },
    #[error("compendium pack `{0}` already exists")]
    PackExists(String),
    #[error("compendium pack `{0}` is not registered")]
    PackNotFound(String),
}

impl DocumentError {
    pub(crate) fn validation(document_name: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            document_name: document_name.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn not_found(document_name: &str, id: &str) -> Self {
        Self::NotFound {
            document_name: document_name.to_string(),
            id: id.to_string(),
        }
    }

    /// Short stable code used in log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Permission { .. } => "permission",
            Self::LockedPack(_) => "locked_pack",
            Self::NotFound { .. } => "not_found",
            Self::Backend(_) => "backend",
            Self::UnknownDocumentType(_) => "unknown_document_type",
            Self::UnknownEmbeddedCollection { .. } => "unknown_embedded_collection",
            Self::InvalidId(_) => "invalid_id",
            Self::DuplicateDocument { .. } => "duplicate_document",
            Self::PackExists(_) => "pack_exists",
            Self::PackNotFound(_) => "pack_not_found",
        }
    }
}
