//! Collections of live documents.
//!
//! # Responsibility
//! - Keep the in-memory set of top-level documents of one type.
//! - Route every mutation through the backend before reconciling memory.
//! - Layer the compendium cache and the world registry on top.
//!
//! # Invariants
//! - Validation and permission failures never reach the backend.
//! - A backend failure leaves the in-memory collection unchanged.
//! - Once the backend commits, memory follows what it returned; a failed
//!   re-preparation is logged and keeps the last published derived data.

pub mod compendium;
mod document_collection;
mod embedded;
pub mod world;

pub use compendium::{
    CompendiumCollection, CompendiumConfiguration, CompendiumMetadata, ImportAllOptions,
    PackContents,
};
pub use document_collection::{CollectionHooks, DocumentCollection};
pub use embedded::EmbeddedCollectionManager;
pub use world::World;

use crate::model::document::DocumentHandle;
use crate::model::error::{DocumentError, DocumentResult};
use crate::model::permission::{PermissionLevel, User};
use crate::model::registry::DocumentTypeRegistry;
use crate::model::source::{is_valid_id, random_id, source_id, SourceData, ID_KEY};
use serde_json::Value;
use std::collections::HashSet;
use tokio::sync::OwnedMutexGuard;

/// Fails with `Permission` unless `actual` reaches `required`.
pub(crate) fn require_level(
    user: &User,
    action: impl Into<String>,
    required: PermissionLevel,
    actual: PermissionLevel,
) -> DocumentResult<()> {
    if actual >= required {
        return Ok(());
    }
    Err(DocumentError::Permission {
        user_id: user.id.clone(),
        action: action.into(),
        required,
        actual,
    })
}

/// Gives every proposed source an `_id`.
///
/// Caller-supplied ids survive only with `keep_id`. Ids already taken
/// (per `exists`) or repeated within the batch are rejected.
pub(crate) fn assign_ids(
    data: Vec<SourceData>,
    keep_id: bool,
    collection: &str,
    exists: impl Fn(&str) -> bool,
) -> DocumentResult<Vec<SourceData>> {
    let mut seen = HashSet::with_capacity(data.len());
    data.into_iter()
        .map(|mut source| {
            let id = match source_id(&source) {
                Some(id) if keep_id && !is_valid_id(id) => {
                    return Err(DocumentError::InvalidId(id.to_string()))
                }
                Some(id) if keep_id => id.to_string(),
                _ => random_id(),
            };
            if exists(&id) || !seen.insert(id.clone()) {
                return Err(DocumentError::DuplicateDocument {
                    collection: collection.to_string(),
                    id,
                });
            }
            source.insert(ID_KEY.to_string(), Value::String(id));
            Ok(source)
        })
        .collect()
}

/// Gives embedded children without an `_id` a generated one, at every depth.
pub(crate) fn assign_child_ids(
    types: &DocumentTypeRegistry,
    document_name: &str,
    source: &mut SourceData,
) -> DocumentResult<()> {
    let document_type = types.require(document_name)?;
    for spec in document_type.embedded() {
        let Some(Value::Array(children)) = source.get_mut(&spec.key) else {
            continue;
        };
        for child in children.iter_mut() {
            if let Value::Object(child) = child {
                if source_id(child).is_none() {
                    child.insert(ID_KEY.to_string(), Value::String(random_id()));
                }
                assign_child_ids(types, &spec.document_name, child)?;
            }
        }
    }
    Ok(())
}

/// Takes the mutation gates of `handles` in id order.
pub(crate) async fn lock_in_order(handles: &[DocumentHandle]) -> Vec<OwnedMutexGuard<()>> {
    let mut ordered: Vec<&DocumentHandle> = handles.iter().collect();
    ordered.sort_by(|left, right| left.id().cmp(right.id()));
    let mut gates = Vec::with_capacity(ordered.len());
    for handle in ordered {
        gates.push(handle.begin_mutation().await);
    }
    gates
}
