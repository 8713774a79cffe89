//! CRUD orchestration for documents embedded in a held top-level document.
//!
//! # Responsibility
//! - Run the parent type's pre hook, validate, persist, mutate children,
//!   re-prepare the parent, then run the post hook.
//!
//! # Invariants
//! - The pre hook runs before any persistence or in-memory change; an
//!   emptied proposal ends the batch without error.
//! - The post hook sees the children attached and the parent re-prepared.
//! - Both hooks run once per batch, under the parent's mutation gate.
//! - Parents are top-level documents of the owning collection.

use crate::backend::ModificationOptions;
use crate::collection::{assign_ids, require_level, DocumentCollection};
use crate::model::client::{ClientDocument, HookContext};
use crate::model::document::{Document, DocumentHandle};
use crate::model::error::{DocumentError, DocumentResult};
use crate::model::permission::{PermissionLevel, User};
use crate::model::source::{merge_object, source_id, value_id, DocumentId, SourceData};
use crate::observer::{notify, Observer};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

pub struct EmbeddedCollectionManager<'c> {
    collection: &'c DocumentCollection,
}

/// Parent type behaviour and child type name of one embedded collection.
struct Target {
    behavior: Arc<dyn ClientDocument>,
    parent_name: String,
    child_name: String,
}

impl<'c> EmbeddedCollectionManager<'c> {
    pub fn new(collection: &'c DocumentCollection) -> Self {
        Self { collection }
    }

    pub async fn create(
        &self,
        user: &User,
        parent_id: &str,
        embedded_name: &str,
        data: Vec<SourceData>,
        options: &ModificationOptions,
    ) -> DocumentResult<Vec<DocumentId>> {
        let result = self
            .create_inner(user, parent_id, embedded_name, data, options)
            .await;
        self.log_outcome("create", parent_id, embedded_name, result.as_ref().map(Vec::len));
        result
    }

    async fn create_inner(
        &self,
        user: &User,
        parent_id: &str,
        embedded_name: &str,
        data: Vec<SourceData>,
        options: &ModificationOptions,
    ) -> DocumentResult<Vec<DocumentId>> {
        let handle = self.collection.get_strict(parent_id)?;
        let _gate = handle.begin_mutation().await;
        self.ensure_held(&handle)?;
        let target = self.resolve(&handle, embedded_name)?;
        let context = HookContext {
            embedded_name,
            options,
            user_id: &user.id,
        };

        let proposal = {
            let parent = handle.read();
            require_owner(user, &parent, embedded_name)?;
            let mut proposed = data;
            target
                .behavior
                .pre_create_embedded(&parent, &mut proposed, &context)?;
            if proposed.is_empty() {
                None
            } else {
                let sources = assign_ids(proposed, options.keep_id, &parent.uuid(), |id| {
                    parent.embedded_child(embedded_name, id).is_some()
                })?;
                let mut full = parent.to_source();
                embedded_values(&mut full, &target.parent_name, embedded_name)?
                    .extend(sources.iter().cloned().map(Value::Object));
                Some((sources, full))
            }
        };
        let Some((sources, full)) = proposal else {
            self.log_veto("create", parent_id, embedded_name);
            return Ok(Vec::new());
        };
        self.validate(&target, full)?;

        let scope = self.collection.scope().embedded(parent_id, embedded_name);
        let created = self
            .collection
            .backend()
            .create_documents(&scope, sources, options)
            .await?;
        let ids = ids_of(&created);

        // The backend has committed: reconcile what it returned, never fail.
        {
            let mut children = Vec::with_capacity(created.len());
            for source in created.iter().cloned() {
                match Document::from_source(self.collection.types(), &target.child_name, source) {
                    Ok(child) => children.push(child),
                    Err(err) => self.log_reconcile_error("create", parent_id, embedded_name, &err),
                }
            }
            let mut parent = handle.write();
            for child in children {
                parent.attach_child(embedded_name, child);
            }
            self.reprepare(&mut parent, "create", embedded_name);
        }

        {
            let parent = handle.read();
            let children: Vec<&Document> = ids
                .iter()
                .filter_map(|id| parent.embedded_child(embedded_name, id))
                .collect();
            target
                .behavior
                .on_create_embedded(&parent, &children, &created, &context);
        }
        self.finish(&handle, embedded_name, &ids, Vec::new(), options);
        Ok(ids)
    }

    pub async fn update(
        &self,
        user: &User,
        parent_id: &str,
        embedded_name: &str,
        updates: Vec<SourceData>,
        options: &ModificationOptions,
    ) -> DocumentResult<Vec<DocumentId>> {
        let result = self
            .update_inner(user, parent_id, embedded_name, updates, options)
            .await;
        self.log_outcome("update", parent_id, embedded_name, result.as_ref().map(Vec::len));
        result
    }

    async fn update_inner(
        &self,
        user: &User,
        parent_id: &str,
        embedded_name: &str,
        updates: Vec<SourceData>,
        options: &ModificationOptions,
    ) -> DocumentResult<Vec<DocumentId>> {
        let handle = self.collection.get_strict(parent_id)?;
        let _gate = handle.begin_mutation().await;
        self.ensure_held(&handle)?;
        let target = self.resolve(&handle, embedded_name)?;
        let context = HookContext {
            embedded_name,
            options,
            user_id: &user.id,
        };

        let proposal = {
            let parent = handle.read();
            require_owner(user, &parent, embedded_name)?;
            let mut changes = updates;
            target
                .behavior
                .pre_update_embedded(&parent, &mut changes, &context)?;
            if changes.is_empty() {
                None
            } else {
                let mut full = parent.to_source();
                let children = embedded_values(&mut full, &target.parent_name, embedded_name)?;
                let mut seen = HashSet::with_capacity(changes.len());
                for change in &changes {
                    let id = source_id(change).ok_or_else(|| {
                        DocumentError::validation(&target.child_name, "update payload must carry `_id`")
                    })?;
                    if !seen.insert(id) {
                        return Err(DocumentError::validation(
                            &target.child_name,
                            format!("`{id}` appears twice in one batch"),
                        ));
                    }
                    let child = children
                        .iter_mut()
                        .find(|value| value_id(value) == Some(id))
                        .and_then(Value::as_object_mut)
                        .ok_or_else(|| DocumentError::not_found(&target.child_name, id))?;
                    merge_object(child, change);
                }
                drop(seen);
                Some((changes, full))
            }
        };
        let Some((changes, full)) = proposal else {
            self.log_veto("update", parent_id, embedded_name);
            return Ok(Vec::new());
        };
        self.validate(&target, full)?;

        let scope = self.collection.scope().embedded(parent_id, embedded_name);
        let applied = self
            .collection
            .backend()
            .update_documents(&scope, changes, options)
            .await?;
        let ids = ids_of(&applied);

        {
            let mut parent = handle.write();
            for change in &applied {
                let Some(id) = source_id(change) else {
                    continue;
                };
                if let Some(child) = parent.embedded_child_mut(embedded_name, id) {
                    child.apply_changes(change);
                }
            }
            self.reprepare(&mut parent, "update", embedded_name);
        }

        {
            let parent = handle.read();
            let children: Vec<&Document> = ids
                .iter()
                .filter_map(|id| parent.embedded_child(embedded_name, id))
                .collect();
            target
                .behavior
                .on_update_embedded(&parent, &children, &applied, &context);
        }
        self.finish(&handle, embedded_name, &ids, Vec::new(), options);
        Ok(ids)
    }

    pub async fn delete(
        &self,
        user: &User,
        parent_id: &str,
        embedded_name: &str,
        ids: Vec<DocumentId>,
        options: &ModificationOptions,
    ) -> DocumentResult<Vec<DocumentId>> {
        let result = self
            .delete_inner(user, parent_id, embedded_name, ids, options)
            .await;
        self.log_outcome("delete", parent_id, embedded_name, result.as_ref().map(Vec::len));
        result
    }

    async fn delete_inner(
        &self,
        user: &User,
        parent_id: &str,
        embedded_name: &str,
        ids: Vec<DocumentId>,
        options: &ModificationOptions,
    ) -> DocumentResult<Vec<DocumentId>> {
        let handle = self.collection.get_strict(parent_id)?;
        let _gate = handle.begin_mutation().await;
        self.ensure_held(&handle)?;
        let target = self.resolve(&handle, embedded_name)?;
        let context = HookContext {
            embedded_name,
            options,
            user_id: &user.id,
        };

        let proposal = {
            let parent = handle.read();
            require_owner(user, &parent, embedded_name)?;
            let mut ids = ids;
            target
                .behavior
                .pre_delete_embedded(&parent, &mut ids, &context)?;
            if ids.is_empty() {
                None
            } else {
                let mut seen = HashSet::with_capacity(ids.len());
                for id in &ids {
                    if !seen.insert(id.as_str()) {
                        return Err(DocumentError::validation(
                            &target.child_name,
                            format!("`{id}` appears twice in one batch"),
                        ));
                    }
                    if parent.embedded_child(embedded_name, id).is_none() {
                        return Err(DocumentError::not_found(&target.child_name, id));
                    }
                }
                let mut full = parent.to_source();
                embedded_values(&mut full, &target.parent_name, embedded_name)?.retain(|value| {
                    value_id(value).map_or(true, |id| !seen.contains(id))
                });
                drop(seen);
                Some((ids, full))
            }
        };
        let Some((ids, full)) = proposal else {
            self.log_veto("delete", parent_id, embedded_name);
            return Ok(Vec::new());
        };
        self.validate(&target, full)?;

        let scope = self.collection.scope().embedded(parent_id, embedded_name);
        let deleted = self
            .collection
            .backend()
            .delete_documents(&scope, ids, options)
            .await?;

        let removed = {
            let mut parent = handle.write();
            let removed = match parent.embedded_mut(embedded_name) {
                Some(children) => {
                    let (gone, kept): (Vec<Document>, Vec<Document>) = std::mem::take(children)
                        .into_iter()
                        .partition(|child| deleted.iter().any(|id| id == child.id()));
                    *children = kept;
                    gone
                }
                None => Vec::new(),
            };
            self.reprepare(&mut parent, "delete", embedded_name);
            removed
        };

        let mut removed_observers = Vec::new();
        let removed: Vec<Document> = removed
            .into_iter()
            .map(|mut child| {
                child.detach();
                removed_observers.extend(child.live_observers());
                child.clear_observers();
                child
            })
            .collect();

        target
            .behavior
            .on_delete_embedded(&handle.read(), &removed, &deleted, &context);
        self.finish(&handle, embedded_name, &[], removed_observers, options);
        Ok(deleted)
    }

    fn resolve(&self, handle: &DocumentHandle, embedded_name: &str) -> DocumentResult<Target> {
        let parent_name = handle.read().document_name().to_string();
        let document_type = self.collection.types().require(&parent_name)?;
        let spec = document_type.embedded_spec(embedded_name).ok_or_else(|| {
            DocumentError::UnknownEmbeddedCollection {
                document_name: parent_name.clone(),
                embedded_name: embedded_name.to_string(),
            }
        })?;
        Ok(Target {
            behavior: document_type.behavior().clone(),
            child_name: spec.document_name.clone(),
            parent_name,
        })
    }

    /// The parent may have been deleted while this call waited for its gate.
    fn ensure_held(&self, handle: &DocumentHandle) -> DocumentResult<()> {
        match self.collection.get(handle.id()) {
            Some(current) if current.ptr_eq(handle) => Ok(()),
            _ => Err(DocumentError::not_found(
                self.collection.document_name(),
                handle.id(),
            )),
        }
    }

    /// Runs a full pass over the proposed parent without publishing it.
    fn validate(&self, target: &Target, full: SourceData) -> DocumentResult<()> {
        let candidate = Document::from_source(self.collection.types(), &target.parent_name, full)?;
        self.collection.pipeline().compute(&candidate, &[])?;
        Ok(())
    }

    /// Re-prepares the parent after a committed change. A failed pass keeps
    /// the last published derived data.
    fn reprepare(&self, parent: &mut Document, operation: &str, embedded_name: &str) {
        if let Err(err) = self.collection.pipeline().prepare(parent, &[]) {
            self.log_reconcile_error(operation, parent.id(), embedded_name, &err);
        }
    }

    fn log_reconcile_error(
        &self,
        operation: &str,
        parent_id: &str,
        embedded_name: &str,
        err: &DocumentError,
    ) {
        error!(
            "event=embedded_{operation} module=embedded status=reconcile_error collection={} parent={parent_id} embedded={embedded_name} error_code={} error={}",
            self.collection.key(),
            err.code(),
            err
        );
    }

    fn finish(
        &self,
        handle: &DocumentHandle,
        embedded_name: &str,
        child_ids: &[DocumentId],
        mut observers: Vec<Arc<dyn Observer>>,
        options: &ModificationOptions,
    ) {
        if let Some(hooks) = self.collection.hooks() {
            hooks.documents_updated(std::slice::from_ref(handle));
        }
        if !options.render {
            return;
        }
        {
            let mut parent = handle.write();
            observers.extend(parent.live_observers());
            for id in child_ids {
                if let Some(child) = parent.embedded_child_mut(embedded_name, id) {
                    observers.extend(child.live_observers());
                }
            }
        }
        notify(&observers, false);
    }

    fn log_veto(&self, operation: &str, parent_id: &str, embedded_name: &str) {
        debug!(
            "event=embedded_{operation} module=embedded status=skip collection={} parent={parent_id} embedded={embedded_name} reason=vetoed",
            self.collection.key()
        );
    }

    fn log_outcome(
        &self,
        operation: &str,
        parent_id: &str,
        embedded_name: &str,
        outcome: Result<usize, &DocumentError>,
    ) {
        match outcome {
            Ok(count) => info!(
                "event=embedded_{operation} module=embedded status=ok collection={} parent={parent_id} embedded={embedded_name} count={count}",
                self.collection.key()
            ),
            Err(err) => warn!(
                "event=embedded_{operation} module=embedded status=error collection={} parent={parent_id} embedded={embedded_name} error_code={} error={}",
                self.collection.key(),
                err.code(),
                err
            ),
        }
    }
}

fn require_owner(user: &User, parent: &Document, embedded_name: &str) -> DocumentResult<()> {
    require_level(
        user,
        format!("modify {embedded_name} of {}", parent.uuid()),
        PermissionLevel::Owner,
        parent.permission(user),
    )
}

fn embedded_values<'a>(
    full: &'a mut SourceData,
    document_name: &str,
    key: &str,
) -> DocumentResult<&'a mut Vec<Value>> {
    let slot = full
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    slot.as_array_mut()
        .ok_or_else(|| DocumentError::validation(document_name, format!("`{key}` must be an array")))
}

fn ids_of(sources: &[SourceData]) -> Vec<DocumentId> {
    sources
        .iter()
        .filter_map(source_id)
        .map(str::to_string)
        .collect()
}
