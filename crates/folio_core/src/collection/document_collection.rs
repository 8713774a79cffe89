//! Indexed, ordered set of top-level documents of one type.
//!
//! # Responsibility
//! - Keep the insertion-ordered `id -> DocumentHandle` map.
//! - Validate, check permission, persist, then reconcile memory for every
//!   batch create/update/delete.
//! - Run the `_onXDocuments` step: type hooks, collection hooks, observers.
//!
//! # Invariants
//! - A document held here points back at this collection and no other.
//! - Mutations of one document are serialized through its gate.
//! - No lock on document data is held across an `.await` or while
//!   observers render.

use crate::backend::{Backend, ModificationOptions, Query, Scope};
use crate::collection::embedded::EmbeddedCollectionManager;
use crate::collection::{assign_child_ids, assign_ids, lock_in_order, require_level};
use crate::model::client::ClientDocument;
use crate::model::document::{Document, DocumentHandle};
use crate::model::error::{DocumentError, DocumentResult};
use crate::model::permission::{PermissionLevel, User};
use crate::model::registry::DocumentTypeRegistry;
use crate::model::source::{merge_object, source_id, DocumentId, SourceData};
use crate::observer::{notify, Observer, ObserverSet};
use crate::pipeline::DataPreparationPipeline;
use indexmap::IndexMap;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;

/// Listener run by the `_onXDocuments` step, before observers render.
///
/// Compendium packs use it to keep their index and cache expiry in step
/// with the documents map.
pub trait CollectionHooks: Send + Sync {
    fn documents_loaded(&self, _handles: &[DocumentHandle]) {}
    fn documents_created(&self, _handles: &[DocumentHandle]) {}
    /// Also runs for the parent of an embedded batch.
    fn documents_updated(&self, _handles: &[DocumentHandle]) {}
    fn documents_deleted(&self, _ids: &[DocumentId]) {}
}

#[derive(Clone)]
pub struct DocumentCollection {
    inner: Arc<CollectionInner>,
}

struct CollectionInner {
    key: String,
    document_name: String,
    pack: Option<String>,
    types: Arc<DocumentTypeRegistry>,
    backend: Arc<dyn Backend>,
    documents: RwLock<IndexMap<DocumentId, DocumentHandle>>,
    observers: Mutex<ObserverSet>,
    hooks: Option<Arc<dyn CollectionHooks>>,
}

impl DocumentCollection {
    /// World-level collection keyed by its document type name.
    pub fn new(
        document_name: &str,
        types: Arc<DocumentTypeRegistry>,
        backend: Arc<dyn Backend>,
    ) -> DocumentResult<Self> {
        types.require(document_name)?;
        Ok(Self::build(document_name, document_name, None, types, backend, None))
    }

    pub(crate) fn for_pack(
        pack_key: &str,
        document_name: &str,
        types: Arc<DocumentTypeRegistry>,
        backend: Arc<dyn Backend>,
        hooks: Arc<dyn CollectionHooks>,
    ) -> DocumentResult<Self> {
        types.require(document_name)?;
        Ok(Self::build(
            pack_key,
            document_name,
            Some(pack_key.to_string()),
            types,
            backend,
            Some(hooks),
        ))
    }

    fn build(
        key: &str,
        document_name: &str,
        pack: Option<String>,
        types: Arc<DocumentTypeRegistry>,
        backend: Arc<dyn Backend>,
        hooks: Option<Arc<dyn CollectionHooks>>,
    ) -> Self {
        Self {
            inner: Arc::new(CollectionInner {
                key: key.to_string(),
                document_name: document_name.to_string(),
                pack,
                types,
                backend,
                documents: RwLock::new(IndexMap::new()),
                observers: Mutex::new(ObserverSet::new()),
                hooks,
            }),
        }
    }

    /// Backend collection key.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn document_name(&self) -> &str {
        &self.inner.document_name
    }

    pub fn pack(&self) -> Option<&str> {
        self.inner.pack.as_deref()
    }

    pub fn types(&self) -> &Arc<DocumentTypeRegistry> {
        &self.inner.types
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    pub(crate) fn scope(&self) -> Scope {
        Scope::collection(self.inner.key.clone())
    }

    pub(crate) fn pipeline(&self) -> DataPreparationPipeline<'_> {
        DataPreparationPipeline::new(&self.inner.types)
    }

    pub(crate) fn hooks(&self) -> Option<&Arc<dyn CollectionHooks>> {
        self.inner.hooks.as_ref()
    }

    pub(crate) fn behavior_of(&self, document_name: &str) -> DocumentResult<Arc<dyn ClientDocument>> {
        Ok(self.inner.types.require(document_name)?.behavior().clone())
    }

    pub fn get(&self, id: &str) -> Option<DocumentHandle> {
        self.inner.documents.read().get(id).cloned()
    }

    pub fn get_strict(&self, id: &str) -> DocumentResult<DocumentHandle> {
        self.get(id)
            .ok_or_else(|| DocumentError::not_found(&self.inner.document_name, id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.documents.read().contains_key(id)
    }

    /// Inserts `handle`, replacing any document with the same id.
    pub fn set(&self, handle: DocumentHandle) -> Option<DocumentHandle> {
        {
            let mut document = handle.write();
            document.set_collection(Some(self.inner.key.clone()));
            document.set_pack(self.inner.pack.clone());
        }
        let previous = self
            .inner
            .documents
            .write()
            .insert(handle.id().to_string(), handle.clone());
        if let Some(previous) = &previous {
            if !previous.ptr_eq(&handle) {
                previous.write().set_collection(None);
            }
        }
        previous
    }

    /// Drops the in-memory copy only; the backend is not touched.
    pub fn remove(&self, id: &str) -> Option<DocumentHandle> {
        let removed = self.inner.documents.write().shift_remove(id);
        if let Some(handle) = &removed {
            handle.write().set_collection(None);
        }
        removed
    }

    /// Snapshot of the held documents in insertion order.
    pub fn contents(&self) -> Vec<DocumentHandle> {
        self.inner.documents.read().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<DocumentId> {
        self.inner.documents.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.documents.read().is_empty()
    }

    pub fn register_observer(&self, id: impl Into<String>, observer: &Arc<dyn Observer>) {
        self.inner.observers.lock().register(id, observer);
    }

    pub fn unregister_observer(&self, id: &str) -> bool {
        self.inner.observers.lock().unregister(id)
    }

    /// Renders the observers of the collection itself.
    pub fn on_modify_contents(&self) {
        let observers = self.inner.observers.lock().live();
        notify(&observers, false);
    }

    /// Fetches matching documents from the backend and merges them into
    /// the collection.
    ///
    /// Index projections are ignored: full documents are always loaded. A
    /// held document with an in-flight mutation keeps its in-memory state.
    pub async fn load(&self, query: &Query) -> DocumentResult<Vec<DocumentHandle>> {
        let result = self.load_inner(query).await;
        self.log_outcome("load", result.as_ref().map(Vec::len));
        result
    }

    async fn load_inner(&self, query: &Query) -> DocumentResult<Vec<DocumentHandle>> {
        let mut query = query.clone();
        query.index_fields = None;
        let sources = self.inner.backend.get_documents(&self.scope(), &query).await?;

        let pipeline = self.pipeline();
        let mut prepared = Vec::with_capacity(sources.len());
        for source in sources {
            let mut document =
                Document::from_source(&self.inner.types, &self.inner.document_name, source)?;
            document.set_pack(self.inner.pack.clone());
            pipeline.prepare(&mut document, &[])?;
            prepared.push(document);
        }

        let mut handles = Vec::with_capacity(prepared.len());
        for document in prepared {
            let handle = match self.get(document.id()) {
                Some(existing) if existing.is_mutating() => existing,
                Some(existing) => {
                    existing.write().absorb(document);
                    existing
                }
                None => {
                    let handle = DocumentHandle::new(document);
                    self.set(handle.clone());
                    handle
                }
            };
            handles.push(handle);
        }

        if let Some(hooks) = self.hooks() {
            hooks.documents_loaded(&handles);
        }
        Ok(handles)
    }

    /// Creates documents from proposed source data.
    ///
    /// # Errors
    /// - `Permission` for users below the player role.
    /// - `DuplicateDocument` / `InvalidId` for unusable ids.
    /// - `Validation` when any proposed document fails preparation.
    /// - `Backend` when persistence fails; nothing is inserted then.
    pub async fn create_documents(
        &self,
        user: &User,
        data: Vec<SourceData>,
        options: &ModificationOptions,
    ) -> DocumentResult<Vec<DocumentHandle>> {
        let result = self.create_inner(user, data, options).await;
        self.log_outcome("create", result.as_ref().map(Vec::len));
        result
    }

    async fn create_inner(
        &self,
        user: &User,
        data: Vec<SourceData>,
        options: &ModificationOptions,
    ) -> DocumentResult<Vec<DocumentHandle>> {
        // Users without a creating role hold no level over new documents.
        let actual = if user.can_create_documents() {
            PermissionLevel::Owner
        } else {
            PermissionLevel::None
        };
        require_level(
            user,
            format!("create {}", self.inner.document_name),
            PermissionLevel::Owner,
            actual,
        )?;
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let mut sources =
            assign_ids(data, options.keep_id, &self.inner.key, |id| self.contains(id))?;
        for source in &mut sources {
            assign_child_ids(&self.inner.types, &self.inner.document_name, source)?;
        }
        let behavior = self.behavior_of(&self.inner.document_name)?;
        let pipeline = self.pipeline();
        for source in &sources {
            let candidate = Document::from_source(
                &self.inner.types,
                &self.inner.document_name,
                source.clone(),
            )?;
            pipeline.compute(&candidate, &[])?;
        }

        let created = self
            .inner
            .backend
            .create_documents(&self.scope(), sources, options)
            .await?;

        // The backend has committed: reconcile what it returned, never fail.
        let mut documents = Vec::with_capacity(created.len());
        for source in created {
            let id = source_id(&source).unwrap_or_default().to_string();
            let mut document =
                match Document::from_source(&self.inner.types, &self.inner.document_name, source) {
                    Ok(document) => document,
                    Err(err) => {
                        self.log_reconcile_error("create", &id, &err);
                        continue;
                    }
                };
            document.set_pack(self.inner.pack.clone());
            if let Err(err) = pipeline.prepare(&mut document, &[]) {
                self.log_reconcile_error("create", &id, &err);
            }
            documents.push(document);
        }
        let handles: Vec<DocumentHandle> = documents
            .into_iter()
            .map(|document| {
                let handle = DocumentHandle::new(document);
                self.set(handle.clone());
                handle
            })
            .collect();

        self.on_create_documents(&behavior, &handles, options, user);
        Ok(handles)
    }

    /// Applies incremental payloads, each carrying the target `_id`.
    ///
    /// Embedded keys in a payload are ignored; use the embedded operations.
    ///
    /// # Errors
    /// - `NotFound` when a target is not held by this collection.
    /// - `Permission` unless the user owns every target.
    /// - `Validation` when any merged result fails preparation.
    /// - `Backend` when persistence fails; nothing changes in memory then.
    pub async fn update_documents(
        &self,
        user: &User,
        updates: Vec<SourceData>,
        options: &ModificationOptions,
    ) -> DocumentResult<Vec<DocumentHandle>> {
        let result = self.update_inner(user, updates, options).await;
        self.log_outcome("update", result.as_ref().map(Vec::len));
        result
    }

    async fn update_inner(
        &self,
        user: &User,
        updates: Vec<SourceData>,
        options: &ModificationOptions,
    ) -> DocumentResult<Vec<DocumentHandle>> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::with_capacity(updates.len());
        for changes in &updates {
            let id = source_id(changes).ok_or_else(|| {
                DocumentError::validation(&self.inner.document_name, "update payload must carry `_id`")
            })?;
            ids.push(id.to_string());
        }
        let targets = self.targets(&ids)?;
        let _gates = lock_in_order(&targets).await;
        self.ensure_still_held(&targets)?;

        let behavior = self.behavior_of(&self.inner.document_name)?;
        let pipeline = self.pipeline();
        let mut payloads = Vec::with_capacity(updates.len());
        for (handle, changes) in targets.iter().zip(&updates) {
            let (own, merged) = {
                let document = handle.read();
                require_level(
                    user,
                    format!("update {}", document.uuid()),
                    PermissionLevel::Owner,
                    document.permission(user),
                )?;
                let own = document.own_changes(changes);
                let mut merged = document.to_source();
                merge_object(&mut merged, &own);
                (own, merged)
            };
            let candidate =
                Document::from_source(&self.inner.types, &self.inner.document_name, merged)?;
            pipeline.compute(&candidate, &[])?;
            payloads.push(own);
        }

        let applied = self
            .inner
            .backend
            .update_documents(&self.scope(), payloads, options)
            .await?;

        let mut updated = Vec::with_capacity(applied.len());
        for changes in &applied {
            let Some(handle) = source_id(changes)
                .and_then(|id| targets.iter().find(|handle| handle.id() == id))
            else {
                continue;
            };
            {
                let mut document = handle.write();
                document.apply_changes(changes);
                if let Err(err) = pipeline.prepare(&mut document, &[]) {
                    self.log_reconcile_error("update", handle.id(), &err);
                }
            }
            updated.push(handle.clone());
        }

        self.on_update_documents(&behavior, &updated, &applied, options, user);
        Ok(updated)
    }

    /// Deletes documents by id and returns the ids the backend removed.
    ///
    /// # Errors
    /// - `NotFound` when a target is not held by this collection.
    /// - `Permission` unless the user owns every target.
    /// - `Backend` when persistence fails; nothing changes in memory then.
    pub async fn delete_documents(
        &self,
        user: &User,
        ids: Vec<DocumentId>,
        options: &ModificationOptions,
    ) -> DocumentResult<Vec<DocumentId>> {
        let result = self.delete_inner(user, ids, options).await;
        self.log_outcome("delete", result.as_ref().map(Vec::len));
        result
    }

    async fn delete_inner(
        &self,
        user: &User,
        ids: Vec<DocumentId>,
        options: &ModificationOptions,
    ) -> DocumentResult<Vec<DocumentId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let targets = self.targets(&ids)?;
        let _gates = lock_in_order(&targets).await;
        self.ensure_still_held(&targets)?;
        let behavior = self.behavior_of(&self.inner.document_name)?;
        for handle in &targets {
            let document = handle.read();
            require_level(
                user,
                format!("delete {}", document.uuid()),
                PermissionLevel::Owner,
                document.permission(user),
            )?;
        }

        let deleted = self
            .inner
            .backend
            .delete_documents(&self.scope(), ids, options)
            .await?;

        let removed: Vec<DocumentHandle> = deleted.iter().filter_map(|id| self.remove(id)).collect();
        self.on_delete_documents(&behavior, &removed, &deleted, options, user);
        Ok(deleted)
    }

    /// Creates children under `embedded_name` of the held document `parent_id`.
    pub async fn create_embedded_documents(
        &self,
        user: &User,
        parent_id: &str,
        embedded_name: &str,
        data: Vec<SourceData>,
        options: &ModificationOptions,
    ) -> DocumentResult<Vec<DocumentId>> {
        EmbeddedCollectionManager::new(self)
            .create(user, parent_id, embedded_name, data, options)
            .await
    }

    pub async fn update_embedded_documents(
        &self,
        user: &User,
        parent_id: &str,
        embedded_name: &str,
        updates: Vec<SourceData>,
        options: &ModificationOptions,
    ) -> DocumentResult<Vec<DocumentId>> {
        EmbeddedCollectionManager::new(self)
            .update(user, parent_id, embedded_name, updates, options)
            .await
    }

    pub async fn delete_embedded_documents(
        &self,
        user: &User,
        parent_id: &str,
        embedded_name: &str,
        ids: Vec<DocumentId>,
        options: &ModificationOptions,
    ) -> DocumentResult<Vec<DocumentId>> {
        EmbeddedCollectionManager::new(self)
            .delete(user, parent_id, embedded_name, ids, options)
            .await
    }

    fn targets(&self, ids: &[DocumentId]) -> DocumentResult<Vec<DocumentHandle>> {
        let mut seen = HashSet::with_capacity(ids.len());
        ids.iter()
            .map(|id| {
                if !seen.insert(id.as_str()) {
                    return Err(DocumentError::validation(
                        &self.inner.document_name,
                        format!("`{id}` appears twice in one batch"),
                    ));
                }
                self.get_strict(id)
            })
            .collect()
    }

    /// A target may have been deleted while this call waited for its gate.
    fn ensure_still_held(&self, targets: &[DocumentHandle]) -> DocumentResult<()> {
        for handle in targets {
            match self.get(handle.id()) {
                Some(current) if current.ptr_eq(handle) => {}
                _ => return Err(DocumentError::not_found(&self.inner.document_name, handle.id())),
            }
        }
        Ok(())
    }

    fn on_create_documents(
        &self,
        behavior: &Arc<dyn ClientDocument>,
        handles: &[DocumentHandle],
        options: &ModificationOptions,
        user: &User,
    ) {
        for handle in handles {
            behavior.on_create(&handle.read(), options, &user.id);
        }
        if let Some(hooks) = self.hooks() {
            hooks.documents_created(handles);
        }
        if options.render {
            for handle in handles {
                handle.render(false);
            }
            self.on_modify_contents();
        }
    }

    fn on_update_documents(
        &self,
        behavior: &Arc<dyn ClientDocument>,
        handles: &[DocumentHandle],
        applied: &[SourceData],
        options: &ModificationOptions,
        user: &User,
    ) {
        for (handle, changes) in handles.iter().zip(applied) {
            behavior.on_update(&handle.read(), changes, options, &user.id);
        }
        if let Some(hooks) = self.hooks() {
            hooks.documents_updated(handles);
        }
        if options.render {
            for handle in handles {
                handle.render(false);
            }
            self.on_modify_contents();
        }
    }

    fn on_delete_documents(
        &self,
        behavior: &Arc<dyn ClientDocument>,
        removed: &[DocumentHandle],
        deleted: &[DocumentId],
        options: &ModificationOptions,
        user: &User,
    ) {
        for handle in removed {
            behavior.on_delete(&handle.read(), options, &user.id);
        }
        if let Some(hooks) = self.hooks() {
            hooks.documents_deleted(deleted);
        }
        for handle in removed {
            let observers = {
                let mut document = handle.write();
                let observers = document.live_observers();
                document.clear_observers();
                observers
            };
            if options.render {
                notify(&observers, false);
            }
        }
        if options.render {
            self.on_modify_contents();
        }
    }

    fn log_reconcile_error(&self, operation: &str, id: &str, err: &DocumentError) {
        error!(
            "event=collection_{operation} module=collection status=reconcile_error collection={} id={id} error_code={} error={}",
            self.inner.key,
            err.code(),
            err
        );
    }

    fn log_outcome(&self, operation: &str, outcome: Result<usize, &DocumentError>) {
        match outcome {
            Ok(count) => {
                if operation == "load" {
                    debug!(
                        "event=collection_{operation} module=collection status=ok collection={} count={count}",
                        self.inner.key
                    );
                } else {
                    info!(
                        "event=collection_{operation} module=collection status=ok collection={} count={count}",
                        self.inner.key
                    );
                }
            }
            Err(err) => warn!(
                "event=collection_{operation} module=collection status=error collection={} error_code={} error={}",
                self.inner.key,
                err.code(),
                err
            ),
        }
    }
}

impl std::fmt::Debug for DocumentCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentCollection")
            .field("key", &self.inner.key)
            .field("document_name", &self.inner.document_name)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
