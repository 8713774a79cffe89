//! Compendium packs: a bounded-lifetime cache over one backend collection.
//!
//! # Responsibility
//! - Keep a minimal `index` of every pack entry and a cache of full
//!   documents that expires after `PackCacheConfig::lifetime` without access.
//! - De-duplicate concurrent fetches of the same id.
//! - Guard every mutating entry point with the lock and owner check.
//! - Read-merge-write the pack's `{private, locked}` settings entry.
//!
//! # Invariants
//! - Every cached document has an index entry; the reverse is not required.
//! - Eviction never writes to the backend and never drops a document whose
//!   mutation gate is held.
//! - A locked pack rejects mutations before permission is even considered.

use crate::backend::{
    Backend, BackendError, ModificationOptions, Query, SettingsStore,
};
use crate::collection::document_collection::{CollectionHooks, DocumentCollection};
use crate::collection::{require_level, World};
use crate::config::{PackCacheConfig, CONFIG_SETTING, WORLD_PACKAGE};
use crate::model::document::{Document, DocumentHandle};
use crate::model::error::{DocumentError, DocumentResult};
use crate::model::permission::{PermissionLevel, User};
use crate::model::registry::{DocumentTypeRegistry, FOLDER_DOCUMENT};
use crate::model::source::{project, source_id, DocumentId, SourceData};
use crate::observer::Observer;
use futures::future::{BoxFuture, FutureExt, Shared};
use indexmap::IndexMap;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type SharedFetch = Shared<BoxFuture<'static, DocumentResult<DocumentHandle>>>;

/// Immutable identity of a pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompendiumMetadata {
    pub name: String,
    /// Package the pack ships with; `world` for packs the world owns.
    pub package: String,
    pub document_name: String,
    pub label: String,
}

impl CompendiumMetadata {
    pub fn new(
        package: impl Into<String>,
        name: impl Into<String>,
        document_name: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            package: package.into(),
            document_name: document_name.into(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Collection key `<package>.<name>`.
    pub fn collection(&self) -> String {
        format!("{}.{}", self.package, self.name)
    }

    pub fn is_world(&self) -> bool {
        self.package == WORLD_PACKAGE
    }
}

/// Stored `{private, locked}` entry of one pack. Unset flags fall back to
/// the pack defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompendiumConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
}

impl CompendiumConfiguration {
    pub fn locked(locked: bool) -> Self {
        Self {
            locked: Some(locked),
            ..Self::default()
        }
    }

    pub fn private(private: bool) -> Self {
        Self {
            private: Some(private),
            ..Self::default()
        }
    }

    /// Flags set in `changes` win; the rest keep their current value.
    pub fn merged(self, changes: CompendiumConfiguration) -> Self {
        Self {
            private: changes.private.or(self.private),
            locked: changes.locked.or(self.locked),
        }
    }

    /// Reads a stored entry flag by flag. A flag holding anything but a
    /// boolean reads as `true` (locked, private) and is named in the
    /// returned list; well-formed flags are kept.
    pub fn from_stored(entry: &Value) -> (Self, Vec<&'static str>) {
        let Some(entry) = entry.as_object() else {
            return (
                Self {
                    private: Some(true),
                    locked: Some(true),
                },
                vec!["private", "locked"],
            );
        };
        let mut malformed = Vec::new();
        let mut flag = |name: &'static str| match entry.get(name) {
            None | Some(Value::Null) => None,
            Some(Value::Bool(value)) => Some(*value),
            Some(_) => {
                malformed.push(name);
                Some(true)
            }
        };
        let config = Self {
            private: flag("private"),
            locked: flag("locked"),
        };
        (config, malformed)
    }
}

/// Options of [`CompendiumCollection::import_all`].
#[derive(Debug, Clone, Default)]
pub struct ImportAllOptions {
    /// Existing folder to file the imported documents under.
    pub folder_id: Option<DocumentId>,
    /// Name of a new folder to create and file under; wins over `folder_id`.
    pub folder_name: Option<String>,
    pub options: ModificationOptions,
}

/// Index and cache expiry of one pack, kept in step with its documents.
struct PackState {
    lifetime: Duration,
    index_fields: Vec<String>,
    index: RwLock<IndexMap<DocumentId, SourceData>>,
    expiries: Mutex<HashMap<DocumentId, Instant>>,
}

impl PackState {
    fn touch(&self, id: &str) {
        self.expiries
            .lock()
            .insert(id.to_string(), Instant::now() + self.lifetime);
    }

    fn index_handle(&self, handle: &DocumentHandle) {
        let entry = project(handle.read().source(), &self.index_fields);
        self.index.write().insert(handle.id().to_string(), entry);
    }

    fn cache(&self, handles: &[DocumentHandle]) {
        for handle in handles {
            self.index_handle(handle);
            self.touch(handle.id());
        }
    }
}

impl CollectionHooks for PackState {
    fn documents_loaded(&self, handles: &[DocumentHandle]) {
        self.cache(handles);
    }

    fn documents_created(&self, handles: &[DocumentHandle]) {
        self.cache(handles);
    }

    fn documents_updated(&self, handles: &[DocumentHandle]) {
        self.cache(handles);
    }

    fn documents_deleted(&self, ids: &[DocumentId]) {
        let mut index = self.index.write();
        let mut expiries = self.expiries.lock();
        for id in ids {
            index.shift_remove(id);
            expiries.remove(id);
        }
    }
}

/// Read-only view of the documents a pack currently holds.
#[derive(Clone, Copy)]
pub struct PackContents<'p> {
    collection: &'p DocumentCollection,
}

impl PackContents<'_> {
    pub fn get(&self, id: &str) -> Option<DocumentHandle> {
        self.collection.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.collection.contains(id)
    }

    pub fn contents(&self) -> Vec<DocumentHandle> {
        self.collection.contents()
    }

    pub fn ids(&self) -> Vec<DocumentId> {
        self.collection.ids()
    }

    pub fn len(&self) -> usize {
        self.collection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collection.is_empty()
    }
}

#[derive(Clone)]
pub struct CompendiumCollection {
    inner: Arc<PackInner>,
}

struct PackInner {
    metadata: CompendiumMetadata,
    collection: DocumentCollection,
    state: Arc<PackState>,
    settings: Arc<dyn SettingsStore>,
    config: RwLock<CompendiumConfiguration>,
    in_flight: Mutex<HashMap<DocumentId, SharedFetch>>,
    cache: PackCacheConfig,
}

impl CompendiumCollection {
    /// Opens a pack with default configuration; call
    /// [`CompendiumCollection::load_configuration`] to read stored flags.
    pub fn new(
        metadata: CompendiumMetadata,
        types: Arc<DocumentTypeRegistry>,
        backend: Arc<dyn Backend>,
        settings: Arc<dyn SettingsStore>,
        cache: PackCacheConfig,
    ) -> DocumentResult<Self> {
        let index_fields = types.require(&metadata.document_name)?.index_fields().to_vec();
        let state = Arc::new(PackState {
            lifetime: cache.lifetime,
            index_fields,
            index: RwLock::new(IndexMap::new()),
            expiries: Mutex::new(HashMap::new()),
        });
        let collection = DocumentCollection::for_pack(
            &metadata.collection(),
            &metadata.document_name,
            types,
            backend,
            state.clone(),
        )?;
        Ok(Self {
            inner: Arc::new(PackInner {
                metadata,
                collection,
                state,
                settings,
                config: RwLock::new(CompendiumConfiguration::default()),
                in_flight: Mutex::new(HashMap::new()),
                cache,
            }),
        })
    }

    pub fn metadata(&self) -> &CompendiumMetadata {
        &self.inner.metadata
    }

    /// Collection key `<package>.<name>`.
    pub fn collection(&self) -> &str {
        self.inner.collection.key()
    }

    pub fn document_name(&self) -> &str {
        &self.inner.metadata.document_name
    }

    pub fn title(&self) -> &str {
        &self.inner.metadata.label
    }

    /// Read-only view of the held documents. Reads through it skip expiry
    /// handling; every mutation goes through the pack's guarded methods.
    pub fn documents(&self) -> PackContents<'_> {
        PackContents {
            collection: &self.inner.collection,
        }
    }

    pub fn config(&self) -> CompendiumConfiguration {
        *self.inner.config.read()
    }

    /// Packs of other packages are locked unless configured otherwise.
    pub fn locked(&self) -> bool {
        self.config()
            .locked
            .unwrap_or(!self.inner.metadata.is_world())
    }

    pub fn private(&self) -> bool {
        self.config().private.unwrap_or(false)
    }

    /// Level of `user` over the pack as a whole.
    pub fn permission(&self, user: &User) -> PermissionLevel {
        if user.is_gm() {
            PermissionLevel::Owner
        } else if self.private() {
            PermissionLevel::None
        } else {
            PermissionLevel::Observer
        }
    }

    pub fn visible_to(&self, user: &User) -> bool {
        self.permission(user).is_visible()
    }

    pub fn register_observer(&self, id: impl Into<String>, observer: &Arc<dyn Observer>) {
        self.inner.collection.register_observer(id, observer);
    }

    pub fn unregister_observer(&self, id: &str) -> bool {
        self.inner.collection.unregister_observer(id)
    }

    /// Renders the pack's own observers.
    pub fn on_modify_contents(&self) {
        self.inner.collection.on_modify_contents();
    }

    /// Fails unless `user` may modify this pack.
    ///
    /// # Errors
    /// - `LockedPack` when `require_unlocked` and the pack is locked,
    ///   whatever the user's level.
    /// - `Permission` when the user is not owner-equivalent for the pack.
    pub fn assert_user_can_modify(&self, user: &User, require_unlocked: bool) -> DocumentResult<()> {
        let result = if require_unlocked && self.locked() {
            Err(DocumentError::LockedPack(self.collection().to_string()))
        } else {
            require_level(
                user,
                format!("modify compendium {}", self.collection()),
                PermissionLevel::Owner,
                self.permission(user),
            )
        };
        if let Err(err) = &result {
            warn!(
                "event=pack_assert_modify module=compendium status=error pack={} user={} error_code={}",
                self.collection(),
                user.id,
                err.code()
            );
        }
        result
    }

    /// Snapshot of the index in backend order.
    pub fn index(&self) -> Vec<SourceData> {
        self.inner.state.index.read().values().cloned().collect()
    }

    pub fn index_entry(&self, id: &str) -> Option<SourceData> {
        self.inner.state.index.read().get(id).cloned()
    }

    /// Cached document, if held and not expired. A hit extends its expiry.
    pub fn get(&self, id: &str) -> Option<DocumentHandle> {
        let handle = self.inner.collection.get(id)?;
        let now = Instant::now();
        let mut expiries = self.inner.state.expiries.lock();
        let expired = expiries.get(id).is_some_and(|deadline| *deadline <= now);
        if expired && !handle.is_mutating() {
            expiries.remove(id);
            drop(expiries);
            self.inner.collection.remove(id);
            debug!(
                "event=pack_evict module=compendium status=ok pack={} id={id} reason=lazy",
                self.collection()
            );
            return None;
        }
        expiries.insert(id.to_string(), now + self.inner.state.lifetime);
        Some(handle)
    }

    /// Replaces the index wholesale from the backend. Cached documents are
    /// not loaded or dropped.
    pub async fn get_index(&self) -> DocumentResult<Vec<SourceData>> {
        let query = Query::index(&self.inner.state.index_fields);
        let entries = self
            .inner
            .collection
            .backend()
            .get_documents(&self.inner.collection.scope(), &query)
            .await
            .map_err(|err| {
                warn!(
                    "event=pack_get_index module=compendium status=error pack={} error={}",
                    self.collection(),
                    err
                );
                DocumentError::from(err)
            })?;

        let mut index: IndexMap<DocumentId, SourceData> = entries
            .into_iter()
            .filter_map(|entry| Some((source_id(&entry)?.to_string(), entry)))
            .collect();
        for handle in self.inner.collection.contents() {
            if !index.contains_key(handle.id()) {
                let entry = project(handle.read().source(), &self.inner.state.index_fields);
                index.insert(handle.id().to_string(), entry);
            }
        }
        let count = index.len();
        *self.inner.state.index.write() = index;
        info!(
            "event=pack_get_index module=compendium status=ok pack={} count={count}",
            self.collection()
        );
        Ok(self.index())
    }

    /// Cached document or a fresh backend fetch. Concurrent calls for the
    /// same id share one fetch and its outcome.
    ///
    /// # Errors
    /// - `NotFound` when the backend holds no such document.
    /// - `Validation` / `Backend` from the fetch.
    pub async fn get_document(&self, id: &str) -> DocumentResult<DocumentHandle> {
        if let Some(handle) = self.get(id) {
            debug!(
                "event=pack_get_document module=compendium status=ok pack={} id={id} cache=hit",
                self.collection()
            );
            return Ok(handle);
        }
        let fetch = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(id) {
                Some(fetch) => fetch.clone(),
                None => {
                    let fetch = self.spawn_fetch(id.to_string());
                    in_flight.insert(id.to_string(), fetch.clone());
                    fetch
                }
            }
        };
        fetch.await
    }

    /// The fetch runs as its own task, so it completes and publishes even
    /// when every caller stops waiting.
    fn spawn_fetch(&self, id: DocumentId) -> SharedFetch {
        let pack = self.clone();
        let task = tokio::spawn(async move {
            let result = pack.fetch_document(&id).await;
            pack.inner.in_flight.lock().remove(&id);
            result
        });
        async move {
            task.await.unwrap_or_else(|err| {
                Err(DocumentError::Backend(BackendError::Transport(format!(
                    "document fetch aborted: {err}"
                ))))
            })
        }
        .boxed()
        .shared()
    }

    async fn fetch_document(&self, id: &str) -> DocumentResult<DocumentHandle> {
        let handles = self.inner.collection.load(&Query::by_id(id)).await?;
        let result = handles
            .into_iter()
            .find(|handle| handle.id() == id)
            .ok_or_else(|| DocumentError::not_found(self.document_name(), id));
        match &result {
            Ok(_) => debug!(
                "event=pack_get_document module=compendium status=ok pack={} id={id} cache=miss",
                self.collection()
            ),
            Err(err) => warn!(
                "event=pack_get_document module=compendium status=error pack={} id={id} error_code={}",
                self.collection(),
                err.code()
            ),
        }
        result
    }

    /// Always queries the backend, then merges every result into the cache
    /// and the index.
    pub async fn get_documents(&self, query: &Query) -> DocumentResult<Vec<DocumentHandle>> {
        self.inner.collection.load(query).await
    }

    /// Drops every expired document that is not being mutated. Returns the
    /// number evicted.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let due: Vec<DocumentId> = self
            .inner
            .state
            .expiries
            .lock()
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut evicted = 0;
        for id in due {
            let Some(handle) = self.inner.collection.get(&id) else {
                self.inner.state.expiries.lock().remove(&id);
                continue;
            };
            if handle.is_mutating() {
                continue;
            }
            {
                let mut expiries = self.inner.state.expiries.lock();
                // A hit may have extended the entry since `due` was collected.
                if expiries.get(&id).is_some_and(|deadline| *deadline > now) {
                    continue;
                }
                expiries.remove(&id);
            }
            self.inner.collection.remove(&id);
            evicted += 1;
        }
        if evicted > 0 {
            debug!(
                "event=pack_evict module=compendium status=ok pack={} count={evicted} reason=sweep",
                self.collection()
            );
        }
        evicted
    }

    /// Starts the periodic sweep when the cache config asks for one. The
    /// task ends once the pack is dropped.
    pub fn spawn_cache_sweeper(&self) -> Option<JoinHandle<()>> {
        let period = self.inner.cache.sweep_interval?;
        if period.is_zero() {
            return None;
        }
        let pack = Arc::downgrade(&self.inner);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = pack.upgrade() else {
                    break;
                };
                CompendiumCollection { inner }.sweep_expired();
            }
        }))
    }

    pub async fn create_documents(
        &self,
        user: &User,
        data: Vec<SourceData>,
        options: &ModificationOptions,
    ) -> DocumentResult<Vec<DocumentHandle>> {
        self.assert_user_can_modify(user, true)?;
        self.inner.collection.create_documents(user, data, options).await
    }

    /// Targets missing from the cache are fetched first.
    pub async fn update_documents(
        &self,
        user: &User,
        updates: Vec<SourceData>,
        options: &ModificationOptions,
    ) -> DocumentResult<Vec<DocumentHandle>> {
        self.assert_user_can_modify(user, true)?;
        for changes in &updates {
            if let Some(id) = source_id(changes) {
                self.get_document(id).await?;
            }
        }
        self.inner.collection.update_documents(user, updates, options).await
    }

    pub async fn delete_documents(
        &self,
        user: &User,
        ids: Vec<DocumentId>,
        options: &ModificationOptions,
    ) -> DocumentResult<Vec<DocumentId>> {
        self.assert_user_can_modify(user, true)?;
        for id in &ids {
            self.get_document(id).await?;
        }
        self.inner.collection.delete_documents(user, ids, options).await
    }

    pub async fn create_embedded_documents(
        &self,
        user: &User,
        parent_id: &str,
        embedded_name: &str,
        data: Vec<SourceData>,
        options: &ModificationOptions,
    ) -> DocumentResult<Vec<DocumentId>> {
        self.assert_user_can_modify(user, true)?;
        self.get_document(parent_id).await?;
        self.inner
            .collection
            .create_embedded_documents(user, parent_id, embedded_name, data, options)
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
        self.assert_user_can_modify(user, true)?;
        self.get_document(parent_id).await?;
        self.inner
            .collection
            .update_embedded_documents(user, parent_id, embedded_name, updates, options)
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
        self.assert_user_can_modify(user, true)?;
        self.get_document(parent_id).await?;
        self.inner
            .collection
            .delete_embedded_documents(user, parent_id, embedded_name, ids, options)
            .await
    }

    /// Copies `document` into this pack, dropping its world-local identity.
    pub async fn import_document(
        &self,
        user: &User,
        document: &DocumentHandle,
    ) -> DocumentResult<DocumentHandle> {
        self.assert_user_can_modify(user, true)?;
        let data = {
            let document = document.read();
            if document.document_name() != self.document_name() {
                return Err(DocumentError::validation(
                    document.document_name(),
                    format!("pack {} holds {} documents", self.collection(), self.document_name()),
                ));
            }
            document.to_compendium()
        };
        let created = self
            .inner
            .collection
            .create_documents(user, vec![data], &ModificationOptions::default())
            .await?;
        created.into_iter().next().ok_or_else(|| {
            DocumentError::Backend(BackendError::Rejected(
                "import produced no document".to_string(),
            ))
        })
    }

    /// Copies every pack document into the world collection of the same
    /// type, optionally filed under an existing or a new folder.
    pub async fn import_all(
        &self,
        user: &User,
        world: &World,
        options: ImportAllOptions,
    ) -> DocumentResult<Vec<DocumentHandle>> {
        self.assert_user_can_modify(user, true)?;
        let target = world.require_collection(self.document_name())?;
        let documents = self.get_documents(&Query::all()).await?;

        let folder_id = match &options.folder_name {
            Some(name) => {
                let mut folder = SourceData::new();
                folder.insert("name".to_string(), Value::String(name.clone()));
                folder.insert(
                    "type".to_string(),
                    Value::String(self.document_name().to_string()),
                );
                let created = world
                    .require_collection(FOLDER_DOCUMENT)?
                    .create_documents(user, vec![folder], &ModificationOptions::default())
                    .await?;
                created.first().map(|handle| handle.id().to_string())
            }
            None => options.folder_id.clone(),
        };

        let data: Vec<SourceData> = documents
            .iter()
            .map(|handle| {
                let mut source = handle.read().to_compendium();
                if let Some(folder_id) = &folder_id {
                    source.insert("folder".to_string(), Value::String(folder_id.clone()));
                }
                source
            })
            .collect();
        let created = target.create_documents(user, data, &options.options).await?;
        info!(
            "event=pack_import_all module=compendium status=ok pack={} count={} folder={}",
            self.collection(),
            created.len(),
            folder_id.as_deref().unwrap_or("none")
        );
        Ok(created)
    }

    /// Writes the index entry of a document held by this pack.
    pub fn index_document(&self, user: &User, handle: &DocumentHandle) -> DocumentResult<()> {
        self.assert_user_can_modify(user, true)?;
        if handle.read().pack() != Some(self.collection()) {
            return Err(DocumentError::not_found(self.document_name(), handle.id()));
        }
        self.inner.state.index_handle(handle);
        Ok(())
    }

    /// Reads the stored flags of this pack into memory.
    ///
    /// Malformed flags are logged and read as locked and private.
    pub async fn load_configuration(&self) -> DocumentResult<CompendiumConfiguration> {
        let stored = self.inner.settings.get_setting(CONFIG_SETTING).await?;
        let config = match stored {
            None => CompendiumConfiguration::default(),
            Some(Value::Object(setting)) => match setting.get(self.collection()) {
                Some(entry) => self.read_entry(entry, "load"),
                None => CompendiumConfiguration::default(),
            },
            Some(other) => self.read_entry(&other, "load"),
        };
        *self.inner.config.write() = config;
        debug!(
            "event=pack_load_config module=compendium status=ok pack={} locked={} private={}",
            self.collection(),
            self.locked(),
            self.private()
        );
        Ok(config)
    }

    /// Merges `changes` into the stored flags of this pack.
    ///
    /// The settings entry is shared by every pack and has no exclusive
    /// owner, so it is re-read right before merging. Works on locked packs.
    /// Malformed stored flags are logged and overwritten with the merge.
    pub async fn configure(
        &self,
        user: &User,
        changes: CompendiumConfiguration,
    ) -> DocumentResult<CompendiumConfiguration> {
        self.assert_user_can_modify(user, false)?;
        let key = self.collection().to_string();
        let mut setting = match self.inner.settings.get_setting(CONFIG_SETTING).await? {
            Some(Value::Object(setting)) => setting,
            None => SourceData::new(),
            Some(_) => {
                warn!(
                    "event=pack_configure module=compendium status=error pack={key} reason=setting_not_an_object"
                );
                return Err(DocumentError::Backend(BackendError::Rejected(format!(
                    "stored `{CONFIG_SETTING}` is not an object"
                ))));
            }
        };
        let current = setting
            .get(&key)
            .map(|entry| self.read_entry(entry, "configure"))
            .unwrap_or_default();
        let merged = current.merged(changes);
        let entry = serde_json::to_value(merged)
            .map_err(|err| DocumentError::Backend(BackendError::Rejected(err.to_string())))?;
        setting.insert(key, entry);
        self.inner
            .settings
            .set_setting(CONFIG_SETTING, Value::Object(setting))
            .await?;

        *self.inner.config.write() = merged;
        info!(
            "event=pack_configure module=compendium status=ok pack={} locked={} private={}",
            self.collection(),
            self.locked(),
            self.private()
        );
        self.on_modify_contents();
        Ok(merged)
    }

    fn read_entry(&self, entry: &Value, operation: &str) -> CompendiumConfiguration {
        let (config, malformed) = CompendiumConfiguration::from_stored(entry);
        if !malformed.is_empty() {
            warn!(
                "event=pack_config module=compendium status=malformed operation={operation} pack={} fields={} entry={}",
                self.collection(),
                malformed.join(","),
                entry
            );
        }
        config
    }

    /// Re-validates every stored document and writes the batch back in one
    /// request. Nothing is written if any document fails validation.
    ///
    /// Cached copies are dropped so the next access reads the migrated data.
    pub async fn migrate(
        &self,
        user: &User,
        options: &ModificationOptions,
    ) -> DocumentResult<CompendiumCollection> {
        self.assert_user_can_modify(user, true)?;
        info!(
            "event=pack_migrate module=compendium status=start pack={}",
            self.collection()
        );
        let collection = &self.inner.collection;
        let scope = collection.scope();
        let sources = collection
            .backend()
            .get_documents(&scope, &Query::all())
            .await?;

        let pipeline = collection.pipeline();
        for source in &sources {
            let candidate =
                Document::from_source(collection.types(), self.document_name(), source.clone())?;
            if let Err(err) = pipeline.compute(&candidate, &[]) {
                warn!(
                    "event=pack_migrate module=compendium status=error pack={} id={} error_code={}",
                    self.collection(),
                    candidate.id(),
                    err.code()
                );
                return Err(err);
            }
        }
        let count = sources.len();
        if !sources.is_empty() {
            collection
                .backend()
                .update_documents(&scope, sources, options)
                .await?;
        }

        for handle in collection.contents() {
            if !handle.is_mutating() {
                collection.remove(handle.id());
                self.inner.state.expiries.lock().remove(handle.id());
            }
        }
        self.get_index().await?;
        info!(
            "event=pack_migrate module=compendium status=ok pack={} count={count}",
            self.collection()
        );
        Ok(self.clone())
    }

    pub fn ptr_eq(&self, other: &CompendiumCollection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for CompendiumCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompendiumCollection")
            .field("metadata", &self.inner.metadata)
            .field("config", &self.config())
            .field("cached", &self.inner.collection.len())
            .finish_non_exhaustive()
    }
}
