#![allow(dead_code)]

use async_trait::async_trait;
use folio_core::{
    Backend, BackendError, BackendResult, ClientDocument, DerivedContext, Document, DocumentId,
    DocumentType, DocumentTypeRegistry, HookContext, ModificationOptions, Observer, Query, Scope,
    SettingsStore, SourceData, SqliteBackend, User, UserRole,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn object(value: Value) -> SourceData {
    value.as_object().cloned().expect("test value is an object")
}

pub fn gm() -> User {
    User::new("gm", "Gamemaster", UserRole::Gamemaster)
}

pub fn player(id: &str) -> User {
    User::new(id, id, UserRole::Player)
}

/// Hook calls observed by [`ActorBehavior`], in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    PreCreate { proposed: usize },
    PostCreate { created: usize, item_count: Option<i64>, attached: bool },
    PreUpdate { changes: usize },
    PostUpdate { updated: usize, total_weight: Option<f64> },
    PreDelete { ids: usize },
    PostDelete { deleted: usize, item_count: Option<i64>, detached: bool },
    Created(String),
    Updated(String),
    Deleted(String),
}

/// Actor type: rejects negative `hp`, derives `itemCount` and
/// `totalWeight` from its items, drops proposed items marked `veto`.
#[derive(Default)]
pub struct ActorBehavior {
    events: Mutex<Vec<HookEvent>>,
    veto_everything: AtomicBool,
}

impl ActorBehavior {
    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    pub fn veto_everything(&self, veto: bool) {
        self.veto_everything.store(veto, Ordering::SeqCst);
    }

    fn record(&self, event: HookEvent) {
        self.events.lock().push(event);
    }
}

fn item_count(parent: &Document) -> Option<i64> {
    parent.derived()?.get("itemCount")?.as_i64()
}

impl ClientDocument for ActorBehavior {
    fn validate_source(&self, source: &SourceData) -> Result<(), String> {
        match source.get("hp") {
            None => Ok(()),
            Some(value) if value.as_i64().is_some_and(|hp| hp >= 0) => Ok(()),
            Some(_) => Err("`hp` must be a non-negative integer".to_string()),
        }
    }

    fn prepare_derived_data(&self, context: &mut DerivedContext<'_>) -> Result<(), String> {
        let count = context.children("items").count();
        let weight: f64 = context
            .children("items")
            .filter_map(|item| item.get("weight").and_then(Value::as_f64))
            .sum();
        context.derived.insert("itemCount".to_string(), json!(count));
        context.derived.insert("totalWeight".to_string(), json!(weight));
        Ok(())
    }

    fn on_create(&self, document: &Document, _options: &ModificationOptions, _user_id: &str) {
        self.record(HookEvent::Created(document.id().to_string()));
    }

    fn on_update(
        &self,
        document: &Document,
        _changes: &SourceData,
        _options: &ModificationOptions,
        _user_id: &str,
    ) {
        self.record(HookEvent::Updated(document.id().to_string()));
    }

    fn on_delete(&self, document: &Document, _options: &ModificationOptions, _user_id: &str) {
        self.record(HookEvent::Deleted(document.id().to_string()));
    }

    fn pre_create_embedded(
        &self,
        _parent: &Document,
        proposed: &mut Vec<SourceData>,
        _context: &HookContext<'_>,
    ) -> folio_core::DocumentResult<()> {
        self.record(HookEvent::PreCreate {
            proposed: proposed.len(),
        });
        if self.veto_everything.load(Ordering::SeqCst) {
            proposed.clear();
        }
        proposed.retain(|item| item.get("veto") != Some(&Value::Bool(true)));
        Ok(())
    }

    fn on_create_embedded(
        &self,
        parent: &Document,
        created: &[&Document],
        _result: &[SourceData],
        _context: &HookContext<'_>,
    ) {
        let attached = created
            .iter()
            .all(|child| child.parent().is_some_and(|key| key.id == parent.id()));
        self.record(HookEvent::PostCreate {
            created: created.len(),
            item_count: item_count(parent),
            attached,
        });
    }

    fn pre_update_embedded(
        &self,
        _parent: &Document,
        changes: &mut Vec<SourceData>,
        _context: &HookContext<'_>,
    ) -> folio_core::DocumentResult<()> {
        self.record(HookEvent::PreUpdate {
            changes: changes.len(),
        });
        Ok(())
    }

    fn on_update_embedded(
        &self,
        parent: &Document,
        updated: &[&Document],
        _result: &[SourceData],
        _context: &HookContext<'_>,
    ) {
        self.record(HookEvent::PostUpdate {
            updated: updated.len(),
            total_weight: parent
                .derived()
                .and_then(|derived| derived.get("totalWeight"))
                .and_then(Value::as_f64),
        });
    }

    fn pre_delete_embedded(
        &self,
        _parent: &Document,
        ids: &mut Vec<DocumentId>,
        _context: &HookContext<'_>,
    ) -> folio_core::DocumentResult<()> {
        self.record(HookEvent::PreDelete { ids: ids.len() });
        Ok(())
    }

    fn on_delete_embedded(
        &self,
        parent: &Document,
        deleted: &[Document],
        _result: &[DocumentId],
        _context: &HookContext<'_>,
    ) {
        self.record(HookEvent::PostDelete {
            deleted: deleted.len(),
            item_count: item_count(parent),
            detached: deleted.iter().all(|child| child.parent().is_none()),
        });
    }
}

/// Item type: rejects negative `weight`.
pub struct ItemBehavior;

impl ClientDocument for ItemBehavior {
    fn validate_source(&self, source: &SourceData) -> Result<(), String> {
        match source.get("weight") {
            None => Ok(()),
            Some(value) if value.as_f64().is_some_and(|weight| weight >= 0.0) => Ok(()),
            Some(_) => Err("`weight` must be a non-negative number".to_string()),
        }
    }
}

pub fn registry(actor: Arc<ActorBehavior>) -> Arc<DocumentTypeRegistry> {
    let mut types = DocumentTypeRegistry::new();
    types
        .register(DocumentType::new("Item").with_behavior(Arc::new(ItemBehavior)))
        .expect("item type");
    types
        .register(
            DocumentType::new("Actor")
                .with_embedded("items", "Item")
                .with_behavior(actor),
        )
        .expect("actor type");
    Arc::new(types)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Calls {
    pub gets: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl Calls {
    pub fn writes(&self) -> usize {
        self.creates + self.updates + self.deletes
    }
}

/// SQLite backend that counts calls and can delay, fail or rewrite them.
pub struct CountingBackend {
    inner: SqliteBackend,
    stamp: Mutex<Option<SourceData>>,
    gets: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
    fail_writes: AtomicBool,
    get_delay_ms: AtomicU64,
    write_delay_ms: AtomicU64,
}

impl CountingBackend {
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self::wrap(SqliteBackend::open_in_memory().expect("in-memory db")))
    }

    pub fn at(path: &Path) -> Arc<Self> {
        Arc::new(Self::wrap(SqliteBackend::open(path).expect("file db")))
    }

    fn wrap(inner: SqliteBackend) -> Self {
        Self {
            inner,
            stamp: Mutex::new(None),
            gets: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            get_delay_ms: AtomicU64::new(0),
            write_delay_ms: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> Calls {
        Calls {
            gets: self.gets.load(Ordering::SeqCst),
            creates: self.creates.load(Ordering::SeqCst),
            updates: self.updates.load(Ordering::SeqCst),
            deletes: self.deletes.load(Ordering::SeqCst),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn delay_gets(&self, delay: Duration) {
        self.get_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn delay_writes(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Fields merged into every created or updated source before it is
    /// stored, as a backend normalising its input would.
    pub fn stamp_writes(&self, stamp: Option<Value>) {
        *self.stamp.lock() = stamp.and_then(|value| value.as_object().cloned());
    }

    fn stamped(&self, mut data: Vec<SourceData>) -> Vec<SourceData> {
        if let Some(stamp) = self.stamp.lock().as_ref() {
            for source in &mut data {
                source.extend(stamp.clone());
            }
        }
        data
    }

    async fn before_write(&self, counter: &AtomicUsize) -> BackendResult<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("connection reset".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for CountingBackend {
    async fn get_documents(&self, scope: &Scope, query: &Query) -> BackendResult<Vec<SourceData>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let delay = self.get_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.get_documents(scope, query).await
    }

    async fn create_documents(
        &self,
        scope: &Scope,
        data: Vec<SourceData>,
        options: &ModificationOptions,
    ) -> BackendResult<Vec<SourceData>> {
        self.before_write(&self.creates).await?;
        let data = self.stamped(data);
        self.inner.create_documents(scope, data, options).await
    }

    async fn update_documents(
        &self,
        scope: &Scope,
        updates: Vec<SourceData>,
        options: &ModificationOptions,
    ) -> BackendResult<Vec<SourceData>> {
        self.before_write(&self.updates).await?;
        let updates = self.stamped(updates);
        self.inner.update_documents(scope, updates, options).await
    }

    async fn delete_documents(
        &self,
        scope: &Scope,
        ids: Vec<DocumentId>,
        options: &ModificationOptions,
    ) -> BackendResult<Vec<DocumentId>> {
        self.before_write(&self.deletes).await?;
        self.inner.delete_documents(scope, ids, options).await
    }
}

#[async_trait]
impl SettingsStore for CountingBackend {
    async fn get_setting(&self, key: &str) -> BackendResult<Option<Value>> {
        self.inner.get_setting(key).await
    }

    async fn set_setting(&self, key: &str, value: Value) -> BackendResult<()> {
        self.inner.set_setting(key, value).await
    }
}

/// Observer counting its renders.
#[derive(Default)]
pub struct RecordingObserver {
    renders: AtomicUsize,
}

impl RecordingObserver {
    pub fn pair() -> (Arc<Self>, Arc<dyn Observer>) {
        let observer = Arc::new(Self::default());
        let as_dyn: Arc<dyn Observer> = observer.clone();
        (observer, as_dyn)
    }

    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }
}

impl Observer for RecordingObserver {
    fn render(&self, _force: bool) {
        self.renders.fetch_add(1, Ordering::SeqCst);
    }
}
