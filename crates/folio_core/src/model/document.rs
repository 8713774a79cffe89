//! Document entity and its shared handle.
//!
//! # Responsibility
//! - Hold persisted source, derived state, embedded children and observers.
//! - Split inline embedded arrays into child documents and rebuild them.
//!
//! # Invariants
//! - `id` never changes after construction.
//! - `derived` is `None` until the pipeline completes once.
//! - A parent owns its children; a child only keeps a `ParentKey` lookup.
//! - `source` never contains embedded arrays; `to_source` reassembles them.

use crate::model::error::{DocumentError, DocumentResult};
use crate::model::permission::{permission_level, PermissionLevel, User};
use crate::model::registry::DocumentTypeRegistry;
use crate::model::source::{
    is_stored_id, merge_object, source_id, strip_local_identity, DerivedData, DocumentId,
    SourceData,
};
use crate::observer::{notify, Observer, ObserverSet};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lookup key from an embedded child back to its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentKey {
    pub id: DocumentId,
    pub document_name: String,
    /// Embedded collection of the parent holding this child.
    pub embedded_name: String,
    pub uuid: String,
}

#[derive(Debug)]
pub struct Document {
    id: DocumentId,
    document_name: String,
    source: SourceData,
    derived: Option<DerivedData>,
    parent: Option<ParentKey>,
    embedded: BTreeMap<String, Vec<Document>>,
    observers: ObserverSet,
    collection: Option<String>,
    pack: Option<String>,
}

impl Document {
    /// Builds a document tree from a full (nested) source object.
    ///
    /// Arrays under the type's embedded keys become child documents.
    pub fn from_source(
        types: &DocumentTypeRegistry,
        document_name: &str,
        mut source: SourceData,
    ) -> DocumentResult<Self> {
        let document_type = types.require(document_name)?;
        let id = match source_id(&source) {
            Some(id) if is_stored_id(id) => id.to_string(),
            Some(id) => return Err(DocumentError::InvalidId(id.to_string())),
            None => return Err(DocumentError::validation(document_name, "missing `_id`")),
        };

        let mut embedded = BTreeMap::new();
        for spec in document_type.embedded() {
            let children = match source.remove(&spec.key) {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(values)) => values
                    .into_iter()
                    .map(|value| match value {
                        Value::Object(child) => {
                            Document::from_source(types, &spec.document_name, child)
                        }
                        _ => Err(DocumentError::validation(
                            &spec.document_name,
                            format!("`{}` entries must be objects", spec.key),
                        )),
                    })
                    .collect::<DocumentResult<Vec<_>>>()?,
                Some(_) => {
                    return Err(DocumentError::validation(
                        document_name,
                        format!("`{}` must be an array", spec.key),
                    ))
                }
            };
            embedded.insert(spec.key.clone(), children);
        }

        let mut document = Self {
            id,
            document_name: document_name.to_string(),
            source,
            derived: None,
            parent: None,
            embedded,
            observers: ObserverSet::new(),
            collection: None,
            pack: None,
        };
        document.refresh_child_keys();
        Ok(document)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn document_name(&self) -> &str {
        &self.document_name
    }

    pub fn name(&self) -> Option<&str> {
        self.source.get("name").and_then(Value::as_str)
    }

    /// Last-persisted source, without embedded arrays.
    pub fn source(&self) -> &SourceData {
        &self.source
    }

    /// Derived state of the last successful preparation pass.
    pub fn derived(&self) -> Option<&DerivedData> {
        self.derived.as_ref()
    }

    pub fn is_prepared(&self) -> bool {
        self.derived.is_some()
    }

    pub fn parent(&self) -> Option<&ParentKey> {
        self.parent.as_ref()
    }

    pub fn is_embedded(&self) -> bool {
        self.parent.is_some()
    }

    /// Key of the collection holding this document, if any.
    pub fn collection_key(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    /// Compendium pack holding this document, if any.
    pub fn pack(&self) -> Option<&str> {
        self.pack.as_deref()
    }

    pub fn embedded(&self, key: &str) -> &[Document] {
        self.embedded.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn embedded_child(&self, key: &str, id: &str) -> Option<&Document> {
        self.embedded(key).iter().find(|child| child.id == id)
    }

    pub fn embedded_collections(&self) -> impl Iterator<Item = (&str, &[Document])> {
        self.embedded
            .iter()
            .map(|(key, children)| (key.as_str(), children.as_slice()))
    }

    pub fn uuid(&self) -> String {
        match (&self.parent, &self.pack) {
            (Some(parent), _) => format!("{}.{}.{}", parent.uuid, self.document_name, self.id),
            (None, Some(pack)) => format!("Compendium.{pack}.{}", self.id),
            (None, None) => format!("{}.{}", self.document_name, self.id),
        }
    }

    /// Content link such as `@Actor[id]{Name}`.
    pub fn link(&self) -> String {
        let label = self.name().unwrap_or(&self.id);
        match &self.pack {
            Some(pack) if self.parent.is_none() => {
                format!("@Compendium[{pack}.{}]{{{label}}}", self.id)
            }
            _ => format!("@{}[{}]{{{label}}}", self.document_name, self.id),
        }
    }

    /// Full nested source, embedded arrays included.
    pub fn to_source(&self) -> SourceData {
        let mut source = self.source.clone();
        for (key, children) in &self.embedded {
            source.insert(
                key.clone(),
                Value::Array(
                    children
                        .iter()
                        .map(|child| Value::Object(child.to_source()))
                        .collect(),
                ),
            );
        }
        source
    }

    /// Source suitable for another collection: local identity removed.
    pub fn to_compendium(&self) -> SourceData {
        let mut source = self.to_source();
        strip_local_identity(&mut source);
        source
    }

    /// Level of `user` over this document, considering only its own map.
    ///
    /// For embedded children use [`Document::child_permission`] on the
    /// parent so inheritance can apply.
    pub fn permission(&self, user: &User) -> PermissionLevel {
        permission_level(user, &self.source, &[])
    }

    /// Level of `user` over an embedded child, inheriting from this document.
    pub fn child_permission(&self, user: &User, key: &str, id: &str) -> Option<PermissionLevel> {
        self.embedded_child(key, id)
            .map(|child| permission_level(user, &child.source, &[&self.source]))
    }

    pub fn is_owner(&self, user: &User) -> bool {
        self.permission(user).is_owner()
    }

    pub fn limited(&self, user: &User) -> bool {
        self.permission(user).is_limited()
    }

    pub fn visible(&self, user: &User) -> bool {
        self.permission(user).is_visible()
    }

    /// True when some non-gamemaster among `users` owns this document.
    pub fn has_player_owner(&self, users: &[User]) -> bool {
        users
            .iter()
            .filter(|user| !user.is_gm())
            .any(|user| self.is_owner(user))
    }

    pub fn register_observer(&mut self, id: impl Into<String>, observer: &Arc<dyn Observer>) {
        self.observers.register(id, observer);
    }

    pub fn unregister_observer(&mut self, id: &str) -> bool {
        self.observers.unregister(id)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub(crate) fn live_observers(&mut self) -> Vec<Arc<dyn Observer>> {
        self.observers.live()
    }

    pub(crate) fn clear_observers(&mut self) {
        self.observers.clear();
    }

    pub(crate) fn set_derived(&mut self, derived: DerivedData) {
        self.derived = Some(derived);
    }

    pub(crate) fn set_collection(&mut self, collection: Option<String>) {
        self.collection = collection;
    }

    pub(crate) fn set_pack(&mut self, pack: Option<String>) {
        self.pack = pack;
        self.refresh_child_keys();
    }

    /// Copy of `changes` without this document's embedded keys.
    pub(crate) fn own_changes(&self, changes: &SourceData) -> SourceData {
        let mut own = changes.clone();
        own.retain(|key, _| !self.embedded.contains_key(key));
        own
    }

    /// Merges an incremental payload into the source. Embedded keys are
    /// ignored: children change through the embedded manager only.
    pub(crate) fn apply_changes(&mut self, changes: &SourceData) {
        let own = self.own_changes(changes);
        merge_object(&mut self.source, &own);
    }

    /// Takes source, derived state and children from a freshly loaded copy.
    /// Observers and collection membership are kept.
    pub(crate) fn absorb(&mut self, fresh: Document) {
        self.source = fresh.source;
        self.derived = fresh.derived;
        self.embedded = fresh.embedded;
        self.refresh_child_keys();
    }

    pub(crate) fn embedded_mut(&mut self, key: &str) -> Option<&mut Vec<Document>> {
        self.embedded.get_mut(key)
    }

    pub(crate) fn embedded_child_mut(&mut self, key: &str, id: &str) -> Option<&mut Document> {
        self.embedded
            .get_mut(key)?
            .iter_mut()
            .find(|child| child.id == id)
    }

    pub(crate) fn embedded_collections_mut(
        &mut self,
    ) -> impl Iterator<Item = (&str, &mut Vec<Document>)> {
        self.embedded
            .iter_mut()
            .map(|(key, children)| (key.as_str(), children))
    }

    /// Attaches `child` under `key`, pointing its parent key at this document.
    pub(crate) fn attach_child(&mut self, key: &str, mut child: Document) {
        child.parent = Some(self.parent_key(key));
        child.refresh_child_keys();
        self.embedded.entry(key.to_string()).or_default().push(child);
    }

    /// Clears the parent key of a removed child.
    pub(crate) fn detach(&mut self) {
        self.parent = None;
        self.refresh_child_keys();
    }

    fn parent_key(&self, key: &str) -> ParentKey {
        ParentKey {
            id: self.id.clone(),
            document_name: self.document_name.clone(),
            embedded_name: key.to_string(),
            uuid: self.uuid(),
        }
    }

    fn refresh_child_keys(&mut self) {
        let keys: Vec<String> = self.embedded.keys().cloned().collect();
        for key in keys {
            let parent_key = self.parent_key(&key);
            if let Some(children) = self.embedded.get_mut(&key) {
                for child in children {
                    child.parent = Some(parent_key.clone());
                    child.refresh_child_keys();
                }
            }
        }
    }
}

/// Shared identity of a live top-level document.
///
/// Cloning the handle never clones the document. Mutations take the
/// per-document gate first, so a second mutation queues (FIFO) behind an
/// in-flight one.
#[derive(Clone)]
pub struct DocumentHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: DocumentId,
    document: RwLock<Document>,
    gate: Arc<Mutex<()>>,
}

impl DocumentHandle {
    pub fn new(document: Document) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: document.id.clone(),
                document: RwLock::new(document),
                gate: Arc::new(Mutex::new(())),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Read access. Never hold the guard across an `.await`.
    pub fn read(&self) -> RwLockReadGuard<'_, Document> {
        self.inner.document.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Document> {
        self.inner.document.write()
    }

    /// Waits for earlier mutations of this document, then holds the gate.
    pub(crate) async fn begin_mutation(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.inner.gate).lock_owned().await
    }

    /// True while a mutating operation holds this document's gate.
    pub fn is_mutating(&self) -> bool {
        self.inner.gate.try_lock().is_err()
    }

    pub fn ptr_eq(&self, other: &DocumentHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn register_observer(&self, id: impl Into<String>, observer: &Arc<dyn Observer>) {
        self.write().register_observer(id, observer);
    }

    pub fn unregister_observer(&self, id: &str) -> bool {
        self.write().unregister_observer(id)
    }

    /// Renders every registered observer with the document lock released.
    pub fn render(&self, force: bool) {
        let observers = self.write().live_observers();
        notify(&observers, force);
    }
}

impl std::fmt::Debug for DocumentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentHandle")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{Document, DocumentHandle};
    use crate::model::permission::{PermissionLevel, User, UserRole};
    use crate::model::registry::{DocumentType, DocumentTypeRegistry};
    use crate::model::source::SourceData;
    use serde_json::json;

    fn registry() -> DocumentTypeRegistry {
        let mut types = DocumentTypeRegistry::new();
        types.register(DocumentType::new("Item")).expect("item");
        types
            .register(DocumentType::new("Actor").with_embedded("items", "Item"))
            .expect("actor");
        types
    }

    fn object(value: serde_json::Value) -> SourceData {
        value.as_object().cloned().expect("object")
    }

    fn actor() -> Document {
        Document::from_source(
            &registry(),
            "Actor",
            object(json!({
                "_id": "actor0000000001a",
                "name": "Hero",
                "permission": {"default": 1, "alice": 3},
                "items": [
                    {"_id": "item00000000001a", "name": "Sword"},
                    {"_id": "item00000000002b", "name": "Shield", "permission": {"bob": 2}}
                ]
            })),
        )
        .expect("valid actor")
    }

    #[test]
    fn splits_embedded_arrays_into_children() {
        let doc = actor();
        assert!(!doc.source().contains_key("items"));
        assert_eq!(doc.embedded("items").len(), 2);
        let sword = doc
            .embedded_child("items", "item00000000001a")
            .expect("sword");
        let parent = sword.parent().expect("parent key");
        assert_eq!(parent.id, "actor0000000001a");
        assert_eq!(parent.embedded_name, "items");
        assert_eq!(sword.uuid(), "Actor.actor0000000001a.Item.item00000000001a");
        assert!(!doc.is_prepared());
    }

    #[test]
    fn to_source_reassembles_children_in_order() {
        let source = actor().to_source();
        let names: Vec<_> = source["items"]
            .as_array()
            .expect("items array")
            .iter()
            .map(|item| item["name"].as_str().expect("name"))
            .collect();
        assert_eq!(names, vec!["Sword", "Shield"]);
    }

    #[test]
    fn rejects_missing_or_blank_ids() {
        let types = registry();
        assert!(Document::from_source(&types, "Item", object(json!({"name": "x"}))).is_err());
        assert!(Document::from_source(&types, "Item", object(json!({"_id": "  "}))).is_err());
        assert!(Document::from_source(&types, "Item", object(json!({"_id": 7}))).is_err());
        assert!(Document::from_source(
            &types,
            "Actor",
            object(json!({"_id": "actor0000000001a", "items": {"not": "array"}}))
        )
        .is_err());
    }

    #[test]
    fn stored_ids_keep_their_backend_form() {
        let types = registry();
        let document = Document::from_source(&types, "Item", object(json!({"_id": "abc", "name": "Rope"})))
            .expect("short stored id");
        assert_eq!(document.id(), "abc");
    }

    #[test]
    fn pack_membership_changes_uuid_and_link() {
        let mut doc = actor();
        doc.set_pack(Some("world.heroes".to_string()));
        assert_eq!(doc.uuid(), "Compendium.world.heroes.actor0000000001a");
        assert_eq!(doc.link(), "@Compendium[world.heroes.actor0000000001a]{Hero}");
        let sword = doc
            .embedded_child("items", "item00000000001a")
            .expect("sword");
        assert_eq!(
            sword.uuid(),
            "Compendium.world.heroes.actor0000000001a.Item.item00000000001a"
        );
    }

    #[test]
    fn permission_accessors_and_child_inheritance() {
        let doc = actor();
        let alice = User::new("alice", "Alice", UserRole::Player);
        let bob = User::new("bob", "Bob", UserRole::Player);
        let gm = User::new("gm", "GM", UserRole::Gamemaster);

        assert!(doc.is_owner(&alice));
        assert!(doc.limited(&bob));
        assert!(doc.visible(&bob));
        assert!(doc.has_player_owner(&[gm.clone(), alice.clone()]));
        assert!(!doc.has_player_owner(&[gm, bob.clone()]));

        assert_eq!(
            doc.child_permission(&alice, "items", "item00000000001a"),
            Some(PermissionLevel::Owner)
        );
        assert_eq!(
            doc.child_permission(&bob, "items", "item00000000002b"),
            Some(PermissionLevel::Observer)
        );
    }

    #[test]
    fn to_compendium_strips_local_identity() {
        let stripped = actor().to_compendium();
        assert!(!stripped.contains_key("_id"));
        assert!(!stripped.contains_key("permission"));
        assert_eq!(stripped["items"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn mutation_gate_reports_in_flight_work() {
        let handle = DocumentHandle::new(actor());
        assert!(!handle.is_mutating());
        let gate = handle.begin_mutation().await;
        assert!(handle.is_mutating());
        drop(gate);
        assert!(!handle.is_mutating());
    }
}
