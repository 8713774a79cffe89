//! World registry: one collection per document type plus the compendium packs.
//!
//! # Responsibility
//! - Build world-level collections from an explicit type registry.
//! - Register packs and run the world-pack lifecycle (create, delete,
//!   duplicate).
//!
//! # Invariants
//! - Pack keys are unique; a second registration fails with `PackExists`.
//! - Only gamemaster-equivalent users manage packs, and only world packs
//!   are created or deleted here.

use crate::backend::{Backend, ModificationOptions, Query, Scope, SettingsStore, SqliteBackend};
use crate::collection::{
    require_level, CompendiumCollection, CompendiumMetadata, DocumentCollection,
};
use crate::config::{PackCacheConfig, CONFIG_SETTING, WORLD_PACKAGE};
use crate::model::error::{DocumentError, DocumentResult};
use crate::model::permission::{PermissionLevel, User};
use crate::model::registry::DocumentTypeRegistry;
use crate::model::source::{source_id, DocumentId};
use indexmap::IndexMap;
use log::{error, info, warn};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

static SLUG_SEPARATOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("valid slug regex"));

/// Lower-case, dash-separated pack name derived from a label.
pub fn slugify(label: &str) -> String {
    SLUG_SEPARATOR_RE
        .replace_all(&label.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}

pub struct World {
    types: Arc<DocumentTypeRegistry>,
    backend: Arc<dyn Backend>,
    settings: Arc<dyn SettingsStore>,
    cache: PackCacheConfig,
    collections: BTreeMap<String, DocumentCollection>,
    packs: RwLock<IndexMap<String, CompendiumCollection>>,
}

impl World {
    pub fn new(
        types: Arc<DocumentTypeRegistry>,
        backend: Arc<dyn Backend>,
        settings: Arc<dyn SettingsStore>,
    ) -> DocumentResult<Self> {
        let mut collections = BTreeMap::new();
        for name in types.names() {
            let collection = DocumentCollection::new(name, types.clone(), backend.clone())?;
            collections.insert(name.to_string(), collection);
        }
        Ok(Self {
            types,
            backend,
            settings,
            cache: PackCacheConfig::default(),
            collections,
            packs: RwLock::new(IndexMap::new()),
        })
    }

    /// World whose documents and settings share one SQLite database.
    pub fn with_sqlite(
        types: Arc<DocumentTypeRegistry>,
        store: Arc<SqliteBackend>,
    ) -> DocumentResult<Self> {
        Self::new(types, store.clone(), store)
    }

    /// Cache settings for packs registered from now on.
    pub fn with_cache_config(mut self, cache: PackCacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn types(&self) -> &Arc<DocumentTypeRegistry> {
        &self.types
    }

    pub fn collection(&self, document_name: &str) -> Option<DocumentCollection> {
        self.collections.get(document_name).cloned()
    }

    pub fn require_collection(&self, document_name: &str) -> DocumentResult<DocumentCollection> {
        self.collection(document_name)
            .ok_or_else(|| DocumentError::UnknownDocumentType(document_name.to_string()))
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    /// Fills every world collection from the backend.
    pub async fn load(&self) -> DocumentResult<usize> {
        let mut count = 0;
        for collection in self.collections.values() {
            count += collection.load(&Query::all()).await?.len();
        }
        info!("event=world_load module=world status=ok count={count}");
        Ok(count)
    }

    pub fn packs(&self) -> Vec<CompendiumCollection> {
        self.packs.read().values().cloned().collect()
    }

    pub fn pack(&self, key: &str) -> Option<CompendiumCollection> {
        self.packs.read().get(key).cloned()
    }

    pub fn require_pack(&self, key: &str) -> DocumentResult<CompendiumCollection> {
        self.pack(key)
            .ok_or_else(|| DocumentError::PackNotFound(key.to_string()))
    }

    /// Registers a pack, reads its stored configuration and starts its
    /// cache sweeper when one is configured.
    pub async fn register_pack(
        &self,
        metadata: CompendiumMetadata,
    ) -> DocumentResult<CompendiumCollection> {
        let key = metadata.collection();
        if self.packs.read().contains_key(&key) {
            return Err(DocumentError::PackExists(key));
        }
        let pack = CompendiumCollection::new(
            metadata,
            self.types.clone(),
            self.backend.clone(),
            self.settings.clone(),
            self.cache,
        )?;
        pack.load_configuration().await?;
        {
            let mut packs = self.packs.write();
            if packs.contains_key(&key) {
                return Err(DocumentError::PackExists(key));
            }
            packs.insert(key.clone(), pack.clone());
        }
        pack.spawn_cache_sweeper();
        info!("event=pack_register module=world status=ok pack={key}");
        Ok(pack)
    }

    /// Creates an empty, unlocked world pack named after `label`.
    pub async fn create_compendium(
        &self,
        user: &User,
        label: &str,
        document_name: &str,
    ) -> DocumentResult<CompendiumCollection> {
        require_gm(user, "create compendium")?;
        self.types.require(document_name)?;
        let name = slugify(label);
        if name.is_empty() {
            return Err(DocumentError::validation(
                document_name,
                format!("pack label `{label}` yields an empty name"),
            ));
        }
        let metadata =
            CompendiumMetadata::new(WORLD_PACKAGE, name, document_name).with_label(label);
        self.register_pack(metadata).await
    }

    /// Deletes a world pack with every stored document and its settings
    /// entry.
    pub async fn delete_compendium(
        &self,
        user: &User,
        key: &str,
    ) -> DocumentResult<CompendiumMetadata> {
        require_gm(user, "delete compendium")?;
        let pack = self.require_pack(key)?;
        if !pack.metadata().is_world() {
            warn!("event=pack_delete module=world status=error pack={key} reason=not_world_pack");
            return Err(DocumentError::validation(
                pack.document_name(),
                format!("only world packs can be deleted, `{key}` is not one"),
            ));
        }

        let scope = Scope::collection(key);
        let ids: Vec<DocumentId> = self
            .backend
            .get_documents(&scope, &Query::index(&[]))
            .await?
            .iter()
            .filter_map(source_id)
            .map(str::to_string)
            .collect();
        if !ids.is_empty() {
            self.backend
                .delete_documents(&scope, ids, &ModificationOptions::default())
                .await?;
        }
        if let Some(Value::Object(mut setting)) = self.settings.get_setting(CONFIG_SETTING).await? {
            if setting.remove(key).is_some() {
                self.settings
                    .set_setting(CONFIG_SETTING, Value::Object(setting))
                    .await?;
            }
        }

        self.packs.write().shift_remove(key);
        info!("event=pack_delete module=world status=ok pack={key}");
        Ok(pack.metadata().clone())
    }

    /// Copies any pack into a new world pack, ids preserved.
    ///
    /// A failed copy leaves no pack and no copied documents behind.
    pub async fn duplicate_compendium(
        &self,
        user: &User,
        key: &str,
        label: Option<&str>,
    ) -> DocumentResult<CompendiumCollection> {
        require_gm(user, "duplicate compendium")?;
        let source = self.require_pack(key)?;
        let label = label
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} Copy", source.title()));
        let sources = self
            .backend
            .get_documents(&Scope::collection(key), &Query::all())
            .await?;
        let count = sources.len();
        let ids: Vec<DocumentId> = sources
            .iter()
            .filter_map(source_id)
            .map(str::to_string)
            .collect();
        let copy = self
            .create_compendium(user, &label, source.document_name())
            .await?;

        if !sources.is_empty() {
            let written = self
                .backend
                .create_documents(
                    &Scope::collection(copy.collection()),
                    sources,
                    &ModificationOptions::keep_id(),
                )
                .await;
            if let Err(err) = written {
                self.discard_copy(&copy, Vec::new()).await;
                return Err(err.into());
            }
        }
        if let Err(err) = copy.get_index().await {
            self.discard_copy(&copy, ids).await;
            return Err(err);
        }
        info!(
            "event=pack_duplicate module=world status=ok pack={key} copy={} count={count}",
            copy.collection()
        );
        Ok(copy)
    }

    /// Unregisters a half-made copy and deletes the documents already
    /// written to it.
    async fn discard_copy(&self, copy: &CompendiumCollection, written: Vec<DocumentId>) {
        let key = copy.collection().to_string();
        if !written.is_empty() {
            if let Err(err) = self
                .backend
                .delete_documents(&Scope::collection(&key), written, &ModificationOptions::default())
                .await
            {
                error!("event=pack_duplicate module=world status=rollback_error pack={key} error={err}");
            }
        }
        self.packs.write().shift_remove(&key);
        warn!("event=pack_duplicate module=world status=error pack={key} reason=copy_failed");
    }
}

fn require_gm(user: &User, action: &str) -> DocumentResult<()> {
    let actual = if user.is_gm() {
        PermissionLevel::Owner
    } else {
        PermissionLevel::None
    };
    require_level(user, action, PermissionLevel::Owner, actual)
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("collections", &self.collections.keys().collect::<Vec<_>>())
            .field("packs", &self.packs.read().keys().cloned().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
