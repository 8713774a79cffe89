//! Core document lifecycle and compendium cache for folio.
//! This crate is the single source of truth for document invariants.

pub mod backend;
pub mod collection;
pub mod compat;
pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod observer;
pub mod pipeline;

pub use backend::{
    Backend, BackendError, BackendResult, ModificationOptions, Query, Scope, SettingsStore,
    SqliteBackend,
};
pub use collection::{
    CollectionHooks, CompendiumCollection, CompendiumConfiguration, CompendiumMetadata,
    DocumentCollection, EmbeddedCollectionManager, ImportAllOptions, PackContents, World,
};
pub use config::{PackCacheConfig, CACHE_LIFETIME_SECONDS, CONFIG_SETTING};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::client::{BasicDocument, ClientDocument, HookContext};
pub use model::document::{Document, DocumentHandle, ParentKey};
pub use model::error::{DocumentError, DocumentResult};
pub use model::permission::{PermissionLevel, PermissionMap, User, UserRole};
pub use model::registry::{DocumentType, DocumentTypeRegistry, RegistryError};
pub use model::source::{random_id, DerivedData, DocumentId, SourceData};
pub use observer::{Observer, ObserverSet};
pub use pipeline::{DataPreparationPipeline, DerivedContext, PreparedTree};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
