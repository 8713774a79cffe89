//! Deprecated entity-named call shapes.
//!
//! Every method logs a deprecation warning and forwards to the current
//! document API unchanged. Nothing in the core calls these.

use crate::backend::{BackendError, ModificationOptions};
use crate::collection::{CompendiumCollection, DocumentCollection};
use crate::model::document::DocumentHandle;
use crate::model::error::{DocumentError, DocumentResult};
use crate::model::permission::User;
use crate::model::source::{DocumentId, SourceData};
use async_trait::async_trait;
use log::warn;

fn deprecated(old: &str, current: &str) {
    warn!("event=deprecated_call module=compat status=warn old={old} current={current}");
}

fn first<T>(items: Vec<T>, operation: &str) -> DocumentResult<T> {
    items.into_iter().next().ok_or_else(|| {
        DocumentError::Backend(BackendError::Rejected(format!("{operation} returned nothing")))
    })
}

#[async_trait]
pub trait LegacyCompendiumApi {
    /// Old name of the pack's document type.
    fn entity(&self) -> &str;
    async fn get_entry(&self, id: &str) -> DocumentResult<SourceData>;
    async fn get_entity(&self, id: &str) -> DocumentResult<DocumentHandle>;
    async fn import_entity(&self, user: &User, entity: &DocumentHandle) -> DocumentResult<DocumentHandle>;
    async fn create_entity(&self, user: &User, data: SourceData) -> DocumentResult<DocumentHandle>;
    async fn update_entity(&self, user: &User, changes: SourceData) -> DocumentResult<DocumentHandle>;
    async fn delete_entity(&self, user: &User, id: &str) -> DocumentResult<DocumentId>;
}

#[async_trait]
impl LegacyCompendiumApi for CompendiumCollection {
    fn entity(&self) -> &str {
        deprecated("entity", "document_name");
        self.document_name()
    }

    async fn get_entry(&self, id: &str) -> DocumentResult<SourceData> {
        deprecated("get_entry", "get_document");
        let handle = self.get_document(id).await?;
        let source = handle.read().to_source();
        Ok(source)
    }

    async fn get_entity(&self, id: &str) -> DocumentResult<DocumentHandle> {
        deprecated("get_entity", "get_document");
        self.get_document(id).await
    }

    async fn import_entity(&self, user: &User, entity: &DocumentHandle) -> DocumentResult<DocumentHandle> {
        deprecated("import_entity", "import_document");
        self.import_document(user, entity).await
    }

    async fn create_entity(&self, user: &User, data: SourceData) -> DocumentResult<DocumentHandle> {
        deprecated("create_entity", "create_documents");
        let created = self
            .create_documents(user, vec![data], &ModificationOptions::default())
            .await?;
        first(created, "create_entity")
    }

    async fn update_entity(&self, user: &User, changes: SourceData) -> DocumentResult<DocumentHandle> {
        deprecated("update_entity", "update_documents");
        let updated = self
            .update_documents(user, vec![changes], &ModificationOptions::default())
            .await?;
        first(updated, "update_entity")
    }

    async fn delete_entity(&self, user: &User, id: &str) -> DocumentResult<DocumentId> {
        deprecated("delete_entity", "delete_documents");
        let deleted = self
            .delete_documents(user, vec![id.to_string()], &ModificationOptions::default())
            .await?;
        first(deleted, "delete_entity")
    }
}

#[async_trait]
pub trait LegacyEmbeddedApi {
    async fn create_embedded_entity(
        &self,
        user: &User,
        parent_id: &str,
        embedded_name: &str,
        data: Vec<SourceData>,
    ) -> DocumentResult<Vec<DocumentId>>;

    async fn update_embedded_entity(
        &self,
        user: &User,
        parent_id: &str,
        embedded_name: &str,
        updates: Vec<SourceData>,
    ) -> DocumentResult<Vec<DocumentId>>;

    async fn delete_embedded_entity(
        &self,
        user: &User,
        parent_id: &str,
        embedded_name: &str,
        ids: Vec<DocumentId>,
    ) -> DocumentResult<Vec<DocumentId>>;
}

#[async_trait]
impl LegacyEmbeddedApi for DocumentCollection {
    async fn create_embedded_entity(
        &self,
        user: &User,
        parent_id: &str,
        embedded_name: &str,
        data: Vec<SourceData>,
    ) -> DocumentResult<Vec<DocumentId>> {
        deprecated("create_embedded_entity", "create_embedded_documents");
        self.create_embedded_documents(user, parent_id, embedded_name, data, &ModificationOptions::default())
            .await
    }

    async fn update_embedded_entity(
        &self,
        user: &User,
        parent_id: &str,
        embedded_name: &str,
        updates: Vec<SourceData>,
    ) -> DocumentResult<Vec<DocumentId>> {
        deprecated("update_embedded_entity", "update_embedded_documents");
        self.update_embedded_documents(user, parent_id, embedded_name, updates, &ModificationOptions::default())
            .await
    }

    async fn delete_embedded_entity(
        &self,
        user: &User,
        parent_id: &str,
        embedded_name: &str,
        ids: Vec<DocumentId>,
    ) -> DocumentResult<Vec<DocumentId>> {
        deprecated("delete_embedded_entity", "delete_embedded_documents");
        self.delete_embedded_documents(user, parent_id, embedded_name, ids, &ModificationOptions::default())
            .await
    }
}
