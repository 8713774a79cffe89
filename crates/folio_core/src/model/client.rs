//! The `ClientDocument` capability: per-type behaviour composed into the
//! generic document machinery.
//!
//! Concrete document types implement this trait and register it through
//! [`DocumentType`](crate::model::registry::DocumentType). Every method has a
//! no-op default, so a type only overrides the phases it cares about. The
//! preparation phase order itself is fixed by the pipeline and cannot be
//! changed from here.

use crate::backend::ModificationOptions;
use crate::model::document::Document;
use crate::model::error::DocumentResult;
use crate::model::source::{DerivedData, DocumentId, SourceData};
use crate::pipeline::DerivedContext;

/// Arguments shared by every embedded pre/post hook of one batch.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub embedded_name: &'a str,
    pub options: &'a ModificationOptions,
    pub user_id: &'a str,
}

pub trait ClientDocument: Send + Sync {
    /// Shape checks run at the start of the base phase. Returning an error
    /// aborts the pass and blocks persistence.
    fn validate_source(&self, _source: &SourceData) -> Result<(), String> {
        Ok(())
    }

    /// Adds computation to the base phase. `base` starts as a copy of the
    /// document's own source; no other document is visible here.
    fn prepare_base_data(&self, _base: &mut DerivedData) {}

    /// Adds computation to the derived phase, after every embedded child
    /// has been prepared.
    fn prepare_derived_data(&self, _context: &mut DerivedContext<'_>) -> Result<(), String> {
        Ok(())
    }

    fn on_create(&self, _document: &Document, _options: &ModificationOptions, _user_id: &str) {}

    fn on_update(
        &self,
        _document: &Document,
        _changes: &SourceData,
        _options: &ModificationOptions,
        _user_id: &str,
    ) {
    }

    fn on_delete(&self, _document: &Document, _options: &ModificationOptions, _user_id: &str) {}

    /// Runs before any child exists. Removing entries vetoes them; leaving
    /// the array empty vetoes the batch.
    fn pre_create_embedded(
        &self,
        _parent: &Document,
        _proposed: &mut Vec<SourceData>,
        _context: &HookContext<'_>,
    ) -> DocumentResult<()> {
        Ok(())
    }

    /// Runs once the children are attached and the parent is re-prepared.
    fn on_create_embedded(
        &self,
        _parent: &Document,
        _created: &[&Document],
        _result: &[SourceData],
        _context: &HookContext<'_>,
    ) {
    }

    fn pre_update_embedded(
        &self,
        _parent: &Document,
        _changes: &mut Vec<SourceData>,
        _context: &HookContext<'_>,
    ) -> DocumentResult<()> {
        Ok(())
    }

    fn on_update_embedded(
        &self,
        _parent: &Document,
        _updated: &[&Document],
        _result: &[SourceData],
        _context: &HookContext<'_>,
    ) {
    }

    fn pre_delete_embedded(
        &self,
        _parent: &Document,
        _ids: &mut Vec<DocumentId>,
        _context: &HookContext<'_>,
    ) -> DocumentResult<()> {
        Ok(())
    }

    /// `deleted` holds the detached children; their parent key is cleared.
    fn on_delete_embedded(
        &self,
        _parent: &Document,
        _deleted: &[Document],
        _result: &[DocumentId],
        _context: &HookContext<'_>,
    ) {
    }
}

/// Document type with no behaviour beyond the generic pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicDocument;

impl ClientDocument for BasicDocument {}
