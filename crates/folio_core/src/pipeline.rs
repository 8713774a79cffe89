//! Data preparation pipeline.
//!
//! # Responsibility
//! - Recompute a document's derived state from its source in three fixed
//!   phases: base, embedded, derived.
//!
//! # Invariants
//! - Phase order is fixed; document types only add work inside a phase.
//! - A pass is computed completely before anything is published. A failure
//!   anywhere in the tree leaves every previous derived state untouched.
//! - Given unchanged source and ancestor state the output is identical.

use crate::model::document::Document;
use crate::model::error::{DocumentError, DocumentResult};
use crate::model::registry::DocumentTypeRegistry;
use crate::model::source::{is_stored_id, source_id, DerivedData};
use log::{debug, warn};
use std::collections::BTreeMap;

/// Derived state of one document and its prepared children, not yet published.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedTree {
    derived: DerivedData,
    embedded: BTreeMap<String, Vec<PreparedTree>>,
}

impl PreparedTree {
    pub fn derived(&self) -> &DerivedData {
        &self.derived
    }

    pub fn embedded(&self, key: &str) -> &[PreparedTree] {
        self.embedded.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// View handed to `ClientDocument::prepare_derived_data`.
pub struct DerivedContext<'a> {
    pub document: &'a Document,
    /// This document's data after the base phase; edit it in place.
    pub derived: &'a mut DerivedData,
    /// Prepared children, per embedded key, in child order.
    pub embedded: &'a BTreeMap<String, Vec<PreparedTree>>,
    /// Ancestor data already prepared by the base phase, nearest first.
    pub ancestors: &'a [&'a DerivedData],
}

impl DerivedContext<'_> {
    pub fn children(&self, key: &str) -> impl Iterator<Item = &DerivedData> {
        self.embedded
            .get(key)
            .into_iter()
            .flatten()
            .map(PreparedTree::derived)
    }
}

pub struct DataPreparationPipeline<'r> {
    types: &'r DocumentTypeRegistry,
}

impl<'r> DataPreparationPipeline<'r> {
    pub fn new(types: &'r DocumentTypeRegistry) -> Self {
        Self { types }
    }

    /// Runs a full pass and publishes the result on success.
    pub fn prepare(&self, document: &mut Document, ancestors: &[&DerivedData]) -> DocumentResult<()> {
        let prepared = self.compute(document, ancestors).map_err(|err| {
            warn!(
                "event=prepare module=pipeline status=error document={} id={} error_code={} error={}",
                document.document_name(),
                document.id(),
                err.code(),
                err
            );
            err
        })?;
        publish(document, prepared);
        debug!(
            "event=prepare module=pipeline status=ok document={} id={}",
            document.document_name(),
            document.id()
        );
        Ok(())
    }

    /// Computes a pass without publishing it. Used to validate proposed data
    /// before it is persisted.
    pub fn compute(&self, document: &Document, ancestors: &[&DerivedData]) -> DocumentResult<PreparedTree> {
        let document_type = self.types.require(document.document_name())?;
        let behavior = document_type.behavior();

        // Base phase: own source only.
        match source_id(document.source()) {
            Some(id) if is_stored_id(id) => {}
            _ => {
                return Err(DocumentError::validation(
                    document.document_name(),
                    "source `_id` is missing or malformed",
                ))
            }
        }
        behavior
            .validate_source(document.source())
            .map_err(|message| DocumentError::validation(document.document_name(), message))?;
        let mut derived = document.source().clone();
        behavior.prepare_base_data(&mut derived);

        // Embedded phase: children see this document's base data as ancestor.
        let mut embedded = BTreeMap::new();
        {
            let mut lineage: Vec<&DerivedData> = Vec::with_capacity(ancestors.len() + 1);
            lineage.push(&derived);
            lineage.extend_from_slice(ancestors);
            for (key, children) in document.embedded_collections() {
                let prepared = children
                    .iter()
                    .map(|child| self.compute(child, &lineage))
                    .collect::<DocumentResult<Vec<_>>>()?;
                embedded.insert(key.to_string(), prepared);
            }
        }

        // Derived phase.
        let mut context = DerivedContext {
            document,
            derived: &mut derived,
            embedded: &embedded,
            ancestors,
        };
        behavior
            .prepare_derived_data(&mut context)
            .map_err(|message| DocumentError::validation(document.document_name(), message))?;

        Ok(PreparedTree { derived, embedded })
    }
}

fn publish(document: &mut Document, prepared: PreparedTree) {
    let PreparedTree {
        derived,
        mut embedded,
    } = prepared;
    document.set_derived(derived);
    for (key, children) in document.embedded_collections_mut() {
        let Some(trees) = embedded.remove(key) else {
            continue;
        };
        for (child, tree) in children.iter_mut().zip(trees) {
            publish(child, tree);
        }
    }
}
