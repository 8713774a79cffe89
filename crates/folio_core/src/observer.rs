//! Render observers registered against documents and collections.
//!
//! Observers are held weakly: registering never keeps a view alive, and a
//! dropped view silently falls out of the set on the next notification.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

pub type ObserverId = String;

/// Anything that re-renders when the document it watches changes.
///
/// `render` must not start another mutating operation synchronously.
pub trait Observer: Send + Sync {
    fn render(&self, force: bool);
}

#[derive(Default)]
pub struct ObserverSet {
    entries: BTreeMap<ObserverId, Weak<dyn Observer>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `observer` under `id`, replacing any previous entry.
    pub fn register(&mut self, id: impl Into<ObserverId>, observer: &Arc<dyn Observer>) {
        self.entries.insert(id.into(), Arc::downgrade(observer));
    }

    pub fn unregister(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Upgrades live observers, dropping entries whose view is gone.
    pub fn live(&mut self) -> Vec<Arc<dyn Observer>> {
        let mut live = Vec::with_capacity(self.entries.len());
        self.entries.retain(|_, weak| match weak.upgrade() {
            Some(observer) => {
                live.push(observer);
                true
            }
            None => false,
        });
        live
    }
}

impl std::fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// Renders every observer in `observers`.
///
/// Callers collect observers first and release document locks before
/// calling this, so a view may read the document it renders.
pub fn notify(observers: &[Arc<dyn Observer>], force: bool) {
    for observer in observers {
        observer.render(force);
    }
}
