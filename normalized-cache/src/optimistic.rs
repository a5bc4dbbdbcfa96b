//! Optimistic overlay layers.
//!
//! Each layer is a self-contained `Storage` produced by normalizing an
//! optimistic payload, plus the dependency keys it covers. Layers never touch
//! base storage; reads go through a merged view that applies every layer's
//! cells over the base, shallowly per field, in push order. The view is
//! rebuilt lazily after any layer change or base write.

use indexmap::IndexMap;
use indexmap::IndexSet;

use crate::keys::DependencyKey;
use crate::storage::Storage;

pub(crate) struct OptimisticLayer {
    pub(crate) storage: Storage,
    pub(crate) dependencies: IndexSet<DependencyKey>,
}

#[derive(Default)]
pub(crate) struct OptimisticStack {
    layers: IndexMap<String, OptimisticLayer>,
    merged: Option<Storage>,
}

impl OptimisticStack {
    pub(crate) fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Pushes a layer under `key`. Re-pushing an existing key replaces the
    /// layer and moves it to the top of the stack.
    pub(crate) fn push(&mut self, key: String, layer: OptimisticLayer) {
        self.layers.shift_remove(&key);
        self.layers.insert(key, layer);
        self.merged = None;
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<OptimisticLayer> {
        let removed = self.layers.shift_remove(key);
        if removed.is_some() {
            self.merged = None;
        }
        removed
    }

    /// Drops the cached merged view; the next read rebuilds it.
    pub(crate) fn invalidate_view(&mut self) {
        self.merged = None;
    }

    /// The base storage with every layer applied on top. Rebuilt only when
    /// the cached view was invalidated.
    pub(crate) fn merged_view<'a>(&'a mut self, base: &'a Storage) -> &'a Storage {
        if self.merged.is_none() {
            let mut view = base.clone();
            for layer in self.layers.values() {
                for (storage_key, fields) in layer.storage.buckets() {
                    let bucket = view.bucket_mut(storage_key);
                    for (field_key, value) in fields {
                        bucket.insert(field_key.clone(), value.clone());
                    }
                }
            }
            self.merged = Some(view);
        }
        self.merged.as_ref().unwrap_or(base)
    }

    pub(crate) fn clear(&mut self) {
        self.layers.clear();
        self.merged = None;
    }
}
