//! The subscription registry: a secondary index from dependency keys to
//! listeners.
//!
//! The registry never looks at storage. Each subscription remembers the
//! artifact (and variables or fragment refs) it was registered with, so the
//! cache can replay denormalization after a fan-out and refresh the
//! subscription's dependency set — the index stays reconstructible from its
//! sources at all times.

use std::sync::Arc;

use indexmap::IndexMap;
use indexmap::IndexSet;

use crate::artifact::Artifact;
use crate::artifact::Variables;
use crate::keys::DependencyKey;
use crate::keys::StorageKey;

/// Handle returned by `subscribe_*`; pass back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub(crate) type Listener = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Clone)]
pub(crate) enum SubscriptionSource {
    Query {
        artifact: Arc<Artifact>,
        variables: Variables,
    },
    Fragments {
        artifact: Arc<Artifact>,
        keys: Vec<StorageKey>,
    },
}

struct Subscription {
    listener: Listener,
    source: SubscriptionSource,
    dependencies: IndexSet<DependencyKey>,
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    next_id: u64,
    subscriptions: IndexMap<SubscriptionId, Subscription>,
    by_dependency: IndexMap<DependencyKey, IndexSet<SubscriptionId>>,
}

impl SubscriptionRegistry {
    pub(crate) fn subscribe(
        &mut self,
        source: SubscriptionSource,
        dependencies: IndexSet<DependencyKey>,
        listener: Listener,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        for dependency in &dependencies {
            self.by_dependency
                .entry(dependency.clone())
                .or_default()
                .insert(id);
        }
        self.subscriptions.insert(
            id,
            Subscription {
                listener,
                source,
                dependencies,
            },
        );
        id
    }

    /// Idempotent; prunes dependency sets that become empty.
    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) {
        if let Some(subscription) = self.subscriptions.shift_remove(&id) {
            for dependency in &subscription.dependencies {
                self.detach(dependency, id);
            }
        }
    }

    /// Replaces a subscription's dependency set, keeping the index in sync.
    pub(crate) fn retarget(&mut self, id: SubscriptionId, dependencies: IndexSet<DependencyKey>) {
        let Some(subscription) = self.subscriptions.get_mut(&id) else {
            return;
        };
        let previous = std::mem::replace(&mut subscription.dependencies, dependencies.clone());
        for dependency in previous.difference(&dependencies) {
            self.detach(dependency, id);
        }
        for dependency in dependencies {
            self.by_dependency.entry(dependency).or_default().insert(id);
        }
    }

    fn detach(&mut self, dependency: &DependencyKey, id: SubscriptionId) {
        if let Some(set) = self.by_dependency.get_mut(dependency) {
            set.shift_remove(&id);
            if set.is_empty() {
                self.by_dependency.shift_remove(dependency);
            }
        }
    }

    /// The union of subscriptions under the given dependency keys, in
    /// insertion order.
    pub(crate) fn affected_by<'d>(
        &self,
        changed: impl IntoIterator<Item = &'d DependencyKey>,
    ) -> IndexSet<SubscriptionId> {
        let mut affected = IndexSet::new();
        for dependency in changed {
            if let Some(set) = self.by_dependency.get(dependency) {
                affected.extend(set.iter().copied());
            }
        }
        affected
    }

    /// Subscriptions depending on any cell of `storage_key`'s bucket.
    pub(crate) fn affected_under(&self, storage_key: &StorageKey) -> IndexSet<SubscriptionId> {
        let mut affected = IndexSet::new();
        for (dependency, set) in &self.by_dependency {
            if dependency.is_under(storage_key) {
                affected.extend(set.iter().copied());
            }
        }
        affected
    }

    pub(crate) fn source(&self, id: SubscriptionId) -> Option<&SubscriptionSource> {
        self.subscriptions.get(&id).map(|s| &s.source)
    }

    pub(crate) fn listener(&self, id: SubscriptionId) -> Option<Listener> {
        self.subscriptions.get(&id).map(|s| Arc::clone(&s.listener))
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub(crate) fn clear(&mut self) {
        self.subscriptions.clear();
        self.by_dependency.clear();
    }
}
