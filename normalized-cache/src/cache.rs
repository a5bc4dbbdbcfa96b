//! The cache facade.
//!
//! Owns every piece of state — base storage, subscriptions, memo table, stale
//! set, optimistic stack — and composes the traversal engines into the public
//! operations. All operations are synchronous and take `&mut self`: the
//! mutable receiver *is* the write barrier. Hosts with multiple threads wrap
//! the cache in a single lock; there is no finer-grained locking to reason
//! about.

use std::sync::Arc;

use indexmap::IndexMap;
use indexmap::IndexSet;
use serde_json_bytes::Value as JSON;

use crate::artifact::Artifact;
use crate::artifact::Variables;
use crate::denormalize::Denormalizer;
use crate::denormalize::FRAGMENT_REF_KEY;
use crate::error::CacheError;
use crate::invalidation::InvalidateTarget;
use crate::invalidation::StaleSet;
use crate::keys::canonical_variables;
use crate::keys::DependencyKey;
use crate::keys::MemoKey;
use crate::keys::StorageKey;
use crate::normalize::Normalizer;
use crate::optimistic::OptimisticLayer;
use crate::optimistic::OptimisticStack;
use crate::schema::SchemaMeta;
use crate::shared::replace_equal_deep;
use crate::snapshot::Snapshot;
use crate::storage::merge_fields;
use crate::storage::Storage;
use crate::subscriptions::Listener;
use crate::subscriptions::SubscriptionId;
use crate::subscriptions::SubscriptionRegistry;
use crate::subscriptions::SubscriptionSource;

/// The outcome of a read.
///
/// A partial read — any required cell absent — is `data: None, stale: false`,
/// never an error. `stale` is true when any cell the read touched carries a
/// stale mark; the data itself is still the memoized value.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub data: Option<Arc<JSON>>,
    pub stale: bool,
}

impl ReadResult {
    fn partial() -> Self {
        Self {
            data: None,
            stale: false,
        }
    }
}

pub struct Cache {
    schema: SchemaMeta,
    storage: Storage,
    subscriptions: SubscriptionRegistry,
    memo: IndexMap<MemoKey, Arc<JSON>>,
    stale: StaleSet,
    optimistic: OptimisticStack,
}

impl Cache {
    pub fn new(schema: SchemaMeta) -> Self {
        Self {
            schema,
            storage: Storage::new(),
            subscriptions: SubscriptionRegistry::default(),
            memo: IndexMap::new(),
            stale: StaleSet::default(),
            optimistic: OptimisticStack::default(),
        }
    }

    /// Normalizes a response payload into base storage, clears stale marks on
    /// every visited cell and bucket, and fans out to the subscriptions whose
    /// dependencies actually changed.
    pub fn write_query(&mut self, artifact: &Artifact, variables: &Variables, data: &JSON) {
        let mut normalizer = Normalizer::new(&self.schema, variables);
        normalizer.write_root(&mut self.storage, &artifact.selections, data);
        for dependency in &normalizer.touched {
            self.stale.clear_cell(dependency);
        }
        for bucket in &normalizer.visited {
            self.stale.clear_bucket(bucket);
        }
        self.optimistic.invalidate_view();
        tracing::debug!(
            artifact = %artifact.name,
            cells = normalizer.touched.len(),
            changed = normalizer.changed.len(),
            "write_query"
        );
        let affected = self.subscriptions.affected_by(&normalizer.changed);
        self.notify(affected);
    }

    /// Denormalizes over the merged view (base plus optimistic layers) and
    /// memoizes the result with structural sharing: an unchanged result is
    /// the same `Arc` as the previous read.
    pub fn read_query(&mut self, artifact: &Artifact, variables: &Variables) -> ReadResult {
        let memo_key = MemoKey::new(artifact.kind, &artifact.name, &canonical_variables(variables));
        let (object, partial, stale) = {
            let storage = view(&mut self.optimistic, &self.storage);
            let mut denormalizer = Denormalizer::new(storage, variables, &self.stale);
            let object = denormalizer.read_root(&artifact.selections);
            (object, denormalizer.partial, denormalizer.stale_hit)
        };
        if partial {
            return ReadResult::partial();
        }
        let data = self.memoize(memo_key, JSON::Object(object));
        ReadResult {
            data: Some(data),
            stale,
        }
    }

    /// Reads a fragment rooted at the entity a `{"__fragmentRef": key}` value
    /// points to.
    pub fn read_fragment(&mut self, artifact: &Artifact, fragment_ref: &JSON) -> ReadResult {
        let Some(key) = fragment_ref_key(fragment_ref) else {
            return ReadResult::partial();
        };
        let memo_key = MemoKey::new(artifact.kind, &artifact.name, key.as_str());
        let variables = Variables::new();
        let (object, partial, stale) = {
            let storage = view(&mut self.optimistic, &self.storage);
            let mut denormalizer = Denormalizer::new(storage, &variables, &self.stale);
            let object = denormalizer.read_entity(&artifact.selections, &key);
            (object, denormalizer.partial, denormalizer.stale_hit)
        };
        let Some(object) = object else {
            return ReadResult::partial();
        };
        if partial {
            return ReadResult::partial();
        }
        let data = self.memoize(memo_key, JSON::Object(object));
        ReadResult {
            data: Some(data),
            stale,
        }
    }

    /// Batch fragment read. Partiality is collective: one missing fragment
    /// makes the whole read partial. The result memoizes under the
    /// comma-joined entity keys.
    pub fn read_fragments(&mut self, artifact: &Artifact, fragment_refs: &[JSON]) -> ReadResult {
        let mut keys = Vec::with_capacity(fragment_refs.len());
        for fragment_ref in fragment_refs {
            let Some(key) = fragment_ref_key(fragment_ref) else {
                return ReadResult::partial();
            };
            keys.push(key);
        }
        let id = keys
            .iter()
            .map(StorageKey::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let memo_key = MemoKey::new(artifact.kind, &artifact.name, &id);
        let variables = Variables::new();
        let (items, partial, stale) = {
            let storage = view(&mut self.optimistic, &self.storage);
            let mut denormalizer = Denormalizer::new(storage, &variables, &self.stale);
            let mut items = Vec::with_capacity(keys.len());
            for key in &keys {
                if let Some(object) = denormalizer.read_entity(&artifact.selections, key) {
                    items.push(JSON::Object(object));
                }
            }
            (items, denormalizer.partial, denormalizer.stale_hit)
        };
        if partial {
            return ReadResult::partial();
        }
        let data = self.memoize(memo_key, JSON::Array(items));
        ReadResult {
            data: Some(data),
            stale,
        }
    }

    /// Registers a listener for every cell the query depends on, established
    /// by a dry-run denormalization over the merged view. The listener fires
    /// whenever any such cell is changed by a write, invalidation, or
    /// optimistic layer change.
    pub fn subscribe_query(
        &mut self,
        artifact: Arc<Artifact>,
        variables: Variables,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> SubscriptionId {
        let source = SubscriptionSource::Query {
            artifact,
            variables,
        };
        self.subscribe(source, Arc::new(listener))
    }

    pub fn subscribe_fragment(
        &mut self,
        artifact: Arc<Artifact>,
        fragment_ref: JSON,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribe_fragments(artifact, vec![fragment_ref], listener)
    }

    pub fn subscribe_fragments(
        &mut self,
        artifact: Arc<Artifact>,
        fragment_refs: Vec<JSON>,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> SubscriptionId {
        let keys = fragment_refs
            .iter()
            .filter_map(fragment_ref_key)
            .collect::<Vec<_>>();
        let source = SubscriptionSource::Fragments {
            artifact,
            keys,
        };
        self.subscribe(source, Arc::new(listener))
    }

    fn subscribe(&mut self, source: SubscriptionSource, listener: Listener) -> SubscriptionId {
        let dependencies = self.collect_dependencies(&source);
        self.subscriptions.subscribe(source, dependencies, listener)
    }

    /// Idempotent.
    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscriptions.unsubscribe(id);
    }

    /// Marks the targeted cells or buckets stale — without deleting anything —
    /// and fires every subscription whose dependencies overlap the targets.
    /// Targets use the JSON wire shape; malformed targets are skipped.
    pub fn invalidate(&mut self, targets: &[JSON]) {
        let mut affected = IndexSet::new();
        for target in targets {
            let Some(target) = InvalidateTarget::parse(&self.schema, target) else {
                tracing::debug!("skipping malformed invalidate target");
                continue;
            };
            match target {
                InvalidateTarget::Bucket(key) => {
                    affected.extend(self.subscriptions.affected_under(&key));
                    tracing::debug!(bucket = %key, "invalidate");
                    self.stale.mark_bucket(key);
                }
                InvalidateTarget::Cell(key, field) => {
                    let dependency = DependencyKey::new(&key, &field);
                    affected.extend(
                        self.subscriptions
                            .affected_by(std::iter::once(&dependency)),
                    );
                    tracing::debug!(cell = %dependency, "invalidate");
                    self.stale.mark_cell(dependency);
                }
                InvalidateTarget::Type(typename) => {
                    let keys: Vec<StorageKey> =
                        self.storage.keys_of_type(&typename).cloned().collect();
                    tracing::debug!(typename = %typename, buckets = keys.len(), "invalidate");
                    for key in keys {
                        affected.extend(self.subscriptions.affected_under(&key));
                        self.stale.mark_bucket(key);
                    }
                }
            }
        }
        self.notify(affected);
    }

    /// Normalizes `data` into a fresh overlay layer named `key`, leaving base
    /// storage untouched, and fans out to every subscription the layer's
    /// cells cover.
    pub fn write_optimistic(
        &mut self,
        key: impl Into<String>,
        artifact: &Artifact,
        variables: &Variables,
        data: &JSON,
    ) {
        let key = key.into();
        let mut storage = Storage::new();
        let mut normalizer = Normalizer::new(&self.schema, variables);
        normalizer.write_root(&mut storage, &artifact.selections, data);
        let dependencies = normalizer.touched;
        tracing::debug!(layer = %key, cells = dependencies.len(), "write_optimistic");
        let affected = self.subscriptions.affected_by(&dependencies);
        self.optimistic.push(
            key,
            OptimisticLayer {
                storage,
                dependencies,
            },
        );
        self.notify(affected);
    }

    /// Removes the named layer and fans out over the dependency set it
    /// produced at write time.
    pub fn remove_optimistic(&mut self, key: &str) {
        let Some(layer) = self.optimistic.remove(key) else {
            return;
        };
        tracing::debug!(layer = %key, "remove_optimistic");
        let affected = self.subscriptions.affected_by(&layer.dependencies);
        self.notify(affected);
    }

    /// Serializable extract of base storage and the memo table. Optimistic
    /// layers, subscriptions, and stale marks are excluded.
    pub fn extract(&self) -> Snapshot {
        Snapshot {
            storage: self.storage.clone(),
            memo: self.memo.clone(),
        }
    }

    /// Merges a snapshot's buckets into the current storage and adopts its
    /// memo entries.
    pub fn hydrate(&mut self, snapshot: Snapshot) {
        for (key, fields) in snapshot.storage.into_buckets() {
            merge_fields(self.storage.bucket_mut(&key), fields);
        }
        self.memo.extend(snapshot.memo);
        self.optimistic.invalidate_view();
    }

    pub fn hydrate_json(&mut self, text: &str) -> Result<(), CacheError> {
        let snapshot = Snapshot::from_json(text)?;
        self.hydrate(snapshot);
        Ok(())
    }

    /// Empties storage, subscriptions, memo, stale set, and optimistic stack.
    pub fn clear(&mut self) {
        self.storage = Storage::new();
        self.subscriptions.clear();
        self.memo.clear();
        self.stale.clear();
        self.optimistic.clear();
    }

    /// Read-only view of base storage, for devtools and tests.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn memoize(&mut self, key: MemoKey, next: JSON) -> Arc<JSON> {
        if let Some(previous) = self.memo.get(&key) {
            if **previous == next {
                return Arc::clone(previous);
            }
            let shared = Arc::new(replace_equal_deep(previous, next));
            self.memo.insert(key, Arc::clone(&shared));
            shared
        } else {
            let shared = Arc::new(next);
            self.memo.insert(key, Arc::clone(&shared));
            shared
        }
    }

    /// Invokes each affected listener exactly once, in registration order,
    /// refreshing its dependency set first by replaying denormalization over
    /// the current view. A panicking listener is caught and discarded; the
    /// remaining listeners still run.
    fn notify(&mut self, affected: IndexSet<SubscriptionId>) {
        for id in affected {
            let Some(source) = self.subscriptions.source(id).cloned() else {
                continue;
            };
            let dependencies = self.collect_dependencies(&source);
            self.subscriptions.retarget(id, dependencies);
            if let Some(listener) = self.subscriptions.listener(id) {
                let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener()));
            }
        }
    }

    fn collect_dependencies(&mut self, source: &SubscriptionSource) -> IndexSet<DependencyKey> {
        let storage = view(&mut self.optimistic, &self.storage);
        match source {
            SubscriptionSource::Query {
                artifact,
                variables,
            } => {
                let mut denormalizer = Denormalizer::new(storage, variables, &self.stale);
                denormalizer.read_root(&artifact.selections);
                denormalizer.dependencies
            }
            SubscriptionSource::Fragments { artifact, keys } => {
                let variables = Variables::new();
                let mut denormalizer = Denormalizer::new(storage, &variables, &self.stale);
                for key in keys {
                    denormalizer.read_entity(&artifact.selections, key);
                }
                denormalizer.dependencies
            }
        }
    }
}

/// The storage reads go through: base when no layers exist, otherwise the
/// lazily rebuilt merged view.
fn view<'a>(optimistic: &'a mut OptimisticStack, base: &'a Storage) -> &'a Storage {
    if optimistic.is_empty() {
        base
    } else {
        optimistic.merged_view(base)
    }
}

fn fragment_ref_key(value: &JSON) -> Option<StorageKey> {
    let key = value.as_object()?.get(FRAGMENT_REF_KEY)?.as_str()?;
    Some(StorageKey::from_raw(key))
}
