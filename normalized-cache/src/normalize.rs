//! Response normalization: selection-driven decomposition of a payload into
//! the flat store.
//!
//! The walk is keyed by `(selections, value)`. Objects whose typename has
//! declared key fields — all present in the payload — are promoted into their
//! own bucket and replaced by a link in the parent; anything else stays
//! inline. Cell-level bookkeeping (which cells were visited, which changed)
//! happens only at bucket boundaries, which is what keeps reactivity granular
//! at the entity/root level rather than inside value objects.

use indexmap::IndexSet;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
use serde_json_bytes::Value as JSON;

use crate::artifact::find_response_key;
use crate::artifact::Selection;
use crate::artifact::Variables;
use crate::artifact::TYPENAME_FIELD;
use crate::keys::DependencyKey;
use crate::keys::EntityKey;
use crate::keys::FieldKey;
use crate::keys::StorageKey;
use crate::schema::SchemaMeta;
use crate::storage::merge_fields;
use crate::storage::merge_stored;
use crate::storage::Fields;
use crate::storage::Storage;
use crate::storage::StoredValue;

pub(crate) struct Normalizer<'a> {
    schema: &'a SchemaMeta,
    variables: &'a Variables,
    /// Every bucket-level cell visited by the walk, changed or not.
    pub(crate) touched: IndexSet<DependencyKey>,
    /// Cells whose post-merge value differs from what the bucket held before.
    pub(crate) changed: IndexSet<DependencyKey>,
    /// Buckets that received at least one cell.
    pub(crate) visited: IndexSet<StorageKey>,
}

impl<'a> Normalizer<'a> {
    pub(crate) fn new(schema: &'a SchemaMeta, variables: &'a Variables) -> Self {
        Self {
            schema,
            variables,
            touched: IndexSet::new(),
            changed: IndexSet::new(),
            visited: IndexSet::new(),
        }
    }

    /// Normalizes a root payload into the root bucket, promoting entities
    /// along the way.
    pub(crate) fn write_root(
        &mut self,
        storage: &mut Storage,
        selections: &[Selection],
        data: &JSON,
    ) {
        let Some(object) = data.as_object() else {
            return;
        };
        let fields = self.collect_fields(storage, selections, object);
        self.merge_into_bucket(storage, StorageKey::root(), fields);
    }

    /// Collects the cells this selection set produces from `object`. Nested
    /// entities are promoted (written through to `storage`) as they are
    /// encountered; the returned map holds what belongs to the *current*
    /// object, whoever that turns out to be.
    fn collect_fields(
        &mut self,
        storage: &mut Storage,
        selections: &[Selection],
        object: &Map<ByteString, JSON>,
    ) -> Fields {
        let mut fields = Fields::default();
        for selection in selections {
            match selection {
                Selection::Field(field) => {
                    let Some(value) = object.get(field.response_key()) else {
                        continue;
                    };
                    let stored = self.store_value(storage, field.selections.as_deref(), value);
                    let key = FieldKey::new(field, self.variables);
                    let merged = merge_stored(fields.get(&key), stored);
                    fields.insert(key, merged);
                }
                Selection::FragmentSpread(spread) => {
                    let nested = self.collect_fields(storage, &spread.selections, object);
                    merge_fields(&mut fields, nested);
                }
                Selection::InlineFragment(fragment) => {
                    if typename_of(object, selections) == Some(fragment.on.as_str()) {
                        let nested = self.collect_fields(storage, &fragment.selections, object);
                        merge_fields(&mut fields, nested);
                    }
                }
            }
        }
        fields
    }

    fn store_value(
        &mut self,
        storage: &mut Storage,
        selections: Option<&[Selection]>,
        value: &JSON,
    ) -> StoredValue {
        match (value, selections) {
            (JSON::Array(items), _) => StoredValue::List(
                items
                    .iter()
                    .map(|item| self.store_value(storage, selections, item))
                    .collect(),
            ),
            (JSON::Object(object), Some(selections)) => {
                if let Some(entity_key) = self.entity_key_of(object, selections) {
                    let fields = self.collect_fields(storage, selections, object);
                    self.merge_into_bucket(storage, StorageKey::from(entity_key.clone()), fields);
                    StoredValue::Link(entity_key)
                } else {
                    StoredValue::Object(self.collect_fields(storage, selections, object))
                }
            }
            (value, _) => StoredValue::Scalar(value.clone()),
        }
    }

    /// The object's entity key, if its typename is an entity and every key
    /// field is present in the payload. Key fields selected under an alias
    /// are read from their response key. An incomplete key degrades to inline
    /// storage — the caller stores the object in place, with no promotion.
    fn entity_key_of(
        &self,
        object: &Map<ByteString, JSON>,
        selections: &[Selection],
    ) -> Option<EntityKey> {
        let typename = typename_of(object, selections)?;
        let meta = self.schema.entity_meta(typename)?;
        let mut values = Vec::with_capacity(meta.key_fields.len());
        for field in &meta.key_fields {
            let key = find_response_key(selections, field).unwrap_or(field.as_str());
            values.push(object.get(key)?);
        }
        Some(EntityKey::new(typename, &values))
    }

    fn merge_into_bucket(&mut self, storage: &mut Storage, key: StorageKey, incoming: Fields) {
        self.visited.insert(key.clone());
        let bucket = storage.bucket_mut(&key);
        for (field, value) in incoming {
            let dependency = DependencyKey::new(&key, &field);
            let merged = merge_stored(bucket.get(&field), value);
            if bucket.get(&field) != Some(&merged) {
                self.changed.insert(dependency.clone());
            }
            self.touched.insert(dependency);
            bucket.insert(field, merged);
        }
        tracing::trace!(bucket = %key, "normalized");
    }
}

fn typename_of<'a>(
    object: &'a Map<ByteString, JSON>,
    selections: &[Selection],
) -> Option<&'a str> {
    let key = find_response_key(selections, TYPENAME_FIELD).unwrap_or(TYPENAME_FIELD);
    object.get(key)?.as_str()
}
