//! Denormalization: re-materializing a response shape from the flat store.
//!
//! The mirror image of the normalize walk. Along the way it accumulates the
//! dependency key of every bucket-level cell the selection set needs —
//! including cells that are absent, so a subscription registered from this
//! walk fires when the cell appears — and a `partial` flag that poisons the
//! whole read when any required cell is missing.
//!
//! Fragment spreads on an entity are *masked*: the output carries
//! `{"__fragmentRef": key}` instead of the fragment's fields, and none of the
//! fragment's dependencies are reported. Those belong to whoever later reads
//! the fragment. Spreads at the root bucket (and inside inline value objects,
//! which have no entity identity to reference) descend unmasked.

use indexmap::IndexSet;
use itertools::EitherOrBoth;
use itertools::Itertools;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
use serde_json_bytes::Value as JSON;

use crate::artifact::Selection;
use crate::artifact::Variables;
use crate::invalidation::StaleSet;
use crate::keys::DependencyKey;
use crate::keys::FieldKey;
use crate::keys::StorageKey;
use crate::storage::Fields;
use crate::storage::Storage;
use crate::storage::StoredValue;

pub(crate) const FRAGMENT_REF_KEY: &str = "__fragmentRef";

pub(crate) struct Denormalizer<'a> {
    storage: &'a Storage,
    variables: &'a Variables,
    stale: &'a StaleSet,
    /// Every bucket-level cell this read needed, present or not.
    pub(crate) dependencies: IndexSet<DependencyKey>,
    /// True once any required cell was absent.
    pub(crate) partial: bool,
    /// True once any touched cell or bucket carried a stale mark.
    pub(crate) stale_hit: bool,
}

impl<'a> Denormalizer<'a> {
    pub(crate) fn new(storage: &'a Storage, variables: &'a Variables, stale: &'a StaleSet) -> Self {
        Self {
            storage,
            variables,
            stale,
            dependencies: IndexSet::new(),
            partial: false,
            stale_hit: false,
        }
    }

    pub(crate) fn read_root(&mut self, selections: &[Selection]) -> Map<ByteString, JSON> {
        let root = StorageKey::root();
        self.read_object(selections, Some(&root), self.storage.root())
    }

    /// Reads an entity bucket directly, as fragment-rooted reads do. An
    /// absent bucket registers a dependency on the entity's typename cell so
    /// the read re-fires when the entity appears.
    pub(crate) fn read_entity(
        &mut self,
        selections: &[Selection],
        key: &StorageKey,
    ) -> Option<Map<ByteString, JSON>> {
        match self.storage.bucket(key) {
            Some(bucket) => Some(self.read_object(selections, Some(key), bucket)),
            None => {
                self.touch(key, &FieldKey::typename());
                self.partial = true;
                None
            }
        }
    }

    fn touch(&mut self, storage_key: &StorageKey, field_key: &FieldKey) {
        let dependency = DependencyKey::new(storage_key, field_key);
        if self.stale.is_stale(storage_key, &dependency) {
            self.stale_hit = true;
        }
        self.dependencies.insert(dependency);
    }

    /// Reads one selection set against one field map. `at` is the bucket the
    /// fields live in, or `None` inside an inline value object — where no
    /// dependencies are reported and no masking applies.
    fn read_object(
        &mut self,
        selections: &[Selection],
        at: Option<&StorageKey>,
        fields: &Fields,
    ) -> Map<ByteString, JSON> {
        let mut output = Map::new();
        for selection in selections {
            match selection {
                Selection::Field(field) => {
                    let key = FieldKey::new(field, self.variables);
                    if let Some(storage_key) = at {
                        self.touch(storage_key, &key);
                    }
                    let Some(value) = fields.get(&key) else {
                        self.partial = true;
                        continue;
                    };
                    let rendered = self.render(value, field.selections.as_deref());
                    insert_merged(&mut output, field.response_key(), rendered);
                }
                Selection::FragmentSpread(spread) => match at {
                    Some(storage_key) if !storage_key.is_root() => {
                        output.insert(
                            FRAGMENT_REF_KEY,
                            JSON::String(storage_key.as_str().into()),
                        );
                    }
                    _ => {
                        let nested = self.read_object(&spread.selections, at, fields);
                        merge_into(&mut output, nested);
                    }
                },
                Selection::InlineFragment(fragment) => {
                    let key = FieldKey::typename();
                    if let Some(storage_key) = at {
                        self.touch(storage_key, &key);
                    }
                    let matches = matches!(
                        fields.get(&key),
                        Some(StoredValue::Scalar(JSON::String(name))) if name.as_str() == fragment.on
                    );
                    if matches {
                        let nested = self.read_object(&fragment.selections, at, fields);
                        merge_into(&mut output, nested);
                    }
                }
            }
        }
        output
    }

    fn render(&mut self, value: &StoredValue, selections: Option<&[Selection]>) -> JSON {
        match (value, selections) {
            (StoredValue::Scalar(value), _) => value.clone(),
            (StoredValue::List(items), _) => JSON::Array(
                items
                    .iter()
                    .map(|item| self.render(item, selections))
                    .collect(),
            ),
            (StoredValue::Link(key), Some(selections)) => {
                let storage_key = StorageKey::from(key.clone());
                match self.read_entity(selections, &storage_key) {
                    Some(object) => JSON::Object(object),
                    None => JSON::Null,
                }
            }
            (StoredValue::Object(fields), Some(selections)) => {
                JSON::Object(self.read_object(selections, None, fields))
            }
            // A composite cell without subselections has nothing to render.
            (StoredValue::Link(_), None) | (StoredValue::Object(_), None) => JSON::Null,
        }
    }
}

/// Inserts `value` under `key`, deep-merging when two selection branches
/// produce the same response key (e.g. two root fragments both selecting the
/// same nested field with disjoint sub-fields).
fn insert_merged(output: &mut Map<ByteString, JSON>, key: &str, value: JSON) {
    let merged = match output.remove(key) {
        Some(existing) => merge_json(existing, value),
        None => value,
    };
    output.insert(key, merged);
}

fn merge_into(output: &mut Map<ByteString, JSON>, nested: Map<ByteString, JSON>) {
    for (key, value) in nested {
        let merged = match output.remove(key.as_str()) {
            Some(existing) => merge_json(existing, value),
            None => value,
        };
        output.insert(key, merged);
    }
}

fn merge_json(a: JSON, b: JSON) -> JSON {
    match (a, b) {
        (JSON::Object(a), JSON::Object(b)) => {
            let mut merged = a;
            for (key, value) in b {
                let combined = match merged.remove(key.as_str()) {
                    Some(existing) => merge_json(existing, value),
                    None => value,
                };
                merged.insert(key, combined);
            }
            JSON::Object(merged)
        }
        (JSON::Array(a), JSON::Array(b)) => JSON::Array(
            a.into_iter()
                .zip_longest(b)
                .map(|pair| match pair {
                    EitherOrBoth::Both(a, b) => merge_json(a, b),
                    EitherOrBoth::Left(a) => a,
                    EitherOrBoth::Right(b) => b,
                })
                .collect(),
        ),
        (_, b) => b,
    }
}
