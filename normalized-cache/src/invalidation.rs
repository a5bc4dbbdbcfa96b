//! Stale tracking.
//!
//! Invalidation marks cells suspect without deleting them: reads keep
//! returning the memoized data but surface `stale: true` until a covering
//! write lands. Marks exist at two granularities — a whole bucket, or a
//! single cell.

use indexmap::IndexSet;
use serde_json_bytes::Value as JSON;

use crate::artifact::TYPENAME_FIELD;
use crate::keys::DependencyKey;
use crate::keys::EntityKey;
use crate::keys::FieldKey;
use crate::keys::StorageKey;
use crate::schema::SchemaMeta;

#[derive(Debug, Default, Clone)]
pub(crate) struct StaleSet {
    buckets: IndexSet<StorageKey>,
    cells: IndexSet<DependencyKey>,
}

impl StaleSet {
    pub(crate) fn mark_bucket(&mut self, key: StorageKey) {
        self.buckets.insert(key);
    }

    pub(crate) fn mark_cell(&mut self, dependency: DependencyKey) {
        self.cells.insert(dependency);
    }

    pub(crate) fn clear_cell(&mut self, dependency: &DependencyKey) {
        self.cells.shift_remove(dependency);
    }

    pub(crate) fn clear_bucket(&mut self, key: &StorageKey) {
        self.buckets.shift_remove(key);
    }

    pub(crate) fn is_stale(&self, storage_key: &StorageKey, dependency: &DependencyKey) -> bool {
        self.buckets.contains(storage_key) || self.cells.contains(dependency)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buckets.is_empty() && self.cells.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.buckets.clear();
        self.cells.clear();
    }
}

/// A parsed invalidation target.
///
/// Targets arrive as plain JSON objects:
///
/// ```json
/// { "__typename": "Query", "field": "user", "args": {"id": "1"} }
/// { "__typename": "User", "id": "1" }
/// { "__typename": "User", "id": "1", "field": "name" }
/// { "__typename": "User" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InvalidateTarget {
    /// A whole bucket: the root bucket or one entity.
    Bucket(StorageKey),
    /// One cell of a bucket.
    Cell(StorageKey, FieldKey),
    /// Every bucket of a typename.
    Type(String),
}

impl InvalidateTarget {
    pub(crate) fn parse(schema: &SchemaMeta, target: &JSON) -> Option<Self> {
        let object = target.as_object()?;
        let typename = object.get(TYPENAME_FIELD)?.as_str()?;

        let storage_key = if typename == "Query" {
            StorageKey::root()
        } else {
            let meta = schema.entity_meta(typename)?;
            let values: Vec<&JSON> = meta
                .key_fields
                .iter()
                .filter_map(|field| object.get(field.as_str()))
                .collect();
            // No key fields at all: the target addresses the whole type. A
            // subset of the key fields addresses nothing; it never widens to
            // the whole type.
            if values.is_empty() {
                return Some(Self::Type(typename.to_string()));
            }
            if values.len() < meta.key_fields.len() {
                return None;
            }
            EntityKey::new(typename, &values).into()
        };

        match object.get("field").and_then(JSON::as_str) {
            Some(field) => Some(Self::Cell(
                storage_key,
                FieldKey::from_literal_args(field, object.get("args")),
            )),
            None => Some(Self::Bucket(storage_key)),
        }
    }
}
