//! The normalized store.
//!
//! Two nested maps: storage key → bucket, bucket → field key → value. The
//! root bucket (`__root`) always exists and holds root-level query fields;
//! every promoted entity gets a bucket of its own, and parents hold a link
//! (`{"__ref": key}`) where the entity appeared. Plain nested value objects
//! stay inline in their parent cell.
//!
//! Buckets are created on first write and are never removed by normal writes;
//! only `clear()` empties the store.

use std::sync::LazyLock;

use indexmap::IndexMap;
use serde::de::Deserializer;
use serde::ser::SerializeMap;
use serde::ser::Serializer;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value as JSON;

use crate::keys::EntityKey;
use crate::keys::FieldKey;
use crate::keys::StorageKey;

pub(crate) const REF_KEY: &str = "__ref";
/// Wire tag for inline composites, so an empty composite and an opaque empty
/// scalar object stay distinct through serialization.
pub(crate) const FIELDS_KEY: &str = "__fields";

pub type Fields = IndexMap<FieldKey, StoredValue>;

static EMPTY_FIELDS: LazyLock<Fields> = LazyLock::new(Fields::default);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Storage {
    buckets: IndexMap<StorageKey, Fields>,
}

impl Storage {
    pub fn new() -> Self {
        let mut buckets = IndexMap::new();
        buckets.insert(StorageKey::root(), Fields::default());
        Self { buckets }
    }

    pub fn bucket(&self, key: &StorageKey) -> Option<&Fields> {
        self.buckets.get(key)
    }

    pub(crate) fn bucket_mut(&mut self, key: &StorageKey) -> &mut Fields {
        self.buckets.entry(key.clone()).or_default()
    }

    pub(crate) fn root(&self) -> &Fields {
        self.buckets
            .get(&StorageKey::root())
            .unwrap_or(&EMPTY_FIELDS)
    }

    pub fn buckets(&self) -> impl Iterator<Item = (&StorageKey, &Fields)> {
        self.buckets.iter()
    }

    pub(crate) fn into_buckets(self) -> impl Iterator<Item = (StorageKey, Fields)> {
        self.buckets.into_iter()
    }

    /// Entity keys of every bucket belonging to `typename`.
    pub(crate) fn keys_of_type<'a>(
        &'a self,
        typename: &'a str,
    ) -> impl Iterator<Item = &'a StorageKey> + 'a {
        self.buckets
            .keys()
            .filter(move |key| key.has_typename(typename))
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

/// One cell of a bucket.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    /// A leaf value stored verbatim. Custom scalars may carry arbitrary JSON.
    Scalar(JSON),
    /// A reference to an entity bucket.
    Link(EntityKey),
    List(Vec<StoredValue>),
    /// An inline value object, keyed like a bucket but stored in place.
    Object(Fields),
}

impl StoredValue {
    pub fn as_scalar(&self) -> Option<&JSON> {
        match self {
            Self::Scalar(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&EntityKey> {
        match self {
            Self::Link(key) => Some(key),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[StoredValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_fields(&self) -> Option<&Fields> {
        match self {
            Self::Object(fields) => Some(fields),
            _ => None,
        }
    }

    fn from_snapshot_value(value: JSON) -> Self {
        match value {
            JSON::Array(items) => {
                Self::List(items.into_iter().map(Self::from_snapshot_value).collect())
            }
            JSON::Object(mut object) => {
                if object.len() == 1 {
                    if let Some(JSON::String(key)) = object.get(REF_KEY) {
                        return Self::Link(EntityKey::from_raw(key.as_str()));
                    }
                    if matches!(object.get(FIELDS_KEY), Some(JSON::Object(_))) {
                        if let Some(JSON::Object(fields)) = object.remove(FIELDS_KEY) {
                            return Self::Object(
                                fields
                                    .into_iter()
                                    .map(|(key, value)| {
                                        (
                                            FieldKey::from_raw(key.as_str()),
                                            Self::from_snapshot_value(value),
                                        )
                                    })
                                    .collect(),
                            );
                        }
                    }
                }
                // Any other object is an opaque scalar.
                Self::Scalar(JSON::Object(object))
            }
            scalar => Self::Scalar(scalar),
        }
    }
}

impl Serialize for StoredValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Scalar(value) => value.serialize(serializer),
            Self::Link(key) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(REF_KEY, key.as_str())?;
                map.end()
            }
            Self::List(items) => serializer.collect_seq(items),
            Self::Object(fields) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(FIELDS_KEY, fields)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for StoredValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = JSON::deserialize(deserializer)?;
        Ok(Self::from_snapshot_value(value))
    }
}

/// Deep-merges an incoming cell value over an existing one.
///
/// Scalars and links are last-write-wins; two lists merge element-wise with
/// the incoming length winning; two inline objects merge recursively. An
/// incoming inline object never overwrites an existing entity link: a payload
/// without the entity's key fields must not sever the reference already in
/// place.
pub(crate) fn merge_stored(existing: Option<&StoredValue>, incoming: StoredValue) -> StoredValue {
    match (existing, incoming) {
        (Some(StoredValue::Link(key)), StoredValue::Object(_)) => StoredValue::Link(key.clone()),
        (Some(StoredValue::Object(existing)), StoredValue::Object(incoming)) => {
            let mut merged = existing.clone();
            merge_fields(&mut merged, incoming);
            StoredValue::Object(merged)
        }
        (Some(StoredValue::List(existing)), StoredValue::List(incoming)) => StoredValue::List(
            incoming
                .into_iter()
                .enumerate()
                .map(|(index, item)| merge_stored(existing.get(index), item))
                .collect(),
        ),
        (_, incoming) => incoming,
    }
}

pub(crate) fn merge_fields(target: &mut Fields, source: Fields) {
    for (key, incoming) in source {
        let merged = merge_stored(target.get(&key), incoming);
        target.insert(key, merged);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;

    use super::*;

    fn fields(entries: Vec<(&str, StoredValue)>) -> Fields {
        entries
            .into_iter()
            .map(|(key, value)| (FieldKey::from_raw(key), value))
            .collect()
    }

    #[test]
    fn root_bucket_always_exists() {
        let storage = Storage::new();
        assert!(storage.bucket(&StorageKey::root()).is_some());
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn scalars_and_links_are_last_write_wins() {
        let old = StoredValue::Scalar(json!("Alice"));
        let merged = merge_stored(Some(&old), StoredValue::Scalar(json!("Bob")));
        assert_eq!(merged, StoredValue::Scalar(json!("Bob")));

        let old = StoredValue::Link(EntityKey::from_raw("User:1"));
        let merged = merge_stored(Some(&old), StoredValue::Link(EntityKey::from_raw("User:2")));
        assert_eq!(merged, StoredValue::Link(EntityKey::from_raw("User:2")));
    }

    #[test]
    fn null_overwrites() {
        let old = StoredValue::Scalar(json!("Alice"));
        let merged = merge_stored(Some(&old), StoredValue::Scalar(JSON::Null));
        assert_eq!(merged, StoredValue::Scalar(JSON::Null));
    }

    #[test]
    fn inline_object_never_replaces_a_link() {
        let link = StoredValue::Link(EntityKey::from_raw("User:1"));
        let incoming = StoredValue::Object(fields(vec![(
            "name@{}",
            StoredValue::Scalar(json!("Alice")),
        )]));
        assert_eq!(merge_stored(Some(&link), incoming), link);
    }

    #[test]
    fn inline_objects_merge_recursively() {
        let old = StoredValue::Object(fields(vec![
            ("a@{}", StoredValue::Scalar(json!(1))),
            ("b@{}", StoredValue::Scalar(json!(2))),
        ]));
        let incoming = StoredValue::Object(fields(vec![
            ("b@{}", StoredValue::Scalar(json!(20))),
            ("c@{}", StoredValue::Scalar(json!(3))),
        ]));
        let merged = merge_stored(Some(&old), incoming);
        assert_eq!(
            merged,
            StoredValue::Object(fields(vec![
                ("a@{}", StoredValue::Scalar(json!(1))),
                ("b@{}", StoredValue::Scalar(json!(20))),
                ("c@{}", StoredValue::Scalar(json!(3))),
            ]))
        );
    }

    #[test]
    fn incoming_list_length_wins() {
        let old = StoredValue::List(vec![
            StoredValue::Scalar(json!(1)),
            StoredValue::Scalar(json!(2)),
            StoredValue::Scalar(json!(3)),
        ]);
        let shorter = StoredValue::List(vec![StoredValue::Scalar(json!(10))]);
        assert_eq!(
            merge_stored(Some(&old), shorter),
            StoredValue::List(vec![StoredValue::Scalar(json!(10))])
        );

        let old = StoredValue::List(vec![StoredValue::Scalar(json!(1))]);
        let longer = StoredValue::List(vec![
            StoredValue::Scalar(json!(10)),
            StoredValue::Scalar(json!(20)),
        ]);
        assert_eq!(
            merge_stored(Some(&old), longer),
            StoredValue::List(vec![
                StoredValue::Scalar(json!(10)),
                StoredValue::Scalar(json!(20)),
            ])
        );
    }

    #[test]
    fn array_and_object_mismatch_incoming_wins() {
        let old = StoredValue::List(vec![StoredValue::Scalar(json!(1))]);
        let incoming = StoredValue::Object(fields(vec![("a@{}", StoredValue::Scalar(json!(1)))]));
        assert_eq!(merge_stored(Some(&old), incoming.clone()), incoming);
    }

    #[test]
    fn stored_value_serde_preserves_wire_tags() {
        let value = StoredValue::Object(fields(vec![
            ("author@{}", StoredValue::Link(EntityKey::from_raw("User:1"))),
            (
                "tags@{}",
                StoredValue::List(vec![StoredValue::Scalar(json!("a"))]),
            ),
        ]));
        let encoded = serde_json::to_string(&value).unwrap();
        assert_eq!(
            encoded,
            r#"{"__fields":{"author@{}":{"__ref":"User:1"},"tags@{}":["a"]}}"#
        );
        let decoded: StoredValue = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn empty_inline_composites_survive_serde() {
        // A selection that matched zero payload fields stores an empty
        // composite; it must not collapse into an opaque scalar `{}`.
        let value = StoredValue::Object(Fields::default());
        let encoded = serde_json::to_string(&value).unwrap();
        assert_eq!(encoded, r#"{"__fields":{}}"#);
        let decoded: StoredValue = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn opaque_scalar_objects_survive_serde() {
        let value = StoredValue::Scalar(json!({"lat": 1.5, "lng": 2.5}));
        let encoded = serde_json::to_string(&value).unwrap();
        let decoded: StoredValue = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, value);

        let empty = StoredValue::Scalar(json!({}));
        let encoded = serde_json::to_string(&empty).unwrap();
        assert_eq!(encoded, "{}");
        let decoded: StoredValue = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, empty);
    }
}
