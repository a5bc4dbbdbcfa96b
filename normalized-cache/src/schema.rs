use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

/// Schema metadata consumed by the cache: which typenames are entities, and
/// which fields identify them.
///
/// Typenames not listed here denote value objects, which are stored inline in
/// their parent rather than promoted to their own bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaMeta {
    types: IndexMap<String, EntityMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMeta {
    /// Ordered list of fields whose values form the entity key.
    pub key_fields: Vec<String>,
}

impl SchemaMeta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `typename` as an entity identified by `key_fields`, in order.
    pub fn with_entity<N, F>(mut self, typename: N, key_fields: F) -> Self
    where
        N: Into<String>,
        F: IntoIterator,
        F::Item: Into<String>,
    {
        self.types.insert(
            typename.into(),
            EntityMeta {
                key_fields: key_fields.into_iter().map(Into::into).collect(),
            },
        );
        self
    }

    pub(crate) fn entity_meta(&self, typename: &str) -> Option<&EntityMeta> {
        self.types.get(typename)
    }
}
