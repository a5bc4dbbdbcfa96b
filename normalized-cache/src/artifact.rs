//! Precompiled document artifacts.
//!
//! The cache never parses GraphQL text. External tooling compiles each
//! document (query, mutation, subscription, or named fragment) into an
//! [`Artifact`] carrying the operation metadata and a tree of [`Selection`]s,
//! and the cache consumes that record as-is. Artifacts round-trip through the
//! JSON shape emitted by the codegen (`kind`-tagged selection variants), so
//! they can be embedded in generated source or loaded at runtime.

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value as JSON;

pub type Variables = IndexMap<String, JSON>;

pub(crate) const TYPENAME_FIELD: &str = "__typename";

/// A precompiled document. Immutable once constructed; `name` is unique per
/// artifact and participates in memo keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: OperationKind,
    pub name: String,
    pub selections: Vec<Selection>,
}

impl Artifact {
    pub fn new(kind: OperationKind, name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self {
            kind,
            name: name.into(),
            selections,
        }
    }

    pub fn query(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self::new(OperationKind::Query, name, selections)
    }

    pub fn mutation(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self::new(OperationKind::Mutation, name, selections)
    }

    pub fn subscription(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self::new(OperationKind::Subscription, name, selections)
    }

    pub fn fragment(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self::new(OperationKind::Fragment, name, selections)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    #[strum(to_string = "query")]
    Query,
    #[strum(to_string = "mutation")]
    Mutation,
    #[strum(to_string = "subscription")]
    Subscription,
    #[strum(to_string = "fragment")]
    Fragment,
}

/// One node of a selection tree.
///
/// Dispatch over the three variants is a `match`; there is no trait object in
/// the traversal paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Selection {
    Field(FieldSelection),
    FragmentSpread(FragmentSpreadSelection),
    InlineFragment(InlineFragmentSelection),
}

impl Selection {
    /// A leaf field selection with no alias, arguments, or subselections.
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(FieldSelection::new(name))
    }

    pub fn spread(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self::FragmentSpread(FragmentSpreadSelection {
            name: name.into(),
            selections,
        })
    }

    pub fn inline(on: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self::InlineFragment(InlineFragmentSelection {
            on: on.into(),
            selections,
        })
    }
}

impl From<FieldSelection> for Selection {
    fn from(field: FieldSelection) -> Self {
        Self::Field(field)
    }
}

/// A concrete field. `alias` affects the response shape only; storage identity
/// is always derived from `name` and the resolved arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSelection {
    pub name: String,
    /// The field's declared type name, carried through from the schema for
    /// tooling; the cache itself does not consult it.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub ty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub array: bool,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub args: IndexMap<String, Argument>,
    /// Directive payloads are carried opaquely for tooling; the cache ignores
    /// them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directives: Option<JSON>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selections: Option<Vec<Selection>>,
}

impl FieldSelection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: None,
            alias: None,
            array: false,
            nullable: true,
            args: IndexMap::new(),
            directives: None,
            selections: None,
        }
    }

    pub fn aliased(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn arg(mut self, name: impl Into<String>, argument: Argument) -> Self {
        self.args.insert(name.into(), argument);
        self
    }

    pub fn select(mut self, selections: Vec<Selection>) -> Self {
        self.selections = Some(selections);
        self
    }

    /// The key this field occupies in a response object.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Denotes a masking boundary. The fragment's inlined selections are carried
/// so traversal does not need a fragment registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentSpreadSelection {
    pub name: String,
    pub selections: Vec<Selection>,
}

/// Conditional on the runtime `__typename` matching `on`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineFragmentSelection {
    pub on: String,
    pub selections: Vec<Selection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Argument {
    Literal(JSON),
    Variable(String),
}

impl Argument {
    pub fn literal(value: impl Into<JSON>) -> Self {
        Self::Literal(value.into())
    }

    pub fn variable(name: impl Into<String>) -> Self {
        Self::Variable(name.into())
    }
}

/// Finds the response key under which `field_name` appears anywhere in this
/// selection set, looking through fragment spreads and inline fragments.
/// Returns the first match in selection order.
pub(crate) fn find_response_key<'a>(
    selections: &'a [Selection],
    field_name: &str,
) -> Option<&'a str> {
    for selection in selections {
        match selection {
            Selection::Field(field) => {
                if field.name == field_name {
                    return Some(field.response_key());
                }
            }
            Selection::FragmentSpread(spread) => {
                if let Some(key) = find_response_key(&spread.selections, field_name) {
                    return Some(key);
                }
            }
            Selection::InlineFragment(fragment) => {
                if let Some(key) = find_response_key(&fragment.selections, field_name) {
                    return Some(key);
                }
            }
        }
    }
    None
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_true(value: &bool) -> bool {
    *value
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;

    use super::*;

    fn user_query() -> Artifact {
        Artifact::query(
            "GetUser",
            vec![FieldSelection::new("user")
                .arg("id", Argument::variable("id"))
                .select(vec![
                    Selection::field("__typename"),
                    Selection::field("id"),
                    FieldSelection::new("name").aliased("displayName").into(),
                ])
                .into()],
        )
    }

    #[test]
    fn artifact_json_round_trip() {
        let artifact = user_query();
        let encoded = serde_json::to_string(&artifact).unwrap();
        let decoded: Artifact = serde_json::from_str(&encoded).unwrap();
        assert_eq!(artifact, decoded);
    }

    #[test]
    fn artifact_wire_shape() {
        let artifact: Artifact = serde_json::from_value(serde_json::json!({
            "kind": "query",
            "name": "GetUser",
            "selections": [
                {
                    "kind": "field",
                    "name": "user",
                    "args": { "id": { "variable": "id" } },
                    "selections": [
                        { "kind": "field", "name": "__typename" },
                        { "kind": "field", "name": "id" },
                        { "kind": "field", "name": "name", "alias": "displayName" }
                    ]
                }
            ]
        }))
        .unwrap();
        assert_eq!(artifact, user_query());
    }

    #[test]
    fn argument_wire_shape() {
        let literal: Argument = serde_json::from_value(serde_json::json!({ "literal": 10 })).unwrap();
        assert_eq!(literal, Argument::literal(10));
        let variable: Argument =
            serde_json::from_value(serde_json::json!({ "variable": "n" })).unwrap();
        assert_eq!(variable, Argument::variable("n"));
        assert_eq!(Argument::literal(json!(null)), Argument::Literal(JSON::Null));
    }

    #[test]
    fn response_key_prefers_alias() {
        let field = FieldSelection::new("name").aliased("displayName");
        assert_eq!(field.response_key(), "displayName");
        assert_eq!(FieldSelection::new("name").response_key(), "name");
    }

    #[test]
    fn find_response_key_looks_through_fragments() {
        let selections = vec![
            Selection::spread(
                "UserFields",
                vec![FieldSelection::new("__typename").aliased("tn").into()],
            ),
            Selection::inline("User", vec![Selection::field("id")]),
        ];
        assert_eq!(find_response_key(&selections, "__typename"), Some("tn"));
        assert_eq!(find_response_key(&selections, "id"), Some("id"));
        assert_eq!(find_response_key(&selections, "missing"), None);
    }

    #[test]
    fn operation_kind_display() {
        assert_eq!(OperationKind::Query.to_string(), "query");
        assert_eq!(OperationKind::Fragment.to_string(), "fragment");
    }
}
