//! Key algebra.
//!
//! Every unit of identity in the cache is a string: entity keys name buckets,
//! field keys name cells within a bucket, dependency keys name cells globally,
//! and memo keys name memoized read results. Strings keep hashing cheap and
//! make whole-bucket invalidation a prefix scan.
//!
//! All constructors here are pure. Two argument maps that differ only in key
//! order produce byte-identical field keys: the JSON encoding is canonical
//! (object keys sorted ascending by codepoint, recursively).

use std::fmt;

use itertools::Itertools;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value as JSON;

use crate::artifact::Argument;
use crate::artifact::FieldSelection;
use crate::artifact::Variables;
use crate::OperationKind;

pub(crate) const ROOT_BUCKET: &str = "__root";

/// Names a bucket in storage: either the root bucket or an entity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn root() -> Self {
        Self(ROOT_BUCKET.to_string())
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_BUCKET
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// True for entity keys of the form `{typename}:…`.
    pub(crate) fn has_typename(&self, typename: &str) -> bool {
        self.0.as_bytes().get(typename.len()) == Some(&b':') && self.0.starts_with(typename)
    }
}

impl From<EntityKey> for StorageKey {
    fn from(key: EntityKey) -> Self {
        Self(key.0)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical identity of an entity: `{typename}:{k₁}:…:{kₙ}`, colon-joined
/// over the stringified key-field values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey(String);

impl EntityKey {
    pub(crate) fn new(typename: &str, key_values: &[&JSON]) -> Self {
        let segments = key_values.iter().map(|value| key_segment(value)).join(":");
        Self(format!("{typename}:{segments}"))
    }

    pub(crate) fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scalar key-field values are stringified verbatim; null yields an empty
/// segment. Composite values fall back to the canonical JSON encoding so the
/// key stays deterministic.
fn key_segment(value: &JSON) -> String {
    match value {
        JSON::Null => String::new(),
        JSON::Bool(b) => b.to_string(),
        JSON::Number(n) => n.to_string(),
        JSON::String(s) => s.as_str().to_string(),
        composite => canonical_json(composite),
    }
}

/// Names a cell within a bucket: `{name}@{argsJson}`. The field name is
/// always used, never the alias; aliases affect response shape, not storage
/// identity. An empty resolved argument map encodes as `{}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldKey(String);

impl FieldKey {
    pub(crate) fn new(field: &FieldSelection, variables: &Variables) -> Self {
        let resolved = resolve_arguments(&field.args, variables);
        Self(format!("{}@{}", field.name, canonical_args(resolved)))
    }

    /// Builds a key from a field name and an optional literal argument object,
    /// as they appear in invalidate targets.
    pub(crate) fn from_literal_args(name: &str, args: Option<&JSON>) -> Self {
        let resolved = args
            .and_then(JSON::as_object)
            .map(|object| {
                object
                    .iter()
                    .map(|(key, value)| (key.as_str(), value))
                    .collect()
            })
            .unwrap_or_default();
        Self(format!("{name}@{}", canonical_args(resolved)))
    }

    pub(crate) fn typename() -> Self {
        Self(format!("{}@{{}}", crate::artifact::TYPENAME_FIELD))
    }

    pub(crate) fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The unit of reactivity: `{storageKey}.{fieldKey}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyKey(String);

impl DependencyKey {
    pub(crate) fn new(storage_key: &StorageKey, field_key: &FieldKey) -> Self {
        Self(format!("{storage_key}.{field_key}"))
    }

    /// True if this dependency names a cell inside `storage_key`'s bucket.
    pub(crate) fn is_under(&self, storage_key: &StorageKey) -> bool {
        let prefix = storage_key.as_str();
        self.0.as_bytes().get(prefix.len()) == Some(&b'.') && self.0.starts_with(prefix)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DependencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Names one memoized read result: `{kind}:{artifactName}:{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoKey(String);

impl MemoKey {
    pub(crate) fn new(kind: OperationKind, name: &str, id: &str) -> Self {
        Self(format!("{kind}:{name}:{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves an argument map against the supplied variables. A variable with
/// no binding is absent from the result (and therefore from the encoding); an
/// explicit null literal or a variable bound to null is preserved.
pub(crate) fn resolve_arguments<'a>(
    args: &'a indexmap::IndexMap<String, Argument>,
    variables: &'a Variables,
) -> Vec<(&'a str, &'a JSON)> {
    let mut resolved = Vec::with_capacity(args.len());
    for (name, argument) in args {
        match argument {
            Argument::Literal(value) => resolved.push((name.as_str(), value)),
            Argument::Variable(variable) => {
                if let Some(value) = variables.get(variable.as_str()) {
                    resolved.push((name.as_str(), value));
                }
            }
        }
    }
    resolved
}

/// Encodes resolved arguments as a canonical JSON object.
pub(crate) fn canonical_args(mut pairs: Vec<(&str, &JSON)>) -> String {
    pairs.sort_unstable_by(|a, b| a.0.cmp(b.0));
    let mut out = String::from("{");
    for (index, (name, value)) in pairs.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        write_escaped_str(name, &mut out);
        out.push(':');
        write_canonical(value, &mut out);
    }
    out.push('}');
    out
}

/// Canonical variable encoding, used as the memo-key id for query reads.
pub(crate) fn canonical_variables(variables: &Variables) -> String {
    canonical_args(
        variables
            .iter()
            .map(|(name, value)| (name.as_str(), value))
            .collect(),
    )
}

/// Deterministic JSON encoding: object keys sorted ascending by codepoint at
/// every level, array order preserved, number precision preserved.
pub(crate) fn canonical_json(value: &JSON) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JSON, out: &mut String) {
    match value {
        JSON::Null => out.push_str("null"),
        JSON::Bool(true) => out.push_str("true"),
        JSON::Bool(false) => out.push_str("false"),
        JSON::Number(n) => out.push_str(&n.to_string()),
        JSON::String(s) => write_escaped_str(s.as_str(), out),
        JSON::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        JSON::Object(object) => {
            let mut entries: Vec<_> = object
                .iter()
                .map(|(key, value)| (key.as_str(), value))
                .collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (index, (key, value)) in entries.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_escaped_str(key, out);
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
    }
}

fn write_escaped_str(s: &str, out: &mut String) {
    use std::fmt::Write;

    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
