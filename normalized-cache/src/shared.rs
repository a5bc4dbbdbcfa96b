//! Structural sharing for read results.
//!
//! A read-path concern only: storage is never affected. The memo table keeps
//! the last result per memo key behind an `Arc`, and successive reads rebuild
//! only the subtrees that actually changed, reusing the previous value
//! everywhere else. A read whose result is wholly unchanged returns the same
//! `Arc`.

use serde_json_bytes::Value as JSON;

/// Returns `previous` wherever `next` is deeply equal to it; otherwise a new
/// composite whose children are shared recursively. Array elements share
/// per-index. Primitive/object distinctions are preserved: an empty array and
/// an empty object never compare equal.
pub(crate) fn replace_equal_deep(previous: &JSON, next: JSON) -> JSON {
    if *previous == next {
        return previous.clone();
    }
    match (previous, next) {
        (JSON::Object(previous), JSON::Object(next)) => JSON::Object(
            next.into_iter()
                .map(|(key, value)| {
                    let value = match previous.get(&key) {
                        Some(previous_child) => replace_equal_deep(previous_child, value),
                        None => value,
                    };
                    (key, value)
                })
                .collect(),
        ),
        (JSON::Array(previous), JSON::Array(next)) => JSON::Array(
            next.into_iter()
                .enumerate()
                .map(|(index, value)| match previous.get(index) {
                    Some(previous_child) => replace_equal_deep(previous_child, value),
                    None => value,
                })
                .collect(),
        ),
        (_, next) => next,
    }
}
