//! Snapshot interchange.
//!
//! A snapshot captures base storage and the memo table — nothing else.
//! Subscriptions are rebuilt by their owners, the stale set is transient, and
//! optimistic layers are transient by construction. The JSON layout is stable
//! for interoperability:
//!
//! ```json
//! { "storage": { "__root": { "user@{}": { "__ref": "User:1" } },
//!                "User:1": { "id@{}": "1" } },
//!   "memo":    { "query:GetUser:{}": { "user": { "id": "1" } } } }
//! ```

use std::sync::Arc;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value as JSON;

use crate::error::CacheError;
use crate::keys::MemoKey;
use crate::storage::Storage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub storage: Storage,
    pub memo: IndexMap<MemoKey, Arc<JSON>>,
}

impl Snapshot {
    pub fn to_json(&self) -> Result<String, CacheError> {
        serde_json::to_string(self).map_err(|error| CacheError::SnapshotEncode {
            message: error.to_string(),
        })
    }

    pub fn from_json(text: &str) -> Result<Self, CacheError> {
        serde_json::from_str(text).map_err(|error| CacheError::MalformedSnapshot {
            message: error.to_string(),
        })
    }
}
