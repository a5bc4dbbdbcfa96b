//! A normalized, reactive, in-memory cache for GraphQL-style query responses.
//!
//! Clients submit precompiled document [`Artifact`]s together with variables
//! and response payloads. The cache decomposes entity objects into a flat
//! store keyed by typename and identity, keeps plain nested objects inline,
//! and re-materializes consistent response shapes on read. Every read records
//! the cells it touched; writes, invalidations, and optimistic layer changes
//! notify the subscriptions whose cells changed. Structural sharing keeps
//! unchanged results referentially equal across reads.
//!
//! Document parsing, transport, and UI bindings are external collaborators:
//! the cache consumes artifacts, never GraphQL text.

mod artifact;
mod cache;
mod denormalize;
mod error;
mod invalidation;
mod keys;
mod normalize;
mod optimistic;
mod schema;
mod shared;
mod snapshot;
mod storage;
mod subscriptions;

pub use crate::artifact::Argument;
pub use crate::artifact::Artifact;
pub use crate::artifact::FieldSelection;
pub use crate::artifact::FragmentSpreadSelection;
pub use crate::artifact::InlineFragmentSelection;
pub use crate::artifact::OperationKind;
pub use crate::artifact::Selection;
pub use crate::artifact::Variables;
pub use crate::cache::Cache;
pub use crate::cache::ReadResult;
pub use crate::error::CacheError;
pub use crate::keys::DependencyKey;
pub use crate::keys::EntityKey;
pub use crate::keys::FieldKey;
pub use crate::keys::MemoKey;
pub use crate::keys::StorageKey;
pub use crate::schema::EntityMeta;
pub use crate::schema::SchemaMeta;
pub use crate::snapshot::Snapshot;
pub use crate::storage::Fields;
pub use crate::storage::Storage;
pub use crate::storage::StoredValue;
pub use crate::subscriptions::SubscriptionId;
