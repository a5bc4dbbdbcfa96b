use thiserror::Error;

/// Errors surfaced by the cache.
///
/// The core read/write paths are infallible: partial results and anomalous
/// payloads are returned as values, not errors. Only snapshot interchange can
/// fail.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("malformed snapshot: {message}")]
    MalformedSnapshot { message: String },

    #[error("snapshot could not be encoded: {message}")]
    SnapshotEncode { message: String },
}
