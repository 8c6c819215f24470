//! Content-addressed response caching.
//!
//! The scheduler talks to the cache through three narrow contracts: hash a
//! request into a key, look a key up, insert a response under a key. Lookup
//! happens on the enqueue path (a hit bypasses batching entirely); insertion
//! happens inside the response delegator once the backend has produced the
//! response. Cache failures are logged and never fail a request.

mod exact;

pub use exact::ExactResponseCache;

use thiserror::Error;

use crate::request::{InferenceRequest, InferenceResponse};

/// Cache key produced by hashing a request's inputs.
pub type CacheKey = u64;

/// Errors from cache operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The key is already present; treated as an idempotent hit
    #[error("entry already exists")]
    AlreadyExists,

    /// The request could not be hashed into a key
    #[error("request cannot be hashed: {0}")]
    Hash(String),

    /// Backend failure
    #[error("cache failure: {0}")]
    Internal(String),
}

/// A response cache backend.
pub trait ResponseCache: Send + Sync {
    /// Hash a request into its cache key. Must be deterministic: equal
    /// inputs produce equal keys.
    fn hash(&self, request: &InferenceRequest) -> Result<CacheKey, CacheError>;

    /// Look up a key; `None` is a miss.
    fn lookup(&self, key: CacheKey) -> Option<InferenceResponse>;

    /// Insert a response under a key. Returns `CacheError::AlreadyExists`
    /// when the key is already present (the hit is counted elsewhere).
    fn insert(&self, response: &InferenceResponse, key: CacheKey) -> Result<(), CacheError>;
}
