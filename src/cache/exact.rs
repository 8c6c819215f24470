//! Exact-match response cache using LRU eviction and TTL expiration.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use xxhash_rust::xxh3::Xxh3;

use super::{CacheError, CacheKey, ResponseCache};
use crate::request::{InferenceRequest, InferenceResponse};

/// A cached response with timestamp for TTL checking
struct CachedEntry {
    response: InferenceResponse,
    created_at: Instant,
}

impl CachedEntry {
    fn new(response: InferenceResponse) -> Self {
        Self { response, created_at: Instant::now() }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// Exact match cache with hash-based lookup
///
/// Provides O(1) lookup for identical requests using xxh3 hashing over the
/// request's input tensors, LRU eviction when full and optional TTL-based
/// expiration.
pub struct ExactResponseCache {
    cache: Mutex<LruCache<CacheKey, CachedEntry>>,
    ttl: Option<Duration>,
}

impl ExactResponseCache {
    /// Create a cache holding up to `capacity` responses. Entries older
    /// than `ttl` read as misses; `None` disables expiration.
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self { cache: Mutex::new(LruCache::new(capacity)), ttl }
    }

    /// Current number of entries
    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.cache.lock().unwrap().is_empty()
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.cache.lock().unwrap().clear();
    }
}

impl ResponseCache for ExactResponseCache {
    /// The key covers every input tensor's name, shape and raw contents in
    /// declared order. Request ids and priorities do not participate, so
    /// identical workloads from different clients share an entry.
    fn hash(&self, request: &InferenceRequest) -> Result<CacheKey, CacheError> {
        let mut hasher = Xxh3::new();
        for tensor in request.inputs() {
            hasher.update(tensor.name.as_bytes());
            hasher.update(&[0]);
            for dim in &tensor.shape {
                hasher.update(&dim.to_le_bytes());
            }
            hasher.update(&[0]);
            hasher.update(&tensor.data);
            hasher.update(&[0xff]);
        }
        Ok(hasher.digest())
    }

    fn lookup(&self, key: CacheKey) -> Option<InferenceResponse> {
        let mut cache = self.cache.lock().unwrap();
        let entry = cache.get(&key)?;
        if let Some(ttl) = self.ttl {
            if entry.is_expired(ttl) {
                cache.pop(&key);
                return None;
            }
        }
        Some(entry.response.clone())
    }

    fn insert(&self, response: &InferenceResponse, key: CacheKey) -> Result<(), CacheError> {
        let mut cache = self.cache.lock().unwrap();
        if cache.contains(&key) {
            return Err(CacheError::AlreadyExists);
        }
        cache.put(key, CachedEntry::new(response.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Tensor;
    use bytes::Bytes;

    fn create_request(content: &str) -> InferenceRequest {
        InferenceRequest::new(
            "req",
            vec![Tensor::new(
                "input",
                vec![1, content.len() as i64],
                Bytes::copy_from_slice(content.as_bytes()),
            )],
        )
    }

    fn create_response(content: &str) -> InferenceResponse {
        InferenceResponse::new(
            "req",
            vec![Tensor::new("output", vec![1], Bytes::copy_from_slice(content.as_bytes()))],
        )
    }

    #[test]
    fn test_hash_is_deterministic() {
        let cache = ExactResponseCache::new(16, None);
        let a = cache.hash(&create_request("hello")).unwrap();
        let b = cache.hash(&create_request("hello")).unwrap();
        let c = cache.hash(&create_request("goodbye")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_request_id_does_not_affect_key() {
        let cache = ExactResponseCache::new(16, None);
        let mut other = create_request("hello");
        other.id = "different".to_string();
        assert_eq!(
            cache.hash(&create_request("hello")).unwrap(),
            cache.hash(&other).unwrap()
        );
    }

    #[test]
    fn test_insert_then_lookup_round_trip() {
        let cache = ExactResponseCache::new(16, None);
        let key = cache.hash(&create_request("hello")).unwrap();

        assert!(cache.lookup(key).is_none());
        cache.insert(&create_response("hi"), key).unwrap();

        let cached = cache.lookup(key).unwrap();
        assert_eq!(cached, create_response("hi"));
    }

    #[test]
    fn test_double_insert_reports_already_exists() {
        let cache = ExactResponseCache::new(16, None);
        let key = cache.hash(&create_request("hello")).unwrap();
        cache.insert(&create_response("hi"), key).unwrap();
        assert_eq!(
            cache.insert(&create_response("hi again"), key),
            Err(CacheError::AlreadyExists)
        );
        // The original entry wins.
        assert_eq!(cache.lookup(key).unwrap(), create_response("hi"));
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ExactResponseCache::new(2, None);
        let k1 = cache.hash(&create_request("one")).unwrap();
        let k2 = cache.hash(&create_request("two")).unwrap();
        let k3 = cache.hash(&create_request("three")).unwrap();

        cache.insert(&create_response("1"), k1).unwrap();
        cache.insert(&create_response("2"), k2).unwrap();
        cache.insert(&create_response("3"), k3).unwrap();

        assert!(cache.lookup(k1).is_none());
        assert!(cache.lookup(k2).is_some());
        assert!(cache.lookup(k3).is_some());
    }

    #[test]
    fn test_ttl_expiration() {
        let cache = ExactResponseCache::new(16, Some(Duration::from_millis(1)));
        let key = cache.hash(&create_request("hello")).unwrap();
        cache.insert(&create_response("hi"), key).unwrap();

        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.lookup(key).is_none());
    }
}
