pub mod disk;
pub mod memory;

pub use disk::DiskCache;
pub use memory::InMemoryCache;

use async_trait::async_trait;

/// A blob store for cached HTTP responses, keyed by canonical request URL.
/// Backends are responsible for their own concurrency; keys are unique per
/// URL-plus-fragment so writes to different variants never conflict.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Returns the cached blob for `key`, if present.
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Stores `value` under `key`, replacing any existing blob.
    async fn set(&self, key: &str, value: &[u8]);

    /// Removes the blob stored under `key`, if any.
    async fn delete(&self, key: &str);
}

/// A cache that stores nothing. Every lookup misses.
pub struct NopCache;

#[async_trait]
impl Cache for NopCache {
    async fn get(&self, _key: &str) -> Option<Vec<u8>> {
        None
    }

    async fn set(&self, _key: &str, _value: &[u8]) {}

    async fn delete(&self, _key: &str) {}
}
