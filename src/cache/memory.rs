use async_trait::async_trait;

use super::Cache;

/// An in-memory cache bounded by total stored bytes, with entries weighed by
/// blob size.
pub struct InMemoryCache {
    entries: moka::future::Cache<String, Vec<u8>>,
}

impl InMemoryCache {
    /// Creates a cache holding at most `max_bytes` of blob data.
    pub fn new(max_bytes: u64) -> Self {
        let entries = moka::future::Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|key: &String, value: &Vec<u8>| {
                (key.len() + value.len()).try_into().unwrap_or(u32::MAX)
            })
            .build();
        InMemoryCache { entries }
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) {
        self.entries.insert(key.to_string(), value.to_vec()).await;
    }

    async fn delete(&self, key: &str) {
        self.entries.invalidate(key).await;
    }
}
