use crate::{Cache, CoreError};
use async_trait::async_trait;
use moka::{Expiry, future::Cache as MokaCache};
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
struct Entry {
    bytes: Vec<u8>,
    ttl: Option<Duration>,
}

/// Expires each entry after the TTL it was written with.
struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// Moka-backed Cache port, used as the session store.
#[derive(Clone, Debug)]
pub struct InMemoryCache {
    cache: MokaCache<String, Entry>,
    default_ttl: Option<Duration>,
}

impl InMemoryCache {
    /// `default_ttl_seconds` applies to writes that pass no TTL; `None` keeps them until evicted.
    pub fn new(max_capacity: u64, default_ttl_seconds: Option<u64>) -> Self {
        let cache = MokaCache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self {
            cache,
            default_ttl: default_ttl_seconds.map(Duration::from_secs),
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(10_000, Some(3600))
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self.cache.get(key).await.map(|entry| entry.bytes))
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl_seconds: Option<u64>,
    ) -> Result<(), CoreError> {
        let entry = Entry {
            bytes: value.to_vec(),
            ttl: ttl_seconds.map(Duration::from_secs).or(self.default_ttl),
        };
        self.cache.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        self.cache.invalidate(key).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = InMemoryCache::default();
        cache.set("session:abc", b"payload", None).await.unwrap();
        assert_eq!(
            cache.get("session:abc").await.unwrap(),
            Some(b"payload".to_vec())
        );

        cache.delete("session:abc").await.unwrap();
        assert_eq!(cache.get("session:abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let cache = InMemoryCache::default();
        assert_eq!(cache.get("nothing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entry_expires_after_its_own_ttl() {
        let cache = InMemoryCache::new(100, Some(3600));
        cache.set("short", b"x", Some(1)).await.unwrap();
        cache.set("long", b"y", None).await.unwrap();

        sleep(Duration::from_millis(1500)).await;

        assert_eq!(cache.get("short").await.unwrap(), None);
        assert_eq!(cache.get("long").await.unwrap(), Some(b"y".to_vec()));
    }

    #[tokio::test]
    async fn test_overwrite_replaces_value() {
        let cache = InMemoryCache::default();
        cache.set("k", b"one", Some(60)).await.unwrap();
        cache.set("k", b"two", Some(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"two".to_vec()));
    }
}
