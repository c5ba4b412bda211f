//! OAuth access-token caching for processor adapters.
//!
//! Tokens are cached for less than their advertised lifetime so a token is
//! never presented right as it expires. Cache failures are never fatal: the
//! adapter simply fetches a fresh token.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Fraction of the advertised lifetime a token is reused for (50 of 60 minutes).
const REUSE_NUMERATOR: u64 = 5;
const REUSE_DENOMINATOR: u64 = 6;
const MIN_TTL: Duration = Duration::from_secs(30);

/// How long to keep a token the processor says lives `expires_in`.
pub fn reuse_window(expires_in: Duration) -> Duration {
    let secs = expires_in.as_secs() * REUSE_NUMERATOR / REUSE_DENOMINATOR;
    Duration::from_secs(secs).max(MIN_TTL.min(expires_in))
}

#[async_trait]
pub trait TokenCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn put(&self, key: &str, token: &str, ttl: Duration);
    async fn invalidate(&self, key: &str);
}

/// Process-local cache.
#[derive(Default, Clone)]
pub struct InMemoryTokenCache {
    entries: Arc<RwLock<HashMap<String, (String, Instant)>>>,
}

impl InMemoryTokenCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenCache for InMemoryTokenCache {
    async fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|(_, expires_at)| Instant::now() < *expires_at)
            .map(|(token, _)| token.clone())
    }

    async fn put(&self, key: &str, token: &str, ttl: Duration) {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), (token.to_string(), Instant::now() + ttl));
    }

    async fn invalidate(&self, key: &str) {
        self.entries.write().await.remove(key);
    }
}

/// Redis-backed cache shared by every replica of the service.
#[derive(Clone)]
pub struct RedisTokenCache {
    client: redis::Client,
    prefix: String,
}

impl RedisTokenCache {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            prefix: "settlement:token".to_string(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    async fn connection(&self) -> Option<redis::aio::MultiplexedConnection> {
        match self.client.get_multiplexed_async_connection().await {
            Ok(con) => Some(con),
            Err(e) => {
                tracing::warn!(error = %e, "Token cache unavailable, falling back to fetch");
                None
            }
        }
    }
}

#[async_trait]
impl TokenCache for RedisTokenCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut con = self.connection().await?;
        redis::cmd("GET")
            .arg(self.key(key))
            .query_async::<_, Option<String>>(&mut con)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Token cache read failed");
                None
            })
    }

    async fn put(&self, key: &str, token: &str, ttl: Duration) {
        let Some(mut con) = self.connection().await else {
            return;
        };
        let result: redis::RedisResult<()> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(token)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut con)
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "Token cache write failed");
        }
    }

    async fn invalidate(&self, key: &str) {
        let Some(mut con) = self.connection().await else {
            return;
        };
        let result: redis::RedisResult<()> = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut con)
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "Token cache invalidation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_long_token_is_reused_for_fifty_minutes() {
        assert_eq!(
            reuse_window(Duration::from_secs(3600)),
            Duration::from_secs(3000)
        );
    }

    #[test]
    fn short_lived_token_keeps_a_floor() {
        assert_eq!(reuse_window(Duration::from_secs(12)), Duration::from_secs(12));
        assert_eq!(reuse_window(Duration::from_secs(60)), Duration::from_secs(50));
    }

    #[tokio::test]
    async fn in_memory_cache_round_trip_and_invalidate() {
        let cache = InMemoryTokenCache::new();
        assert!(cache.get("mpesa").await.is_none());

        cache.put("mpesa", "tok-1", Duration::from_secs(60)).await;
        assert_eq!(cache.get("mpesa").await.as_deref(), Some("tok-1"));

        cache.invalidate("mpesa").await;
        assert!(cache.get("mpesa").await.is_none());
    }

    #[tokio::test]
    async fn in_memory_cache_expires_entries() {
        let cache = InMemoryTokenCache::new();
        cache.put("mpesa", "tok-1", Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(cache.get("mpesa").await.is_none());
    }
}
