//! Two-tier cache service: Redis-backed KV + sets + pub/sub with an
//! in-process key registry for pattern invalidation
//!
//! The kv group is fail-safe by design: a missing key, a corrupted entry, a
//! schema mismatch, and a driver outage all read as `None`. A corrupted
//! cache entry must never be observable as a partial value.

pub mod driver;
pub mod presence;
pub mod registry;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::Stream;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
pub use driver::{DriverError, MemoryDriver, RedisDriver, RedisPoolDriver};
pub use registry::{InvalidationMessage, KeyRegistry, INVALIDATION_CHANNEL};

/// Prefix for kv entries
pub const CACHE_KEY_PREFIX: &str = "cache:";

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        Error::infra(err.to_string())
    }
}

/// Stored form of a kv entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub value: serde_json::Value,
    pub codec: String,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a `set_nx`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetNxOutcome {
    pub key: String,
    pub already_exists: bool,
}

/// Driver health snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheHealth {
    pub connected: bool,
    pub latency_ms: u64,
}

/// The cache service
///
/// Cheap to clone; all clones share the driver and the key registry.
/// `store` names the registry bucket this handle tracks keys under.
#[derive(Clone)]
pub struct CacheService {
    driver: Arc<dyn RedisDriver>,
    registry: Arc<KeyRegistry>,
    store: String,
}

impl CacheService {
    pub fn new(driver: Arc<dyn RedisDriver>) -> Self {
        Self {
            driver,
            registry: Arc::new(KeyRegistry::new()),
            store: "default".to_string(),
        }
    }

    /// A handle tracking keys under a different registry store
    pub fn with_store(&self, store: impl Into<String>) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            registry: Arc::clone(&self.registry),
            store: store.into(),
        }
    }

    pub fn driver(&self) -> Arc<dyn RedisDriver> {
        Arc::clone(&self.driver)
    }

    pub fn registry(&self) -> Arc<KeyRegistry> {
        Arc::clone(&self.registry)
    }

    // -- kv -----------------------------------------------------------------

    /// Fail-safe read: `None` on miss, decode failure, schema mismatch,
    /// expiry, or driver error
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.registry.track(&self.store, key);
        let raw = match self.driver.get(&format!("{CACHE_KEY_PREFIX}{key}")).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                tracing::debug!(key, error = %err, "cache read failed");
                return None;
            }
        };
        let entry: CacheEntry = serde_json::from_str(&raw).ok()?;
        // The deadline is enforced client-side as well, so a lagging driver
        // cannot resurrect an expired entry.
        if entry.expires_at <= Utc::now() {
            return None;
        }
        serde_json::from_value(entry.value).ok()
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        self.registry.track(&self.store, key);
        let entry = CacheEntry {
            value: serde_json::to_value(value)
                .map_err(|e| Error::internal_with_cause("cache encode failed", e.to_string()))?,
            codec: "json".to_string(),
            expires_at: Utc::now()
                + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::days(36500)),
        };
        let raw = serde_json::to_string(&entry)
            .map_err(|e| Error::internal_with_cause("cache encode failed", e.to_string()))?;
        self.driver
            .set(&format!("{CACHE_KEY_PREFIX}{key}"), &raw, Some(ttl))
            .await?;
        Ok(())
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        self.registry.release(&self.store, key);
        self.driver.del(&format!("{CACHE_KEY_PREFIX}{key}")).await?;
        Ok(())
    }

    /// Set only if absent; reports whether a value was already there
    pub async fn set_nx<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<SetNxOutcome> {
        self.registry.track(&self.store, key);
        let entry = CacheEntry {
            value: serde_json::to_value(value)
                .map_err(|e| Error::internal_with_cause("cache encode failed", e.to_string()))?,
            codec: "json".to_string(),
            expires_at: Utc::now()
                + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::days(36500)),
        };
        let raw = serde_json::to_string(&entry)
            .map_err(|e| Error::internal_with_cause("cache encode failed", e.to_string()))?;
        let newly_set = self
            .driver
            .set_nx(&format!("{CACHE_KEY_PREFIX}{key}"), &raw, Some(ttl))
            .await?;
        Ok(SetNxOutcome {
            key: key.to_string(),
            already_exists: !newly_set,
        })
    }

    // -- sets ---------------------------------------------------------------

    /// Add members to a set; a no-op for an empty slice
    pub async fn sadd(&self, key: &str, members: &[String]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        self.driver.sadd(key, members).await?;
        Ok(())
    }

    /// Remove members from a set; a no-op for an empty slice
    pub async fn srem(&self, key: &str, members: &[String]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        self.driver.srem(key, members).await?;
        Ok(())
    }

    /// Set members; a throwing driver reads as an empty set
    pub async fn smembers(&self, key: &str) -> Vec<String> {
        self.driver.smembers(key).await.unwrap_or_default()
    }

    /// Extend a set's TTL; seconds computed as `max(1, ceil(d))`
    pub async fn touch(&self, key: &str, ttl: Duration) -> Result<()> {
        self.driver.expire(key, touch_secs(ttl)).await?;
        Ok(())
    }

    // -- pubsub -------------------------------------------------------------

    /// Publish an encoded message on a channel
    pub async fn publish<T: Serialize>(&self, channel: &str, message: &T) -> Result<()> {
        let payload = serde_json::to_string(message)
            .map_err(|e| Error::internal_with_cause("publish encode failed", e.to_string()))?;
        self.driver.publish(channel, &payload).await?;
        Ok(())
    }

    /// Subscribe to a channel as a stream of decoded messages
    ///
    /// Undecodable payloads are dropped. FIFO per subscriber.
    pub async fn subscribe<T: DeserializeOwned>(
        &self,
        channel: &str,
    ) -> Result<impl Stream<Item = T>> {
        let rx = self.driver.subscribe(channel).await?;
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|payload| (payload, rx))
        });
        use futures::StreamExt;
        Ok(stream.filter_map(|payload| async move { serde_json::from_str::<T>(&payload).ok() }))
    }

    // -- health -------------------------------------------------------------

    /// Ping the driver; any error or non-PONG reply reads as disconnected
    pub async fn health(&self) -> CacheHealth {
        let start = std::time::Instant::now();
        match self.driver.ping().await {
            Ok(reply) if reply == "PONG" => CacheHealth {
                connected: true,
                latency_ms: start.elapsed().as_millis() as u64,
            },
            _ => CacheHealth {
                connected: false,
                latency_ms: 0,
            },
        }
    }

    // -- invalidation -------------------------------------------------------

    /// Remove matching registry entries on this node only
    pub fn invalidate_local(&self, store: &str, matcher: &str) -> usize {
        self.registry.invalidate_local(store, matcher)
    }

    /// Invalidate across the fleet: clear matching keys from the driver,
    /// drop local registry entries, and fan the matcher out to every node
    pub async fn invalidate(&self, store: &str, matcher: &str) -> Result<usize> {
        for key in self.registry.matching_keys(store, matcher) {
            // Best effort: a failed delete ages out through the entry TTL.
            let _ = self.driver.del(&format!("{CACHE_KEY_PREFIX}{key}")).await;
        }
        let removed = self.registry.invalidate_local(store, matcher);
        self.publish(
            INVALIDATION_CHANNEL,
            &InvalidationMessage {
                store: store.to_string(),
                matcher: matcher.to_string(),
            },
        )
        .await?;
        Ok(removed)
    }

    /// Listen for cross-node invalidations until cancelled
    pub async fn spawn_invalidation_listener(
        &self,
        cancel: CancellationToken,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let mut rx = self.driver.subscribe(INVALIDATION_CHANNEL).await?;
        let registry = Arc::clone(&self.registry);
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = rx.recv() => {
                        let Some(payload) = message else { break };
                        let Ok(msg) = serde_json::from_str::<InvalidationMessage>(&payload) else {
                            continue;
                        };
                        let removed = registry.invalidate_local(&msg.store, &msg.matcher);
                        tracing::debug!(
                            store = %msg.store,
                            matcher = %msg.matcher,
                            removed,
                            "applied remote invalidation"
                        );
                    }
                }
            }
        }))
    }
}

/// TTL seconds for `touch`: `max(1, ceil(d))`
fn touch_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}
