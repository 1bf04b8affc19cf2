//! Redis driver abstraction
//!
//! The cache service talks to Redis through the [`RedisDriver`] trait so the
//! whole platform can run against the in-memory [`MemoryDriver`] in tests
//! and local development. [`RedisPoolDriver`] is the production
//! implementation over a deadpool-managed connection pool, with a dedicated
//! client for pub/sub subscriptions.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::config::RedisSettings;

/// Driver-level failure
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("command failed: {0}")]
    Command(String),

    #[error("pool unavailable: {0}")]
    Pool(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

/// Thin Redis command surface
///
/// Mirrors the commands the platform actually issues. `hset_expire` is a
/// MULTI of `HSET` + `EXPIRE` so presence writes stay atomic.
#[async_trait]
pub trait RedisDriver: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, DriverError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), DriverError>;
    /// Returns true when the key was newly set
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<bool, DriverError>;
    async fn del(&self, key: &str) -> Result<u64, DriverError>;

    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), DriverError>;
    async fn srem(&self, key: &str, members: &[String]) -> Result<(), DriverError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, DriverError>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), DriverError>;

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, DriverError>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), DriverError>;
    async fn hset_expire(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<(), DriverError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<(), DriverError>;

    async fn ping(&self) -> Result<String, DriverError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), DriverError>;
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, DriverError>;
}

// ---------------------------------------------------------------------------
// In-memory driver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<tokio::time::Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at
            .map(|at| tokio::time::Instant::now() >= at)
            .unwrap_or(false)
    }
}

/// In-memory driver with TTL expiry and pub/sub
///
/// Expiry is checked lazily on access, which preserves the visibility
/// invariant: a key is never observable past its deadline. Uses the tokio
/// clock so paused-clock tests can advance past TTLs.
#[derive(Default)]
pub struct MemoryDriver {
    entries: DashMap<String, Entry>,
    channels: DashMap<String, broadcast::Sender<String>>,
    failing: AtomicBool,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent command fail, for fault-path tests
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DriverError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(DriverError::Command("injected failure".to_string()))
        } else {
            Ok(())
        }
    }

    fn live(&self, key: &str) -> Option<Entry> {
        let entry = self.entries.get(key)?.clone();
        if entry.expired() {
            drop(self.entries.remove(key));
            None
        } else {
            Some(entry)
        }
    }

    fn deadline(ttl: Option<Duration>) -> Option<tokio::time::Instant> {
        ttl.map(|d| tokio::time::Instant::now() + d)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl RedisDriver for MemoryDriver {
    async fn get(&self, key: &str) -> Result<Option<String>, DriverError> {
        self.check()?;
        Ok(self.live(key).and_then(|entry| match entry.value {
            Value::Str(s) => Some(s),
            _ => None,
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), DriverError> {
        self.check()?;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Self::deadline(ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, DriverError> {
        self.check()?;
        if self.live(key).is_some() {
            return Ok(false);
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Self::deadline(ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<u64, DriverError> {
        self.check()?;
        Ok(u64::from(self.entries.remove(key).is_some()))
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), DriverError> {
        self.check()?;
        let mut entry = self.live(key).unwrap_or(Entry {
            value: Value::Set(HashSet::new()),
            expires_at: None,
        });
        if let Value::Set(set) = &mut entry.value {
            set.extend(members.iter().cloned());
        }
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<(), DriverError> {
        self.check()?;
        if let Some(mut entry) = self.live(key) {
            if let Value::Set(set) = &mut entry.value {
                for member in members {
                    set.remove(member);
                }
            }
            self.entries.insert(key.to_string(), entry);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, DriverError> {
        self.check()?;
        Ok(self
            .live(key)
            .and_then(|entry| match entry.value {
                Value::Set(set) => Some(set.into_iter().collect()),
                _ => None,
            })
            .unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), DriverError> {
        self.check()?;
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(tokio::time::Instant::now() + Duration::from_secs(ttl_secs));
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, DriverError> {
        self.check()?;
        Ok(self
            .live(key)
            .and_then(|entry| match entry.value {
                Value::Hash(map) => Some(map.into_iter().collect()),
                _ => None,
            })
            .unwrap_or_default())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), DriverError> {
        self.check()?;
        let mut entry = self.live(key).unwrap_or(Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        if let Value::Hash(map) = &mut entry.value {
            map.insert(field.to_string(), value.to_string());
        }
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn hset_expire(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<(), DriverError> {
        self.check()?;
        let mut entry = self.live(key).unwrap_or(Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        if let Value::Hash(map) = &mut entry.value {
            map.insert(field.to_string(), value.to_string());
        }
        entry.expires_at = Some(tokio::time::Instant::now() + Duration::from_secs(ttl_secs));
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), DriverError> {
        self.check()?;
        if let Some(mut entry) = self.live(key) {
            if let Value::Hash(map) = &mut entry.value {
                map.remove(field);
            }
            self.entries.insert(key.to_string(), entry);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<String, DriverError> {
        self.check()?;
        Ok("PONG".to_string())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), DriverError> {
        self.check()?;
        if let Some(sender) = self.channels.get(channel) {
            // No subscribers is not an error, matching Redis semantics.
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, DriverError> {
        self.check()?;
        let mut rx = self.sender(channel).subscribe();
        let (tx, out) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// deadpool-redis driver
// ---------------------------------------------------------------------------

/// Production driver over a deadpool-managed Redis pool
pub struct RedisPoolDriver {
    pool: deadpool_redis::Pool,
    client: redis::Client,
}

impl RedisPoolDriver {
    /// Create the pool with exponential-backoff connection retries
    pub async fn connect(settings: &RedisSettings) -> Result<Self, DriverError> {
        let mut attempt = 0u32;
        let base_delay = settings.retry_delay();

        loop {
            match Self::try_connect(settings).await {
                Ok(driver) => {
                    if attempt > 0 {
                        tracing::info!(
                            "Redis connection established after {} attempt(s)",
                            attempt + 1
                        );
                    } else {
                        tracing::info!(
                            "Redis connection pool created: max_connections={}",
                            settings.max_connections
                        );
                    }
                    return Ok(driver);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > settings.max_retries {
                        tracing::error!(
                            "Failed to connect to Redis after {} attempts: {}",
                            settings.max_retries + 1,
                            e
                        );
                        return Err(e);
                    }

                    let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                    tracing::warn!(
                        "Redis connection attempt {} failed: {}. Retrying in {:?}...",
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_connect(settings: &RedisSettings) -> Result<Self, DriverError> {
        let cfg = deadpool_redis::Config::from_url(&settings.url);
        let pool = cfg
            .builder()
            .map_err(|e| DriverError::Pool(format!("failed to build Redis pool: {e}")))?
            .max_size(settings.max_connections)
            .runtime(deadpool_redis::Runtime::Tokio1)
            .build()
            .map_err(|e| DriverError::Pool(format!("failed to create Redis pool: {e}")))?;

        let client = redis::Client::open(settings.url.as_str())
            .map_err(|e| DriverError::Pool(format!("invalid Redis URL: {e}")))?;

        // Test the connection.
        let conn = pool
            .get()
            .await
            .map_err(|e| DriverError::Pool(format!("failed to get Redis connection: {e}")))?;
        drop(conn);

        Ok(Self { pool, client })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, DriverError> {
        self.pool
            .get()
            .await
            .map_err(|e| DriverError::Pool(e.to_string()))
    }
}

impl From<redis::RedisError> for DriverError {
    fn from(err: redis::RedisError) -> Self {
        DriverError::Command(err.to_string())
    }
}

#[async_trait]
impl RedisDriver for RedisPoolDriver {
    async fn get(&self, key: &str) -> Result<Option<String>, DriverError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), DriverError> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, DriverError> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<u64, DriverError> {
        let mut conn = self.conn().await?;
        let removed: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), DriverError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SADD")
            .arg(key)
            .arg(members)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<(), DriverError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SREM")
            .arg(key)
            .arg(members)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, DriverError> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), DriverError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, DriverError> {
        let mut conn = self.conn().await?;
        let pairs: Vec<(String, String)> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(pairs)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), DriverError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hset_expire(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<(), DriverError> {
        let mut conn = self.conn().await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), DriverError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<String, DriverError> {
        let mut conn = self.conn().await?;
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(reply)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), DriverError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, DriverError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| DriverError::Subscribe(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| DriverError::Subscribe(e.to_string()))?;

        let (tx, out) = mpsc::channel(256);
        tokio::spawn(async move {
            use futures::StreamExt;
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(out)
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 || secs == 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_kv_roundtrip() {
        let driver = MemoryDriver::new();
        driver.set("k", "v", None).await.unwrap();
        assert_eq!(driver.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(driver.del("k").await.unwrap(), 1);
        assert_eq!(driver.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_ttl_expiry() {
        let driver = MemoryDriver::new();
        driver
            .set("k", "v", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(driver.get("k").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(driver.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_set_nx() {
        let driver = MemoryDriver::new();
        assert!(driver.set_nx("k", "a", None).await.unwrap());
        assert!(!driver.set_nx("k", "b", None).await.unwrap());
        assert_eq!(driver.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_memory_sets() {
        let driver = MemoryDriver::new();
        driver
            .sadd("s", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        let mut members = driver.smembers("s").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["a", "b"]);
        driver.srem("s", &["a".to_string()]).await.unwrap();
        assert_eq!(driver.smembers("s").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_memory_hash_atomic_expire() {
        let driver = MemoryDriver::new();
        driver.hset_expire("h", "f", "v", 60).await.unwrap();
        let pairs = driver.hgetall("h").await.unwrap();
        assert_eq!(pairs, vec![("f".to_string(), "v".to_string())]);
        driver.hdel("h", "f").await.unwrap();
        assert!(driver.hgetall("h").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_pubsub() {
        let driver = MemoryDriver::new();
        let mut rx = driver.subscribe("chan").await.unwrap();
        driver.publish("chan", "hello").await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_memory_failure_injection() {
        let driver = MemoryDriver::new();
        driver.set_failing(true);
        assert!(driver.get("k").await.is_err());
        assert!(driver.ping().await.is_err());
        driver.set_failing(false);
        assert!(driver.ping().await.is_ok());
    }

    #[test]
    fn test_ttl_secs_rounds_up() {
        assert_eq!(ttl_secs(Duration::from_millis(1)), 1);
        assert_eq!(ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ttl_secs(Duration::from_secs(3)), 3);
    }
}
