//! Presence map helpers
//!
//! The authoritative map of live WebSocket sockets per tenant lives in a
//! Redis hash `presence:<tenantId>` mapping socket id to a presence entry.
//! Writes are atomic `HSET` + `EXPIRE` pairs; the TTL is refreshed on a
//! schedule so presence decays on its own when a node dies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{CacheService, RedisDriver};
use crate::context::TenantId;
use crate::error::Result;

/// Hash key for a tenant's presence map
pub fn presence_key(tenant: TenantId) -> String {
    format!("presence:{tenant}")
}

/// One live socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
}

/// Presence operations over the shared cache driver
#[derive(Clone)]
pub struct Presence {
    cache: CacheService,
    ttl: Duration,
}

impl Presence {
    pub fn new(cache: CacheService, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    /// Register a socket; hash write and TTL extension are one MULTI
    pub async fn set(
        &self,
        tenant: TenantId,
        socket_id: &str,
        entry: &PresenceEntry,
    ) -> Result<()> {
        let payload = serde_json::to_string(entry).map_err(|e| {
            crate::error::Error::internal_with_cause("presence encode failed", e.to_string())
        })?;
        self.cache
            .driver()
            .hset_expire(
                &presence_key(tenant),
                socket_id,
                &payload,
                self.ttl.as_secs().max(1),
            )
            .await?;
        Ok(())
    }

    /// Drop a socket from the map
    pub async fn remove(&self, tenant: TenantId, socket_id: &str) -> Result<()> {
        self.cache
            .driver()
            .hdel(&presence_key(tenant), socket_id)
            .await?;
        Ok(())
    }

    /// Extend the map's TTL
    pub async fn refresh(&self, tenant: TenantId) -> Result<()> {
        self.cache
            .driver()
            .expire(&presence_key(tenant), self.ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    /// All live sockets for a tenant
    ///
    /// Rows that fail to decode against the presence schema are silently
    /// dropped.
    pub async fn get_all(&self, tenant: TenantId) -> Result<Vec<(String, PresenceEntry)>> {
        let rows = self
            .cache
            .driver()
            .hgetall(&presence_key(tenant))
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(socket_id, raw)| {
                serde_json::from_str::<PresenceEntry>(&raw)
                    .ok()
                    .map(|entry| (socket_id, entry))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryDriver;
    use std::sync::Arc;
    use uuid::Uuid;

    fn tenant() -> TenantId {
        TenantId::new(Uuid::from_u128(0x11))
    }

    fn presence() -> Presence {
        let cache = CacheService::new(Arc::new(MemoryDriver::new()));
        Presence::new(cache, Duration::from_secs(90))
    }

    fn entry() -> PresenceEntry {
        PresenceEntry {
            user_id: "user-1".to_string(),
            connected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_set_and_get_all() {
        let presence = presence();
        presence.set(tenant(), "sock-1", &entry()).await.unwrap();
        let all = presence.get_all(tenant()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "sock-1");
        assert_eq!(all[0].1.user_id, "user-1");
    }

    #[tokio::test]
    async fn test_remove() {
        let presence = presence();
        presence.set(tenant(), "sock-1", &entry()).await.unwrap();
        presence.remove(tenant(), "sock-1").await.unwrap();
        assert!(presence.get_all(tenant()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_rows_are_dropped() {
        let presence = presence();
        presence.set(tenant(), "sock-1", &entry()).await.unwrap();
        presence
            .cache
            .driver()
            .hset(&presence_key(tenant()), "sock-2", "{broken")
            .await
            .unwrap();
        let all = presence.get_all(tenant()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "sock-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_decays_without_refresh() {
        let presence = presence();
        presence.set(tenant(), "sock-1", &entry()).await.unwrap();
        tokio::time::advance(Duration::from_secs(91)).await;
        assert!(presence.get_all(tenant()).await.unwrap().is_empty());
    }
}
