//! Exactly-once mutation gate with body-hash binding
//!
//! A client-supplied `Idempotency-Key` binds a mutation to its result. The
//! record is acquired with a set-NX under
//! `idem:<tenantId>:<resource>:<action>:<key>`, the request body is bound
//! through a SHA-256 of its canonical (sorted-key) JSON, and completed
//! results replay without re-invoking the handler. Handler failure deletes
//! the record: there is no negative caching.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::Duration;

use crate::cache::{CacheService, RedisDriver};
use crate::context::{self, TenantId};
use crate::error::{Error, Result};

/// Records live for a day
pub const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Maximum accepted key length, in UTF-8 bytes
pub const MAX_KEY_LEN: usize = 128;

/// Record key under the `idem:` namespace
pub fn record_key(tenant: TenantId, resource: &str, action: &str, key: &str) -> String {
    format!("idem:{tenant}:{resource}:{action}:{key}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RecordStatus {
    Pending,
    Completed,
}

/// Stored idempotency record; the schema is stable and serialized
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdempotencyRecord {
    status: RecordStatus,
    body_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
}

/// Canonical JSON: object keys sorted recursively, no whitespace
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn write(value: &serde_json::Value, out: &mut String) {
        match value {
            serde_json::Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap_or_default());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            serde_json::Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

/// SHA-256 hex of the canonical body
pub fn body_hash(body: &serde_json::Value) -> String {
    hex::encode(Sha256::digest(canonical_json(body).as_bytes()))
}

/// The gate service
#[derive(Clone)]
pub struct IdempotencyGate {
    cache: CacheService,
}

impl IdempotencyGate {
    pub fn new(cache: CacheService) -> Self {
        Self { cache }
    }

    /// Run a mutation exactly once per `(tenant, resource, action, key)`
    ///
    /// Replay with a matching body returns the cached result without
    /// invoking the handler; a mismatched body or an in-flight twin yields
    /// `Conflict`.
    pub async fn execute<T, F, Fut>(
        &self,
        resource: &str,
        action: &str,
        key: &str,
        body: &serde_json::Value,
        handler: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(Error::validation(
                "idempotency_key",
                format!("must be 1..={MAX_KEY_LEN} bytes"),
            ));
        }
        let tenant = context::current_tenant_id().require_specified()?;
        let cache_key = record_key(tenant, resource, action, key);
        let hash = body_hash(body);

        let pending = IdempotencyRecord {
            status: RecordStatus::Pending,
            body_hash: hash.clone(),
            result: None,
            completed_at: None,
        };
        let raw = serde_json::to_string(&pending)
            .map_err(|e| Error::internal_with_cause("idempotency encode failed", e.to_string()))?;
        let acquired = self
            .cache
            .driver()
            .set_nx(&cache_key, &raw, Some(IDEMPOTENCY_TTL))
            .await?;

        if acquired {
            return match handler().await {
                Ok(result) => {
                    let value = serde_json::to_value(&result).map_err(|e| {
                        Error::internal_with_cause("idempotency encode failed", e.to_string())
                    })?;
                    let completed = IdempotencyRecord {
                        status: RecordStatus::Completed,
                        body_hash: hash,
                        result: Some(value),
                        completed_at: Some(Utc::now()),
                    };
                    let raw = serde_json::to_string(&completed).map_err(|e| {
                        Error::internal_with_cause("idempotency encode failed", e.to_string())
                    })?;
                    self.cache
                        .driver()
                        .set(&cache_key, &raw, Some(IDEMPOTENCY_TTL))
                        .await?;
                    Ok(result)
                }
                Err(err) => {
                    // No negative caching: a failed mutation may be retried.
                    let _ = self.cache.driver().del(&cache_key).await;
                    Err(err)
                }
            };
        }

        let existing = self
            .cache
            .driver()
            .get(&cache_key)
            .await?
            .ok_or_else(|| Error::conflict("idempotency", "in_flight"))?;
        let record: IdempotencyRecord = serde_json::from_str(&existing)
            .map_err(|e| Error::internal_with_cause("idempotency decode failed", e.to_string()))?;

        match record.status {
            RecordStatus::Completed if record.body_hash == hash => {
                let value = record
                    .result
                    .ok_or_else(|| Error::internal("completed record without result"))?;
                serde_json::from_value(value).map_err(|e| {
                    Error::internal_with_cause("idempotency replay decode failed", e.to_string())
                })
            }
            RecordStatus::Completed => Err(Error::conflict("idempotency", "body_mismatch")),
            RecordStatus::Pending => Err(Error::conflict("idempotency", "in_flight")),
        }
    }
}
