//! Durable audit log with dead-letter fallback and replay
//!
//! Every audit write is attributed to the ambient request context. When the
//! store rejects a write, the entry's fate depends on its class: security
//! events must never be lost and always dead-letter, best-effort events
//! marked `silent` are dropped, and everything else dead-letters for later
//! replay.

pub mod dlq;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::context::{self, TenantId};
use crate::database::{AuditRepo, JobDlqRepo};
use crate::error::{Error, Result};
pub use dlq::{DeadLetterEntry, ReplayOutcome};

/// Target type for bare (undotted) operation names
pub const SECURITY_TARGET: &str = "security";

/// Before/after snapshot pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub old: serde_json::Value,
    pub new: serde_json::Value,
}

/// A persisted audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub app_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub operation: String,
    pub target_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Delta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_agent: Option<String>,
    pub request_id: String,
    pub silent: bool,
    pub created_at: DateTime<Utc>,
}

/// Options for one audit write
#[derive(Debug, Clone, Default)]
pub struct AuditOptions {
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub subject_id: Option<String>,
    pub details: Option<serde_json::Value>,
    /// Best-effort event: dropped silently on persistence failure
    pub silent: bool,
}

/// Split a dotted operation name into `(target_type, operation)`
///
/// `"app.update"` becomes `("app", "update")`; a bare name falls back to the
/// security target.
pub fn split_operation(name: &str) -> (String, String) {
    match name.split_once('.') {
        Some((target, operation)) if !target.is_empty() && !operation.is_empty() => {
            (target.to_string(), operation.to_string())
        }
        _ => (SECURITY_TARGET.to_string(), name.to_string()),
    }
}

/// The audit service
#[derive(Clone)]
pub struct AuditService {
    repo: Arc<dyn AuditRepo>,
    dlq: Arc<dyn JobDlqRepo>,
}

impl AuditService {
    pub fn new(repo: Arc<dyn AuditRepo>, dlq: Arc<dyn JobDlqRepo>) -> Self {
        Self { repo, dlq }
    }

    /// Write one audit entry, attributed to the ambient context
    pub async fn log(&self, operation: &str, options: AuditOptions) -> Result<()> {
        let (target_type, op) = split_operation(operation);
        let ctx = context::current();
        let delta = match (options.before, options.after) {
            (Some(old), Some(new)) => Some(Delta { old, new }),
            _ => None,
        };

        let entry = AuditEntry {
            app_id: ctx
                .as_ref()
                .map(|c| c.tenant_id)
                .unwrap_or(TenantId::UNSPECIFIED),
            user_id: ctx
                .as_ref()
                .and_then(|c| c.session.as_ref())
                .map(|s| s.user_id.clone()),
            operation: op.clone(),
            target_type: target_type.clone(),
            target_id: options.subject_id,
            delta,
            details: options.details,
            context_ip: ctx.as_ref().and_then(|c| c.ip_address.clone()),
            context_agent: ctx.as_ref().and_then(|c| c.user_agent.clone()),
            request_id: ctx
                .as_ref()
                .map(|c| c.request_id.to_string())
                .unwrap_or_default(),
            silent: options.silent,
            created_at: Utc::now(),
        };

        match self.repo.insert(entry.clone()).await {
            Ok(()) => Ok(()),
            Err(err) => self.handle_failure(entry, err).await,
        }
    }

    async fn handle_failure(&self, entry: AuditEntry, err: Error) -> Result<()> {
        let is_security = entry.target_type == SECURITY_TARGET;
        if entry.silent && !is_security {
            tracing::debug!(
                operation = %entry.operation,
                error = %err,
                "dropping best-effort audit entry"
            );
            return Ok(());
        }

        let payload = serde_json::to_value(&entry)
            .map_err(|e| Error::internal_with_cause("audit encode failed", e.to_string()))?;
        let dead_letter = DeadLetterEntry::new(
            format!("audit.{}", entry.operation),
            payload,
            err.to_string(),
        );
        match self.dlq.push(dead_letter).await {
            Ok(()) => {
                tracing::warn!(
                    operation = %entry.operation,
                    target = %entry.target_type,
                    "audit write dead-lettered"
                );
                Ok(())
            }
            Err(dlq_err) if is_security => {
                // A security event with nowhere to go is a hard failure.
                Err(dlq_err)
            }
            Err(dlq_err) => {
                tracing::error!(
                    operation = %entry.operation,
                    error = %dlq_err,
                    "audit dead-letter failed; entry lost"
                );
                Ok(())
            }
        }
    }

    /// Replay up to `limit` parked audit entries
    ///
    /// Valid payloads are re-persisted and marked replayed. Invalid payloads
    /// are consumed and counted as failed so they cannot poison the queue.
    pub async fn replay_dead_letters(&self, limit: usize) -> Result<ReplayOutcome> {
        let pending = self.dlq.take_pending("audit.", limit).await?;
        if pending.is_empty() {
            return Ok(ReplayOutcome::skipped());
        }

        let mut replayed = 0u32;
        let mut failed = 0u32;
        for dead_letter in pending {
            match serde_json::from_value::<AuditEntry>(dead_letter.payload.clone()) {
                Ok(entry) => match self.repo.insert(entry).await {
                    Ok(()) => {
                        self.dlq.mark_replayed(&dead_letter.id).await?;
                        replayed += 1;
                    }
                    Err(err) => {
                        tracing::warn!(
                            id = %dead_letter.id,
                            error = %err,
                            "audit replay re-insert failed"
                        );
                        self.dlq.mark_replayed(&dead_letter.id).await?;
                        failed += 1;
                    }
                },
                Err(err) => {
                    tracing::warn!(
                        id = %dead_letter.id,
                        error = %err,
                        "audit replay payload undecodable"
                    );
                    self.dlq.mark_replayed(&dead_letter.id).await?;
                    failed += 1;
                }
            }
        }
        Ok(ReplayOutcome {
            replayed,
            failed,
            skipped: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextOverrides;
    use crate::database::{MemoryAuditRepo, MemoryJobDlqRepo};
    use std::future::Future;
    use uuid::Uuid;

    fn service() -> (AuditService, Arc<MemoryAuditRepo>, Arc<MemoryJobDlqRepo>) {
        let repo = Arc::new(MemoryAuditRepo::new());
        let dlq = Arc::new(MemoryJobDlqRepo::new());
        (AuditService::new(repo.clone(), dlq.clone()), repo, dlq)
    }

    fn tenant() -> TenantId {
        TenantId::new(Uuid::from_u128(0x42))
    }

    async fn scoped<T>(op: impl Future<Output = T>) -> T {
        context::within(tenant(), ContextOverrides::default(), op).await
    }

    #[test]
    fn test_split_operation() {
        assert_eq!(
            split_operation("app.update"),
            ("app".to_string(), "update".to_string())
        );
        assert_eq!(
            split_operation("login"),
            ("security".to_string(), "login".to_string())
        );
        assert_eq!(
            split_operation(".odd"),
            ("security".to_string(), ".odd".to_string())
        );
    }

    #[tokio::test]
    async fn test_log_persists_with_context_attribution() {
        let (service, repo, _) = service();
        scoped(service.log("app.update", AuditOptions::default()))
            .await
            .unwrap();
        let entries = repo.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].target_type, "app");
        assert_eq!(entries[0].operation, "update");
        assert_eq!(entries[0].app_id, tenant());
        assert!(!entries[0].request_id.is_empty());
    }

    #[tokio::test]
    async fn test_delta_requires_both_sides() {
        let (service, repo, _) = service();
        scoped(service.log(
            "doc.update",
            AuditOptions {
                before: Some(serde_json::json!({"v": 1})),
                after: Some(serde_json::json!({"v": 2})),
                ..Default::default()
            },
        ))
        .await
        .unwrap();
        scoped(service.log(
            "doc.update",
            AuditOptions {
                after: Some(serde_json::json!({"v": 3})),
                ..Default::default()
            },
        ))
        .await
        .unwrap();

        let entries = repo.entries();
        assert!(entries[0].delta.is_some());
        assert!(entries[1].delta.is_none());
    }

    #[tokio::test]
    async fn test_persistence_failure_dead_letters() {
        let (service, repo, dlq) = service();
        repo.set_failing(true);
        scoped(service.log("app.update", AuditOptions::default()))
            .await
            .unwrap();
        let parked = dlq.pending();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].entry_type, "audit.update");
    }

    #[tokio::test]
    async fn test_silent_non_security_drops() {
        let (service, repo, dlq) = service();
        repo.set_failing(true);
        scoped(service.log(
            "app.viewed",
            AuditOptions {
                silent: true,
                ..Default::default()
            },
        ))
        .await
        .unwrap();
        assert!(dlq.pending().is_empty());
    }

    #[tokio::test]
    async fn test_silent_security_still_dead_letters() {
        let (service, repo, dlq) = service();
        repo.set_failing(true);
        scoped(service.log(
            "login",
            AuditOptions {
                silent: true,
                ..Default::default()
            },
        ))
        .await
        .unwrap();
        assert_eq!(dlq.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_security_fails_hard_when_dlq_is_down() {
        let (service, repo, dlq) = service();
        repo.set_failing(true);
        dlq.set_failing(true);
        let result = scoped(service.log("login", AuditOptions::default())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_replay_accounting() {
        let (service, repo, dlq) = service();

        // One valid parked entry, one poison payload.
        repo.set_failing(true);
        scoped(service.log("app.update", AuditOptions::default()))
            .await
            .unwrap();
        repo.set_failing(false);
        dlq.push(DeadLetterEntry::new(
            "audit.update",
            serde_json::json!({"bad": true}),
            "seed",
        ))
        .await
        .unwrap();

        let outcome = service.replay_dead_letters(10).await.unwrap();
        assert_eq!(outcome.replayed, 1);
        assert_eq!(outcome.failed, 1);
        assert!(!outcome.skipped);
        assert_eq!(repo.entries().len(), 1);

        // Queue is now drained.
        let outcome = service.replay_dead_letters(10).await.unwrap();
        assert!(outcome.skipped);
    }
}
