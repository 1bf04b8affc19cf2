//! Tenant lifecycle state machine
//!
//! Commands: provision, suspend, resume, archive, purge. Purge is terminal
//! and irreversible, only legal from Archived, and cascades the delete of
//! all tenant data. Every transition emits an event on the lifecycle topic.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::CacheService;
use crate::context::TenantId;
use crate::database::AppsRepo;
use crate::error::{Error, Result};

/// Pub/sub topic carrying lifecycle events
pub const LIFECYCLE_TOPIC: &str = "tenant:lifecycle";

static NAMESPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9-]*[a-z0-9]$").unwrap());

/// Minimum namespace length
pub const MIN_NAMESPACE_LEN: usize = 3;

/// Tenant states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantState {
    Active,
    Suspended,
    Archived,
}

impl TenantState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Archived => "archived",
        }
    }
}

/// A tenant application row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRecord {
    pub tenant_id: TenantId,
    pub namespace: String,
    pub name: String,
    pub status: TenantState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle commands; the `_tag` is the wire discriminator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum TenantCommand {
    Provision {
        namespace: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settings: Option<serde_json::Value>,
    },
    Suspend {
        tenant_id: Uuid,
    },
    Resume {
        tenant_id: Uuid,
    },
    Archive {
        tenant_id: Uuid,
    },
    Purge {
        tenant_id: Uuid,
    },
}

impl TenantCommand {
    /// Decode a command at the boundary; unknown tags are rejected
    pub fn decode(value: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::validation("command", e.to_string()))
    }
}

/// Event emitted on every transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantEvent {
    pub tenant_id: TenantId,
    pub action: String,
    pub at: DateTime<Utc>,
}

/// Validate a provision namespace
pub fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.len() < MIN_NAMESPACE_LEN {
        return Err(Error::validation(
            "namespace",
            format!("must be at least {MIN_NAMESPACE_LEN} characters"),
        ));
    }
    if !NAMESPACE_RE.is_match(namespace) {
        return Err(Error::validation(
            "namespace",
            "must match ^[a-z][a-z0-9-]*[a-z0-9]$",
        ));
    }
    Ok(())
}

/// The lifecycle service
#[derive(Clone)]
pub struct TenantLifecycle {
    apps: Arc<dyn AppsRepo>,
    cache: CacheService,
}

impl TenantLifecycle {
    pub fn new(apps: Arc<dyn AppsRepo>, cache: CacheService) -> Self {
        Self { apps, cache }
    }

    /// Apply one lifecycle command
    pub async fn handle(&self, command: TenantCommand) -> Result<TenantEvent> {
        match command {
            TenantCommand::Provision {
                namespace,
                name,
                settings,
            } => self.provision(namespace, name, settings).await,
            TenantCommand::Suspend { tenant_id } => {
                self.transition(tenant_id, TenantState::Suspended, "suspended", |state| {
                    matches!(state, TenantState::Active)
                })
                .await
            }
            TenantCommand::Resume { tenant_id } => {
                self.transition(tenant_id, TenantState::Active, "resumed", |state| {
                    matches!(state, TenantState::Suspended)
                })
                .await
            }
            TenantCommand::Archive { tenant_id } => {
                self.transition(tenant_id, TenantState::Archived, "archived", |state| {
                    matches!(state, TenantState::Active | TenantState::Suspended)
                })
                .await
            }
            TenantCommand::Purge { tenant_id } => self.purge(tenant_id).await,
        }
    }

    async fn provision(
        &self,
        namespace: String,
        name: String,
        settings: Option<serde_json::Value>,
    ) -> Result<TenantEvent> {
        validate_namespace(&namespace)?;
        if self.apps.find_by_namespace(&namespace).await?.is_some() {
            return Err(Error::conflict("tenant", "namespace taken"));
        }
        let now = Utc::now();
        let record = AppRecord {
            tenant_id: TenantId::new(Uuid::now_v7()),
            namespace,
            name,
            status: TenantState::Active,
            settings,
            created_at: now,
            updated_at: now,
        };
        let tenant_id = record.tenant_id;
        self.apps.insert(record).await?;
        self.emit(tenant_id, "provisioned").await
    }

    async fn transition(
        &self,
        tenant_id: Uuid,
        to: TenantState,
        action: &str,
        allowed_from: impl Fn(TenantState) -> bool,
    ) -> Result<TenantEvent> {
        let tenant = TenantId::new(tenant_id);
        let record = self
            .apps
            .get(tenant)
            .await?
            .ok_or_else(|| Error::not_found_id("tenant", tenant.to_string()))?;
        if !allowed_from(record.status) {
            return Err(Error::conflict(
                "tenant",
                format!("cannot {action} from {}", record.status.as_str()),
            ));
        }
        self.apps.set_status(tenant, to).await?;
        self.emit(tenant, action).await
    }

    async fn purge(&self, tenant_id: Uuid) -> Result<TenantEvent> {
        let tenant = TenantId::new(tenant_id);
        let record = self
            .apps
            .get(tenant)
            .await?
            .ok_or_else(|| Error::not_found_id("tenant", tenant.to_string()))?;
        if record.status != TenantState::Archived {
            return Err(Error::conflict(
                "tenant",
                format!("cannot purge from {}", record.status.as_str()),
            ));
        }
        self.apps.delete_cascade(tenant).await?;
        self.emit(tenant, "purged").await
    }

    async fn emit(&self, tenant_id: TenantId, action: &str) -> Result<TenantEvent> {
        let event = TenantEvent {
            tenant_id,
            action: action.to_string(),
            at: Utc::now(),
        };
        self.cache.publish(LIFECYCLE_TOPIC, &event).await?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryDriver;
    use crate::database::MemoryAppsRepo;

    fn lifecycle() -> (TenantLifecycle, Arc<MemoryAppsRepo>) {
        let apps = Arc::new(MemoryAppsRepo::new());
        let cache = CacheService::new(Arc::new(MemoryDriver::new()));
        (TenantLifecycle::new(apps.clone(), cache), apps)
    }

    async fn provision(lifecycle: &TenantLifecycle, namespace: &str) -> TenantEvent {
        lifecycle
            .handle(TenantCommand::Provision {
                namespace: namespace.to_string(),
                name: "Test App".to_string(),
                settings: None,
            })
            .await
            .unwrap()
    }

    #[test]
    fn test_namespace_validation() {
        assert!(validate_namespace("acme-corp").is_ok());
        assert!(validate_namespace("a2c").is_ok());
        assert!(validate_namespace("ab").is_err());
        assert!(validate_namespace("-bad").is_err());
        assert!(validate_namespace("bad-").is_err());
        assert!(validate_namespace("Bad").is_err());
        assert!(validate_namespace("with space").is_err());
    }

    #[test]
    fn test_unknown_command_tag_rejected() {
        let err =
            TenantCommand::decode(&serde_json::json!({"_tag": "explode", "tenantId": "x"}))
                .unwrap_err();
        assert_eq!(err.tag(), "Validation");
    }

    #[test]
    fn test_command_wire_shape() {
        let command = TenantCommand::decode(&serde_json::json!({
            "_tag": "suspend",
            "tenantId": "0198c6b2-7b44-7abc-8def-0123456789ab"
        }))
        .unwrap();
        assert!(matches!(command, TenantCommand::Suspend { .. }));
    }

    #[tokio::test]
    async fn test_provision_creates_active_tenant() {
        let (lifecycle, apps) = lifecycle();
        let event = provision(&lifecycle, "acme").await;
        assert_eq!(event.action, "provisioned");
        let rows = apps.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, TenantState::Active);
    }

    #[tokio::test]
    async fn test_duplicate_namespace_conflicts() {
        let (lifecycle, _) = lifecycle();
        provision(&lifecycle, "acme").await;
        let err = lifecycle
            .handle(TenantCommand::Provision {
                namespace: "acme".to_string(),
                name: "Again".to_string(),
                settings: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.tag(), "Conflict");
    }

    #[tokio::test]
    async fn test_full_lifecycle_path() {
        let (lifecycle, apps) = lifecycle();
        let event = provision(&lifecycle, "acme").await;
        let tenant = event.tenant_id.as_uuid();

        lifecycle
            .handle(TenantCommand::Suspend { tenant_id: tenant })
            .await
            .unwrap();
        assert_eq!(apps.rows()[0].status, TenantState::Suspended);

        lifecycle
            .handle(TenantCommand::Resume { tenant_id: tenant })
            .await
            .unwrap();
        assert_eq!(apps.rows()[0].status, TenantState::Active);

        lifecycle
            .handle(TenantCommand::Archive { tenant_id: tenant })
            .await
            .unwrap();
        assert_eq!(apps.rows()[0].status, TenantState::Archived);

        lifecycle
            .handle(TenantCommand::Purge { tenant_id: tenant })
            .await
            .unwrap();
        assert!(apps.rows().is_empty());
    }

    #[tokio::test]
    async fn test_purge_requires_archived() {
        let (lifecycle, _) = lifecycle();
        let event = provision(&lifecycle, "acme").await;
        let err = lifecycle
            .handle(TenantCommand::Purge {
                tenant_id: event.tenant_id.as_uuid(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.tag(), "Conflict");
    }

    #[tokio::test]
    async fn test_resume_requires_suspended() {
        let (lifecycle, _) = lifecycle();
        let event = provision(&lifecycle, "acme").await;
        let err = lifecycle
            .handle(TenantCommand::Resume {
                tenant_id: event.tenant_id.as_uuid(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.tag(), "Conflict");
    }

    #[tokio::test]
    async fn test_unknown_tenant_not_found() {
        let (lifecycle, _) = lifecycle();
        let err = lifecycle
            .handle(TenantCommand::Suspend {
                tenant_id: Uuid::new_v4(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.tag(), "NotFound");
    }

    #[tokio::test]
    async fn test_archive_from_suspended() {
        let (lifecycle, apps) = lifecycle();
        let event = provision(&lifecycle, "acme").await;
        let tenant = event.tenant_id.as_uuid();
        lifecycle
            .handle(TenantCommand::Suspend { tenant_id: tenant })
            .await
            .unwrap();
        lifecycle
            .handle(TenantCommand::Archive { tenant_id: tenant })
            .await
            .unwrap();
        assert_eq!(apps.rows()[0].status, TenantState::Archived);
    }

    #[tokio::test]
    async fn test_lifecycle_events_published() {
        use futures::StreamExt;
        let apps = Arc::new(MemoryAppsRepo::new());
        let cache = CacheService::new(Arc::new(MemoryDriver::new()));
        let lifecycle = TenantLifecycle::new(apps, cache.clone());

        let mut events = Box::pin(cache.subscribe::<TenantEvent>(LIFECYCLE_TOPIC).await.unwrap());
        let emitted = provision(&lifecycle, "acme").await;
        let received = events.next().await.unwrap();
        assert_eq!(received.tenant_id, emitted.tenant_id);
        assert_eq!(received.action, "provisioned");
    }
}
