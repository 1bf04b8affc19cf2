//! Ambient per-request context with tenant isolation
//!
//! A [`RequestContext`] is created once at request ingress (or by a scheduler
//! for system work), flows immutably through the call graph via tokio
//! task-local storage, and is destroyed when the response is written. Any
//! operation awaited inside a [`within`] scope observes the enclosing
//! context; the child context never escapes the scoped future.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// HTTP header and field names, stable strings
pub mod headers {
    pub const REQUEST_ID: &str = "x-request-id";
    pub const TENANT_ID: &str = "x-tenant-id";
    pub const APP_ID: &str = "x-app-id";
    pub const SESSION_ID: &str = "x-session-id";
    pub const RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
    pub const RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
    pub const RATELIMIT_RESET: &str = "x-ratelimit-reset";
    pub const CSRF: &str = "x-requested-with";
    pub const IDEMPOTENCY_KEY: &str = "idempotency-key";
}

/// 128-bit tenant identifier
///
/// Two sentinels exist: [`TenantId::SYSTEM`] for background fibers that cross
/// tenants deliberately, and [`TenantId::UNSPECIFIED`], a deny sentinel that
/// must fail every scope check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

impl TenantId {
    /// Synthetic tenant for cross-tenant background work
    pub const SYSTEM: TenantId = TenantId(Uuid::from_u128(1));

    /// Deny sentinel; reads and writes under this tenant must fail
    pub const UNSPECIFIED: TenantId = TenantId(Uuid::nil());

    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn is_system(&self) -> bool {
        *self == Self::SYSTEM
    }

    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }

    /// Fails with `Forbidden` when the deny sentinel is observed
    pub fn require_specified(&self) -> Result<TenantId> {
        if self.is_unspecified() {
            Err(Error::forbidden("unspecified tenant"))
        } else {
            Ok(*self)
        }
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TenantId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::validation("tenant_id", "not a UUID"))
    }
}

/// 128-bit correlation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn new(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::validation("request_id", "not a UUID"))
    }
}

/// Authenticated session attached to a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub app_id: TenantId,
    pub mfa_enabled: bool,
    pub verified_at: Option<DateTime<Utc>>,
}

/// Cluster placement, present only inside cluster-hosted handlers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub entity_id: String,
    pub entity_type: String,
    pub runner_id: Option<String>,
    pub shard_id: Option<u32>,
    pub is_leader: bool,
}

/// Rate-limit accounting carried for header injection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: u32,
    /// May go negative under races; clamped to `[0, limit]` at the boundary
    pub remaining: i64,
    pub reset_after_secs: u64,
    pub delay_ms: u64,
}

/// Circuit annotation set by the resilience layer so child spans can tag
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitContext {
    pub name: String,
    pub state: &'static str,
}

/// Immutable per-request state
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub tenant_id: TenantId,
    pub request_id: RequestId,
    pub session: Option<Session>,
    pub cluster: Option<ClusterInfo>,
    pub rate_limit: Option<RateLimitInfo>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub app_namespace: Option<String>,
    pub circuit: Option<CircuitContext>,
}

impl RequestContext {
    /// Well-formed default for background work: no session, no cluster, no
    /// rate limit.
    pub fn system(request_id: RequestId, tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            request_id,
            session: None,
            cluster: None,
            rate_limit: None,
            ip_address: None,
            user_agent: None,
            app_namespace: None,
            circuit: None,
        }
    }

    /// Check the cross-field invariants
    ///
    /// A session may only be attached to the tenant it belongs to.
    pub fn validate(&self) -> Result<()> {
        if let Some(session) = &self.session {
            if session.app_id != self.tenant_id {
                return Err(Error::forbidden("session tenant mismatch"));
            }
        }
        Ok(())
    }

    /// Flat correlation attributes for telemetry
    ///
    /// Always carries `request.id` and `tenant.id`; `session.mfa` when a
    /// session is present. The raw identity attributes `session.id` and
    /// `user.id` are PII-sensitive and deliberately excluded; call sites that
    /// need them emit them explicitly.
    pub fn to_attrs(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        attrs.insert("request.id".to_string(), self.request_id.to_string());
        attrs.insert("tenant.id".to_string(), self.tenant_id.to_string());
        if let Some(session) = &self.session {
            attrs.insert(
                "session.mfa".to_string(),
                if session.mfa_enabled { "true" } else { "false" }.to_string(),
            );
        }
        if let Some(circuit) = &self.circuit {
            attrs.insert("circuit.name".to_string(), circuit.name.clone());
            attrs.insert("circuit.state".to_string(), circuit.state.to_string());
        }
        attrs
    }
}

/// Seed values for a child context created by [`within`]
///
/// Unset fields fall back to the [`RequestContext::system`] defaults.
#[derive(Debug, Clone, Default)]
pub struct ContextOverrides {
    pub request_id: Option<RequestId>,
    pub session: Option<Session>,
    pub cluster: Option<ClusterInfo>,
    pub rate_limit: Option<RateLimitInfo>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub app_namespace: Option<String>,
}

tokio::task_local! {
    static CURRENT: RequestContext;
}

/// Run `op` under a child context scoped to the given tenant
///
/// The child context exists only for the duration of `op`; descendants of
/// `op` observe it through [`current`] and friends.
pub async fn within<F, T>(tenant_id: TenantId, overrides: ContextOverrides, op: F) -> T
where
    F: Future<Output = T>,
{
    let request_id = overrides.request_id.unwrap_or_else(RequestId::generate);
    let ctx = RequestContext {
        tenant_id,
        request_id,
        session: overrides.session,
        cluster: overrides.cluster,
        rate_limit: overrides.rate_limit,
        ip_address: overrides.ip_address,
        user_agent: overrides.user_agent,
        app_namespace: overrides.app_namespace,
        circuit: None,
    };
    CURRENT.scope(ctx, op).await
}

/// Run `op` under a fully-formed context (request ingress)
pub async fn scope<F, T>(ctx: RequestContext, op: F) -> T
where
    F: Future<Output = T>,
{
    CURRENT.scope(ctx, op).await
}

/// Run `op` with cluster placement attached to the enclosing context
pub async fn within_cluster<F, T>(info: ClusterInfo, op: F) -> T
where
    F: Future<Output = T>,
{
    let mut ctx = current().unwrap_or_else(|| {
        RequestContext::system(RequestId::generate(), TenantId::SYSTEM)
    });
    ctx.cluster = Some(info);
    CURRENT.scope(ctx, op).await
}

/// Run `op` with a circuit annotation attached to the enclosing context
pub(crate) async fn with_circuit<F, T>(name: &str, state: &'static str, op: F) -> T
where
    F: Future<Output = T>,
{
    let mut ctx = current().unwrap_or_else(|| {
        RequestContext::system(RequestId::generate(), TenantId::SYSTEM)
    });
    ctx.circuit = Some(CircuitContext {
        name: name.to_string(),
        state,
    });
    CURRENT.scope(ctx, op).await
}

/// The enclosing context, if any
pub fn current() -> Option<RequestContext> {
    CURRENT.try_with(|ctx| ctx.clone()).ok()
}

/// The enclosing tenant; the deny sentinel when no scope is active
pub fn current_tenant_id() -> TenantId {
    CURRENT
        .try_with(|ctx| ctx.tenant_id)
        .unwrap_or(TenantId::UNSPECIFIED)
}

/// The enclosing session, if any
pub fn session() -> Option<Session> {
    CURRENT.try_with(|ctx| ctx.session.clone()).ok().flatten()
}

/// The enclosing session, or `Auth` when absent
pub fn session_or_fail() -> Result<Session> {
    session().ok_or_else(|| Error::auth("Missing session"))
}

/// Cluster placement, or `Infra` when called outside a cluster handler
pub fn cluster_state() -> Result<ClusterInfo> {
    CURRENT
        .try_with(|ctx| ctx.cluster.clone())
        .ok()
        .flatten()
        .ok_or_else(|| Error::infra("ClusterContextRequired"))
}
