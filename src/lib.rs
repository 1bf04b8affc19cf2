//! # portal-platform
//!
//! Server platform runtime for a multi-tenant SaaS portal: the cross-cutting
//! infrastructure every HTTP/WebSocket handler consumes without wiring it up.
//!
//! ## Features
//!
//! - **Ambient request context**: tenant-scoped, task-local, immutable
//! - **Tagged errors**: internal taxonomy with boundary collapse to a stable
//!   `{_tag, message}` wire catalog
//! - **Resilience**: timeout / retry / circuit / bulkhead / hedge / fallback
//!   as one combinator
//! - **Two-tier cache**: Redis KV + sets + pub/sub with an in-process key
//!   registry and cross-node pattern invalidation
//! - **Idempotency**: exactly-once mutation gate with body-hash binding
//! - **WebSocket fabric**: codec, presence, rooms, cross-node routing, reaper
//! - **Audit**: durable log with dead-letter fallback and replay
//! - **Polling supervisor**: health probes with alert hysteresis
//!
//! ## Example
//!
//! ```rust,no_run
//! use portal_platform::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> portal_platform::error::Result<()> {
//!     let config = PlatformConfig::load()?;
//!     init_tracing(&config)?;
//!
//!     let driver = Arc::new(MemoryDriver::new());
//!     let cache = CacheService::new(driver.clone());
//!     let resilience = Resilience::with_store(driver);
//!
//!     let value = context::within(TenantId::SYSTEM, Default::default(), async {
//!         resilience
//!             .run("warmup", RunOptions::default(), || async { Ok(1) })
//!             .await
//!     })
//!     .await?;
//!     assert_eq!(value, 1);
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod cache;
pub mod config;
pub mod context;
pub mod crypto;
pub mod database;
pub mod error;
pub mod idempotency;
pub mod metrics;
pub mod middleware;
pub mod poller;
pub mod resilience;
pub mod telemetry;
pub mod tenant;
pub mod ws;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::audit::{AuditOptions, AuditService, ReplayOutcome};
    pub use crate::cache::{
        presence::{Presence, PresenceEntry},
        CacheHealth, CacheService, MemoryDriver, RedisDriver, RedisPoolDriver,
    };
    pub use crate::config::{DeploymentMode, PlatformConfig, RuntimeProjection};
    pub use crate::context::{
        self, ClusterInfo, ContextOverrides, RequestContext, RequestId, Session, TenantId,
    };
    pub use crate::crypto::KeyRing;
    pub use crate::database::{Database, MemoryDatabase};
    pub use crate::error::{map_to, BoundaryError, Error, Result};
    pub use crate::idempotency::IdempotencyGate;
    pub use crate::poller::PollingSupervisor;
    pub use crate::resilience::{
        BreakerConfig, BreakerPolicy, Resilience, RetryPreset, RunOptions,
    };
    pub use crate::telemetry::{
        init_tracing, resolve_exporters, route_span, span, ResolvedTelemetry, SpanOptions,
    };
    pub use crate::tenant::{TenantCommand, TenantLifecycle};
    pub use crate::ws::{WsService, WsSettings};
}
