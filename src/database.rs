//! External SQL-store collaborator
//!
//! The platform never talks to SQL directly; it declares the repository
//! surface it needs and receives an implementation from the composition
//! root. The in-memory implementations below back the test kit and local
//! development, and define the reference semantics every real backend must
//! match.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::audit::{AuditEntry, DeadLetterEntry};
use crate::context::TenantId;
use crate::error::{Error, Result};
use crate::tenant::{AppRecord, TenantState};

/// Dead letters kept per `type` before the oldest are evicted
pub const DLQ_CAP_PER_TYPE: usize = 500;

/// Tenant application records
#[async_trait]
pub trait AppsRepo: Send + Sync {
    async fn get(&self, tenant: TenantId) -> Result<Option<AppRecord>>;
    async fn find_by_namespace(&self, namespace: &str) -> Result<Option<AppRecord>>;
    async fn insert(&self, record: AppRecord) -> Result<()>;
    async fn set_status(&self, tenant: TenantId, status: TenantState) -> Result<()>;
    /// Remove the tenant and every row scoped to it
    async fn delete_cascade(&self, tenant: TenantId) -> Result<()>;
}

/// Durable audit rows
#[async_trait]
pub trait AuditRepo: Send + Sync {
    async fn insert(&self, entry: AuditEntry) -> Result<()>;
}

/// Dead-letter queue, bounded per type
#[async_trait]
pub trait JobDlqRepo: Send + Sync {
    async fn push(&self, entry: DeadLetterEntry) -> Result<()>;
    /// Pending (unreplayed) entries whose type starts with the prefix
    async fn take_pending(&self, type_prefix: &str, limit: usize) -> Result<Vec<DeadLetterEntry>>;
    async fn mark_replayed(&self, id: &str) -> Result<()>;
    async fn size(&self) -> Result<u64>;
}

/// Background job queue introspection
#[async_trait]
pub trait JobsRepo: Send + Sync {
    async fn queue_depth(&self) -> Result<u64>;
}

/// Operational counters surfaced to the polling supervisor
#[async_trait]
pub trait ObservabilityRepo: Send + Sync {
    async fn event_outbox_depth(&self) -> Result<u64>;
    async fn io_stats(&self) -> Result<u64>;
}

/// Durable key-value rows (alert state, breaker snapshots at rest)
#[async_trait]
pub trait KvStoreRepo: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// The full collaborator surface
pub trait Database: Send + Sync {
    fn apps(&self) -> Arc<dyn AppsRepo>;
    fn audit(&self) -> Arc<dyn AuditRepo>;
    fn job_dlq(&self) -> Arc<dyn JobDlqRepo>;
    fn jobs(&self) -> Arc<dyn JobsRepo>;
    fn observability(&self) -> Arc<dyn ObservabilityRepo>;
    fn kv_store(&self) -> Arc<dyn KvStoreRepo>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

macro_rules! fail_check {
    ($self:ident) => {
        if $self.failing.load(Ordering::SeqCst) {
            return Err(Error::infra("injected store failure"));
        }
    };
}

/// In-memory apps table
#[derive(Default)]
pub struct MemoryAppsRepo {
    rows: Mutex<HashMap<TenantId, AppRecord>>,
    failing: AtomicBool,
}

impl MemoryAppsRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<AppRecord> {
        lock(&self.rows).values().cloned().collect()
    }
}

#[async_trait]
impl AppsRepo for MemoryAppsRepo {
    async fn get(&self, tenant: TenantId) -> Result<Option<AppRecord>> {
        fail_check!(self);
        Ok(lock(&self.rows).get(&tenant).cloned())
    }

    async fn find_by_namespace(&self, namespace: &str) -> Result<Option<AppRecord>> {
        fail_check!(self);
        Ok(lock(&self.rows)
            .values()
            .find(|row| row.namespace == namespace)
            .cloned())
    }

    async fn insert(&self, record: AppRecord) -> Result<()> {
        fail_check!(self);
        let mut rows = lock(&self.rows);
        if rows.contains_key(&record.tenant_id) {
            return Err(Error::conflict("app", "tenant exists"));
        }
        rows.insert(record.tenant_id, record);
        Ok(())
    }

    async fn set_status(&self, tenant: TenantId, status: TenantState) -> Result<()> {
        fail_check!(self);
        let mut rows = lock(&self.rows);
        let row = rows
            .get_mut(&tenant)
            .ok_or_else(|| Error::not_found_id("app", tenant.to_string()))?;
        row.status = status;
        row.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn delete_cascade(&self, tenant: TenantId) -> Result<()> {
        fail_check!(self);
        lock(&self.rows).remove(&tenant);
        Ok(())
    }
}

/// In-memory audit table
#[derive(Default)]
pub struct MemoryAuditRepo {
    rows: Mutex<Vec<AuditEntry>>,
    failing: AtomicBool,
}

impl MemoryAuditRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        lock(&self.rows).clone()
    }
}

#[async_trait]
impl AuditRepo for MemoryAuditRepo {
    async fn insert(&self, entry: AuditEntry) -> Result<()> {
        fail_check!(self);
        lock(&self.rows).push(entry);
        Ok(())
    }
}

/// In-memory dead-letter queue
#[derive(Default)]
pub struct MemoryJobDlqRepo {
    rows: Mutex<Vec<DeadLetterEntry>>,
    failing: AtomicBool,
}

impl MemoryJobDlqRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Unreplayed entries, oldest first
    pub fn pending(&self) -> Vec<DeadLetterEntry> {
        lock(&self.rows)
            .iter()
            .filter(|row| row.replayed_at.is_none())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl JobDlqRepo for MemoryJobDlqRepo {
    async fn push(&self, entry: DeadLetterEntry) -> Result<()> {
        fail_check!(self);
        let mut rows = lock(&self.rows);
        let same_type = rows
            .iter()
            .filter(|row| row.entry_type == entry.entry_type && row.replayed_at.is_none())
            .count();
        if same_type >= DLQ_CAP_PER_TYPE {
            // Evict the oldest pending entry of this type.
            if let Some(pos) = rows
                .iter()
                .position(|row| row.entry_type == entry.entry_type && row.replayed_at.is_none())
            {
                rows.remove(pos);
            }
        }
        rows.push(entry);
        Ok(())
    }

    async fn take_pending(&self, type_prefix: &str, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        fail_check!(self);
        Ok(lock(&self.rows)
            .iter()
            .filter(|row| row.replayed_at.is_none() && row.entry_type.starts_with(type_prefix))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_replayed(&self, id: &str) -> Result<()> {
        fail_check!(self);
        let mut rows = lock(&self.rows);
        let row = rows
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or_else(|| Error::not_found_id("dead_letter", id))?;
        row.replayed_at = Some(chrono::Utc::now());
        Ok(())
    }

    async fn size(&self) -> Result<u64> {
        fail_check!(self);
        Ok(lock(&self.rows)
            .iter()
            .filter(|row| row.replayed_at.is_none())
            .count() as u64)
    }
}

/// In-memory jobs counter
#[derive(Default)]
pub struct MemoryJobsRepo {
    depth: AtomicU64,
    failing: AtomicBool,
}

impl MemoryJobsRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.depth.store(depth, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobsRepo for MemoryJobsRepo {
    async fn queue_depth(&self) -> Result<u64> {
        fail_check!(self);
        Ok(self.depth.load(Ordering::SeqCst))
    }
}

/// In-memory observability counters
#[derive(Default)]
pub struct MemoryObservabilityRepo {
    outbox_depth: AtomicU64,
    io_stats: AtomicU64,
    failing: AtomicBool,
}

impl MemoryObservabilityRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_outbox_depth(&self, depth: u64) {
        self.outbox_depth.store(depth, Ordering::SeqCst);
    }

    pub fn set_io_stats(&self, value: u64) {
        self.io_stats.store(value, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObservabilityRepo for MemoryObservabilityRepo {
    async fn event_outbox_depth(&self) -> Result<u64> {
        fail_check!(self);
        Ok(self.outbox_depth.load(Ordering::SeqCst))
    }

    async fn io_stats(&self) -> Result<u64> {
        fail_check!(self);
        Ok(self.io_stats.load(Ordering::SeqCst))
    }
}

/// In-memory kv rows
#[derive(Default)]
pub struct MemoryKvStoreRepo {
    rows: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
}

impl MemoryKvStoreRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl KvStoreRepo for MemoryKvStoreRepo {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        fail_check!(self);
        Ok(lock(&self.rows).get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        fail_check!(self);
        lock(&self.rows).insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        fail_check!(self);
        lock(&self.rows).remove(key);
        Ok(())
    }
}

/// Aggregate in-memory database for tests and local development
#[derive(Default)]
pub struct MemoryDatabase {
    pub apps: Arc<MemoryAppsRepo>,
    pub audit: Arc<MemoryAuditRepo>,
    pub job_dlq: Arc<MemoryJobDlqRepo>,
    pub jobs: Arc<MemoryJobsRepo>,
    pub observability: Arc<MemoryObservabilityRepo>,
    pub kv_store: Arc<MemoryKvStoreRepo>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Database for MemoryDatabase {
    fn apps(&self) -> Arc<dyn AppsRepo> {
        self.apps.clone()
    }

    fn audit(&self) -> Arc<dyn AuditRepo> {
        self.audit.clone()
    }

    fn job_dlq(&self) -> Arc<dyn JobDlqRepo> {
        self.job_dlq.clone()
    }

    fn jobs(&self) -> Arc<dyn JobsRepo> {
        self.jobs.clone()
    }

    fn observability(&self) -> Arc<dyn ObservabilityRepo> {
        self.observability.clone()
    }

    fn kv_store(&self) -> Arc<dyn KvStoreRepo> {
        self.kv_store.clone()
    }
}
