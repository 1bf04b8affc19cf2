//! Polling health supervisor with alert hysteresis
//!
//! A fixed set of probes reads operational depths from the store, compares
//! them to thresholds, and publishes state *changes* only: entering warning
//! or critical publishes that action on the probe's aggregate channel,
//! leaving any alert state publishes `recovered`, and an identical state
//! publishes nothing. Persisted alert state lives at the `alerts` KV key,
//! shadowed in memory so health stays queryable through store outages.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheService, RedisDriver};
use crate::database::Database;
use crate::error::Result;
use crate::metrics;

/// KV key holding persisted alert state
pub const ALERTS_KEY: &str = "alerts";

/// Default staleness factor over a probe's minimum interval
pub const DEFAULT_STALE_MULTIPLIER: u32 = 2;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Normal,
    Warning,
    Critical,
}

impl AlertLevel {
    fn action(&self) -> Option<&'static str> {
        match self {
            Self::Normal => None,
            Self::Warning => Some("warning"),
            Self::Critical => Some("critical"),
        }
    }
}

/// One probe definition
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    pub name: &'static str,
    /// Aggregate identifier, also the publish channel
    pub alert_id: &'static str,
    pub warning: f64,
    pub critical: f64,
    pub min_interval: Duration,
}

/// The standard probe set
pub fn default_probes() -> Vec<ProbeSpec> {
    vec![
        ProbeSpec {
            name: "dlq_size",
            alert_id: "jobs_dlq_size",
            warning: 10.0,
            critical: 100.0,
            min_interval: Duration::from_secs(30),
        },
        ProbeSpec {
            name: "job_queue_depth",
            alert_id: "jobs_queue_depth",
            warning: 100.0,
            critical: 1_000.0,
            min_interval: Duration::from_secs(30),
        },
        ProbeSpec {
            name: "event_outbox_depth",
            alert_id: "events_outbox_depth",
            warning: 100.0,
            critical: 1_000.0,
            min_interval: Duration::from_secs(30),
        },
        ProbeSpec {
            name: "io_stats",
            alert_id: "io_stats",
            warning: 1_000.0,
            critical: 10_000.0,
            min_interval: Duration::from_secs(60),
        },
    ]
}

/// Event published on a probe's aggregate channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub action: String,
    pub probe: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub at: chrono::DateTime<Utc>,
}

/// Persisted alert record (the `alerts` key holds an array of these)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlertRecord {
    alert_id: String,
    level: AlertLevel,
}

/// One probe's view in a health snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeStatus {
    pub name: &'static str,
    pub alert_id: &'static str,
    pub value: Option<f64>,
    pub level: AlertLevel,
    pub stale: bool,
}

/// Aggregate health view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub probes: Vec<ProbeStatus>,
}

#[derive(Default)]
struct SupervisorState {
    levels: BTreeMap<String, AlertLevel>,
    last_run: HashMap<&'static str, Instant>,
    last_success: HashMap<&'static str, Instant>,
    last_failure: HashMap<&'static str, Instant>,
    last_value: HashMap<&'static str, f64>,
}

/// The supervisor
pub struct PollingSupervisor {
    db: Arc<dyn Database>,
    cache: CacheService,
    probes: Vec<ProbeSpec>,
    stale_multiplier: u32,
    state: Mutex<SupervisorState>,
}

impl PollingSupervisor {
    pub fn new(db: Arc<dyn Database>, cache: CacheService) -> Self {
        Self::with_probes(db, cache, default_probes())
    }

    pub fn with_probes(
        db: Arc<dyn Database>,
        cache: CacheService,
        probes: Vec<ProbeSpec>,
    ) -> Self {
        Self {
            db,
            cache,
            probes,
            stale_multiplier: DEFAULT_STALE_MULTIPLIER,
            state: Mutex::new(SupervisorState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SupervisorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn classify(spec: &ProbeSpec, value: f64) -> AlertLevel {
        if value >= spec.critical {
            AlertLevel::Critical
        } else if value >= spec.warning {
            AlertLevel::Warning
        } else {
            AlertLevel::Normal
        }
    }

    async fn compute(&self, name: &str) -> Result<f64> {
        let value = match name {
            "dlq_size" => self.db.job_dlq().size().await?,
            "job_queue_depth" => self.db.jobs().queue_depth().await?,
            "event_outbox_depth" => self.db.observability().event_outbox_depth().await?,
            "io_stats" => self.db.observability().io_stats().await?,
            other => {
                return Err(crate::error::Error::internal(format!(
                    "unknown probe {other}"
                )))
            }
        };
        Ok(value as f64)
    }

    /// Load the persisted alert levels; fall back to the in-memory shadow
    async fn load_levels(&self) -> BTreeMap<String, AlertLevel> {
        match self.cache.driver().get(ALERTS_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<AlertRecord>>(&raw) {
                Ok(records) => records
                    .into_iter()
                    .map(|record| (record.alert_id, record.level))
                    .collect(),
                Err(_) => self.lock().levels.clone(),
            },
            Ok(None) => BTreeMap::new(),
            Err(err) => {
                tracing::warn!(error = %err, "alert state read failed, using shadow");
                self.lock().levels.clone()
            }
        }
    }

    async fn store_levels(&self, levels: &BTreeMap<String, AlertLevel>) {
        let records: Vec<AlertRecord> = levels
            .iter()
            .map(|(alert_id, level)| AlertRecord {
                alert_id: alert_id.clone(),
                level: *level,
            })
            .collect();
        let Ok(raw) = serde_json::to_string(&records) else {
            return;
        };
        if let Err(err) = self.cache.driver().set(ALERTS_KEY, &raw, None).await {
            tracing::warn!(error = %err, "alert state write failed, shadow only");
        }
    }

    /// Run the probes
    ///
    /// With `force = false`, probes run only when their minimum interval has
    /// elapsed since the previous run.
    pub async fn refresh(&self, force: bool) -> Result<HealthSnapshot> {
        let mut levels = self.load_levels().await;

        for spec in &self.probes {
            let due = {
                let state = self.lock();
                state
                    .last_run
                    .get(spec.name)
                    .map(|at| at.elapsed() >= spec.min_interval)
                    .unwrap_or(true)
            };
            if !force && !due {
                continue;
            }
            self.lock().last_run.insert(spec.name, Instant::now());

            match self.compute(spec.name).await {
                Ok(value) => {
                    {
                        let mut state = self.lock();
                        state.last_success.insert(spec.name, Instant::now());
                        state.last_value.insert(spec.name, value);
                    }
                    let mut labels = BTreeMap::new();
                    labels.insert("probe".to_string(), spec.name.to_string());
                    metrics::gauge("probe_value", value, &labels);

                    let next = Self::classify(spec, value);
                    let previous = levels
                        .get(spec.alert_id)
                        .copied()
                        .unwrap_or(AlertLevel::Normal);
                    if next != previous {
                        let action = next.action().unwrap_or("recovered");
                        self.publish_event(spec, action, Some(value)).await;
                        levels.insert(spec.alert_id.to_string(), next);
                    }
                }
                Err(err) => {
                    tracing::warn!(probe = spec.name, error = %err, "probe failed");
                    {
                        let mut state = self.lock();
                        state.last_failure.insert(spec.name, Instant::now());
                        // A failed probe contributes zero so aggregates do
                        // not regress.
                        state.last_value.insert(spec.name, 0.0);
                    }
                    self.publish_event(spec, "error", None).await;
                }
            }
        }

        self.store_levels(&levels).await;
        self.lock().levels = levels;
        Ok(self.snapshot())
    }

    async fn publish_event(&self, spec: &ProbeSpec, action: &str, value: Option<f64>) {
        let event = AlertEvent {
            action: action.to_string(),
            probe: spec.name.to_string(),
            value,
            at: Utc::now(),
        };
        if let Err(err) = self.cache.publish(spec.alert_id, &event).await {
            tracing::warn!(probe = spec.name, error = %err, "alert publish failed");
        }
    }

    fn snapshot(&self) -> HealthSnapshot {
        let state = self.lock();
        let probes = self
            .probes
            .iter()
            .map(|spec| {
                let stale = state
                    .last_success
                    .get(spec.name)
                    .map(|at| at.elapsed() > spec.min_interval * self.stale_multiplier)
                    .unwrap_or(true);
                ProbeStatus {
                    name: spec.name,
                    alert_id: spec.alert_id,
                    value: state.last_value.get(spec.name).copied(),
                    level: state
                        .levels
                        .get(spec.alert_id)
                        .copied()
                        .unwrap_or(AlertLevel::Normal),
                    stale,
                }
            })
            .collect();
        HealthSnapshot { probes }
    }

    /// Current health; readable even when the KV store is down
    pub async fn get_health(&self) -> HealthSnapshot {
        // Refresh the shadow from the store when possible.
        let levels = self.load_levels().await;
        if !levels.is_empty() {
            self.lock().levels = levels;
        }
        self.snapshot()
    }

    /// Run the supervisor on a cadence until cancelled
    pub fn spawn(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(err) = self.refresh(false).await {
                            tracing::warn!(error = %err, "supervisor refresh failed");
                        }
                    }
                }
            }
        })
    }
}
