//! Circuit breaker: three-state machine with a single half-open probe
//!
//! Transitions are linearizable per breaker: all state lives behind one
//! mutex, and a process-wide registry aliases same-name breakers to one
//! instance. Persistence (`breaker:<name>` in the KV store) is best-effort;
//! a persistence failure never prevents operation.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::cache::RedisDriver;
use crate::error::{Error, Result};
use crate::metrics;

/// Key prefix for persisted breaker state
pub const BREAKER_KEY_PREFIX: &str = "breaker:";

/// Minimum samples before the sampling policy may trip
const MIN_SAMPLES: usize = 10;

/// Breaker states, gauge-encoded 0/1/2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        }
    }

    pub fn gauge_value(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

/// Trip policy
#[derive(Debug, Clone)]
pub enum BreakerPolicy {
    /// Trip after `threshold` consecutive failures in Closed
    Consecutive { threshold: u32 },
    /// Trip when the failure rate over the trailing window reaches `rate`
    ///
    /// Decay is a fixed trailing window: outcomes older than `window` are
    /// evicted before the rate is computed, and the rate is only evaluated
    /// once at least ten samples survive.
    Sampling { rate: f64, window: Duration },
}

/// Breaker configuration
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub policy: BreakerPolicy,
    /// Cooldown before Open admits a probe
    pub half_open_after: Duration,
    /// Flush state to the KV store on every transition
    pub persist: bool,
    /// Emit state gauges and transition counters
    pub metrics: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            policy: BreakerPolicy::Consecutive { threshold: 5 },
            half_open_after: Duration::from_secs(30),
            persist: false,
            metrics: true,
        }
    }
}

/// How a call was admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Ordinary call in Closed
    Normal,
    /// The single half-open probe
    Probe,
}

/// Persisted breaker record
#[derive(Debug, Serialize, Deserialize)]
struct BreakerSnapshot {
    state: CircuitState,
    #[serde(default)]
    opened_at_unix_ms: Option<i64>,
    #[serde(default)]
    failure_count: u32,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    samples: VecDeque<(Instant, bool)>,
}

/// The breaker entity
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    store: Option<Arc<dyn RedisDriver>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_store(name, config, None)
    }

    pub fn with_store(
        name: impl Into<String>,
        config: BreakerConfig,
        store: Option<Arc<dyn RedisDriver>>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                samples: VecDeque::new(),
            }),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Attempt to restore persisted state; silent on any failure
    pub async fn restore(&self) {
        if !self.config.persist {
            return;
        }
        let Some(store) = &self.store else { return };
        let key = format!("{BREAKER_KEY_PREFIX}{}", self.name);
        let Ok(Some(raw)) = store.get(&key).await else {
            return;
        };
        let Ok(snapshot) = serde_json::from_str::<BreakerSnapshot>(&raw) else {
            return;
        };
        let mut inner = self.lock();
        inner.state = snapshot.state;
        inner.consecutive_failures = snapshot.failure_count;
        inner.opened_at = snapshot.opened_at_unix_ms.map(|opened_ms| {
            let elapsed_ms = (Utc::now().timestamp_millis() - opened_ms).max(0) as u64;
            Instant::now()
                .checked_sub(Duration::from_millis(elapsed_ms))
                .unwrap_or_else(Instant::now)
        });
    }

    /// Admit a call, or short-circuit with `CircuitError`
    pub fn try_acquire(&self) -> Result<Admission> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.half_open_after)
                    .unwrap_or(true);
                if cooled {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probe_in_flight = true;
                    Ok(Admission::Probe)
                } else {
                    Err(Error::Circuit {
                        name: self.name.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(Error::Circuit {
                        name: self.name.clone(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    /// Release an admission without recording an outcome
    ///
    /// Used when an admitted call never ran (bulkhead rejection, caller
    /// cancellation) so a half-open probe slot is not leaked.
    pub fn release(&self, admission: Admission) {
        if admission == Admission::Probe {
            let mut inner = self.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.probe_in_flight = false;
            }
        }
    }

    /// Record the outcome of an admitted call
    pub fn record(&self, success: bool, admission: Admission) {
        let mut inner = self.lock();
        match admission {
            Admission::Probe => {
                inner.probe_in_flight = false;
                if success {
                    inner.consecutive_failures = 0;
                    inner.samples.clear();
                    inner.opened_at = None;
                    self.transition(&mut inner, CircuitState::Closed);
                } else {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            Admission::Normal => {
                // A call admitted before a trip may complete after it; its
                // outcome no longer affects the machine.
                if inner.state != CircuitState::Closed {
                    return;
                }
                if success {
                    inner.consecutive_failures = 0;
                } else {
                    inner.consecutive_failures += 1;
                }
                inner.samples.push_back((Instant::now(), success));
                if self.should_trip(&mut inner) {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
        }
    }

    fn should_trip(&self, inner: &mut Inner) -> bool {
        match &self.config.policy {
            BreakerPolicy::Consecutive { threshold } => {
                inner.consecutive_failures >= *threshold
            }
            BreakerPolicy::Sampling { rate, window } => {
                while inner
                    .samples
                    .front()
                    .map(|(at, _)| at.elapsed() > *window)
                    .unwrap_or(false)
                {
                    inner.samples.pop_front();
                }
                let total = inner.samples.len();
                if total < MIN_SAMPLES {
                    return false;
                }
                let failures = inner.samples.iter().filter(|(_, ok)| !ok).count();
                failures as f64 / total as f64 >= *rate
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        tracing::info!(
            breaker = %self.name,
            from = from.as_str(),
            to = to.as_str(),
            "circuit transition"
        );
        if self.config.metrics {
            let mut labels = BTreeMap::new();
            labels.insert("name".to_string(), self.name.clone());
            metrics::gauge("circuit_state", to.gauge_value(), &labels);
            labels.insert("from".to_string(), from.as_str().to_string());
            labels.insert("to".to_string(), to.as_str().to_string());
            metrics::inc("circuit_transitions", &labels);
        }
        if self.config.persist {
            self.persist(inner);
        }
    }

    fn persist(&self, inner: &Inner) {
        let Some(store) = &self.store else { return };
        let snapshot = BreakerSnapshot {
            state: inner.state,
            opened_at_unix_ms: inner
                .opened_at
                .map(|at| Utc::now().timestamp_millis() - at.elapsed().as_millis() as i64),
            failure_count: inner.consecutive_failures,
        };
        let Ok(raw) = serde_json::to_string(&snapshot) else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(store);
        let key = format!("{BREAKER_KEY_PREFIX}{}", self.name);
        let name = self.name.clone();
        handle.spawn(async move {
            if let Err(err) = store.set(&key, &raw, None).await {
                tracing::warn!(breaker = %name, error = %err, "breaker persistence failed");
            }
        });
    }
}

/// Process-wide breaker registry
///
/// Duplicate breakers with the same name alias to the same instance.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    store: Option<Arc<dyn RedisDriver>>,
}

impl BreakerRegistry {
    pub fn new(store: Option<Arc<dyn RedisDriver>>) -> Self {
        Self {
            breakers: DashMap::new(),
            store,
        }
    }

    /// Fetch or build the breaker for a name
    pub async fn get_or_create(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(&existing);
        }
        let built = Arc::new(CircuitBreaker::with_store(
            name,
            config,
            self.store.clone(),
        ));
        built.restore().await;
        // A racing creator may have inserted first; the entry API keeps the
        // winner so every caller aliases one instance.
        Arc::clone(
            &self
                .breakers
                .entry(name.to_string())
                .or_insert(built),
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(&b))
    }
}
