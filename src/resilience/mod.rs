//! The resilience combinator
//!
//! [`Resilience::run`] composes, outermost first: circuit breaker (default
//! on), bulkhead (optional), timeout (default 30 s), hedge (optional), and
//! retry (preset). [`Resilience::run_or_else`] adds a fallback around the
//! whole pipeline. Retry runs inside the timeout so total wall clock is
//! bounded, and cancellation is total: dropping the returned future drops
//! the in-flight attempt, the hedge sibling, and any pending backoff.

pub mod bulkhead;
pub mod circuit;
pub mod presets;

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::RedisDriver;
use crate::context;
use crate::error::{Error, Result};
pub use bulkhead::Bulkhead;
pub use circuit::{
    Admission, BreakerConfig, BreakerPolicy, BreakerRegistry, CircuitBreaker, CircuitState,
};
pub use presets::{schedule, RetryPreset, RetrySchedule};

/// Default wall-clock bound for a run
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default delay before the hedge attempt fires
pub const DEFAULT_HEDGE_DELAY: Duration = Duration::from_millis(100);

/// Bulkhead sizing for a run
#[derive(Debug, Clone)]
pub struct BulkheadOptions {
    pub capacity: usize,
    pub grace: Duration,
}

impl BulkheadOptions {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            grace: bulkhead::DEFAULT_GRACE,
        }
    }
}

/// Options for one [`Resilience::run`]
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Circuit breaker configuration; `None` disables the breaker
    pub circuit: Option<BreakerConfig>,
    /// Bulkhead; off by default
    pub bulkhead: Option<BulkheadOptions>,
    /// Total wall-clock bound, retries included
    pub timeout: Duration,
    /// Hedge delay; off by default
    pub hedge: Option<Duration>,
    /// Retry preset; off by default
    pub retry: Option<RetryPreset>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            circuit: Some(BreakerConfig::default()),
            bulkhead: None,
            timeout: DEFAULT_TIMEOUT,
            hedge: None,
            retry: None,
        }
    }
}

impl RunOptions {
    pub fn without_circuit(mut self) -> Self {
        self.circuit = None;
        self
    }

    pub fn with_retry(mut self, preset: RetryPreset) -> Self {
        self.retry = Some(preset);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_hedge(mut self) -> Self {
        self.hedge = Some(DEFAULT_HEDGE_DELAY);
        self
    }

    pub fn with_bulkhead(mut self, capacity: usize) -> Self {
        self.bulkhead = Some(BulkheadOptions::with_capacity(capacity));
        self
    }
}

/// The combinator service
///
/// Owns the breaker and bulkhead registries; same-name resources alias to
/// one instance across the process.
pub struct Resilience {
    breakers: BreakerRegistry,
    bulkheads: DashMap<String, Arc<Bulkhead>>,
}

impl Resilience {
    /// Without persistence: breaker state is process-local
    pub fn new() -> Self {
        Self {
            breakers: BreakerRegistry::new(None),
            bulkheads: DashMap::new(),
        }
    }

    /// With a KV store for `persist: true` breakers
    pub fn with_store(store: Arc<dyn RedisDriver>) -> Self {
        Self {
            breakers: BreakerRegistry::new(Some(store)),
            bulkheads: DashMap::new(),
        }
    }

    /// The schedule for a preset, as a first-class value
    pub fn schedule(preset: RetryPreset) -> RetrySchedule {
        presets::schedule(preset)
    }

    /// Predicate for resilience-produced errors
    ///
    /// With a tag, checks that exact tag; without, checks membership in
    /// `{TimeoutError, BulkheadError, CircuitError}`.
    pub fn is(err: &Error, tag: Option<&str>) -> bool {
        match tag {
            Some(tag) => err.tag() == tag,
            None => matches!(
                err,
                Error::Timeout { .. } | Error::Bulkhead { .. } | Error::Circuit { .. }
            ),
        }
    }

    /// The breaker registered under a name, if any
    pub fn breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name)
    }

    fn bulkhead(&self, name: &str, options: &BulkheadOptions) -> Arc<Bulkhead> {
        Arc::clone(
            &self
                .bulkheads
                .entry(name.to_string())
                .or_insert_with(|| {
                    Arc::new(Bulkhead::new(name, options.capacity, options.grace))
                }),
        )
    }

    /// Run an operation through the pipeline
    ///
    /// `op` is a factory so retry and hedge can re-invoke the attempt.
    pub async fn run<T, F, Fut>(&self, name: &str, options: RunOptions, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = match &options.circuit {
            Some(config) => Some(self.breakers.get_or_create(name, config.clone()).await),
            None => None,
        };
        // The guard releases an unrecorded admission on every exit path,
        // including cancellation, so a half-open probe slot cannot leak.
        let mut guard = match &breaker {
            Some(breaker) => Some(AdmissionGuard {
                breaker: Arc::clone(breaker),
                admission: Some(breaker.try_acquire()?),
            }),
            None => None,
        };

        let _permit = match &options.bulkhead {
            Some(bulkhead_options) => {
                Some(self.bulkhead(name, bulkhead_options).acquire().await?)
            }
            None => None,
        };

        let schedule = options.retry.map(presets::schedule);
        let circuit_state = breaker
            .as_ref()
            .map(|b| b.state().as_str())
            .unwrap_or("closed");

        let timeout = options.timeout;
        let body = async {
            match tokio::time::timeout(timeout, attempt(options.hedge, schedule.as_ref(), &op))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    name: name.to_string(),
                    duration: timeout,
                }),
            }
        };
        let result = match &breaker {
            Some(_) => context::with_circuit(name, circuit_state, body).await,
            None => body.await,
        };

        if let Some(guard) = guard.as_mut() {
            guard.record(result.is_ok());
        }
        result
    }

    /// Run with a fallback wrapping the whole pipeline
    ///
    /// If the pipeline fails, `fallback` is invoked with the error; its
    /// success becomes the result and its failure propagates.
    pub async fn run_or_else<T, F, Fut, FB, FutB>(
        &self,
        name: &str,
        options: RunOptions,
        op: F,
        fallback: FB,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce(Error) -> FutB,
        FutB: Future<Output = Result<T>>,
    {
        match self.run(name, options, op).await {
            Ok(value) => Ok(value),
            Err(err) => fallback(err).await,
        }
    }
}

impl Default for Resilience {
    fn default() -> Self {
        Self::new()
    }
}

struct AdmissionGuard {
    breaker: Arc<CircuitBreaker>,
    admission: Option<Admission>,
}

impl AdmissionGuard {
    fn record(&mut self, success: bool) {
        if let Some(admission) = self.admission.take() {
            self.breaker.record(success, admission);
        }
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        if let Some(admission) = self.admission.take() {
            self.breaker.release(admission);
        }
    }
}

/// One hedged-or-plain chain of retried attempts
async fn attempt<T, F, Fut>(
    hedge: Option<Duration>,
    schedule: Option<&RetrySchedule>,
    op: &F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match hedge {
        None => retry_loop(schedule, op).await,
        Some(delay) => {
            let first = retry_loop(schedule, op);
            tokio::pin!(first);
            tokio::select! {
                result = &mut first => result,
                _ = tokio::time::sleep(delay) => {
                    // The hedge races the original; the winner cancels the
                    // loser by drop.
                    let second = retry_loop(schedule, op);
                    tokio::pin!(second);
                    tokio::select! {
                        result = &mut first => result,
                        result = &mut second => result,
                    }
                }
            }
        }
    }
}

/// Sequential retry chain; side effects are serialized
async fn retry_loop<T, F, Fut>(schedule: Option<&RetrySchedule>, op: &F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let Some(schedule) = schedule else {
        return op().await;
    };
    let started = tokio::time::Instant::now();
    let mut previous_delay: Option<Duration> = None;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retriable() || attempts >= schedule.max_attempts {
                    return Err(err);
                }
                let delay = schedule.next_delay(previous_delay);
                if let Some(up_to) = schedule.up_to {
                    if started.elapsed() + delay > up_to {
                        return Err(err);
                    }
                }
                previous_delay = Some(delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
