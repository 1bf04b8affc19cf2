//! Span instrumentation and tracing bootstrap
//!
//! Spans are `tracing` spans carrying OpenTelemetry-conventional fields,
//! metrics go through the `opentelemetry` API meter, and log output is
//! structured JSON on stdout. Exporter endpoints are resolved per signal
//! from [`crate::config::OtlpSettings`] and surfaced for the collector that
//! ships the signals; the process itself does not open exporter
//! connections. Every non-success exit annotates the span: typed failures
//! record `error.tag` and `error.message`, panics record the exception
//! fields and are never swallowed, and cancellation records
//! `interrupted=true` without marking the span as an error.

use futures::FutureExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tracing::{field::Empty, Instrument, Span};
use tracing_subscriber::EnvFilter;

use crate::config::{LogsExporters, PlatformConfig, Signal};
use crate::context;
use crate::error::{BoundaryError, Error, Result};
use crate::metrics;

/// Span kind recorded as `otel.kind`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Internal,
    Client,
    Server,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

/// Options for [`span`]
#[derive(Debug, Clone)]
pub struct SpanOptions {
    /// Explicit kind; defaults by name prefix when unset
    pub kind: Option<SpanKind>,
    /// Emit a duration histogram labeled by span name
    pub metrics: bool,
    /// Capture a stack trace on error annotation
    pub capture_stack_trace: bool,
}

impl Default for SpanOptions {
    fn default() -> Self {
        Self {
            kind: None,
            metrics: true,
            capture_stack_trace: false,
        }
    }
}

/// Kind defaults: `cache.*` spans talk to a remote store, `auth.*` spans are
/// in-process, and anything under an active circuit is a client call.
pub fn default_kind(name: &str, circuit_active: bool) -> SpanKind {
    if name.starts_with("cache.") {
        SpanKind::Client
    } else if name.starts_with("auth.") {
        SpanKind::Internal
    } else if circuit_active {
        SpanKind::Client
    } else {
        SpanKind::Internal
    }
}

fn make_span(name: &str, kind: SpanKind) -> Span {
    let span = tracing::info_span!(
        "operation",
        otel.name = %name,
        otel.kind = kind.as_str(),
        otel.status_code = Empty,
        error.tag = Empty,
        error.message = Empty,
        "exception.type" = Empty,
        exception.message = Empty,
        interrupted = Empty,
        request.id = Empty,
        tenant.id = Empty,
        session.mfa = Empty,
        circuit.name = Empty,
        circuit.state = Empty,
    );
    if let Some(ctx) = context::current() {
        for (key, value) in ctx.to_attrs() {
            span.record(key.as_str(), value.as_str());
        }
    }
    span
}

struct InterruptGuard {
    span: Span,
    armed: bool,
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.armed {
            self.span.record("interrupted", true);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

fn record_duration(name: &str, start: Instant) {
    let mut labels = BTreeMap::new();
    labels.insert("operation".to_string(), metrics::sanitize_value(name));
    metrics::observe(
        "operation_duration_ms",
        start.elapsed().as_secs_f64() * 1000.0,
        &labels,
    );
}

/// Wrap a single unit of work in an annotated span
pub async fn span<T, F>(name: &str, options: SpanOptions, op: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let circuit_active = context::current().map(|c| c.circuit.is_some()).unwrap_or(false);
    let kind = options
        .kind
        .unwrap_or_else(|| default_kind(name, circuit_active));
    let span = make_span(name, kind);

    let mut guard = InterruptGuard {
        span: span.clone(),
        armed: true,
    };
    let start = Instant::now();
    let outcome = AssertUnwindSafe(op)
        .catch_unwind()
        .instrument(span.clone())
        .await;
    guard.armed = false;
    drop(guard);

    if options.metrics {
        record_duration(name, start);
    }

    match outcome {
        Err(payload) => {
            span.record("otel.status_code", "ERROR");
            span.record("exception.type", "panic");
            span.record("exception.message", panic_message(payload.as_ref()).as_str());
            std::panic::resume_unwind(payload);
        }
        Ok(Ok(value)) => {
            span.record("otel.status_code", "OK");
            Ok(value)
        }
        Ok(Err(err)) => {
            span.record("otel.status_code", "ERROR");
            span.record("error.tag", err.tag());
            span.record("error.message", err.to_string().as_str());
            if options.capture_stack_trace {
                span.record(
                    "exception.message",
                    std::backtrace::Backtrace::force_capture()
                        .to_string()
                        .as_str(),
                );
            }
            Err(err)
        }
    }
}

/// Pre-configured span for HTTP handlers
///
/// Forces metrics on, carries request and tenant attributes from the ambient
/// context, and annotates error status from the boundary `_tag`.
pub async fn route_span<T, F>(name: &str, op: F) -> std::result::Result<T, BoundaryError>
where
    F: Future<Output = std::result::Result<T, BoundaryError>>,
{
    let span = make_span(name, SpanKind::Server);

    let mut guard = InterruptGuard {
        span: span.clone(),
        armed: true,
    };
    let start = Instant::now();
    let outcome = AssertUnwindSafe(op)
        .catch_unwind()
        .instrument(span.clone())
        .await;
    guard.armed = false;
    drop(guard);

    record_duration(name, start);

    match outcome {
        Err(payload) => {
            span.record("otel.status_code", "ERROR");
            span.record("exception.type", "panic");
            span.record("exception.message", panic_message(payload.as_ref()).as_str());
            std::panic::resume_unwind(payload);
        }
        Ok(Ok(value)) => {
            span.record("otel.status_code", "OK");
            Ok(value)
        }
        Ok(Err(err)) => {
            span.record("otel.status_code", "ERROR");
            span.record("error.tag", err.tag());
            span.record("error.message", err.message());
            Err(err)
        }
    }
}

/// Convenience wrapper: run `op` in a span with default options
pub async fn in_span<T, F>(name: &str, op: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    span(name, SpanOptions::default(), op).await
}

/// Exporter wiring resolved per signal
///
/// This is what the composition root hands to the deploy tooling that runs
/// the collector; the process itself does not open exporter connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTelemetry {
    pub logs_endpoint: String,
    pub metrics_endpoint: String,
    pub traces_endpoint: String,
    pub headers: Vec<(String, String)>,
    pub logs: LogsExporters,
}

/// Resolve the exporter surface for the configured deployment mode
pub fn resolve_exporters(config: &PlatformConfig) -> ResolvedTelemetry {
    let mode = config.service.deployment_mode;
    ResolvedTelemetry {
        logs_endpoint: config.otlp.endpoint_for(Signal::Logs, mode),
        metrics_endpoint: config.otlp.endpoint_for(Signal::Metrics, mode),
        traces_endpoint: config.otlp.endpoint_for(Signal::Traces, mode),
        headers: config.otlp.parsed_headers(),
        logs: config.otlp.logs_exporters(),
    }
}

/// Initialize tracing for the service
///
/// Installs the JSON console formatter when the logs-exporter selection
/// includes `console` (the default), with an environment filter seeded from
/// the configured log level. The per-signal endpoints and exporter headers
/// are resolved here and returned for the collector handoff.
pub fn init_tracing(config: &PlatformConfig) -> Result<ResolvedTelemetry> {
    let resolved = resolve_exporters(config);

    if resolved.logs.console {
        let log_level = config.service.log_level.clone();
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    }

    tracing::info!(
        service = %config.service.name,
        logs_endpoint = %resolved.logs_endpoint,
        metrics_endpoint = %resolved.metrics_endpoint,
        traces_endpoint = %resolved.traces_endpoint,
        "Tracing initialized"
    );

    Ok(resolved)
}

/// Annotate the current span with an error without failing the operation
pub fn annotate_error(err: &Error) {
    let span = Span::current();
    span.record("error.tag", err.tag());
    span.record("error.message", err.to_string().as_str());
}
