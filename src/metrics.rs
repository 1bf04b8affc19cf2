//! Metric emission, label sanitization, and cardinality guards
//!
//! All emitters go through the global OpenTelemetry meter. Label values are
//! sanitized before emission (dropped when absent, truncated to 123 bytes,
//! control characters stripped) and URL path segments are normalized to
//! templates before they become labels; that normalization is the sole
//! cardinality guard for URL-keyed metrics.

use futures::Stream;
use futures::StreamExt;
use once_cell::sync::Lazy;
use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, Meter},
    KeyValue,
};
use regex::Regex;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Instant;

use crate::error::{Error, Result};

const MAX_LABEL_LEN: usize = 123;

fn meter() -> Meter {
    global::meter("portal-platform")
}

static COUNTERS: Lazy<dashmap::DashMap<String, Counter<u64>>> = Lazy::new(dashmap::DashMap::new);
static GAUGES: Lazy<dashmap::DashMap<String, Gauge<f64>>> = Lazy::new(dashmap::DashMap::new);
static HISTOGRAMS: Lazy<dashmap::DashMap<String, Histogram<f64>>> =
    Lazy::new(dashmap::DashMap::new);

fn counter(name: &str) -> Counter<u64> {
    COUNTERS
        .entry(name.to_string())
        .or_insert_with(|| meter().u64_counter(name.to_string()).build())
        .clone()
}

fn gauge_instrument(name: &str) -> Gauge<f64> {
    GAUGES
        .entry(name.to_string())
        .or_insert_with(|| meter().f64_gauge(name.to_string()).build())
        .clone()
}

fn histogram(name: &str) -> Histogram<f64> {
    HISTOGRAMS
        .entry(name.to_string())
        .or_insert_with(|| meter().f64_histogram(name.to_string()).build())
        .clone()
}

/// Sanitize one label value: truncate to 123 bytes on a char boundary, then
/// strip ASCII control characters (≤ 0x1F and 0x7F). Idempotent.
pub fn sanitize_value(value: &str) -> String {
    let mut end = value.len().min(MAX_LABEL_LEN);
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end]
        .chars()
        .filter(|c| !c.is_ascii_control())
        .collect()
}

/// Normalize a label dictionary
///
/// Entries with absent values are dropped; the rest pass through
/// [`sanitize_value`]. `label(label(x)) == label(x)`.
pub fn label(labels: &BTreeMap<String, Option<String>>) -> BTreeMap<String, String> {
    labels
        .iter()
        .filter_map(|(k, v)| {
            v.as_deref()
                .map(|value| (k.clone(), sanitize_value(value)))
        })
        .collect()
}

/// Extract a stable tag from an error value
///
/// Platform errors report their `_tag`; anything else reports its type name
/// tail, falling back to `"Unknown"`.
pub fn error_tag<E>(err: &E) -> String
where
    E: std::error::Error + std::any::Any,
{
    let any = err as &dyn std::any::Any;
    if let Some(platform) = any.downcast_ref::<Error>() {
        return platform.tag().to_string();
    }
    if let Some(boundary) = any.downcast_ref::<crate::error::BoundaryError>() {
        return boundary.tag().to_string();
    }
    std::any::type_name::<E>()
        .rsplit("::")
        .next()
        .filter(|tail| !tail.is_empty())
        .map(|tail| tail.to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

static UUID_SEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .unwrap()
});
static NUMERIC_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+$").unwrap());
static HEX_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{16,}$").unwrap());
static TOKEN_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{12,}$").unwrap());

/// Replace identifier-like path segments with stable templates
///
/// UUIDs become `:id`, numeric segments `:num`, 16+-char hex tokens `:hash`,
/// and any other opaque token of 12+ chars `:token`. Everything else passes
/// through. The `:token` rule has no digit requirement, so 12+-char static
/// route words collapse as well.
pub fn normalize_path(path: &str) -> String {
    let normalized: Vec<&str> = path
        .split('/')
        .map(|segment| {
            if segment.is_empty() {
                segment
            } else if UUID_SEGMENT.is_match(segment) {
                ":id"
            } else if NUMERIC_SEGMENT.is_match(segment) {
                ":num"
            } else if HEX_SEGMENT.is_match(segment) {
                ":hash"
            } else if TOKEN_SEGMENT.is_match(segment) {
                ":token"
            } else {
                segment
            }
        })
        .collect();
    normalized.join("/")
}

fn to_kv(labels: &BTreeMap<String, String>) -> Vec<KeyValue> {
    labels
        .iter()
        .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
        .collect()
}

/// Increment a counter
pub fn inc(name: &str, labels: &BTreeMap<String, String>) {
    counter(name).add(1, &to_kv(labels));
}

/// Record a gauge value
pub fn gauge(name: &str, value: f64, labels: &BTreeMap<String, String>) {
    gauge_instrument(name).record(value, &to_kv(labels));
}

/// Record a histogram observation
pub fn observe(name: &str, value: f64, labels: &BTreeMap<String, String>) {
    histogram(name).record(value, &to_kv(labels));
}

/// Record an error occurrence tagged by its `_tag`
pub fn track_error(name: &str, err: &Error, labels: &BTreeMap<String, String>) {
    let mut attrs = to_kv(labels);
    attrs.push(KeyValue::new("error.tag", err.tag()));
    counter(name).add(1, &attrs);
}

/// Options for [`track_effect`]
#[derive(Debug, Clone)]
pub struct TrackOptions {
    /// Histogram for the operation duration, in milliseconds
    pub duration: &'static str,
    /// Counter for failures, labeled by error tag
    pub errors: &'static str,
    /// Extra labels applied to both instruments
    pub labels: BTreeMap<String, String>,
}

/// Time an operation and record failures by tag
///
/// The value is preserved on success and the typed failure propagates
/// unchanged on error.
pub async fn track_effect<T, F>(op: F, opts: TrackOptions) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let result = op.await;
    let attrs = to_kv(&opts.labels);
    histogram(opts.duration).record(start.elapsed().as_secs_f64() * 1000.0, &attrs);
    if let Err(err) = &result {
        let mut error_attrs = attrs;
        error_attrs.push(KeyValue::new("error.tag", err.tag()));
        counter(opts.errors).add(1, &error_attrs);
    }
    result
}

/// Job pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOperation {
    Submit,
    Cancel,
    Process,
    Replay,
}

impl JobOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Cancel => "cancel",
            Self::Process => "process",
            Self::Replay => "replay",
        }
    }
}

/// Track a job-pipeline operation
pub async fn track_job<T, F>(
    job_type: &str,
    operation: JobOperation,
    priority: Option<&str>,
    op: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let mut labels = BTreeMap::new();
    labels.insert("job.type".to_string(), sanitize_value(job_type));
    labels.insert("job.operation".to_string(), operation.as_str().to_string());
    if let Some(priority) = priority {
        labels.insert("job.priority".to_string(), sanitize_value(priority));
    }
    track_effect(
        op,
        TrackOptions {
            duration: "job_duration_ms",
            errors: "job_errors",
            labels,
        },
    )
    .await
}

/// Count items flowing through a stream
pub fn track_stream<S>(
    stream: S,
    counter_name: &'static str,
    labels: BTreeMap<String, String>,
) -> impl Stream<Item = S::Item>
where
    S: Stream,
{
    let attrs = to_kv(&labels);
    stream.inspect(move |_| counter(counter_name).add(1, &attrs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, Option<&str>)]) -> BTreeMap<String, Option<String>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(|s| s.to_string())))
            .collect()
    }

    #[test]
    fn test_label_drops_absent_values() {
        let out = label(&labels(&[("a", Some("1")), ("b", None)]));
        assert_eq!(out.len(), 1);
        assert_eq!(out.get("a").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_label_truncates() {
        let long = "x".repeat(400);
        let out = label(&labels(&[("k", Some(&long))]));
        assert_eq!(out.get("k").unwrap().len(), 123);
    }

    #[test]
    fn test_label_strips_control_chars() {
        let out = label(&labels(&[("k", Some("a\x00b\x1fc\x7fd\ne"))]));
        assert_eq!(out.get("k").map(String::as_str), Some("abcde"));
    }

    #[test]
    fn test_label_idempotent() {
        let noisy = format!("{}\x01{}", "v".repeat(200), "w".repeat(10));
        let once = sanitize_value(&noisy);
        assert_eq!(sanitize_value(&once), once);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        // 62 two-byte chars = 124 bytes; truncation must not split one.
        let value = "é".repeat(62);
        let out = sanitize_value(&value);
        assert!(out.len() <= 123);
        assert_eq!(out, "é".repeat(61));
    }

    #[test]
    fn test_error_tag_platform() {
        let err = Error::not_found("app");
        assert_eq!(error_tag(&err), "NotFound");
    }

    #[test]
    fn test_error_tag_foreign() {
        let err: serde_json::Error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let tag = error_tag(&err);
        assert_ne!(tag, "Unknown");
        assert!(!tag.is_empty());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path("/apps/0198c6b2-7b44-7abc-8def-0123456789ab/items/42"),
            "/apps/:id/items/:num"
        );
        assert_eq!(
            normalize_path("/files/deadbeefdeadbeef"),
            "/files/:hash"
        );
        assert_eq!(
            normalize_path("/keys/tok_a1b2c3d4e5f6"),
            "/keys/:token"
        );
        // Opaque 12+-char segments normalize even without digits.
        assert_eq!(
            normalize_path("/invites/happypurplefox"),
            "/invites/:token"
        );
        // Short route words survive.
        assert_eq!(normalize_path("/orgs/members"), "/orgs/members");
    }

    #[test]
    fn test_job_operation_names() {
        assert_eq!(JobOperation::Submit.as_str(), "submit");
        assert_eq!(JobOperation::Replay.as_str(), "replay");
    }

    #[tokio::test]
    async fn test_track_effect_preserves_value_and_error() {
        let ok: Result<u32> = track_effect(
            async { Ok(7) },
            TrackOptions {
                duration: "test_duration_ms",
                errors: "test_errors",
                labels: BTreeMap::new(),
            },
        )
        .await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<u32> = track_effect(
            async { Err(Error::conflict("a", "b")) },
            TrackOptions {
                duration: "test_duration_ms",
                errors: "test_errors",
                labels: BTreeMap::new(),
            },
        )
        .await;
        assert_eq!(err.unwrap_err().tag(), "Conflict");
    }

    #[tokio::test]
    async fn test_track_stream_passes_items_through() {
        let items: Vec<u32> = track_stream(
            futures::stream::iter(vec![1, 2, 3]),
            "test_stream_items",
            BTreeMap::new(),
        )
        .collect()
        .await;
        assert_eq!(items, vec![1, 2, 3]);
    }
}
