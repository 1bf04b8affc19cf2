//! Tagged error taxonomy and boundary collapse
//!
//! Two families of errors live here. [`Error`] is the internal union carried
//! through the call graph: it holds domain data and is never serialized.
//! [`BoundaryError`] is the stable wire catalog emitted at HTTP/WS boundaries:
//! every variant carries a status code and a `_tag` that is part of the public
//! contract.
//!
//! Interior code propagates `Error` with `?`. Only boundaries (HTTP handlers,
//! the WS message loop, job dispatchers) may collapse the union, either with
//! the exhaustive [`From<Error>`] conversion or the last-mile
//! [`map_to`] operator for ad-hoc failures.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error as ThisError;

/// Result type alias using the platform error
pub type Result<T> = std::result::Result<T, Error>;

fn fmt_opt_id(id: &Option<String>) -> String {
    match id {
        Some(id) => format!("/{id}"),
        None => String::new(),
    }
}

/// Internal error union
///
/// Message formats for `NotFound` and `Conflict` are part of the stable
/// public interface and must not change.
#[derive(Debug, Clone, PartialEq, ThisError)]
pub enum Error {
    /// Resource lookup missed
    #[error("NotFound: {resource}{}", fmt_opt_id(.id))]
    NotFound {
        /// Resource kind, e.g. `"app"`
        resource: String,
        /// Optional resource identifier
        id: Option<String>,
    },

    /// State collision (duplicate, version race, in-flight twin)
    #[error("Conflict: {resource} - {reason}")]
    Conflict { resource: String, reason: String },

    /// Caller is authenticated but not allowed
    #[error("Forbidden: {details}")]
    Forbidden { details: String },

    /// Caller is not authenticated
    #[error("Auth: {reason}")]
    Auth {
        reason: String,
        context: Option<String>,
    },

    /// Input failed validation
    #[error("Validation: {field} - {detail}")]
    Validation { field: String, detail: String },

    /// Optimistic-concurrency mismatch
    #[error("Stale: expected {expected}, actual {actual}")]
    Stale { expected: String, actual: String },

    /// Caller exhausted its rate budget
    #[error("RateLimit: too many requests")]
    RateLimit,

    /// Resource existed but was removed
    #[error("Gone: {resource}")]
    Gone { resource: String },

    /// Upstream identity-provider failure
    #[error("OAuth: {reason}")]
    OAuth { reason: String },

    /// Transient infrastructure failure (driver, pool, network)
    #[error("Infra: {reason}")]
    Infra { reason: String },

    /// Deadline exceeded inside the resilience pipeline
    #[error("TimeoutError: {name} after {duration:?}")]
    Timeout { name: String, duration: Duration },

    /// Bulkhead permit not acquired within the grace window
    #[error("BulkheadError: {name} at capacity {capacity}")]
    Bulkhead { name: String, capacity: usize },

    /// Circuit breaker is open
    #[error("CircuitError: {name}")]
    Circuit { name: String },

    /// Unclassified internal failure
    #[error("Internal: {details}")]
    Internal {
        details: String,
        cause: Option<String>,
    },
}

impl Error {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: None,
        }
    }

    pub fn not_found_id(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: Some(id.into()),
        }
    }

    pub fn conflict(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    pub fn forbidden(details: impl Into<String>) -> Self {
        Self::Forbidden {
            details: details.into(),
        }
    }

    pub fn auth(reason: impl Into<String>) -> Self {
        Self::Auth {
            reason: reason.into(),
            context: None,
        }
    }

    pub fn validation(field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            detail: detail.into(),
        }
    }

    pub fn infra(reason: impl Into<String>) -> Self {
        Self::Infra {
            reason: reason.into(),
        }
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Self::Internal {
            details: details.into(),
            cause: None,
        }
    }

    pub fn internal_with_cause(details: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::Internal {
            details: details.into(),
            cause: Some(cause.into()),
        }
    }

    /// Stable discriminator, identical to the wire `_tag` where the variant
    /// has a boundary counterpart.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NotFound",
            Self::Conflict { .. } => "Conflict",
            Self::Forbidden { .. } => "Forbidden",
            Self::Auth { .. } => "Auth",
            Self::Validation { .. } => "Validation",
            Self::Stale { .. } => "Stale",
            Self::RateLimit => "RateLimit",
            Self::Gone { .. } => "Gone",
            Self::OAuth { .. } => "OAuth",
            Self::Infra { .. } => "Infra",
            Self::Timeout { .. } => "TimeoutError",
            Self::Bulkhead { .. } => "BulkheadError",
            Self::Circuit { .. } => "CircuitError",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Retry classification: retriable iff the tag is not in the
    /// never-retry set.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Self::Auth { .. }
                | Self::Forbidden { .. }
                | Self::Validation { .. }
                | Self::NotFound { .. }
                | Self::Conflict { .. }
                | Self::OAuth { .. }
        )
    }
}

/// Tags in the boundary catalog, in status order
pub const BOUNDARY_CATALOG: &[&str] = &[
    "Auth",
    "OAuth",
    "Forbidden",
    "NotFound",
    "Conflict",
    "Gone",
    "Validation",
    "RateLimit",
    "Internal",
    "ServiceUnavailable",
    "GatewayTimeout",
    "TimeoutError",
    "BulkheadError",
    "CircuitError",
];

/// Serialized boundary error
///
/// This is the only error shape that crosses the HTTP/WS boundary. No cause
/// chains or stack traces are transmitted; the telemetry span carries those.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundaryError {
    Auth { message: String },
    OAuth { message: String },
    Forbidden { message: String },
    NotFound { message: String },
    Conflict { message: String },
    Gone { message: String },
    Validation { message: String },
    RateLimit { message: String },
    Internal { message: String, cause: Option<String> },
    ServiceUnavailable { message: String },
    GatewayTimeout { message: String },
    Timeout { message: String },
    Bulkhead { message: String },
    Circuit { message: String },
}

impl BoundaryError {
    /// Structural membership check against the boundary catalog
    pub fn is(tag: &str) -> bool {
        BOUNDARY_CATALOG.contains(&tag)
    }

    /// Wire discriminator
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "Auth",
            Self::OAuth { .. } => "OAuth",
            Self::Forbidden { .. } => "Forbidden",
            Self::NotFound { .. } => "NotFound",
            Self::Conflict { .. } => "Conflict",
            Self::Gone { .. } => "Gone",
            Self::Validation { .. } => "Validation",
            Self::RateLimit { .. } => "RateLimit",
            Self::Internal { .. } => "Internal",
            Self::ServiceUnavailable { .. } => "ServiceUnavailable",
            Self::GatewayTimeout { .. } => "GatewayTimeout",
            Self::Timeout { .. } => "TimeoutError",
            Self::Bulkhead { .. } => "BulkheadError",
            Self::Circuit { .. } => "CircuitError",
        }
    }

    /// User-facing message
    pub fn message(&self) -> &str {
        match self {
            Self::Auth { message }
            | Self::OAuth { message }
            | Self::Forbidden { message }
            | Self::NotFound { message }
            | Self::Conflict { message }
            | Self::Gone { message }
            | Self::Validation { message }
            | Self::RateLimit { message }
            | Self::Internal { message, .. }
            | Self::ServiceUnavailable { message }
            | Self::GatewayTimeout { message }
            | Self::Timeout { message }
            | Self::Bulkhead { message }
            | Self::Circuit { message } => message,
        }
    }

    /// HTTP status for the variant
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth { .. } | Self::OAuth { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Gone { .. } => StatusCode::GONE,
            Self::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable { .. } | Self::Bulkhead { .. } | Self::Circuit { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::GatewayTimeout { .. } | Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl std::fmt::Display for BoundaryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for BoundaryError {}

/// Exhaustive collapse of the internal union to the boundary catalog
///
/// Adding an internal variant without extending this match is a compile
/// error, which is the point.
impl From<Error> for BoundaryError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::NotFound { .. } => Self::NotFound { message },
            Error::Conflict { .. } => Self::Conflict { message },
            Error::Forbidden { .. } => Self::Forbidden { message },
            Error::Auth { .. } => Self::Auth { message },
            Error::Validation { .. } => Self::Validation { message },
            Error::Stale { .. } => Self::Conflict { message },
            Error::RateLimit => Self::RateLimit { message },
            Error::Gone { .. } => Self::Gone { message },
            Error::OAuth { .. } => Self::OAuth { message },
            Error::Infra { .. } => Self::ServiceUnavailable { message },
            Error::Timeout { .. } => Self::Timeout { message },
            Error::Bulkhead { .. } => Self::Bulkhead { message },
            Error::Circuit { .. } => Self::Circuit { message },
            Error::Internal { cause, .. } => Self::Internal { message, cause },
        }
    }
}

/// Failure value fed to [`map_to`]: either already a boundary member or an
/// ad-hoc cause.
pub enum BoundaryCause {
    Boundary(BoundaryError),
    Other(String),
}

impl From<BoundaryError> for BoundaryCause {
    fn from(err: BoundaryError) -> Self {
        Self::Boundary(err)
    }
}

impl From<Error> for BoundaryCause {
    fn from(err: Error) -> Self {
        // Structural check on the tag: variants whose tag is in the catalog
        // pass through under their canonical collapse, the rest are ad-hoc.
        if BoundaryError::is(err.tag()) {
            Self::Boundary(BoundaryError::from(err))
        } else {
            Self::Other(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BoundaryCause {
    fn from(err: serde_json::Error) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<std::io::Error> for BoundaryCause {
    fn from(err: std::io::Error) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<String> for BoundaryCause {
    fn from(msg: String) -> Self {
        Self::Other(msg)
    }
}

impl From<&str> for BoundaryCause {
    fn from(msg: &str) -> Self {
        Self::Other(msg.to_string())
    }
}

/// Last-mile boundary collapse
///
/// Values already in the boundary catalog pass through unchanged; anything
/// else is wrapped as `Internal` with `label` as the details and the original
/// failure as the cause. This is the only place ad-hoc errors may be caught.
pub fn map_to<E>(label: &'static str) -> impl Fn(E) -> BoundaryError
where
    E: Into<BoundaryCause>,
{
    move |err| match err.into() {
        BoundaryCause::Boundary(b) => b,
        BoundaryCause::Other(cause) => BoundaryError::Internal {
            message: label.to_string(),
            cause: Some(cause),
        },
    }
}

/// Wire body for boundary errors
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable discriminator
    #[serde(rename = "_tag")]
    pub tag: String,

    /// User-facing message
    pub message: String,
}

impl IntoResponse for BoundaryError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(tag = self.tag(), message = %self.message(), "boundary error");
        }
        let body = ErrorBody {
            tag: self.tag().to_string(),
            message: self.message().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        BoundaryError::from(self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message_format() {
        let err = Error::not_found_id("user", "42");
        assert_eq!(err.to_string(), "NotFound: user/42");

        let err = Error::not_found("user");
        assert_eq!(err.to_string(), "NotFound: user");
    }

    #[test]
    fn test_conflict_message_format() {
        let err = Error::conflict("idempotency", "body_mismatch");
        assert_eq!(err.to_string(), "Conflict: idempotency - body_mismatch");
    }

    #[test]
    fn test_retry_classification() {
        assert!(!Error::auth("missing_session").is_retriable());
        assert!(!Error::forbidden("nope").is_retriable());
        assert!(!Error::validation("name", "empty").is_retriable());
        assert!(!Error::not_found("app").is_retriable());
        assert!(!Error::conflict("app", "dup").is_retriable());
        assert!(!Error::OAuth {
            reason: "revoked".into()
        }
        .is_retriable());

        assert!(Error::infra("pool exhausted").is_retriable());
        assert!(Error::Timeout {
            name: "db".into(),
            duration: Duration::from_secs(30)
        }
        .is_retriable());
        assert!(Error::internal("boom").is_retriable());
    }

    #[test]
    fn test_status_mapping() {
        let cases: Vec<(Error, StatusCode)> = vec![
            (Error::auth("x"), StatusCode::UNAUTHORIZED),
            (
                Error::OAuth { reason: "x".into() },
                StatusCode::UNAUTHORIZED,
            ),
            (Error::forbidden("x"), StatusCode::FORBIDDEN),
            (Error::not_found("x"), StatusCode::NOT_FOUND),
            (Error::conflict("x", "y"), StatusCode::CONFLICT),
            (
                Error::Gone {
                    resource: "x".into(),
                },
                StatusCode::GONE,
            ),
            (
                Error::validation("x", "y"),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (Error::RateLimit, StatusCode::TOO_MANY_REQUESTS),
            (Error::internal("x"), StatusCode::INTERNAL_SERVER_ERROR),
            (
                Error::Timeout {
                    name: "x".into(),
                    duration: Duration::from_secs(1),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                Error::Bulkhead {
                    name: "x".into(),
                    capacity: 8,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                Error::Circuit { name: "x".into() },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (Error::infra("x"), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, status) in cases {
            assert_eq!(BoundaryError::from(err).status(), status);
        }
    }

    #[test]
    fn test_catalog_membership() {
        assert!(BoundaryError::is("NotFound"));
        assert!(BoundaryError::is("TimeoutError"));
        assert!(BoundaryError::is("CircuitError"));
        assert!(!BoundaryError::is("Stale"));
        assert!(!BoundaryError::is("Infra"));
        assert!(!BoundaryError::is("SomethingElse"));
    }

    #[test]
    fn test_map_to_passes_boundary_values_through() {
        let mapper = map_to("load_app");
        let out = mapper(Error::not_found_id("app", "7"));
        assert_eq!(out.tag(), "NotFound");
        assert_eq!(out.message(), "NotFound: app/7");
    }

    #[test]
    fn test_map_to_wraps_adhoc_errors() {
        let mapper = map_to("load_app");
        let bad_json: serde_json::Error =
            serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let out = mapper(bad_json);
        assert_eq!(out.tag(), "Internal");
        assert_eq!(out.message(), "load_app");
        match out {
            BoundaryError::Internal { cause, .. } => assert!(cause.is_some()),
            other => panic!("expected Internal, got {}", other.tag()),
        }
    }

    #[test]
    fn test_map_to_wraps_non_catalog_internal_variants() {
        let mapper = map_to("save_doc");
        let out = mapper(Error::Stale {
            expected: "3".into(),
            actual: "5".into(),
        });
        // Stale is not a catalog tag, so it wraps rather than passing through.
        assert_eq!(out.tag(), "Internal");
        assert_eq!(out.message(), "save_doc");
    }

    #[test]
    fn test_resilience_tags() {
        assert_eq!(
            Error::Timeout {
                name: "db".into(),
                duration: Duration::from_secs(30)
            }
            .tag(),
            "TimeoutError"
        );
        assert_eq!(
            Error::Bulkhead {
                name: "db".into(),
                capacity: 4
            }
            .tag(),
            "BulkheadError"
        );
        assert_eq!(Error::Circuit { name: "db".into() }.tag(), "CircuitError");
    }
}
