//! HTTP middleware: request-context ingress, rate-limit headers, and
//! normalized route metrics
//!
//! The ingress layer builds the ambient [`RequestContext`] from request
//! headers and scopes the rest of the stack under it, so handlers and
//! services read tenancy and correlation without explicit plumbing.

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tower_http::{
    request_id::PropagateRequestIdLayer, sensitive_headers::SetSensitiveRequestHeadersLayer,
};

use crate::context::{self, headers, RateLimitInfo, RequestContext, RequestId, TenantId};
use crate::error::{Error, Result};
use crate::metrics;

/// Sensitive headers masked in logs and traces
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
];

/// Create a sensitive headers layer
pub fn sensitive_headers_layer() -> SetSensitiveRequestHeadersLayer {
    let header_names = SENSITIVE_HEADERS
        .iter()
        .map(|h| h.parse().expect("valid header name"))
        .collect::<Vec<HeaderName>>();
    SetSensitiveRequestHeadersLayer::new(header_names)
}

/// Create a request ID propagation layer
pub fn request_id_propagation_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::x_request_id()
}

/// Build a request context from inbound headers
///
/// A missing tenant header yields the deny sentinel, so unscoped requests
/// fail tenant checks instead of silently crossing tenants.
pub fn context_from_headers(header_map: &HeaderMap) -> RequestContext {
    let request_id = header_value(header_map, headers::REQUEST_ID)
        .and_then(|raw| raw.parse::<RequestId>().ok())
        .unwrap_or_else(RequestId::generate);
    let tenant_id = header_value(header_map, headers::TENANT_ID)
        .or_else(|| header_value(header_map, headers::APP_ID))
        .and_then(|raw| raw.parse::<TenantId>().ok())
        .unwrap_or(TenantId::UNSPECIFIED);

    let mut ctx = RequestContext::system(request_id, tenant_id);
    ctx.ip_address = header_value(header_map, "x-forwarded-for")
        .map(|raw| raw.split(',').next().unwrap_or(&raw).trim().to_string());
    ctx.user_agent = header_value(header_map, "user-agent");
    ctx
}

fn header_value(header_map: &HeaderMap, name: &str) -> Option<String> {
    header_map
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

/// Ingress layer: scope the downstream stack under the request context and
/// echo the correlation id on the response
pub async fn context_ingress(request: Request, next: Next) -> Response {
    let ctx = context_from_headers(request.headers());
    let request_id = ctx.request_id;
    let mut response = context::scope(ctx, next.run(request)).await;
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(headers::REQUEST_ID), value);
    }
    response
}

/// Response layer injecting the rate-limit header triple
///
/// `remaining` is clamped to `[0, limit]`; `reset` is seconds since epoch.
pub async fn rate_limit_headers(request: Request, next: Next) -> Response {
    let rate_limit = context::current().and_then(|ctx| ctx.rate_limit);
    let mut response = next.run(request).await;
    if let Some(info) = rate_limit {
        inject_rate_limit(response.headers_mut(), &info);
    }
    response
}

fn inject_rate_limit(header_map: &mut HeaderMap, info: &RateLimitInfo) {
    let remaining = info.remaining.clamp(0, i64::from(info.limit));
    let reset = chrono::Utc::now().timestamp() + info.reset_after_secs as i64;
    let pairs = [
        (headers::RATELIMIT_LIMIT, info.limit.to_string()),
        (headers::RATELIMIT_REMAINING, remaining.to_string()),
        (headers::RATELIMIT_RESET, reset.to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            header_map.insert(HeaderName::from_static(name), value);
        }
    }
}

/// Route-level metrics with normalized path templates
///
/// Path normalization is the sole cardinality guard for URL-keyed metrics.
pub async fn route_metrics(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = metrics::normalize_path(request.uri().path());
    let start = Instant::now();

    let response = next.run(request).await;

    let mut labels = std::collections::BTreeMap::new();
    labels.insert("http.method".to_string(), method);
    labels.insert("http.route".to_string(), path);
    labels.insert(
        "http.status_code".to_string(),
        response.status().as_u16().to_string(),
    );
    metrics::inc("http_requests", &labels);
    metrics::observe(
        "http_request_duration_ms",
        start.elapsed().as_secs_f64() * 1000.0,
        &labels,
    );
    response
}

/// Extract and validate the inbound idempotency key
pub fn idempotency_key(header_map: &HeaderMap) -> Result<Option<String>> {
    let Some(raw) = header_map.get(headers::IDEMPOTENCY_KEY) else {
        return Ok(None);
    };
    let key = raw
        .to_str()
        .map_err(|_| Error::validation("idempotency_key", "must be UTF-8"))?;
    if key.is_empty() || key.len() > crate::idempotency::MAX_KEY_LEN {
        return Err(Error::validation(
            "idempotency_key",
            format!("must be 1..={} bytes", crate::idempotency::MAX_KEY_LEN),
        ));
    }
    Ok(Some(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, routing::get, Router};
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn echo_tenant() -> String {
        context::current_tenant_id().to_string()
    }

    fn app() -> Router {
        Router::new()
            .route("/whoami", get(echo_tenant))
            .layer(axum::middleware::from_fn(context_ingress))
    }

    #[tokio::test]
    async fn test_ingress_scopes_tenant_from_header() {
        let tenant = Uuid::from_u128(0xBEEF).to_string();
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/whoami")
                    .header(headers::TENANT_ID, &tenant)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&body), tenant);
    }

    #[tokio::test]
    async fn test_ingress_denies_by_default() {
        let response = app()
            .oneshot(Request::builder().uri("/whoami").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(
            String::from_utf8_lossy(&body),
            TenantId::UNSPECIFIED.to_string()
        );
    }

    #[tokio::test]
    async fn test_ingress_echoes_request_id() {
        let request_id = Uuid::now_v7().to_string();
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/whoami")
                    .header(headers::REQUEST_ID, &request_id)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response
                .headers()
                .get(headers::REQUEST_ID)
                .and_then(|v| v.to_str().ok()),
            Some(request_id.as_str())
        );
    }

    #[test]
    fn test_rate_limit_clamping() {
        let mut header_map = HeaderMap::new();
        inject_rate_limit(
            &mut header_map,
            &RateLimitInfo {
                limit: 100,
                remaining: -5,
                reset_after_secs: 60,
                delay_ms: 0,
            },
        );
        assert_eq!(header_map.get(headers::RATELIMIT_REMAINING).unwrap(), "0");

        let mut header_map = HeaderMap::new();
        inject_rate_limit(
            &mut header_map,
            &RateLimitInfo {
                limit: 100,
                remaining: 250,
                reset_after_secs: 60,
                delay_ms: 0,
            },
        );
        assert_eq!(
            header_map.get(headers::RATELIMIT_REMAINING).unwrap(),
            "100"
        );
    }

    #[test]
    fn test_idempotency_key_validation() {
        let mut header_map = HeaderMap::new();
        assert_eq!(idempotency_key(&header_map).unwrap(), None);

        header_map.insert(
            HeaderName::from_static(headers::IDEMPOTENCY_KEY),
            HeaderValue::from_static("key-1"),
        );
        assert_eq!(
            idempotency_key(&header_map).unwrap(),
            Some("key-1".to_string())
        );

        let long = "k".repeat(129);
        header_map.insert(
            HeaderName::from_static(headers::IDEMPOTENCY_KEY),
            HeaderValue::from_str(&long).unwrap(),
        );
        assert!(idempotency_key(&header_map).is_err());
    }

    #[test]
    fn test_sensitive_headers_constant() {
        assert!(SENSITIVE_HEADERS.contains(&"authorization"));
        assert!(SENSITIVE_HEADERS.contains(&"cookie"));
        let _ = sensitive_headers_layer();
    }

    #[test]
    fn test_context_from_headers_forwarded_for() {
        let mut header_map = HeaderMap::new();
        header_map.insert(
            HeaderName::from_static("x-forwarded-for"),
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        let ctx = context_from_headers(&header_map);
        assert_eq!(ctx.ip_address.as_deref(), Some("203.0.113.9"));
    }
}
