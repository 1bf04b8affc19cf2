//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following
//! precedence (highest to lowest):
//! 1. Environment variables (prefix: `PORTAL_`)
//! 2. Current working directory: `./portal.toml`
//! 3. Default values
//!
//! Well-known unprefixed environment variables (`DEPLOYMENT_MODE`,
//! `DATABASE_URL`, `ENCRYPTION_KEY(S)`, provider secrets) are read through
//! [`runtime_projection`], which also classifies them into secrets and plain
//! configuration for deploy tooling.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::{Error, Result};

/// Where the platform is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    #[default]
    Cloud,
    SelfHosted,
}

impl DeploymentMode {
    /// Parse the `DEPLOYMENT_MODE` value; unknown values fall back to cloud
    pub fn parse(value: &str) -> Self {
        match value {
            "selfhosted" => Self::SelfHosted,
            _ => Self::Cloud,
        }
    }
}

/// Outbound email provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailProvider {
    Resend,
    Postmark,
    Ses,
    Smtp,
}

impl EmailProvider {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "resend" => Some(Self::Resend),
            "postmark" => Some(Self::Postmark),
            "ses" => Some(Self::Ses),
            "smtp" => Some(Self::Smtp),
            _ => None,
        }
    }

    /// Secrets that exist only for this provider
    fn secret_names(&self) -> &'static [&'static str] {
        match self {
            Self::Resend => &["RESEND_API_KEY"],
            Self::Postmark => &["POSTMARK_TOKEN"],
            Self::Ses => &["AWS_SECRET_ACCESS_KEY"],
            Self::Smtp => &["SMTP_PASS"],
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Service-level settings
    pub service: ServiceSettings,

    /// Redis connection settings (optional; the in-memory driver is used
    /// when absent)
    #[serde(default)]
    pub redis: Option<RedisSettings>,

    /// Telemetry exporter settings
    #[serde(default)]
    pub otlp: OtlpSettings,

    /// WebSocket fabric settings
    #[serde(default)]
    pub ws: crate::ws::WsSettings,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            service: ServiceSettings::default(),
            redis: None,
            otlp: OtlpSettings::default(),
            ws: crate::ws::WsSettings::default(),
        }
    }
}

impl PlatformConfig {
    /// Load configuration from defaults, `./portal.toml`, and the
    /// environment
    pub fn load() -> Result<Self> {
        let config: PlatformConfig = Figment::new()
            .merge(Serialized::defaults(PlatformConfig::default()))
            .merge(Toml::file("portal.toml"))
            .merge(Env::prefixed("PORTAL_").split("__"))
            .extract()
            .map_err(|e| Error::internal_with_cause("config load failed", e.to_string()))?;
        config.ws.validate()?;
        Ok(config)
    }
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Service name
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Deployment mode (cloud, selfhosted)
    #[serde(default)]
    pub deployment_mode: DeploymentMode,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            port: default_port(),
            log_level: default_log_level(),
            deployment_mode: DeploymentMode::default(),
        }
    }
}

/// Redis connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    /// Redis connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_redis_max_connections")]
    pub max_connections: usize,

    /// Maximum retry attempts for establishing the connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// OpenTelemetry exporter settings
///
/// Endpoints resolve per signal: an explicit per-signal endpoint wins, then
/// the base endpoint, then the deployment-mode default.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OtlpSettings {
    /// Base OTLP endpoint applied to all signals
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Per-signal endpoint override for logs
    #[serde(default)]
    pub logs_endpoint: Option<String>,

    /// Per-signal endpoint override for metrics
    #[serde(default)]
    pub metrics_endpoint: Option<String>,

    /// Per-signal endpoint override for traces
    #[serde(default)]
    pub traces_endpoint: Option<String>,

    /// Exporter headers as `k=v,k=v`
    #[serde(default)]
    pub headers: Option<String>,

    /// Logs exporter selection: `none|otlp|console|otlp,console`
    #[serde(default)]
    pub logs_exporter: Option<String>,
}

/// Telemetry signal kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Logs,
    Metrics,
    Traces,
}

/// Dev default: a local collector
pub const OTLP_DEV_ENDPOINT: &str = "http://127.0.0.1:4318";
/// Prod default: the cluster-internal Alloy service
pub const OTLP_PROD_ENDPOINT: &str = "http://alloy.observability.svc.cluster.local:4318";

impl OtlpSettings {
    /// Resolve the endpoint for a signal under a deployment mode
    pub fn endpoint_for(&self, signal: Signal, mode: DeploymentMode) -> String {
        let per_signal = match signal {
            Signal::Logs => &self.logs_endpoint,
            Signal::Metrics => &self.metrics_endpoint,
            Signal::Traces => &self.traces_endpoint,
        };
        per_signal
            .clone()
            .or_else(|| self.endpoint.clone())
            .unwrap_or_else(|| match mode {
                DeploymentMode::SelfHosted => OTLP_DEV_ENDPOINT.to_string(),
                DeploymentMode::Cloud => OTLP_PROD_ENDPOINT.to_string(),
            })
    }

    /// Parse `k=v,k=v` headers, silently skipping malformed entries
    pub fn parsed_headers(&self) -> Vec<(String, String)> {
        parse_headers(self.headers.as_deref().unwrap_or(""))
    }

    /// Resolve the logs exporter selection
    ///
    /// An unset value keeps the console JSON sink; an explicit value is
    /// parsed as a token list, where only listed tokens are honored.
    pub fn logs_exporters(&self) -> LogsExporters {
        match self.logs_exporter.as_deref() {
            Some(value) => LogsExporters::parse(value),
            None => LogsExporters {
                otlp: false,
                console: true,
            },
        }
    }
}

/// Which logs exporters are active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogsExporters {
    pub otlp: bool,
    pub console: bool,
}

impl LogsExporters {
    /// Parse a comma-separated token list. Only `otlp` and `console` are
    /// honored; `none` and unknown tokens resolve to no exporter.
    pub fn parse(value: &str) -> Self {
        let mut out = Self::default();
        for token in value.split(',') {
            match token.trim() {
                "otlp" => out.otlp = true,
                "console" => out.console = true,
                _ => {}
            }
        }
        out
    }
}

/// Parse `k=v,k=v` header pairs, skipping entries without a `=` or with an
/// empty key
pub fn parse_headers(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Environment variables that are secret in every deployment
const ALWAYS_SECRET: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "GEMINI_API_KEY",
    "OPENAI_API_KEY",
    "POSTGRES_PASSWORD",
    "REDIS_PASSWORD",
    "STORAGE_ACCESS_KEY_ID",
    "STORAGE_SECRET_ACCESS_KEY",
    "ENCRYPTION_KEY",
    "ENCRYPTION_KEYS",
    "DOPPLER_TOKEN",
];

/// Secrets that only exist in self-hosted deployments
const SELFHOSTED_SECRET: &[&str] = &["GRAFANA_ADMIN_PASSWORD"];

/// Split of the raw environment into secrets and plain configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeProjection {
    /// Names of variables that must be provisioned as secrets
    pub secret_names: BTreeSet<String>,
    /// Plain configuration variables; empty-string values are filtered out
    pub config_vars: BTreeMap<String, String>,
}

/// Classify the raw environment map for a deployment mode
///
/// Secret membership is the union of the always-secret set, provider-specific
/// secrets for the configured `EMAIL_PROVIDER`, the encryption key material,
/// and mode-specific extras. Only names actually present with a non-empty
/// value are returned.
pub fn runtime_projection(
    env: &BTreeMap<String, String>,
    mode: DeploymentMode,
) -> RuntimeProjection {
    let mut secret_universe: BTreeSet<&str> = ALWAYS_SECRET.iter().copied().collect();
    if mode == DeploymentMode::SelfHosted {
        secret_universe.extend(SELFHOSTED_SECRET.iter().copied());
    }
    if let Some(provider) = env.get("EMAIL_PROVIDER").and_then(|v| EmailProvider::parse(v)) {
        secret_universe.extend(provider.secret_names().iter().copied());
    }

    let mut secret_names = BTreeSet::new();
    let mut config_vars = BTreeMap::new();
    for (name, value) in env {
        if value.is_empty() {
            continue;
        }
        if secret_universe.contains(name.as_str()) {
            secret_names.insert(name.clone());
        } else {
            config_vars.insert(name.clone(), value.clone());
        }
    }

    RuntimeProjection {
        secret_names,
        config_vars,
    }
}

fn default_service_name() -> String {
    "portal-platform".to_string()
}

const fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_redis_max_connections() -> usize {
    16
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_retry_delay() -> u64 {
    2
}

impl RedisSettings {
    /// Retry delay as a Duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}
