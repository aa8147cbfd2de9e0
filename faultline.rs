//! # Faultline - Service Error Crawler
//!
//! Discovers the live instances of every registered service, polls each instance for
//! the error aggregates it reports about itself, and folds those per-instance snapshots
//! into a single catalog of outstanding errors per service. Operators browse the catalog
//! over HTTP and mark errors as resolved until they happen again.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                            FAULTLINE CRAWLER                                 │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  DISCOVERY → SCRAPER (per service) → FETCH POOL → AGGREGATOR → REPOSITORY   │
//! │                                                                  ↓          │
//! │                                                           HTTP API / METRICS │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Bounded Fetching**: A fixed pool of workers shared by every service
//! - **Delta Merging**: Instance counters are merged without double counting
//! - **Resolve & Revive**: Resolved errors disappear until they are reported again
//! - **Pluggable Storage**: Repository trait with an in-memory backend
//!
//! ## Author
//!
//! AIOps Team - Built with 🔥 and Rust

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// External crate imports organized by functionality.
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::net::TcpListener as TokioTcpListener;
use tokio::signal;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::{JoinHandle as TokioJoinHandle, JoinSet};
use tokio::time::{interval, sleep};

// ----------------------------------------------------------------------------
// Concurrency Primitives & Channels
// ----------------------------------------------------------------------------
use dashmap::DashMap;
use flume::{Receiver as FlumeReceiver, Sender as FlumeSender};
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Deserializer, Serialize};

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use xxhash_rust::xxh3::xxh3_64;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::fmt as tracing_fmt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time Handling
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// HTTP Client & Server
// ----------------------------------------------------------------------------
use reqwest::Client as HttpClient;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, request::Parts as RequestParts, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

// ----------------------------------------------------------------------------
// Async Utilities
// ----------------------------------------------------------------------------
use async_trait::async_trait;
use futures::future::join_all;

// ----------------------------------------------------------------------------
// Configuration & CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// Metrics
// ----------------------------------------------------------------------------
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry as PrometheusRegistry, TextEncoder};

// ----------------------------------------------------------------------------
// Identifiers
// ----------------------------------------------------------------------------
use uuid::Uuid;

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Crawler version - follows semantic versioning
pub const FAULTLINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const FAULTLINE_NAME: &str = "faultline";
pub const FAULTLINE_FULL_NAME: &str = "Faultline Error Crawler";

// ----------------------------------------------------------------------------
// Fetching
// ----------------------------------------------------------------------------

/// Per-request timeout for instance fetches (seconds)
pub const FETCH_TIMEOUT_SECS: u64 = 30;

/// Default number of fetch workers shared by all services
pub const DEFAULT_WORKERS: usize = 8;

/// Bounds for the fetch worker count
pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 256;

/// Scheme used to build instance URLs
pub const DEFAULT_SCHEME: &str = "http";

/// Path polled on every instance unless a service overrides it
pub const DEFAULT_SCRAPE_ENDPOINT: &str = "/errors";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Delay between the end of one scrape cycle and the start of the next (seconds)
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 30;

/// Smallest refresh interval accepted by validation (seconds)
pub const MIN_REFRESH_INTERVAL_SECS: u64 = 1;

/// Default DNS re-resolution period (seconds)
pub const DEFAULT_DNS_REFRESH_INTERVAL_SECS: u64 = 30;

// ----------------------------------------------------------------------------
// API
// ----------------------------------------------------------------------------

/// Default bind address of the query API
pub const DEFAULT_API_ADDR: &str = "0.0.0.0:7777";

/// Occurrences returned per aggregate when the caller does not ask
pub const DEFAULT_NUMBER_OF_ERRORS: usize = 10;

// ----------------------------------------------------------------------------
// Aggregation
// ----------------------------------------------------------------------------

/// Severity substituted for blank severities before persisting
pub const DEFAULT_SEVERITY: &str = "error";

/// Occurrences kept per self-reported aggregate
pub const SELF_REPORT_MAX_LATEST: usize = 10;

/// Namespace of every exported prometheus series
pub const METRICS_NAMESPACE: &str = "faultline";

/// Buffer of the per-service resolution feed
pub const RESOLUTION_CHANNEL_SIZE: usize = 16;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Wire model shared by instances, the aggregator, the repository and the API.
// Field names match the JSON instances expose on their errors endpoint.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp
// ----------------------------------------------------------------------------

/// Second-precision UTC timestamp.
///
/// Serializes as integer unix seconds. Deserializes from either integer seconds
/// or an RFC 3339 string, since instance libraries disagree on the format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs)
    }

    #[inline]
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(since_epoch.as_secs() as i64)
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.0, 0).unwrap_or_default()
    }

    pub fn parse_rfc3339(text: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| Self(dt.timestamp()))
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::EPOCH
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum WireTimestamp {
            Secs(i64),
            Text(String),
        }

        match WireTimestamp::deserialize(deserializer)? {
            WireTimestamp::Secs(secs) => Ok(Timestamp(secs)),
            WireTimestamp::Text(text) => Timestamp::parse_rfc3339(&text)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", text))),
        }
    }
}

/// Treats an explicit JSON `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ----------------------------------------------------------------------------
// 3.2 Error Occurrences
// ----------------------------------------------------------------------------

/// A single error with its cause chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInstance {
    #[serde(default, deserialize_with = "null_as_default")]
    pub class: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub stacktrace: Vec<String>,

    #[serde(default)]
    pub cause: Option<Box<ErrorInstance>>,
}

impl ErrorInstance {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            stacktrace: Vec::new(),
            cause: None,
        }
    }

    pub fn with_stacktrace(mut self, frames: Vec<String>) -> Self {
        self.stacktrace = frames;
        self
    }

    pub fn with_cause(mut self, cause: ErrorInstance) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Number of errors in the chain, this one included.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut current = &self.cause;
        while let Some(cause) = current {
            depth += 1;
            current = &cause.cause;
        }
        depth
    }
}

/// HTTP request that was being served when an error happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpContext {
    #[serde(default, deserialize_with = "null_as_default")]
    pub request_method: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub request_url: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub request_headers: BTreeMap<String, String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub request_body: String,
}

impl HttpContext {
    /// Context of a plain GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            request_method: "GET".into(),
            request_url: url.into(),
            request_headers: BTreeMap::new(),
            request_body: String::new(),
        }
    }
}

/// One concrete occurrence of an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorWithContext {
    #[serde(default, deserialize_with = "null_as_default")]
    pub error: ErrorInstance,

    #[serde(default, deserialize_with = "null_as_default")]
    pub uuid: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: Timestamp,

    #[serde(default, deserialize_with = "null_as_default")]
    pub severity: String,

    #[serde(default)]
    pub http_context: Option<HttpContext>,
}

// ----------------------------------------------------------------------------
// 3.3 Aggregates & Payloads
// ----------------------------------------------------------------------------

/// Summary of all occurrences sharing one aggregation key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorAggregate {
    #[serde(default, deserialize_with = "null_as_default")]
    pub aggregation_key: String,

    /// Cumulative count as reported by the instance (never reset on the instance side)
    #[serde(default)]
    pub total_count: u64,

    #[serde(default, deserialize_with = "null_as_default")]
    pub severity: String,

    /// Sample of recent occurrences, newest first once merged
    #[serde(default, deserialize_with = "null_as_default")]
    pub latest_errors: Vec<ErrorWithContext>,

    #[serde(default)]
    pub created_at: Option<Timestamp>,
}

impl ErrorAggregate {
    /// Copy with at most `limit` occurrences.
    pub fn truncated(&self, limit: usize) -> Self {
        let mut copy = self.clone();
        copy.latest_errors.truncate(limit);
        copy
    }
}

/// Body returned by an instance's errors endpoint.
///
/// `target` and `fetched_at` never travel on the wire; the fetcher stamps them
/// so the aggregator can attribute contributions and date aggregates that
/// arrive without a creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePayload {
    #[serde(default, deserialize_with = "null_as_default")]
    pub aggregated_errors: Vec<ErrorAggregate>,

    #[serde(skip)]
    pub target: String,

    #[serde(skip)]
    pub fetched_at: Timestamp,
}

impl ResponsePayload {
    /// Payload contributed by a target whose fetch failed.
    pub fn empty(target: impl Into<String>) -> Self {
        Self {
            aggregated_errors: Vec::new(),
            target: target.into(),
            fetched_at: Timestamp::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.aggregated_errors.is_empty()
    }
}

/// A resolved instance address (`host:port`), as exposed by the targets endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub endpoint: String,
}

/// Current set of instance addresses (`host:port`) of one service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedAddresses {
    pub addresses: Vec<String>,
}

// ----------------------------------------------------------------------------
// 3.4 Helpers
// ----------------------------------------------------------------------------

/// Returns the severity, or the default severity when it is blank.
pub fn severity_with_fallback(severity: &str) -> String {
    if severity.trim().is_empty() {
        DEFAULT_SEVERITY.to_string()
    } else {
        severity.to_string()
    }
}

/// Concatenates both lists and sorts them newest first.
///
/// The sort is stable, so occurrences with equal timestamps keep their
/// concatenation order. Nothing is deduplicated.
pub fn merge_latest_errors(
    first: &[ErrorWithContext],
    second: &[ErrorWithContext],
) -> Vec<ErrorWithContext> {
    let mut combined = Vec::with_capacity(first.len() + second.len());
    combined.extend_from_slice(first);
    combined.extend_from_slice(second);
    combined.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    combined
}

#[cfg(test)]
mod core_type_tests {
    use super::*;
    use crate::test_support::*;
    use test_case::test_case;

    #[test]
    fn test_timestamp_accepts_seconds_and_rfc3339() {
        let from_secs: Timestamp = serde_json::from_str("1615215845").unwrap();
        let from_text: Timestamp = serde_json::from_str("\"2021-03-08T15:04:05Z\"").unwrap();

        assert_eq!(from_secs, from_text);
        assert_eq!(from_secs.as_secs(), 1_615_215_845);
        assert_eq!(serde_json::to_string(&from_text).unwrap(), "1615215845");
        assert_eq!(from_secs.to_string(), "2021-03-08 15:04:05 UTC");
    }

    #[test]
    fn test_timestamp_rejects_garbage() {
        assert!(serde_json::from_str::<Timestamp>("\"yesterday\"").is_err());
    }

    #[test]
    fn test_payload_parses_instance_response() {
        let payload: ResponsePayload = serde_json::from_str(SAMPLE_RESPONSE).unwrap();

        assert_eq!(payload.aggregated_errors.len(), 1);
        let aggregate = &payload.aggregated_errors[0];
        assert_eq!(aggregate.aggregation_key, "java.lang.IllegalStateException@e28e036e");
        assert_eq!(aggregate.total_count, 2);
        assert_eq!(aggregate.created_at, Some(Timestamp::from_secs(1_615_215_845)));
        assert_eq!(aggregate.latest_errors.len(), 2);

        let first = &aggregate.latest_errors[0];
        assert_eq!(first.error.depth(), 2);
        assert_eq!(first.error.cause.as_ref().unwrap().stacktrace, Vec::<String>::new());
        let context = first.http_context.as_ref().unwrap();
        assert_eq!(context.request_method, "GET");
        assert_eq!(context.request_headers.get("Accept").map(String::as_str), Some("*/*"));

        let second = &aggregate.latest_errors[1];
        assert_eq!(second.timestamp, Timestamp::from_secs(1_615_215_900));
        assert!(second.http_context.is_none());
        assert_eq!(payload.target, "");
    }

    #[test]
    fn test_cause_chain_survives_serialization() {
        let error = ErrorInstance::new("Outer", "outer failed")
            .with_stacktrace(vec!["frame 1".into()])
            .with_cause(ErrorInstance::new("Middle", "middle failed").with_cause(ErrorInstance::new("Root", "root")));

        let json = serde_json::to_string(&error).unwrap();
        let decoded: ErrorInstance = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.depth(), 3);
        assert_eq!(decoded, error);
    }

    #[test]
    fn test_merge_latest_errors_orders_newest_first() {
        let merged = merge_latest_errors(
            &[occurrence("uuid1", 10), occurrence("uuid3", 30)],
            &[occurrence("uuid2", 20), occurrence("uuid4", 5)],
        );

        let uuids: Vec<&str> = merged.iter().map(|e| e.uuid.as_str()).collect();
        assert_eq!(uuids, vec!["uuid3", "uuid2", "uuid1", "uuid4"]);
        let seconds: Vec<i64> = merged.iter().map(|e| e.timestamp.as_secs()).collect();
        assert_eq!(seconds, vec![30, 20, 10, 5]);
    }

    #[test]
    fn test_merge_latest_errors_keeps_duplicates() {
        let merged = merge_latest_errors(&[occurrence("same", 5)], &[occurrence("same", 5)]);
        assert_eq!(merged.len(), 2);
    }

    #[test_case("" => "error"; "empty severity")]
    #[test_case("   " => "error"; "blank severity")]
    #[test_case("warning" => "warning"; "explicit severity")]
    fn test_severity_fallback(severity: &str) -> String {
        severity_with_fallback(severity)
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types per subsystem, each convertible into the umbrella error.
// Library code returns these; only the binary entry point uses anyhow.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Errors
// ----------------------------------------------------------------------------

/// The main error type for the crawler.
#[derive(Error, Debug)]
pub enum FaultlineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FaultlineError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            FaultlineError::Config(_) => false,
            FaultlineError::Fetch(_) => true,
            FaultlineError::Repository(e) => e.is_recoverable(),
            FaultlineError::Discovery(e) => e.is_recoverable(),
            FaultlineError::Io(_) => true,
            FaultlineError::Internal(_) => false,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            FaultlineError::Config(_) => "config",
            FaultlineError::Fetch(_) => "fetch",
            FaultlineError::Repository(_) => "repository",
            FaultlineError::Discovery(_) => "discovery",
            FaultlineError::Io(_) => "io",
            FaultlineError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        ConfigError::MissingField { field: field.into() }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Fetch Errors
// ----------------------------------------------------------------------------

/// Why a single instance fetch produced no payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Request to '{target}' failed: {message}")]
    RequestFailed { target: String, message: String },

    #[error("Request to '{target}' timed out after {timeout_ms}ms")]
    Timeout { target: String, timeout_ms: u64 },

    #[error("'{target}' answered with HTTP {status}")]
    UnexpectedStatus { target: String, status: u16 },

    #[error("Malformed payload from '{target}': {message}")]
    MalformedPayload { target: String, message: String },

    #[error("HTTP client could not be built: {message}")]
    ClientBuild { message: String },
}

impl FetchError {
    pub fn target(&self) -> Option<&str> {
        match self {
            FetchError::RequestFailed { target, .. }
            | FetchError::Timeout { target, .. }
            | FetchError::UnexpectedStatus { target, .. }
            | FetchError::MalformedPayload { target, .. } => Some(target),
            FetchError::ClientBuild { .. } => None,
        }
    }

    /// Class name used when the failure is reported as a self error
    pub fn class(&self) -> &'static str {
        match self {
            FetchError::RequestFailed { .. } => "faultline.fetch.RequestFailed",
            FetchError::Timeout { .. } => "faultline.fetch.Timeout",
            FetchError::UnexpectedStatus { .. } => "faultline.fetch.UnexpectedStatus",
            FetchError::MalformedPayload { .. } => "faultline.fetch.MalformedPayload",
            FetchError::ClientBuild { .. } => "faultline.fetch.ClientBuild",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Repository Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("service {service} not found")]
    ServiceNotFound { service: String },

    #[error("Repository unavailable: {message}")]
    Unavailable { message: String },

    #[error("Unknown repository kind '{kind}'")]
    UnknownKind { kind: String },
}

impl RepositoryError {
    pub fn not_found(service: impl Into<String>) -> Self {
        RepositoryError::ServiceNotFound { service: service.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::ServiceNotFound { .. })
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, RepositoryError::Unavailable { .. })
    }
}

// ----------------------------------------------------------------------------
// 4.5 Discovery Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Lookup of '{name}' failed: {message}")]
    LookupFailed { name: String, message: String },

    #[error("Invalid discovery configuration for service '{service}': {message}")]
    InvalidConfiguration { service: String, message: String },
}

impl DiscoveryError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DiscoveryError::LookupFailed { .. })
    }
}

// ----------------------------------------------------------------------------
// 4.6 Result Type Aliases
// ----------------------------------------------------------------------------

pub type FaultlineResult<T> = Result<T, FaultlineError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type FetchResult<T> = Result<T, FetchError>;
pub type RepositoryResult<T> = Result<T, RepositoryError>;
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML configuration with environment overrides:
// - FAULTLINE_ prefixed variables, nested keys separated by "__"
// - Durations written in humantime form ("30s", "1m")
// - Validation before anything starts
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the crawler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaultlineConfig {
    /// Fetch worker pool settings
    #[serde(default)]
    pub scraper: ScraperPoolConfig,

    /// Query API settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Repository backend selection
    #[serde(default)]
    pub repository: RepositoryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Registered services
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl FaultlineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("FAULTLINE_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_str(toml_str: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.scraper.workers) {
            return Err(ConfigError::invalid(
                "scraper.workers",
                format!("must be between {} and {}", MIN_WORKERS, MAX_WORKERS),
            ));
        }

        if self.api.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::invalid(
                "api.listen_addr",
                format!("'{}' is not a socket address", self.api.listen_addr),
            ));
        }

        if self.api.default_number_of_errors == 0 {
            return Err(ConfigError::invalid("api.default_number_of_errors", "must be at least 1"));
        }

        if !RepositoryConfig::SUPPORTED_KINDS.contains(&self.repository.kind.as_str()) {
            return Err(ConfigError::invalid(
                "repository.kind",
                format!(
                    "'{}' is not one of: {}",
                    self.repository.kind,
                    RepositoryConfig::SUPPORTED_KINDS.join(", ")
                ),
            ));
        }

        let mut seen = HashSet::with_capacity(self.services.len());
        for (index, service) in self.services.iter().enumerate() {
            let prefix = format!("services[{}]", index);
            service.validate(&prefix)?;
            if !seen.insert(service.name.as_str()) {
                return Err(ConfigError::invalid(
                    format!("{}.name", prefix),
                    format!("service '{}' is defined more than once", service.name),
                ));
            }
        }

        Ok(())
    }

    /// Generate a default configuration file content
    pub fn generate_default_config() -> String {
        let mut config = Self::default();
        config.services.push(ServiceConfig {
            name: "checkout".into(),
            scraper: ServiceScraperConfig::default(),
            service_discovery: ServiceDiscoveryConfig {
                kind: DiscoveryKind::Static,
                addresses: vec!["127.0.0.1:8081".into(), "127.0.0.1:8082".into()],
                ..ServiceDiscoveryConfig::default()
            },
        });
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// Find a service by name
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }
}

// ----------------------------------------------------------------------------
// 5.2 Scraper Pool Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperPoolConfig {
    /// Number of concurrent fetch workers
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for ScraperPoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

// ----------------------------------------------------------------------------
// 5.3 API Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Bind address of the query API
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Occurrences per aggregate when `number_of_errors` is absent
    #[serde(default = "default_number_of_errors")]
    pub default_number_of_errors: usize,

    /// Allow cross-origin requests from http://localhost:* (local UI development)
    #[serde(default = "default_true")]
    pub cors_localhost: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            default_number_of_errors: default_number_of_errors(),
            cors_localhost: true,
        }
    }
}

impl ApiConfig {
    /// Replace the port of `listen_addr`, keeping the host
    pub fn set_port(&mut self, port: u16) {
        let host = match self.listen_addr.rsplit_once(':') {
            Some((host, _)) => host.to_string(),
            None => "0.0.0.0".to_string(),
        };
        self.listen_addr = format!("{}:{}", host, port);
    }
}

fn default_listen_addr() -> String {
    DEFAULT_API_ADDR.into()
}

fn default_number_of_errors() -> usize {
    DEFAULT_NUMBER_OF_ERRORS
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.4 Repository Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Backend kind
    #[serde(default = "default_repository_kind")]
    pub kind: String,
}

impl RepositoryConfig {
    pub const SUPPORTED_KINDS: &'static [&'static str] = &["memory"];
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            kind: default_repository_kind(),
        }
    }
}

fn default_repository_kind() -> String {
    "memory".into()
}

// ----------------------------------------------------------------------------
// 5.5 Service Configuration
// ----------------------------------------------------------------------------

/// A registered service and how to find and poll its instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique service name
    pub name: String,

    #[serde(default)]
    pub scraper: ServiceScraperConfig,

    #[serde(default)]
    pub service_discovery: ServiceDiscoveryConfig,
}

impl ServiceConfig {
    fn validate(&self, prefix: &str) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::missing(format!("{}.name", prefix)));
        }

        if self.scraper.refresh_interval < Duration::from_secs(MIN_REFRESH_INTERVAL_SECS) {
            return Err(ConfigError::invalid(
                format!("{}.scraper.refresh_interval", prefix),
                format!("must be at least {}s", MIN_REFRESH_INTERVAL_SECS),
            ));
        }

        if !self.scraper.endpoint.starts_with('/') {
            return Err(ConfigError::invalid(
                format!("{}.scraper.endpoint", prefix),
                "must start with '/'",
            ));
        }

        let discovery = &self.service_discovery;
        match discovery.kind {
            DiscoveryKind::Static => {
                if discovery.addresses.iter().any(|a| a.trim().is_empty()) {
                    return Err(ConfigError::invalid(
                        format!("{}.service_discovery.addresses", prefix),
                        "addresses must not be blank",
                    ));
                }
            }
            DiscoveryKind::Dns => {
                if discovery.name.as_deref().map_or(true, |n| n.trim().is_empty()) {
                    return Err(ConfigError::missing(format!("{}.service_discovery.name", prefix)));
                }
                if discovery.port.is_none() {
                    return Err(ConfigError::missing(format!("{}.service_discovery.port", prefix)));
                }
                if discovery.refresh_interval < Duration::from_secs(MIN_REFRESH_INTERVAL_SECS) {
                    return Err(ConfigError::invalid(
                        format!("{}.service_discovery.refresh_interval", prefix),
                        format!("must be at least {}s", MIN_REFRESH_INTERVAL_SECS),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Per-service polling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceScraperConfig {
    /// Delay between the end of one cycle and the start of the next
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Path of the errors endpoint on every instance
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// URL scheme used to reach instances
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

impl Default for ServiceScraperConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            endpoint: default_endpoint(),
            scheme: default_scheme(),
        }
    }
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS)
}

fn default_endpoint() -> String {
    DEFAULT_SCRAPE_ENDPOINT.into()
}

fn default_scheme() -> String {
    DEFAULT_SCHEME.into()
}

/// How instance addresses of a service are found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryKind {
    #[default]
    Static,
    Dns,
}

impl Display for DiscoveryKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryKind::Static => write!(f, "static"),
            DiscoveryKind::Dns => write!(f, "dns"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDiscoveryConfig {
    #[serde(rename = "type", default)]
    pub kind: DiscoveryKind,

    /// Fixed `host:port` list (static)
    #[serde(default)]
    pub addresses: Vec<String>,

    /// Host name to resolve (dns)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Port paired with every resolved address (dns)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Re-resolution period (dns)
    #[serde(default = "default_dns_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for ServiceDiscoveryConfig {
    fn default() -> Self {
        Self {
            kind: DiscoveryKind::Static,
            addresses: Vec::new(),
            name: None,
            port: None,
            refresh_interval: default_dns_refresh_interval(),
        }
    }
}

fn default_dns_refresh_interval() -> Duration {
    Duration::from_secs(DEFAULT_DNS_REFRESH_INTERVAL_SECS)
}

// ----------------------------------------------------------------------------
// 5.6 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Use colors in terminal output
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include file and line in log records
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use test_case::test_case;

    const SERVICES_TOML: &str = r#"
[scraper]
workers = 4

[api]
listen_addr = "127.0.0.1:9000"

[[services]]
name = "checkout"

[services.scraper]
refresh_interval = "15s"
endpoint = "/-/errors"

[services.service_discovery]
type = "static"
addresses = ["10.0.0.1:8080", "10.0.0.2:8080"]

[[services]]
name = "billing"

[services.service_discovery]
type = "dns"
name = "billing.internal"
port = 7070
refresh_interval = "1m"
"#;

    #[test]
    fn test_config_defaults() {
        let config = FaultlineConfig::default();

        assert_eq!(config.scraper.workers, DEFAULT_WORKERS);
        assert_eq!(config.api.listen_addr, DEFAULT_API_ADDR);
        assert_eq!(config.api.default_number_of_errors, DEFAULT_NUMBER_OF_ERRORS);
        assert_eq!(config.repository.kind, "memory");
        assert!(config.services.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_parses_services() {
        let config = FaultlineConfig::from_str(SERVICES_TOML).unwrap();

        assert_eq!(config.scraper.workers, 4);
        assert_eq!(config.services.len(), 2);

        let checkout = config.service("checkout").unwrap();
        assert_eq!(checkout.scraper.refresh_interval, Duration::from_secs(15));
        assert_eq!(checkout.scraper.endpoint, "/-/errors");
        assert_eq!(checkout.scraper.scheme, "http");
        assert_eq!(checkout.service_discovery.kind, DiscoveryKind::Static);
        assert_eq!(checkout.service_discovery.addresses.len(), 2);

        let billing = config.service("billing").unwrap();
        assert_eq!(billing.scraper.refresh_interval, Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS));
        assert_eq!(billing.scraper.endpoint, DEFAULT_SCRAPE_ENDPOINT);
        assert_eq!(billing.service_discovery.kind, DiscoveryKind::Dns);
        assert_eq!(billing.service_discovery.name.as_deref(), Some("billing.internal"));
        assert_eq!(billing.service_discovery.port, Some(7070));
        assert_eq!(billing.service_discovery.refresh_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_generated_config_round_trips() {
        let generated = FaultlineConfig::generate_default_config();
        let config = FaultlineConfig::from_str(&generated).unwrap();

        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].name, "checkout");
        assert_eq!(config.services[0].scraper.refresh_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faultline.toml");
        fs::write(&path, SERVICES_TOML).unwrap();

        let config = FaultlineConfig::load(&path).unwrap();
        assert_eq!(config.services.len(), 2);
    }

    #[test]
    fn test_load_missing_file() {
        let err = FaultlineConfig::load("/definitely/not/here/faultline.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_duplicate_service_names_rejected() {
        let toml = r#"
[[services]]
name = "checkout"

[[services]]
name = "checkout"
"#;
        let err = FaultlineConfig::from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "services[1].name"));
    }

    #[test_case("[scraper]\nworkers = 0" => "scraper.workers"; "zero workers")]
    #[test_case("[scraper]\nworkers = 1000" => "scraper.workers"; "too many workers")]
    #[test_case("[api]\nlisten_addr = \"nope\"" => "api.listen_addr"; "bad listen address")]
    #[test_case("[repository]\nkind = \"redis\"" => "repository.kind"; "unknown repository")]
    #[test_case("[[services]]\nname = \"a\"\n[services.scraper]\nrefresh_interval = \"100ms\"" => "services[0].scraper.refresh_interval"; "refresh too short")]
    #[test_case("[[services]]\nname = \"a\"\n[services.scraper]\nendpoint = \"errors\"" => "services[0].scraper.endpoint"; "relative endpoint")]
    #[test_case("[[services]]\nname = \"a\"\n[services.service_discovery]\ntype = \"dns\"\nport = 80" => "services[0].service_discovery.name"; "dns without name")]
    #[test_case("[[services]]\nname = \"a\"\n[services.service_discovery]\ntype = \"dns\"\nname = \"a.local\"" => "services[0].service_discovery.port"; "dns without port")]
    fn test_invalid_config_names_field(toml: &str) -> String {
        match FaultlineConfig::from_str(toml).unwrap_err() {
            ConfigError::InvalidValue { field, .. } | ConfigError::MissingField { field } => field,
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_srv_discovery_is_rejected() {
        let toml = "[[services]]\nname = \"a\"\n[services.service_discovery]\ntype = \"srv\"\nname = \"_errors._tcp.a.local\"";
        match FaultlineConfig::from_str(toml).unwrap_err() {
            ConfigError::ParseError { message } => assert!(message.contains("srv"), "{}", message),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_set_port_keeps_host() {
        let mut api = ApiConfig::default();
        api.set_port(8088);
        assert_eq!(api.listen_addr, "0.0.0.0:8088");
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging through tracing. Targets used across the crate:
// faultline::engine, faultline::scraper, faultline::processor,
// faultline::aggregator, faultline::discovery, faultline::api
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> FaultlineResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format.as_str() {
        "json" => registry
            .with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            )
            .try_init(),
        "compact" => registry
            .with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            )
            .try_init(),
        _ => registry
            .with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            )
            .try_init(),
    };

    result.map_err(|e| FaultlineError::Internal(format!("Failed to set logger: {}", e)))
}

// ----------------------------------------------------------------------------
// 6.2 Cycle Timing
// ----------------------------------------------------------------------------

/// Measures one scrape cycle and warns when it outlives its budget.
#[derive(Debug)]
pub struct CycleTimer {
    service: String,
    start: Instant,
    budget: Option<Duration>,
}

impl CycleTimer {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            start: Instant::now(),
            budget: None,
        }
    }

    pub fn with_budget(service: impl Into<String>, budget: Duration) -> Self {
        Self {
            budget: Some(budget),
            ..Self::new(service)
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer, warning if the budget was exceeded
    pub fn stop(self) -> Duration {
        let elapsed = self.elapsed();
        if let Some(budget) = self.budget {
            if elapsed > budget {
                warn!(
                    target: "faultline::scraper",
                    service = %self.service,
                    elapsed_ms = elapsed.as_millis() as u64,
                    budget_ms = budget.as_millis() as u64,
                    "Scrape cycle took longer than the refresh interval"
                );
            }
        }
        elapsed
    }
}

// ============================================================================
// SECTION 7: PROMETHEUS METRICS
// ============================================================================
// Every series lives in a registry owned by the crawler instance, so several
// crawlers (or several tests) can coexist in one process.
// ============================================================================

/// Counters and gauges describing scrape activity.
pub struct ScrapeMetrics {
    registry: PrometheusRegistry,
    /// Instances polled in the last cycle, per service
    pub instances_scraped: IntGaugeVec,
    /// Aggregates persisted, per service
    pub errors_scraped: IntCounterVec,
    /// Internal failures by kind
    pub application_errors: IntCounterVec,
    /// New occurrences per aggregate and instance
    pub error_occurrences: IntCounterVec,
    /// Failed instance fetches, per service
    pub target_scrape_failures: IntCounterVec,
}

impl ScrapeMetrics {
    pub fn new() -> FaultlineResult<Self> {
        let registry = PrometheusRegistry::new();

        let instances_scraped = IntGaugeVec::new(
            Opts::new("instances_scraped", "Number of instances polled in the last scrape cycle")
                .namespace(METRICS_NAMESPACE),
            &["service_name"],
        )
        .map_err(metrics_error)?;
        let errors_scraped = IntCounterVec::new(
            Opts::new("errors_scraped_total", "Number of error aggregates persisted by scrape cycles")
                .namespace(METRICS_NAMESPACE),
            &["service_name"],
        )
        .map_err(metrics_error)?;
        let application_errors = IntCounterVec::new(
            Opts::new("application_errors_total", "Internal failures of the crawler by kind")
                .namespace(METRICS_NAMESPACE),
            &["type"],
        )
        .map_err(metrics_error)?;
        let error_occurrences = IntCounterVec::new(
            Opts::new("error_occurrences_total", "New error occurrences observed per instance")
                .namespace(METRICS_NAMESPACE),
            &["service_name", "severity", "target", "aggregation_key"],
        )
        .map_err(metrics_error)?;
        let target_scrape_failures = IntCounterVec::new(
            Opts::new("target_scrape_failures_total", "Instance fetches that produced no payload")
                .namespace(METRICS_NAMESPACE),
            &["service_name"],
        )
        .map_err(metrics_error)?;

        registry.register(Box::new(instances_scraped.clone())).map_err(metrics_error)?;
        registry.register(Box::new(errors_scraped.clone())).map_err(metrics_error)?;
        registry.register(Box::new(application_errors.clone())).map_err(metrics_error)?;
        registry.register(Box::new(error_occurrences.clone())).map_err(metrics_error)?;
        registry.register(Box::new(target_scrape_failures.clone())).map_err(metrics_error)?;

        Ok(Self {
            registry,
            instances_scraped,
            errors_scraped,
            application_errors,
            error_occurrences,
            target_scrape_failures,
        })
    }

    pub fn record_application_error(&self, kind: &str) {
        self.application_errors.with_label_values(&[kind]).inc();
    }

    /// Render all series in the prometheus text exposition format
    pub fn render(&self) -> FaultlineResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| FaultlineError::Internal(e.to_string()))
    }
}

impl Debug for ScrapeMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScrapeMetrics")
            .field("families", &self.registry.gather().len())
            .finish()
    }
}

fn metrics_error(e: prometheus::Error) -> FaultlineError {
    FaultlineError::Internal(format!("metrics: {}", e))
}

// ============================================================================
// SECTION 8: SELF ERROR COLLECTOR
// ============================================================================
// The crawler reports its own failures in the same shape instances use,
// served on GET /errors so one crawler can scrape another.
// ============================================================================

/// Aggregation key of an error: its class plus a hash of the class.
/// Messages are not part of the key; they only appear in latest occurrences.
pub fn aggregation_key_for(error: &ErrorInstance) -> String {
    let hash = xxh3_64(error.class.as_bytes());
    format!("{}@{:08x}", error.class, hash as u32)
}

#[derive(Debug)]
pub struct ErrorCollector {
    aggregates: DashMap<String, ErrorAggregate>,
    max_latest: usize,
}

impl Default for ErrorCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::with_max_latest(SELF_REPORT_MAX_LATEST)
    }

    pub fn with_max_latest(max_latest: usize) -> Self {
        Self {
            aggregates: DashMap::new(),
            max_latest: max_latest.max(1),
        }
    }

    /// Record one occurrence of an internal failure
    pub fn report(&self, class: &str, message: &str, severity: &str, http_context: Option<HttpContext>) {
        let error = ErrorInstance::new(class, message);
        let key = aggregation_key_for(&error);
        let now = Timestamp::now();
        let severity = severity_with_fallback(severity);

        let occurrence = ErrorWithContext {
            error,
            uuid: Uuid::new_v4().to_string(),
            timestamp: now,
            severity: severity.clone(),
            http_context,
        };

        let mut aggregate = self
            .aggregates
            .entry(key.clone())
            .or_insert_with(|| ErrorAggregate {
                aggregation_key: key,
                total_count: 0,
                severity: severity.clone(),
                latest_errors: Vec::new(),
                created_at: Some(now),
            });
        aggregate.total_count = aggregate.total_count.saturating_add(1);
        aggregate.severity = severity;
        aggregate.latest_errors.insert(0, occurrence);
        aggregate.latest_errors.truncate(self.max_latest);
    }

    /// Snapshot in the instance wire format, sorted by key
    pub fn export(&self) -> ResponsePayload {
        let mut aggregated_errors: Vec<ErrorAggregate> =
            self.aggregates.iter().map(|entry| entry.value().clone()).collect();
        aggregated_errors.sort_by(|a, b| a.aggregation_key.cmp(&b.aggregation_key));
        ResponsePayload {
            aggregated_errors,
            target: String::new(),
            fetched_at: Timestamp::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.aggregates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty()
    }
}

#[cfg(test)]
mod collector_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_report_groups_by_class() {
        let collector = ErrorCollector::new();
        collector.report("fetch.Timeout", "target a timed out", "warning", None);
        collector.report("fetch.Timeout", "target b timed out", "", None);
        collector.report("fetch.UnexpectedStatus", "target a answered 500", "warning", None);

        let payload = collector.export();
        assert_eq!(payload.aggregated_errors.len(), 2);

        let timeouts = payload
            .aggregated_errors
            .iter()
            .find(|a| a.aggregation_key.starts_with("fetch.Timeout@"))
            .unwrap();
        assert_eq!(timeouts.total_count, 2);
        assert!(timeouts.created_at.is_some());
        assert_eq!(timeouts.latest_errors[0].error.message, "target b timed out");
        assert_eq!(timeouts.latest_errors[1].error.message, "target a timed out");
        assert_eq!(timeouts.severity, DEFAULT_SEVERITY);
    }

    #[test]
    fn test_report_keeps_latest_occurrences_newest_first() {
        let collector = ErrorCollector::with_max_latest(3);
        for _ in 0..5 {
            collector.report("repo.Unavailable", "down", "error", Some(HttpContext::get("http://x/errors")));
        }

        let payload = collector.export();
        let aggregate = &payload.aggregated_errors[0];
        assert_eq!(aggregate.total_count, 5);
        assert_eq!(aggregate.latest_errors.len(), 3);
        assert_eq!(
            aggregate.latest_errors[0].http_context.as_ref().map(|c| c.request_url.as_str()),
            Some("http://x/errors")
        );
    }

    #[test]
    fn test_aggregation_key_is_stable() {
        let a = ErrorInstance::new("Boom", "message");
        let b = ErrorInstance::new("Boom", "message");
        let c = ErrorInstance::new("Bang", "message");

        assert_eq!(aggregation_key_for(&a), aggregation_key_for(&b));
        assert_ne!(aggregation_key_for(&a), aggregation_key_for(&c));
        assert_eq!(
            aggregation_key_for(&ErrorInstance::new("Boom", "other message")),
            aggregation_key_for(&a)
        );
    }

    #[test]
    fn test_metrics_render_contains_series() {
        let metrics = ScrapeMetrics::new().unwrap();
        metrics.instances_scraped.with_label_values(&["checkout"]).set(3);
        metrics.record_application_error("store_errors");

        let text = metrics.render().unwrap();
        assert!(text.contains("faultline_instances_scraped{service_name=\"checkout\"} 3"));
        assert!(text.contains("faultline_application_errors_total{type=\"store_errors\"} 1"));
    }
}

// ============================================================================
// SECTION 9: ERRORS REPOSITORY
// ============================================================================
// Storage seam between the scrape cycles and the query API. Each cycle
// replaces a service's snapshot wholesale; resolution state lives beside it.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Repository Trait
// ----------------------------------------------------------------------------

#[async_trait]
pub trait ErrorsRepository: Send + Sync {
    /// Replace the snapshot of a service
    async fn store_errors(&self, service_name: &str, errors: Vec<ErrorAggregate>) -> RepositoryResult<()>;

    /// Snapshot of a service with each `latest_errors` capped at `number_of_errors`
    async fn get_errors(&self, service_name: &str, number_of_errors: usize) -> RepositoryResult<Vec<ErrorAggregate>>;

    /// Names of every service with a stored snapshot, sorted
    async fn get_services(&self) -> RepositoryResult<Vec<String>>;

    /// Drop an aggregate from the snapshot and remember it as resolved
    async fn resolve_error(&self, service_name: &str, aggregation_key: &str) -> RepositoryResult<()>;

    async fn search_resolved(&self, service_name: &str, aggregation_key: &str) -> RepositoryResult<bool>;

    /// Forget a resolved marker; a no-op when none exists
    async fn remove_resolved(&self, service_name: &str, aggregation_key: &str) -> RepositoryResult<()>;

    async fn store_targets(&self, service_name: &str, targets: Vec<Target>) -> RepositoryResult<()>;

    async fn get_targets(&self) -> RepositoryResult<BTreeMap<String, Vec<Target>>>;
}

// ----------------------------------------------------------------------------
// 9.2 In-Memory Repository
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryRepository {
    aggregated_errors: DashMap<String, Vec<ErrorAggregate>>,
    resolved_errors: DashMap<String, HashSet<String>>,
    targets: DashMap<String, Vec<Target>>,
    metrics: Option<Arc<ScrapeMetrics>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count lookups of unknown services in `application_errors_total`
    pub fn with_metrics(metrics: Arc<ScrapeMetrics>) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::default()
        }
    }

    fn service_not_found(&self, service_name: &str) -> RepositoryError {
        if let Some(metrics) = &self.metrics {
            metrics.record_application_error("service_not_found");
        }
        RepositoryError::not_found(service_name)
    }
}

#[async_trait]
impl ErrorsRepository for MemoryRepository {
    async fn store_errors(&self, service_name: &str, errors: Vec<ErrorAggregate>) -> RepositoryResult<()> {
        self.aggregated_errors.insert(service_name.to_string(), errors);
        Ok(())
    }

    async fn get_errors(&self, service_name: &str, number_of_errors: usize) -> RepositoryResult<Vec<ErrorAggregate>> {
        let errors = self
            .aggregated_errors
            .get(service_name)
            .ok_or_else(|| self.service_not_found(service_name))?;
        Ok(errors.iter().map(|aggregate| aggregate.truncated(number_of_errors)).collect())
    }

    async fn get_services(&self) -> RepositoryResult<Vec<String>> {
        let mut services: Vec<String> = self.aggregated_errors.iter().map(|entry| entry.key().clone()).collect();
        services.sort();
        Ok(services)
    }

    async fn resolve_error(&self, service_name: &str, aggregation_key: &str) -> RepositoryResult<()> {
        {
            let mut errors = self
                .aggregated_errors
                .get_mut(service_name)
                .ok_or_else(|| self.service_not_found(service_name))?;
            errors.retain(|aggregate| aggregate.aggregation_key != aggregation_key);
        }
        self.resolved_errors
            .entry(service_name.to_string())
            .or_default()
            .insert(aggregation_key.to_string());
        Ok(())
    }

    async fn search_resolved(&self, service_name: &str, aggregation_key: &str) -> RepositoryResult<bool> {
        Ok(self
            .resolved_errors
            .get(service_name)
            .map_or(false, |keys| keys.contains(aggregation_key)))
    }

    async fn remove_resolved(&self, service_name: &str, aggregation_key: &str) -> RepositoryResult<()> {
        if let Some(mut keys) = self.resolved_errors.get_mut(service_name) {
            keys.remove(aggregation_key);
        }
        Ok(())
    }

    async fn store_targets(&self, service_name: &str, targets: Vec<Target>) -> RepositoryResult<()> {
        self.targets.insert(service_name.to_string(), targets);
        Ok(())
    }

    async fn get_targets(&self) -> RepositoryResult<BTreeMap<String, Vec<Target>>> {
        Ok(self
            .targets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }
}

// ----------------------------------------------------------------------------
// 9.3 Backend Selection
// ----------------------------------------------------------------------------

pub fn repository_from_config(
    config: &RepositoryConfig,
    metrics: Arc<ScrapeMetrics>,
) -> RepositoryResult<Arc<dyn ErrorsRepository>> {
    match config.kind.as_str() {
        "memory" => Ok(Arc::new(MemoryRepository::with_metrics(metrics))),
        other => Err(RepositoryError::UnknownKind { kind: other.to_string() }),
    }
}


// ============================================================================
// SECTION 10: SERVICE DISCOVERY
// ============================================================================
// Resolvers publish the address set of one service on a channel. The
// scheduler keeps the last set it received, so a feed that ends (static
// lists) or stalls (failing DNS) leaves scraping running.
// ============================================================================

pub trait Resolver: Send + Sync {
    /// Start resolving and return the update feed
    fn resolve(&self) -> mpsc::Receiver<ResolvedAddresses>;
}

// ----------------------------------------------------------------------------
// 10.1 Static Resolver
// ----------------------------------------------------------------------------

/// Publishes a fixed address list once, then closes the feed.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    addresses: Vec<String>,
}

impl StaticResolver {
    pub fn new(addresses: Vec<String>) -> Self {
        Self { addresses }
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self) -> mpsc::Receiver<ResolvedAddresses> {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(ResolvedAddresses {
            addresses: self.addresses.clone(),
        });
        rx
    }
}

// ----------------------------------------------------------------------------
// 10.2 DNS Resolver
// ----------------------------------------------------------------------------

/// Periodically resolves a host name and publishes the set when it changes.
#[derive(Debug, Clone)]
pub struct DnsResolver {
    service: String,
    name: String,
    port: u16,
    refresh_interval: Duration,
}

impl DnsResolver {
    pub fn new(service: impl Into<String>, name: impl Into<String>, port: u16, refresh_interval: Duration) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
            port,
            refresh_interval,
        }
    }

    /// Resolve once, returning sorted and de-duplicated `host:port` strings
    pub async fn lookup(name: &str, port: u16) -> DiscoveryResult<Vec<String>> {
        let resolved = tokio::net::lookup_host((name, port))
            .await
            .map_err(|e| DiscoveryError::LookupFailed {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        let mut addresses: Vec<String> = resolved.map(|addr| addr.to_string()).collect();
        addresses.sort();
        addresses.dedup();
        Ok(addresses)
    }
}

impl Resolver for DnsResolver {
    fn resolve(&self) -> mpsc::Receiver<ResolvedAddresses> {
        let (tx, rx) = mpsc::channel(RESOLUTION_CHANNEL_SIZE);
        let resolver = self.clone();

        tokio::spawn(async move {
            let mut tick = interval(resolver.refresh_interval.max(Duration::from_secs(MIN_REFRESH_INTERVAL_SECS)));
            let mut last: Option<Vec<String>> = None;

            loop {
                tick.tick().await;
                if tx.is_closed() {
                    debug!(target: "faultline::discovery", service = %resolver.service, "Resolution feed dropped");
                    break;
                }

                match DnsResolver::lookup(&resolver.name, resolver.port).await {
                    Ok(addresses) => {
                        if last.as_ref() == Some(&addresses) {
                            trace!(target: "faultline::discovery", service = %resolver.service, "Address set unchanged");
                            continue;
                        }
                        debug!(target: "faultline::discovery",
                            service = %resolver.service,
                            name = %resolver.name,
                            instances = addresses.len(),
                            "Address set changed");
                        if tx.send(ResolvedAddresses { addresses: addresses.clone() }).await.is_err() {
                            break;
                        }
                        last = Some(addresses);
                    }
                    Err(e) => {
                        warn!(target: "faultline::discovery",
                            service = %resolver.service,
                            error = %e,
                            "Lookup failed, keeping previous address set");
                    }
                }
            }
        });

        rx
    }
}

/// Build the resolver configured for a service
pub fn resolver_for(service: &ServiceConfig) -> DiscoveryResult<Box<dyn Resolver>> {
    let discovery = &service.service_discovery;
    match discovery.kind {
        DiscoveryKind::Static => Ok(Box::new(StaticResolver::new(discovery.addresses.clone()))),
        DiscoveryKind::Dns => {
            let (name, port) = match (&discovery.name, discovery.port) {
                (Some(name), Some(port)) => (name.clone(), port),
                _ => {
                    return Err(DiscoveryError::InvalidConfiguration {
                        service: service.name.clone(),
                        message: "dns discovery needs both name and port".into(),
                    })
                }
            };
            Ok(Box::new(DnsResolver::new(
                service.name.clone(),
                name,
                port,
                discovery.refresh_interval,
            )))
        }
    }
}


// ============================================================================
// SECTION 11: FETCH WORKER POOL
// ============================================================================
// A fixed number of workers drain one shared queue of fetch requests. Each
// request carries its own reply channel, and a failed fetch still replies
// with an empty payload so the requesting cycle never waits forever.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Fetcher
// ----------------------------------------------------------------------------

#[async_trait]
pub trait ErrorsFetcher: Send + Sync {
    /// Fetch and decode the payload served at `target`
    async fn fetch(&self, target: &str) -> FetchResult<ResponsePayload>;
}

/// Fetches instance payloads over HTTP.
#[derive(Debug, Clone)]
pub struct HttpErrorsFetcher {
    client: HttpClient,
    timeout: Duration,
}

impl HttpErrorsFetcher {
    pub fn new() -> FetchResult<Self> {
        Self::with_timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> FetchResult<Self> {
        let client = HttpClient::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| FetchError::ClientBuild { message: e.to_string() })?;
        Ok(Self { client, timeout })
    }

    fn classify(&self, target: &str, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout {
                target: target.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            FetchError::RequestFailed {
                target: target.to_string(),
                message: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl ErrorsFetcher for HttpErrorsFetcher {
    async fn fetch(&self, target: &str) -> FetchResult<ResponsePayload> {
        let fetched_at = Timestamp::now();
        let response = self
            .client
            .get(target)
            .send()
            .await
            .map_err(|e| self.classify(target, e))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(FetchError::UnexpectedStatus {
                target: target.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| self.classify(target, e))?;
        let mut payload: ResponsePayload =
            serde_json::from_slice(&body).map_err(|e| FetchError::MalformedPayload {
                target: target.to_string(),
                message: e.to_string(),
            })?;
        payload.target = target.to_string();
        payload.fetched_at = fetched_at;
        Ok(payload)
    }
}

// ----------------------------------------------------------------------------
// 11.2 Processor
// ----------------------------------------------------------------------------

/// One unit of work for the pool.
#[derive(Debug)]
pub struct FetchRequest {
    pub service: String,
    pub target: String,
    pub reply: oneshot::Sender<ResponsePayload>,
}

pub struct FetchProcessor {
    num_workers: usize,
    sender: FlumeSender<FetchRequest>,
    receiver: FlumeReceiver<FetchRequest>,
    fetcher: Arc<dyn ErrorsFetcher>,
    metrics: Arc<ScrapeMetrics>,
    error_collector: Arc<ErrorCollector>,
    running: AtomicBool,
    workers: Mutex<Vec<TokioJoinHandle<()>>>,
}

impl FetchProcessor {
    pub fn new(
        num_workers: usize,
        fetcher: Arc<dyn ErrorsFetcher>,
        metrics: Arc<ScrapeMetrics>,
        error_collector: Arc<ErrorCollector>,
    ) -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            num_workers: num_workers.max(MIN_WORKERS),
            sender,
            receiver,
            fetcher,
            metrics,
            error_collector,
            running: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Start the workers. Calling it again is a no-op.
    pub fn run(&self) {
        if self.running.swap(true, AtomicOrdering::AcqRel) {
            return;
        }

        let mut workers = self.workers.lock();
        for worker_id in 0..self.num_workers {
            let receiver = self.receiver.clone();
            let fetcher = Arc::clone(&self.fetcher);
            let metrics = Arc::clone(&self.metrics);
            let error_collector = Arc::clone(&self.error_collector);
            workers.push(tokio::spawn(async move {
                Self::worker_loop(worker_id, receiver, fetcher, metrics, error_collector).await;
            }));
        }

        info!(target: "faultline::processor", workers = self.num_workers, "Fetch workers started");
    }

    async fn worker_loop(
        worker_id: usize,
        receiver: FlumeReceiver<FetchRequest>,
        fetcher: Arc<dyn ErrorsFetcher>,
        metrics: Arc<ScrapeMetrics>,
        error_collector: Arc<ErrorCollector>,
    ) {
        while let Ok(request) = receiver.recv_async().await {
            let started = Instant::now();
            let payload = match fetcher.fetch(&request.target).await {
                Ok(payload) => {
                    trace!(target: "faultline::processor",
                        worker = worker_id,
                        service = %request.service,
                        instance = %request.target,
                        aggregates = payload.aggregated_errors.len(),
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Fetched payload");
                    payload
                }
                Err(e) => {
                    warn!(target: "faultline::processor",
                        worker = worker_id,
                        service = %request.service,
                        instance = %request.target,
                        error = %e,
                        "Fetch failed, contributing an empty payload");
                    metrics
                        .target_scrape_failures
                        .with_label_values(&[request.service.as_str()])
                        .inc();
                    error_collector.report(e.class(), &e.to_string(), "warning", Some(HttpContext::get(&request.target)));
                    ResponsePayload::empty(request.target.clone())
                }
            };

            // The cycle may have been cancelled; nobody is left to tell.
            let _ = request.reply.send(payload);
        }
    }

    /// Queue a request for the next free worker
    pub fn enqueue(&self, request: FetchRequest) {
        if let Err(flume::SendError(request)) = self.sender.send(request) {
            let _ = request.reply.send(ResponsePayload::empty(request.target));
        }
    }

    /// Fetch every address of a service and wait until all of them answered.
    ///
    /// Returns exactly one payload per address. Failed fetches show up as
    /// empty payloads.
    pub async fn scrape_instances(
        &self,
        service: &str,
        addresses: &[String],
        scheme: &str,
        endpoint: &str,
    ) -> Vec<ResponsePayload> {
        let mut pending = Vec::with_capacity(addresses.len());
        for address in addresses {
            let target = format!("{}://{}{}", scheme, address, endpoint);
            let (reply, response) = oneshot::channel();
            self.enqueue(FetchRequest {
                service: service.to_string(),
                target: target.clone(),
                reply,
            });
            pending.push((target, response));
        }

        join_all(pending.into_iter().map(|(target, response)| async move {
            response.await.unwrap_or_else(|_| ResponsePayload::empty(target))
        }))
        .await
    }

    pub fn queue_depth(&self) -> usize {
        self.sender.len()
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    /// Abort all workers
    pub fn shutdown(&self) {
        for handle in self.workers.lock().drain(..) {
            handle.abort();
        }
        self.running.store(false, AtomicOrdering::Release);
        info!(target: "faultline::processor", "Fetch workers stopped");
    }
}

impl Debug for FetchProcessor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchProcessor")
            .field("num_workers", &self.num_workers)
            .field("queue_depth", &self.queue_depth())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod processor_tests {
    use super::*;
    use crate::test_support::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_scrape_instances_builds_urls_and_tolerates_failures() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.set("http://10.0.0.1:80/errors", payload("", vec![aggregate("a", 1, vec![])]));
        fetcher.set("http://10.0.0.2:80/errors", payload("", vec![aggregate("b", 2, vec![])]));
        fetcher.fail("http://10.0.0.3:80/errors");

        let metrics = Arc::new(ScrapeMetrics::new().unwrap());
        let collector = Arc::new(ErrorCollector::new());
        let processor = FetchProcessor::new(2, fetcher.clone(), metrics.clone(), collector.clone());
        processor.run();

        let addresses = vec!["10.0.0.1:80".to_string(), "10.0.0.2:80".to_string(), "10.0.0.3:80".to_string()];
        let payloads = processor.scrape_instances("checkout", &addresses, "http", "/errors").await;

        assert_eq!(payloads.len(), 3);
        let mut targets: Vec<&str> = payloads.iter().map(|p| p.target.as_str()).collect();
        targets.sort();
        assert_eq!(
            targets,
            vec!["http://10.0.0.1:80/errors", "http://10.0.0.2:80/errors", "http://10.0.0.3:80/errors"]
        );
        let failed = payloads.iter().find(|p| p.target.ends_with("10.0.0.3:80/errors")).unwrap();
        assert!(failed.is_empty());

        assert_eq!(metrics.target_scrape_failures.with_label_values(&["checkout"]).get(), 1);
        assert_eq!(collector.len(), 1);
        processor.shutdown();
    }

    #[tokio::test]
    async fn test_failures_across_many_instances_share_one_self_error() {
        let metrics = Arc::new(ScrapeMetrics::new().unwrap());
        let collector = Arc::new(ErrorCollector::new());
        let processor = FetchProcessor::new(8, Arc::new(FakeFetcher::new()), metrics.clone(), collector.clone());
        processor.run();

        let addresses: Vec<String> = (0..500).map(|i| format!("10.1.{}.{}:80", i / 250, i % 250)).collect();
        let payloads = processor.scrape_instances("checkout", &addresses, "http", "/errors").await;

        assert_eq!(payloads.len(), 500);
        assert!(payloads.iter().all(|p| p.is_empty()));
        assert_eq!(metrics.target_scrape_failures.with_label_values(&["checkout"]).get(), 500);
        assert_eq!(collector.len(), 1);

        let exported = collector.export();
        assert_eq!(exported.aggregated_errors[0].total_count, 500);
        assert_eq!(exported.aggregated_errors[0].latest_errors.len(), SELF_REPORT_MAX_LATEST);
        processor.shutdown();
    }

    #[tokio::test]
    async fn test_scrape_without_addresses_returns_immediately() {
        let processor = FetchProcessor::new(
            1,
            Arc::new(FakeFetcher::new()),
            Arc::new(ScrapeMetrics::new().unwrap()),
            Arc::new(ErrorCollector::new()),
        );
        processor.run();

        let payloads = processor.scrape_instances("checkout", &[], "http", "/errors").await;
        assert!(payloads.is_empty());
    }

    #[tokio::test]
    async fn test_http_fetcher_decodes_payload() {
        let addr = spawn_instance(Router::new().route("/errors", get(|| async { SAMPLE_RESPONSE }))).await;
        let target = format!("http://{}/errors", addr);

        let payload = HttpErrorsFetcher::new().unwrap().fetch(&target).await.unwrap();
        assert_eq!(payload.target, target);
        assert_eq!(payload.aggregated_errors.len(), 1);
        assert!(payload.fetched_at > Timestamp::EPOCH);
    }

    #[tokio::test]
    async fn test_http_fetcher_rejects_non_200() {
        let addr = spawn_instance(Router::new().route(
            "/errors",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, SAMPLE_RESPONSE) }),
        ))
        .await;

        let err = HttpErrorsFetcher::new()
            .unwrap()
            .fetch(&format!("http://{}/errors", addr))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::UnexpectedStatus { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_http_fetcher_rejects_malformed_json() {
        let addr = spawn_instance(Router::new().route("/errors", get(|| async { "{\"aggregated_errors\": [" }))).await;

        let err = HttpErrorsFetcher::new()
            .unwrap()
            .fetch(&format!("http://{}/errors", addr))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::MalformedPayload { .. }));
    }

    #[tokio::test]
    async fn test_http_fetcher_times_out() {
        let addr = spawn_instance(Router::new().route(
            "/errors",
            get(|| async {
                sleep(Duration::from_secs(5)).await;
                SAMPLE_RESPONSE
            }),
        ))
        .await;

        let err = HttpErrorsFetcher::with_timeout(Duration::from_millis(200))
            .unwrap()
            .fetch(&format!("http://{}/errors", addr))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout { timeout_ms: 200, .. }));
    }
}

// ============================================================================
// SECTION 12: INCREMENTAL AGGREGATOR
// ============================================================================
// Folds the payloads of one scrape cycle into a single snapshot per service.
// Instances report cumulative counters, so every merge adds only what an
// instance gained since its previous contribution in the same cycle.
// ============================================================================

type ErrorAggregateMap = HashMap<String, ErrorAggregate>;
type TargetErrorsCountMap = HashMap<String, HashMap<String, u64>>;

/// Result of folding one payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CombineOutcome {
    pub merged: usize,
    /// Items ignored because the instance counter went backwards
    pub skipped: usize,
}

/// Accumulator for one scrape cycle of one service.
pub struct CycleAggregator {
    service_name: String,
    repository: Arc<dyn ErrorsRepository>,
    metrics: Arc<ScrapeMetrics>,
    aggregates: ErrorAggregateMap,
    contributions: TargetErrorsCountMap,
}

impl CycleAggregator {
    pub fn new(service_name: impl Into<String>, repository: Arc<dyn ErrorsRepository>, metrics: Arc<ScrapeMetrics>) -> Self {
        Self {
            service_name: service_name.into(),
            repository,
            metrics,
            aggregates: HashMap::new(),
            contributions: HashMap::new(),
        }
    }

    /// Merge one instance payload into the running aggregates.
    pub async fn combine(&mut self, payload: &ResponsePayload) -> CombineOutcome {
        let mut outcome = CombineOutcome::default();

        for item in &payload.aggregated_errors {
            let previous = self.contribution(&payload.target, &item.aggregation_key);
            let created_at = item.created_at.unwrap_or(payload.fetched_at);

            let delta = match self.aggregates.get_mut(&item.aggregation_key) {
                Some(existing) => {
                    if item.total_count < previous {
                        warn!(target: "faultline::aggregator",
                            service = %self.service_name,
                            instance = %payload.target,
                            aggregation_key = %item.aggregation_key,
                            previous,
                            reported = item.total_count,
                            "Instance counter went backwards, skipping update");
                        outcome.skipped += 1;
                        continue;
                    }

                    let delta = item.total_count - previous;
                    existing.total_count = existing.total_count.saturating_add(delta);
                    existing.severity = item.severity.clone();
                    existing.latest_errors = merge_latest_errors(&existing.latest_errors, &item.latest_errors);
                    existing.created_at = Some(existing.created_at.map_or(created_at, |c| c.min(created_at)));
                    delta
                }
                None => {
                    let mut fresh = item.clone();
                    fresh.latest_errors = merge_latest_errors(&[], &item.latest_errors);
                    fresh.created_at = Some(created_at);
                    self.aggregates.insert(item.aggregation_key.clone(), fresh);
                    item.total_count
                }
            };

            self.record_merge(&payload.target, item, delta).await;
            outcome.merged += 1;
        }

        outcome
    }

    async fn record_merge(&mut self, target: &str, item: &ErrorAggregate, delta: u64) {
        let severity = severity_with_fallback(&item.severity);
        self.metrics
            .error_occurrences
            .with_label_values(&[self.service_name.as_str(), severity.as_str(), target, item.aggregation_key.as_str()])
            .inc_by(delta);

        self.contributions
            .entry(target.to_string())
            .or_default()
            .insert(item.aggregation_key.clone(), item.total_count);

        // A reported error is live again, whatever an operator said before.
        if let Err(e) = self.repository.remove_resolved(&self.service_name, &item.aggregation_key).await {
            warn!(target: "faultline::aggregator",
                service = %self.service_name,
                aggregation_key = %item.aggregation_key,
                error = %e,
                "Could not clear resolved marker");
            self.metrics.record_application_error("remove_resolved");
        }
    }

    /// Count last merged from `target` for `aggregation_key`, 0 if none
    pub fn contribution(&self, target: &str, aggregation_key: &str) -> u64 {
        self.contributions
            .get(target)
            .and_then(|keys| keys.get(aggregation_key))
            .copied()
            .unwrap_or(0)
    }

    pub fn get(&self, aggregation_key: &str) -> Option<&ErrorAggregate> {
        self.aggregates.get(aggregation_key)
    }

    pub fn len(&self) -> usize {
        self.aggregates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty()
    }

    /// Build the snapshot to persist: resolved keys dropped, blank severities
    /// replaced, ordered by aggregation key.
    pub async fn finish(self) -> Vec<ErrorAggregate> {
        let mut snapshot = Vec::with_capacity(self.aggregates.len());

        for (key, mut aggregate) in self.aggregates {
            match self.repository.search_resolved(&self.service_name, &key).await {
                Ok(true) => {
                    debug!(target: "faultline::aggregator", service = %self.service_name, aggregation_key = %key, "Skipping resolved error");
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(target: "faultline::aggregator",
                        service = %self.service_name,
                        aggregation_key = %key,
                        error = %e,
                        "Resolved lookup failed, keeping error");
                    self.metrics.record_application_error("search_resolved");
                }
            }

            aggregate.severity = severity_with_fallback(&aggregate.severity);
            for occurrence in &mut aggregate.latest_errors {
                occurrence.severity = severity_with_fallback(&occurrence.severity);
            }
            snapshot.push(aggregate);
        }

        snapshot.sort_by(|a, b| a.aggregation_key.cmp(&b.aggregation_key));
        snapshot
    }
}

impl Debug for CycleAggregator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CycleAggregator")
            .field("service_name", &self.service_name)
            .field("aggregates", &self.aggregates.len())
            .field("targets", &self.contributions.len())
            .finish()
    }
}


// ============================================================================
// SECTION 13: SCRAPE CYCLE SCHEDULER
// ============================================================================
// One scraper per service. It owns the latest address set and alternates
// between applying resolution updates and running scrape cycles. The timer
// is re-armed after each cycle completes, so cycles of one service never
// overlap.
// ============================================================================

/// What one scrape cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub instances: usize,
    pub errors: usize,
    pub merged: usize,
    pub skipped: usize,
    pub duration: Duration,
}

pub struct Scraper {
    service: ServiceConfig,
    resolver: Box<dyn Resolver>,
    repository: Arc<dyn ErrorsRepository>,
    processor: Arc<FetchProcessor>,
    metrics: Arc<ScrapeMetrics>,
    addresses: Vec<String>,
}

impl Scraper {
    pub fn new(
        service: ServiceConfig,
        resolver: Box<dyn Resolver>,
        repository: Arc<dyn ErrorsRepository>,
        processor: Arc<FetchProcessor>,
        metrics: Arc<ScrapeMetrics>,
    ) -> Self {
        Self {
            service,
            resolver,
            repository,
            processor,
            metrics,
            addresses: Vec::new(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service.name
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    fn targets(&self) -> Vec<Target> {
        self.addresses
            .iter()
            .map(|address| Target { endpoint: address.clone() })
            .collect()
    }

    async fn store_targets(&self) {
        if let Err(e) = self.repository.store_targets(&self.service.name, self.targets()).await {
            error!(target: "faultline::scraper", service = %self.service.name, error = %e, "Could not store targets");
            self.metrics.record_application_error("store_targets");
        }
    }

    /// Replace the address set used by subsequent cycles
    pub async fn apply_resolution(&mut self, resolved: ResolvedAddresses) {
        info!(target: "faultline::scraper",
            service = %self.service.name,
            instances = resolved.addresses.len(),
            "Received new address set");
        self.addresses = resolved.addresses;
        self.store_targets().await;
    }

    /// Run one full cycle: fetch all instances, aggregate, persist.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let timer = CycleTimer::with_budget(self.service.name.as_str(), self.service.scraper.refresh_interval);
        let name = self.service.name.clone();

        let payloads = self
            .processor
            .scrape_instances(&name, &self.addresses, &self.service.scraper.scheme, &self.service.scraper.endpoint)
            .await;

        let mut aggregator = CycleAggregator::new(name.as_str(), Arc::clone(&self.repository), Arc::clone(&self.metrics));
        let mut merged = 0;
        let mut skipped = 0;
        for payload in &payloads {
            let outcome = aggregator.combine(payload).await;
            merged += outcome.merged;
            skipped += outcome.skipped;
        }

        let snapshot = aggregator.finish().await;
        let errors = snapshot.len();
        if let Err(e) = self.repository.store_errors(&name, snapshot).await {
            error!(target: "faultline::scraper", service = %name, error = %e, "Could not store errors");
            self.metrics.record_application_error("store_errors");
        }
        self.store_targets().await;

        let instances = self.addresses.len();
        self.metrics
            .instances_scraped
            .with_label_values(&[name.as_str()])
            .set(instances as i64);
        self.metrics
            .errors_scraped
            .with_label_values(&[name.as_str()])
            .inc_by(errors as u64);

        let duration = timer.stop();
        info!(target: "faultline::scraper",
            service = %name,
            errors,
            instances,
            merged,
            skipped,
            duration_ms = duration.as_millis() as u64,
            "Scrape cycle complete");

        CycleReport {
            instances,
            errors,
            merged,
            skipped,
            duration,
        }
    }

    /// Scheduler loop. Runs until the task is aborted.
    pub async fn scrape(mut self) {
        let mut resolutions = self.resolver.resolve();
        let mut feed_open = true;
        let refresh_interval = self.service.scraper.refresh_interval;

        let timer = sleep(refresh_interval);
        tokio::pin!(timer);

        info!(target: "faultline::scraper",
            service = %self.service.name,
            refresh_interval_ms = refresh_interval.as_millis() as u64,
            "Scraper started");

        loop {
            tokio::select! {
                resolved = resolutions.recv(), if feed_open => match resolved {
                    Some(resolved) => self.apply_resolution(resolved).await,
                    None => {
                        feed_open = false;
                        debug!(target: "faultline::scraper", service = %self.service.name, "Resolution feed closed, keeping last address set");
                    }
                },
                () = &mut timer => {
                    self.run_cycle().await;
                    timer.as_mut().reset(tokio::time::Instant::now() + refresh_interval);
                }
            }
        }
    }
}

impl Debug for Scraper {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scraper")
            .field("service", &self.service.name)
            .field("addresses", &self.addresses)
            .finish()
    }
}


// ============================================================================
// SECTION 14: QUERY API
// ============================================================================
// Read and resolve endpoints over the repository, plus self-monitoring:
//   GET    /services/
//   GET    /services/:service_name/errors/?number_of_errors=N
//   DELETE /services/:service_name/errors/*error_key
//   GET    /targets/
//   GET    /errors        (the crawler's own errors, instance wire format)
//   GET    /metrics
//   GET    /-/health
// ============================================================================

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    pub repository: Arc<dyn ErrorsRepository>,
    pub metrics: Arc<ScrapeMetrics>,
    pub error_collector: Arc<ErrorCollector>,
    pub default_number_of_errors: usize,
}

impl Debug for ApiState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiState")
            .field("default_number_of_errors", &self.default_number_of_errors)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
pub struct ErrorsQuery {
    pub number_of_errors: Option<usize>,
}

pub fn api_router(state: ApiState, cors_localhost: bool) -> Router {
    let router = Router::new()
        .route("/services/", get(list_services))
        .route("/services/:service_name/errors/", get(list_errors))
        .route("/services/:service_name/errors/*error_key", delete(resolve_error))
        .route("/targets/", get(list_targets))
        .route("/errors", get(self_errors))
        .route("/metrics", get(metrics_endpoint))
        .route("/-/health", get(health))
        .with_state(state);

    if cors_localhost {
        router.layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(localhost_cors()),
        )
    } else {
        router.layer(TraceLayer::new_for_http())
    }
}

/// CORS policy admitting any http://localhost:<port> origin
fn localhost_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _parts: &RequestParts| {
            origin.as_bytes().starts_with(b"http://localhost:")
        }))
        .allow_methods([Method::GET, Method::DELETE, Method::OPTIONS])
}

fn repository_failure(state: &ApiState, operation: &str, e: RepositoryError) -> Response {
    if e.is_not_found() {
        return (StatusCode::NOT_FOUND, e.to_string()).into_response();
    }
    error!(target: "faultline::api", operation, error = %e, "Repository call failed");
    state.metrics.record_application_error(operation);
    state.error_collector.report("faultline.api.RepositoryFailure", &e.to_string(), "error", None);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

async fn list_services(State(state): State<ApiState>) -> Response {
    match state.repository.get_services().await {
        Ok(services) => Json(services).into_response(),
        Err(e) => repository_failure(&state, "get_services", e),
    }
}

async fn list_errors(
    State(state): State<ApiState>,
    AxumPath(service_name): AxumPath<String>,
    Query(query): Query<ErrorsQuery>,
) -> Response {
    let number_of_errors = query.number_of_errors.unwrap_or(state.default_number_of_errors);
    match state.repository.get_errors(&service_name, number_of_errors).await {
        Ok(errors) => Json(errors).into_response(),
        Err(e) => repository_failure(&state, "get_errors", e),
    }
}

async fn resolve_error(
    State(state): State<ApiState>,
    AxumPath((service_name, error_key)): AxumPath<(String, String)>,
) -> Response {
    let error_key = error_key.strip_suffix('/').unwrap_or(&error_key);
    match state.repository.resolve_error(&service_name, error_key).await {
        Ok(()) => {
            info!(target: "faultline::api", service = %service_name, aggregation_key = %error_key, "Error resolved");
            StatusCode::OK.into_response()
        }
        Err(e) => repository_failure(&state, "resolve_error", e),
    }
}

async fn list_targets(State(state): State<ApiState>) -> Response {
    match state.repository.get_targets().await {
        Ok(targets) => Json(targets).into_response(),
        Err(e) => repository_failure(&state, "get_targets", e),
    }
}

async fn self_errors(State(state): State<ApiState>) -> Json<ResponsePayload> {
    Json(state.error_collector.export())
}

async fn metrics_endpoint(State(state): State<ApiState>) -> Response {
    match state.metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn health() -> &'static str {
    "OK"
}


// ============================================================================
// SECTION 15: ENGINE
// ============================================================================
// Wires the pieces together: one fetch pool, one scraper task per service,
// the API server, and signal handling.
// ============================================================================

pub struct Engine {
    config: FaultlineConfig,
    repository: Arc<dyn ErrorsRepository>,
    metrics: Arc<ScrapeMetrics>,
    error_collector: Arc<ErrorCollector>,
    processor: Arc<FetchProcessor>,
    shutdown: Arc<Notify>,
    running: AtomicBool,
    start_time: Instant,
}

impl Engine {
    /// Create an engine that fetches instances over HTTP
    pub fn new(config: FaultlineConfig) -> FaultlineResult<Self> {
        let fetcher = Arc::new(HttpErrorsFetcher::new()?);
        Self::with_fetcher(config, fetcher)
    }

    pub fn with_fetcher(config: FaultlineConfig, fetcher: Arc<dyn ErrorsFetcher>) -> FaultlineResult<Self> {
        let metrics = Arc::new(ScrapeMetrics::new()?);
        let error_collector = Arc::new(ErrorCollector::new());
        let repository = repository_from_config(&config.repository, Arc::clone(&metrics))?;
        let processor = Arc::new(FetchProcessor::new(
            config.scraper.workers,
            fetcher,
            Arc::clone(&metrics),
            Arc::clone(&error_collector),
        ));

        Ok(Self {
            config,
            repository,
            metrics,
            error_collector,
            processor,
            shutdown: Arc::new(Notify::new()),
            running: AtomicBool::new(false),
            start_time: Instant::now(),
        })
    }

    pub fn config(&self) -> &FaultlineConfig {
        &self.config
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            repository: Arc::clone(&self.repository),
            metrics: Arc::clone(&self.metrics),
            error_collector: Arc::clone(&self.error_collector),
            default_number_of_errors: self.config.api.default_number_of_errors,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        info!(target: "faultline::engine", "Shutdown requested");
        self.shutdown.notify_one();
    }

    /// Run until SIGINT, SIGTERM or [`Engine::shutdown`]
    pub async fn run(&self) -> FaultlineResult<()> {
        info!(target: "faultline::engine",
            version = FAULTLINE_VERSION,
            services = self.config.services.len(),
            workers = self.config.scraper.workers,
            "Starting crawler");

        // Everything fallible happens before any worker or task starts.
        let mut scrapers = Vec::with_capacity(self.config.services.len());
        for service in &self.config.services {
            let resolver = resolver_for(service)?;
            scrapers.push(Scraper::new(
                service.clone(),
                resolver,
                Arc::clone(&self.repository),
                Arc::clone(&self.processor),
                Arc::clone(&self.metrics),
            ));
        }
        let listener = TokioTcpListener::bind(self.config.api.listen_addr.as_str()).await?;
        let local_addr = listener.local_addr()?;
        let router = api_router(self.api_state(), self.config.api.cors_localhost);

        self.running.store(true, AtomicOrdering::Release);
        self.processor.run();

        let mut tasks = JoinSet::new();
        for scraper in scrapers {
            tasks.spawn(scraper.scrape());
        }
        tasks.spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(target: "faultline::api", error = %e, "API server stopped");
            }
        });
        info!(target: "faultline::engine", addr = %local_addr, "Serving API");

        tokio::select! {
            _ = wait_for_shutdown_signal() => {}
            _ = self.shutdown.notified() => {
                info!(target: "faultline::engine", "Shutdown notification received");
            }
        }

        let shutdown_start = Instant::now();
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        self.processor.shutdown();
        self.running.store(false, AtomicOrdering::Release);

        info!(target: "faultline::engine",
            duration_ms = shutdown_start.elapsed().as_millis() as u64,
            uptime_secs = self.uptime().as_secs(),
            "Crawler shutdown complete");
        Ok(())
    }
}

impl Debug for Engine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("services", &self.config.services.len())
            .field("processor", &self.processor)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(target: "faultline::engine", error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(target: "faultline::engine", error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(target: "faultline::engine", "Received SIGINT"),
        _ = terminate => info!(target: "faultline::engine", "Received SIGTERM"),
    }
}

#[cfg(test)]
mod engine_tests {
    use super::*;
    use crate::test_support::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_engine_scrapes_until_shutdown() {
        let fake = Arc::new(FakeFetcher::new());
        fake.set("http://a:1/errors", payload("", vec![aggregate("k", 2, vec![occurrence("u1", 1)])]));

        let mut service = service_config("checkout", Duration::from_millis(50));
        service.service_discovery.addresses = vec!["a:1".into()];
        let mut config = FaultlineConfig::default();
        config.api.listen_addr = "127.0.0.1:0".into();
        config.scraper.workers = 2;
        config.services.push(service);

        let engine = Arc::new(Engine::with_fetcher(config, fake).unwrap());
        let running = Arc::clone(&engine);
        let task = tokio::spawn(async move { running.run().await });

        sleep(Duration::from_millis(400)).await;
        assert!(engine.is_running());
        engine.shutdown();
        task.await.unwrap().unwrap();
        assert!(!engine.is_running());

        let errors = engine.api_state().repository.get_errors("checkout", 10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].total_count, 2);
    }

    #[tokio::test]
    async fn test_engine_failing_to_bind_starts_nothing() {
        let taken = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = FaultlineConfig::default();
        config.api.listen_addr = taken.local_addr().unwrap().to_string();
        config.services.push(service_config("checkout", Duration::from_millis(50)));

        let engine = Engine::with_fetcher(config, Arc::new(FakeFetcher::new())).unwrap();
        let err = engine.run().await.unwrap_err();

        assert_eq!(err.category(), "io");
        assert!(!engine.is_running());
        assert!(!engine.processor.is_running());
    }

    #[tokio::test]
    async fn test_engine_rejects_unknown_repository() {
        let mut config = FaultlineConfig::default();
        config.repository.kind = "redis".into();

        let err = Engine::with_fetcher(config, Arc::new(FakeFetcher::new())).unwrap_err();
        assert_eq!(err.category(), "repository");
        assert!(!err.is_recoverable());
    }
}

// ============================================================================
// SECTION 16: CLI & COMMAND LINE INTERFACE
// ============================================================================

/// Faultline CLI
#[derive(Parser, Debug)]
#[command(
    name = "faultline",
    author = "AIOps Team",
    version,
    about = "Crawls service instances for their errors and serves the aggregated catalog",
    long_about = "Faultline discovers the instances of every configured service, polls their \
                  errors endpoint on a fixed cadence, merges the cumulative counters of all \
                  instances into one catalog per service, and serves that catalog over HTTP."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "faultline.toml", env = "FAULTLINE_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "FAULTLINE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// API port override
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Start the crawler (default)
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate an example configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> FaultlineResult<()> {
    println!("🔍 Validating configuration: {}", config_path.display());

    match FaultlineConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • API address: {}", config.api.listen_addr);
            println!("  • Fetch workers: {}", config.scraper.workers);
            println!("  • Repository: {}", config.repository.kind);
            println!("  • Services defined: {}", config.services.len());
            for service in &config.services {
                println!(
                    "    - {} ({} discovery, every {}, endpoint {})",
                    service.name,
                    service.service_discovery.kind,
                    humantime::format_duration(service.scraper.refresh_interval),
                    service.scraper.endpoint
                );
            }

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(FaultlineError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> FaultlineResult<()> {
    let config_str = FaultlineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Example configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("🛰️  {} v{}", FAULTLINE_FULL_NAME, FAULTLINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Defaults:");
    println!("  • Fetch workers: {}", DEFAULT_WORKERS);
    println!("  • Fetch timeout: {}s", FETCH_TIMEOUT_SECS);
    println!("  • Refresh interval: {}s", DEFAULT_REFRESH_INTERVAL_SECS);
    println!("  • API address: {}", DEFAULT_API_ADDR);
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["faultline", "--config", "/etc/faultline.toml", "validate", "--verbose"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/faultline.toml"));
        assert_eq!(cli.command, Some(Commands::Validate { verbose: true }));

        let cli = Cli::try_parse_from(["faultline", "-p", "9100", "run"]).unwrap();
        assert_eq!(cli.port, Some(9100));
        assert_eq!(cli.command, Some(Commands::Run));
    }

    #[test]
    fn test_generate_then_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faultline.toml");

        handle_generate_config(Some(path.as_path())).unwrap();
        handle_validate(&path, true).unwrap();
    }

    #[test]
    fn test_validate_reports_broken_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faultline.toml");
        fs::write(&path, "[scraper]\nworkers = 0\n").unwrap();

        let err = handle_validate(&path, false).unwrap_err();
        assert_eq!(err.category(), "config");
    }
}

// ============================================================================
// SECTION 17: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    let mut config = FaultlineConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(port) = cli.port {
        config.api.set_port(port);
    }

    init_logging(&config.logging)?;

    info!("🛰️  {} v{}", FAULTLINE_FULL_NAME, FAULTLINE_VERSION);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let engine = Engine::new(config)?;
    engine.run().await?;

    Ok(())
}

// ============================================================================
// SECTION 18: TEST SUPPORT
// ============================================================================

#[cfg(test)]
mod test_support {
    use super::*;

    /// Body of an instance errors endpoint with one aggregate and two occurrences
    pub const SAMPLE_RESPONSE: &str = r#"{
  "aggregated_errors": [
    {
      "aggregation_key": "java.lang.IllegalStateException@e28e036e",
      "total_count": 2,
      "severity": "warning",
      "created_at": "2021-03-08T15:04:05Z",
      "latest_errors": [
        {
          "error": {
            "class": "java.lang.IllegalStateException",
            "message": "checkout failed",
            "stacktrace": ["at Checkout.pay(Checkout.java:42)", "at Router.handle(Router.java:7)"],
            "cause": {
              "class": "java.io.IOException",
              "message": "connection reset",
              "stacktrace": null,
              "cause": null
            }
          },
          "uuid": "5d9893c6-51d6-11ea-8aad-f894c260afe5",
          "timestamp": 1615215845,
          "severity": "warning",
          "http_context": {
            "request_method": "GET",
            "request_url": "http://example.com/checkout",
            "request_headers": {"Accept": "*/*"},
            "request_body": ""
          }
        },
        {
          "error": {
            "class": "java.lang.IllegalStateException",
            "message": "checkout failed",
            "stacktrace": [],
            "cause": null
          },
          "uuid": "6a1c2f0e-51d6-11ea-8aad-f894c260afe5",
          "timestamp": "2021-03-08T15:05:00Z",
          "severity": "",
          "http_context": null
        }
      ]
    }
  ]
}"#;

    pub fn occurrence(uuid: &str, timestamp: i64) -> ErrorWithContext {
        ErrorWithContext {
            error: ErrorInstance::new("java.lang.IllegalStateException", "boom"),
            uuid: uuid.to_string(),
            timestamp: Timestamp::from_secs(timestamp),
            severity: String::new(),
            http_context: None,
        }
    }

    pub fn aggregate(key: &str, total_count: u64, latest_errors: Vec<ErrorWithContext>) -> ErrorAggregate {
        ErrorAggregate {
            aggregation_key: key.to_string(),
            total_count,
            severity: String::new(),
            latest_errors,
            created_at: None,
        }
    }

    pub fn aggregate_created(
        key: &str,
        total_count: u64,
        latest_errors: Vec<ErrorWithContext>,
        created_at: i64,
    ) -> ErrorAggregate {
        ErrorAggregate {
            created_at: Some(Timestamp::from_secs(created_at)),
            ..aggregate(key, total_count, latest_errors)
        }
    }

    pub fn aggregate_with_severity(key: &str, total_count: u64, severity: &str) -> ErrorAggregate {
        ErrorAggregate {
            severity: severity.to_string(),
            ..aggregate(key, total_count, Vec::new())
        }
    }

    pub fn payload(target: &str, aggregated_errors: Vec<ErrorAggregate>) -> ResponsePayload {
        ResponsePayload {
            aggregated_errors,
            target: target.to_string(),
            fetched_at: Timestamp::now(),
        }
    }

    pub fn service_config(name: &str, refresh_interval: Duration) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            scraper: ServiceScraperConfig {
                refresh_interval,
                ..ServiceScraperConfig::default()
            },
            service_discovery: ServiceDiscoveryConfig::default(),
        }
    }

    /// In-process stand-in for instance fetching
    #[derive(Debug, Default)]
    pub struct FakeFetcher {
        payloads: Mutex<HashMap<String, ResponsePayload>>,
        failing: Mutex<HashSet<String>>,
    }

    impl FakeFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set(&self, target: &str, payload: ResponsePayload) {
            self.failing.lock().remove(target);
            self.payloads.lock().insert(target.to_string(), payload);
        }

        pub fn fail(&self, target: &str) {
            self.payloads.lock().remove(target);
            self.failing.lock().insert(target.to_string());
        }
    }

    #[async_trait]
    impl ErrorsFetcher for FakeFetcher {
        async fn fetch(&self, target: &str) -> FetchResult<ResponsePayload> {
            if self.failing.lock().contains(target) {
                return Err(FetchError::Timeout {
                    target: target.to_string(),
                    timeout_ms: FETCH_TIMEOUT_SECS * 1000,
                });
            }
            let found = self.payloads.lock().get(target).cloned();
            match found {
                Some(mut payload) => {
                    payload.target = target.to_string();
                    payload.fetched_at = Timestamp::now();
                    Ok(payload)
                }
                None => Err(FetchError::RequestFailed {
                    target: target.to_string(),
                    message: "connection refused".into(),
                }),
            }
        }
    }

    /// Serve `router` on an ephemeral local port
    pub async fn spawn_instance(router: Router) -> SocketAddr {
        let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        addr
    }
}
