// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Environment-driven configuration loading for the birdex engine.
//!
//! [`EngineConfig`] is the top-level runtime settings struct. [`load`]
//! reads it from `std::env`, validating that required variables are
//! present and that numeric ones parse, and never panics — a misconfigured
//! deployment gets a named [`ConfigError`], not a crash.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required environment variable was not set.
    #[error("missing required environment variable: {var}")]
    Missing {
        /// Name of the missing variable.
        var: String,
    },
    /// A variable was set but could not be parsed as the expected type.
    #[error("environment variable {var} has invalid value {value:?}: {reason}")]
    Invalid {
        /// Name of the offending variable.
        var: String,
        /// The raw string value that failed to parse.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
    /// A value parsed but failed a semantic check (e.g. zero where
    /// positive is required).
    #[error("environment variable {var} is out of range: {reason}")]
    OutOfRange {
        /// Name of the offending variable.
        var: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Database connection settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Postgres connection string.
    pub url: String,
    /// Maximum pool size.
    pub max_connections: u32,
    /// Connection-acquire timeout, in milliseconds.
    pub acquire_timeout_ms: u64,
    /// Per-statement timeout, in milliseconds.
    pub statement_timeout_ms: u64,
    /// Whether the process should run pending migrations on startup.
    pub run_migrations: bool,
}

/// Engine tick-loop settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct EngineSettings {
    /// Milliseconds between `worker tick` invocations in daemon mode.
    pub tick_interval_ms: u64,
    /// Upper bound on instances materialized concurrently within one tick.
    pub max_parallel_instances: u32,
}

/// Upstream HTTP API settings.
#[derive(Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct UpstreamConfig {
    /// Base URL of the upstream provider API.
    pub base_url: String,
    /// Bearer token sent on every upstream request. Redacted by this
    /// struct's `Debug` impl and never serialized back out.
    #[serde(skip_serializing)]
    pub bearer_token: String,
    /// Minimum interval between requests, expressed as queries per second.
    pub rate_limit_qps: f64,
    /// Maximum character length of an OR-joined posts search query.
    pub max_query_length: usize,
    /// Maximum ids per `users-by-ids` batch request.
    pub batch_users_by_ids_max: usize,
    /// Maximum ids per `posts-by-ids` batch request.
    pub batch_posts_by_ids_max: usize,
    /// Per-request HTTP timeout, in milliseconds.
    pub http_request_timeout_ms: u64,
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("bearer_token", &"<redacted>")
            .field("rate_limit_qps", &self.rate_limit_qps)
            .field("max_query_length", &self.max_query_length)
            .field("batch_users_by_ids_max", &self.batch_users_by_ids_max)
            .field("batch_posts_by_ids_max", &self.batch_posts_by_ids_max)
            .field("http_request_timeout_ms", &self.http_request_timeout_ms)
            .finish()
    }
}

/// Request/response snapshot retention settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Maximum bytes of response body retained in a request snapshot.
    pub http_body_max_bytes: usize,
}

/// Identity of the account this deployment ingests on behalf of.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SelfIdentity {
    /// Provider-assigned user id of the account this deployment operates as.
    pub user_id: i64,
    /// Handle of the account this deployment operates as, for logging.
    pub handle: String,
}

/// Advisory-lock acquisition settings for ingest targets.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct IngestLockConfig {
    /// Bound on total time spent polling for a lock, in milliseconds.
    pub timeout_ms: u64,
    /// Interval between poll attempts, in milliseconds.
    pub poll_interval_ms: u64,
}

/// Top-level runtime configuration for the birdex engine.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EngineConfig {
    /// Database connection settings.
    pub database: DatabaseConfig,
    /// Engine tick-loop settings.
    pub engine: EngineSettings,
    /// Upstream HTTP API settings.
    pub upstream: UpstreamConfig,
    /// Request/response snapshot retention settings.
    pub retention: RetentionConfig,
    /// Identity of the account this deployment ingests on behalf of.
    pub x_self: SelfIdentity,
    /// Advisory-lock acquisition settings for ingest targets.
    pub ingest_lock: IngestLockConfig,
}

fn env_var(var: &str) -> Result<String, ConfigError> {
    std::env::var(var).map_err(|_| ConfigError::Missing { var: var.to_string() })
}

fn env_var_opt(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(var: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| ConfigError::Invalid {
        var: var.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(var: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var: var.to_string(),
            value: raw.to_string(),
            reason: "expected one of: 1, 0, true, false, yes, no".into(),
        }),
    }
}

fn require_positive(var: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::OutOfRange {
            var: var.to_string(),
            reason: "must be greater than zero".into(),
        })
    } else {
        Ok(())
    }
}

/// Load [`EngineConfig`] from the process environment.
///
/// Required variables: `BDX_DATABASE_URL`, `BDX_SELF_USER_ID`,
/// `BDX_SELF_HANDLE`, `BDX_UPSTREAM_BASE_URL`, `BDX_UPSTREAM_BEARER_TOKEN`.
/// Everything else has a documented default. Returns a
/// [`ConfigError`] naming the offending variable on any missing, malformed,
/// or out-of-range value — never panics.
pub fn load() -> Result<EngineConfig, ConfigError> {
    let database_url = env_var("BDX_DATABASE_URL")?;
    let max_connections: u32 = parse_env(
        "BDX_DATABASE_MAX_CONNECTIONS",
        &env_var_opt("BDX_DATABASE_MAX_CONNECTIONS", "10"),
    )?;
    let acquire_timeout_ms: u64 = parse_env(
        "BDX_DATABASE_ACQUIRE_TIMEOUT_MS",
        &env_var_opt("BDX_DATABASE_ACQUIRE_TIMEOUT_MS", "5000"),
    )?;
    let statement_timeout_ms: u64 = parse_env(
        "BDX_DATABASE_STATEMENT_TIMEOUT_MS",
        &env_var_opt("BDX_DATABASE_STATEMENT_TIMEOUT_MS", "30000"),
    )?;
    let run_migrations = parse_bool(
        "BDX_RUN_MIGRATIONS",
        &env_var_opt("BDX_RUN_MIGRATIONS", "false"),
    )?;

    let tick_interval_ms: u64 = parse_env(
        "BDX_ENGINE_TICK_INTERVAL_MS",
        &env_var_opt("BDX_ENGINE_TICK_INTERVAL_MS", "60000"),
    )?;
    let max_parallel_instances: u32 = parse_env(
        "BDX_ENGINE_MAX_PARALLEL_INSTANCES",
        &env_var_opt("BDX_ENGINE_MAX_PARALLEL_INSTANCES", "4"),
    )?;

    let upstream_base_url = env_var("BDX_UPSTREAM_BASE_URL")?;
    let upstream_bearer_token = env_var("BDX_UPSTREAM_BEARER_TOKEN")?;
    let rate_limit_qps: f64 = parse_env(
        "BDX_UPSTREAM_RATE_LIMIT_QPS",
        &env_var_opt("BDX_UPSTREAM_RATE_LIMIT_QPS", "1.0"),
    )?;
    let max_query_length: usize = parse_env(
        "BDX_UPSTREAM_MAX_QUERY_LENGTH",
        &env_var_opt("BDX_UPSTREAM_MAX_QUERY_LENGTH", "480"),
    )?;
    let batch_users_by_ids_max: usize = parse_env(
        "BDX_UPSTREAM_BATCH_USERS_BY_IDS_MAX",
        &env_var_opt("BDX_UPSTREAM_BATCH_USERS_BY_IDS_MAX", "100"),
    )?;
    let batch_posts_by_ids_max: usize = parse_env(
        "BDX_UPSTREAM_BATCH_POSTS_BY_IDS_MAX",
        &env_var_opt("BDX_UPSTREAM_BATCH_POSTS_BY_IDS_MAX", "100"),
    )?;
    let http_request_timeout_ms: u64 = parse_env(
        "BDX_UPSTREAM_HTTP_REQUEST_TIMEOUT_MS",
        &env_var_opt("BDX_UPSTREAM_HTTP_REQUEST_TIMEOUT_MS", "10000"),
    )?;

    let http_body_max_bytes: usize = parse_env(
        "BDX_RETENTION_HTTP_BODY_MAX_BYTES",
        &env_var_opt("BDX_RETENTION_HTTP_BODY_MAX_BYTES", "65536"),
    )?;

    let self_user_id: i64 = parse_env("BDX_SELF_USER_ID", &env_var("BDX_SELF_USER_ID")?)?;
    let self_handle = env_var("BDX_SELF_HANDLE")?;

    let ingest_lock_timeout_ms: u64 = parse_env(
        "BDX_INGEST_LOCK_TIMEOUT_MS",
        &env_var_opt("BDX_INGEST_LOCK_TIMEOUT_MS", "10000"),
    )?;
    let ingest_lock_poll_interval_ms: u64 = parse_env(
        "BDX_INGEST_LOCK_POLL_INTERVAL_MS",
        &env_var_opt("BDX_INGEST_LOCK_POLL_INTERVAL_MS", "250"),
    )?;

    require_positive("BDX_DATABASE_MAX_CONNECTIONS", u64::from(max_connections))?;
    require_positive("BDX_ENGINE_TICK_INTERVAL_MS", tick_interval_ms)?;
    require_positive("BDX_ENGINE_MAX_PARALLEL_INSTANCES", u64::from(max_parallel_instances))?;
    require_positive("BDX_INGEST_LOCK_POLL_INTERVAL_MS", ingest_lock_poll_interval_ms)?;
    if rate_limit_qps <= 0.0 {
        return Err(ConfigError::OutOfRange {
            var: "BDX_UPSTREAM_RATE_LIMIT_QPS".into(),
            reason: "must be greater than zero".into(),
        });
    }
    if ingest_lock_poll_interval_ms > ingest_lock_timeout_ms {
        return Err(ConfigError::OutOfRange {
            var: "BDX_INGEST_LOCK_POLL_INTERVAL_MS".into(),
            reason: "must not exceed BDX_INGEST_LOCK_TIMEOUT_MS".into(),
        });
    }

    Ok(EngineConfig {
        database: DatabaseConfig {
            url: database_url,
            max_connections,
            acquire_timeout_ms,
            statement_timeout_ms,
            run_migrations,
        },
        engine: EngineSettings {
            tick_interval_ms,
            max_parallel_instances,
        },
        upstream: UpstreamConfig {
            base_url: upstream_base_url,
            bearer_token: upstream_bearer_token,
            rate_limit_qps,
            max_query_length,
            batch_users_by_ids_max,
            batch_posts_by_ids_max,
            http_request_timeout_ms,
        },
        retention: RetentionConfig { http_body_max_bytes },
        x_self: SelfIdentity {
            user_id: self_user_id,
            handle: self_handle,
        },
        ingest_lock: IngestLockConfig {
            timeout_ms: ingest_lock_timeout_ms,
            poll_interval_ms: ingest_lock_poll_interval_ms,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_all() {
        for var in [
            "BDX_DATABASE_URL",
            "BDX_DATABASE_MAX_CONNECTIONS",
            "BDX_DATABASE_ACQUIRE_TIMEOUT_MS",
            "BDX_DATABASE_STATEMENT_TIMEOUT_MS",
            "BDX_RUN_MIGRATIONS",
            "BDX_ENGINE_TICK_INTERVAL_MS",
            "BDX_ENGINE_MAX_PARALLEL_INSTANCES",
            "BDX_UPSTREAM_BASE_URL",
            "BDX_UPSTREAM_BEARER_TOKEN",
            "BDX_UPSTREAM_RATE_LIMIT_QPS",
            "BDX_UPSTREAM_MAX_QUERY_LENGTH",
            "BDX_UPSTREAM_BATCH_USERS_BY_IDS_MAX",
            "BDX_UPSTREAM_BATCH_POSTS_BY_IDS_MAX",
            "BDX_UPSTREAM_HTTP_REQUEST_TIMEOUT_MS",
            "BDX_RETENTION_HTTP_BODY_MAX_BYTES",
            "BDX_SELF_USER_ID",
            "BDX_SELF_HANDLE",
            "BDX_INGEST_LOCK_TIMEOUT_MS",
            "BDX_INGEST_LOCK_POLL_INTERVAL_MS",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn missing_required_variable_is_named() {
        clear_all();
        let err = load().unwrap_err();
        assert_eq!(err, ConfigError::Missing { var: "BDX_DATABASE_URL".into() });
    }

    #[test]
    #[serial]
    fn minimal_env_loads_with_defaults() {
        clear_all();
        std::env::set_var("BDX_DATABASE_URL", "postgres://localhost/bdx");
        std::env::set_var("BDX_SELF_USER_ID", "7");
        std::env::set_var("BDX_SELF_HANDLE", "birdex_bot");
        std::env::set_var("BDX_UPSTREAM_BASE_URL", "https://api.example.com");
        std::env::set_var("BDX_UPSTREAM_BEARER_TOKEN", "test-token");
        let cfg = load().expect("minimal config should load");
        assert_eq!(cfg.database.url, "postgres://localhost/bdx");
        assert_eq!(cfg.database.max_connections, 10);
        assert_eq!(cfg.engine.tick_interval_ms, 60_000);
        assert_eq!(cfg.x_self.user_id, 7);
        clear_all();
    }

    #[test]
    #[serial]
    fn invalid_numeric_value_names_the_variable() {
        clear_all();
        std::env::set_var("BDX_DATABASE_URL", "postgres://localhost/bdx");
        std::env::set_var("BDX_SELF_USER_ID", "7");
        std::env::set_var("BDX_SELF_HANDLE", "birdex_bot");
        std::env::set_var("BDX_UPSTREAM_BASE_URL", "https://api.example.com");
        std::env::set_var("BDX_UPSTREAM_BEARER_TOKEN", "test-token");
        std::env::set_var("BDX_ENGINE_TICK_INTERVAL_MS", "not-a-number");
        let err = load().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var, .. } if var == "BDX_ENGINE_TICK_INTERVAL_MS"));
        clear_all();
    }

    #[test]
    #[serial]
    fn zero_tick_interval_is_out_of_range() {
        clear_all();
        std::env::set_var("BDX_DATABASE_URL", "postgres://localhost/bdx");
        std::env::set_var("BDX_SELF_USER_ID", "7");
        std::env::set_var("BDX_SELF_HANDLE", "birdex_bot");
        std::env::set_var("BDX_UPSTREAM_BASE_URL", "https://api.example.com");
        std::env::set_var("BDX_UPSTREAM_BEARER_TOKEN", "test-token");
        std::env::set_var("BDX_ENGINE_TICK_INTERVAL_MS", "0");
        let err = load().unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { var, .. } if var == "BDX_ENGINE_TICK_INTERVAL_MS"));
        clear_all();
    }

    #[test]
    #[serial]
    fn poll_interval_exceeding_timeout_is_rejected() {
        clear_all();
        std::env::set_var("BDX_DATABASE_URL", "postgres://localhost/bdx");
        std::env::set_var("BDX_SELF_USER_ID", "7");
        std::env::set_var("BDX_SELF_HANDLE", "birdex_bot");
        std::env::set_var("BDX_UPSTREAM_BASE_URL", "https://api.example.com");
        std::env::set_var("BDX_UPSTREAM_BEARER_TOKEN", "test-token");
        std::env::set_var("BDX_INGEST_LOCK_TIMEOUT_MS", "100");
        std::env::set_var("BDX_INGEST_LOCK_POLL_INTERVAL_MS", "250");
        let err = load().unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));
        clear_all();
    }
}
