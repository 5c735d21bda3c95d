//! Configuration Management Module
//!
//! Loads and parses all application configuration from environment
//! variables: server binding, worker pool sizing, cache bounds, circuit
//! breaker thresholds, timeouts, and admin credentials. Configuration is
//! loaded once at startup and shared across all components.

use serde::{Deserialize, Serialize};
use std::env;

/// Get environment variable value or fallback to default.
pub fn env_or(key: &str, fallback: &str) -> String {
    env::var(key).unwrap_or_else(|_| fallback.to_string())
}

/// Parse boolean values from environment variables.
///
/// Supported: `1`/`true`/`TRUE` and `0`/`false`/`FALSE`; anything else
/// (including missing) falls back to `fallback`.
pub fn bool_env(key: &str, fallback: bool) -> bool {
    match env::var(key).as_deref() {
        Ok("1") | Ok("true") | Ok("TRUE") => true,
        Ok("0") | Ok("false") | Ok("FALSE") => false,
        _ => fallback,
    }
}

/// Parse a numeric environment variable, falling back on absence or a
/// malformed value.
pub fn num_env<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback)
}

/// Parse comma-separated values from environment variables.
pub fn parse_csv(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Worker pool sizing (component C3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks. Default `max(2, cores - 1)`.
    pub worker_count: usize,
    /// Bounded queue capacity. Default `4 * worker_count`.
    pub queue_capacity: usize,
}

/// Result cache sizing and TTLs (component C2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_age_secs: u64,
    pub negative_ttl_secs: u64,
}

/// Circuit breaker thresholds (component C6). See §4.6 for semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Combined load at/above which Closed -> HalfOpen.
    pub open_threshold: f64,
    /// Combined load at/above which HalfOpen -> Open.
    pub shed_threshold: f64,
    /// Combined load below which HalfOpen -> Closed (after 5 samples).
    pub closed_threshold: f64,
    /// Fraction of a single-point baseline cost admitted while HalfOpen.
    pub half_open_cost_fraction: f64,
    /// Cost multiplier applied to admitted HalfOpen requests.
    pub half_open_cost_multiplier: f64,
    /// Cool-down before Open -> HalfOpen is attempted.
    pub cooldown_secs: u64,
    /// Base Retry-After when shedding from Open.
    pub base_retry_after_secs: u64,
}

/// Admin Basic-Auth credentials, configured out-of-band (component C8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub username: String,
    pub password: String,
}

/// Browser session TTLs (component C7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub absolute_ttl_secs: u64,
    pub idle_ttl_secs: u64,
}

/// Main application configuration, loaded once at startup from environment
/// variables and shared across all components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server bind address (host:port)
    pub bind_address: String,
    /// Maximum JSON request body size in bytes
    pub json_limit: usize,
    /// List of allowed CORS origins for cross-origin requests
    pub allowed_origins: Vec<String>,

    pub worker_pool: WorkerPoolConfig,
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
    pub admin: AdminConfig,
    pub session: SessionConfig,

    /// Upper bound on the Cartesian product of axis lengths (component C4).
    pub max_points: u64,
    /// Whole-request wall-clock budget before the session is cancelled.
    pub request_timeout_secs: u64,
    /// Per-kernel-invocation budget before `NumericalFailure` is returned.
    pub kernel_timeout_secs: u64,
    /// Usage-event retention window (component C9).
    pub usage_retention_days: u32,
}

impl Config {
    /// Load configuration from environment variables, loading a `.env`
    /// file first if present (development convenience). Never panics; uses
    /// sensible defaults for anything unset.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let allowed_origins_str = env::var("ALLOWED_ORIGINS").ok();
        let default_workers = std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(2))
            .unwrap_or(2);
        let worker_count = num_env("WORKER_COUNT", default_workers);

        Self {
            bind_address: env_or("BIND_ADDRESS", "127.0.0.1:8080"),
            json_limit: num_env("JSON_LIMIT", 8 * 1024 * 1024),
            allowed_origins: parse_csv(allowed_origins_str.as_deref()),

            worker_pool: WorkerPoolConfig {
                worker_count,
                queue_capacity: num_env("QUEUE_CAPACITY", worker_count * 4),
            },
            cache: CacheConfig {
                max_entries: num_env("CACHE_MAX_ENTRIES", 10_000),
                max_age_secs: num_env("CACHE_MAX_AGE_SECS", 300),
                negative_ttl_secs: num_env("CACHE_NEGATIVE_TTL_SECS", 30),
            },
            breaker: BreakerConfig {
                open_threshold: num_env("BREAKER_OPEN_THRESHOLD", 0.80),
                shed_threshold: num_env("BREAKER_SHED_THRESHOLD", 0.95),
                closed_threshold: num_env("BREAKER_CLOSED_THRESHOLD", 0.60),
                half_open_cost_fraction: num_env("BREAKER_HALF_OPEN_COST_FRACTION", 0.10),
                half_open_cost_multiplier: num_env("BREAKER_HALF_OPEN_COST_MULTIPLIER", 1.5),
                cooldown_secs: num_env("BREAKER_COOLDOWN_SECS", 10),
                base_retry_after_secs: num_env("BREAKER_BASE_RETRY_AFTER_SECS", 5),
            },
            admin: AdminConfig {
                username: env_or("ADMIN_USERNAME", "admin"),
                password: env_or("ADMIN_PASSWORD", ""),
            },
            session: SessionConfig {
                absolute_ttl_secs: num_env("SESSION_ABSOLUTE_TTL_SECS", 24 * 3600),
                idle_ttl_secs: num_env("SESSION_IDLE_TTL_SECS", 3600),
            },

            max_points: num_env("MAX_POINTS", 10_000),
            request_timeout_secs: num_env("REQUEST_TIMEOUT_SECS", 30),
            kernel_timeout_secs: num_env("KERNEL_TIMEOUT_SECS", 10),
            usage_retention_days: num_env("USAGE_RETENTION_DAYS", 90),
        }
    }
}
