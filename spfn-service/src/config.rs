//! Service configuration
//!
//! Configuration is loaded from multiple sources with the following
//! precedence (highest to lowest):
//! 1. Environment variables (prefix: `SPFN_`, `__` as the section separator)
//! 2. Project config file: `./spfn.toml`
//! 3. Default values
//!
//! Database settings resolve one step further in
//! [`DatabaseConfig::to_pool_options`]: explicit config values override
//! `SPFN_DB_*` environment variables, which override environment-aware
//! defaults (smaller pools outside production).

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::db::{HealthOptions, PoolOptions, RetryOptions};
use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// Route tree configuration
    #[serde(default)]
    pub routes: RoutesConfig,

    /// Middleware configuration
    #[serde(default)]
    pub middleware: MiddlewareConfig,

    /// Database configuration (optional)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Request deadline in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Environment (development, test, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Include stack traces in 5xx responses (ignored in production)
    #[serde(default = "default_false")]
    pub include_error_stack: bool,

    /// Bound on in-flight request draining at shutdown
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

/// Route tree configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutesConfig {
    /// Root of the route tree
    #[serde(default = "default_routes_dir")]
    pub dir: PathBuf,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            dir: default_routes_dir(),
        }
    }
}

/// Middleware configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    /// Request body size limit in MB
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,

    /// Enable panic recovery middleware
    #[serde(default = "default_true")]
    pub catch_panic: bool,

    /// Enable compression
    #[serde(default = "default_true")]
    pub compression: bool,

    /// CORS configuration
    #[serde(default = "default_cors_mode")]
    pub cors_mode: String,

    /// Commit latency above this logs a warning (ms)
    #[serde(default = "default_slow_transaction_ms")]
    pub slow_transaction_ms: u64,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            body_limit_mb: default_body_limit_mb(),
            catch_panic: true,
            compression: true,
            cors_mode: default_cors_mode(),
            slow_transaction_ms: default_slow_transaction_ms(),
        }
    }
}

/// Database configuration
///
/// Unset sizing fields resolve against `SPFN_DB_*` variables and
/// environment-aware defaults when converted to pool options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Primary connection URL
    pub url: Option<String>,

    /// Read replica URL (optional)
    #[serde(default)]
    pub replica_url: Option<String>,

    /// Maximum number of connections in the pool
    #[serde(default)]
    pub max_connections: Option<u32>,

    /// Idle connection timeout in seconds
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    /// Maximum retry attempts for establishing the connection
    #[serde(default)]
    pub retry_max_attempts: Option<u32>,

    /// Initial retry delay in milliseconds
    #[serde(default)]
    pub retry_initial_delay_ms: Option<u64>,

    /// Ceiling for the exponential backoff delay in milliseconds
    #[serde(default)]
    pub retry_max_delay_ms: Option<u64>,

    /// Enable periodic health checks
    #[serde(default)]
    pub health_enabled: Option<bool>,

    /// Health check interval in seconds
    #[serde(default)]
    pub health_interval_secs: Option<u64>,

    /// Reconnect automatically when a health check fails
    #[serde(default)]
    pub health_reconnect: Option<bool>,

    /// Delay between reconnection attempts in seconds
    #[serde(default)]
    pub health_retry_interval_secs: Option<u64>,

    /// Bound on reconnection attempts per failed health check
    #[serde(default)]
    pub health_max_retries: Option<u32>,
}

impl DatabaseConfig {
    /// Resolve into pool options: config value > `SPFN_DB_*` variable >
    /// environment-aware default.
    pub fn to_pool_options(&self, environment: &str) -> PoolOptions {
        let mut options = PoolOptions::from_env(environment);

        if self.url.is_some() {
            options.url = self.url.clone();
        }
        if self.replica_url.is_some() {
            options.replica_url = self.replica_url.clone();
        }
        if let Some(max) = self.max_connections {
            options.connect.max_connections = max;
        }
        if let Some(secs) = self.idle_timeout_secs {
            options.connect.idle_timeout = Duration::from_secs(secs);
        }

        options.retry = RetryOptions {
            max_attempts: self.retry_max_attempts.unwrap_or(options.retry.max_attempts),
            initial_delay: self
                .retry_initial_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(options.retry.initial_delay),
            max_delay: self
                .retry_max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(options.retry.max_delay),
            factor: options.retry.factor,
        };

        options.health = HealthOptions {
            enabled: self.health_enabled.unwrap_or(options.health.enabled),
            interval: self
                .health_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(options.health.interval),
            reconnect: self.health_reconnect.unwrap_or(options.health.reconnect),
            retry_interval: self
                .health_retry_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(options.health.retry_interval),
            max_retries: self.health_max_retries.unwrap_or(options.health.max_retries),
        };

        options
    }
}

// Default value functions
fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_routes_dir() -> PathBuf {
    PathBuf::from("src/server/routes")
}

fn default_body_limit_mb() -> usize {
    10
}

fn default_cors_mode() -> String {
    "permissive".to_string()
}

fn default_slow_transaction_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

impl Config {
    /// Load configuration from `./spfn.toml` and the environment
    pub fn load() -> Result<Self> {
        Self::load_from("spfn.toml")
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &str) -> Result<Self> {
        let config = Figment::new()
            // Start with defaults
            .merge(Serialized::defaults(Config::default()))
            // Load from config file (if exists)
            .merge(Toml::file(path))
            // Override with environment variables
            .merge(Env::prefixed("SPFN_").split("__"))
            .extract()?;

        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.service.environment == "production"
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.service.timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.service.drain_timeout_secs)
    }

    pub fn slow_transaction_threshold(&self) -> Duration {
        Duration::from_millis(self.middleware.slow_transaction_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "spfn-service".to_string(),
                port: default_port(),
                log_level: default_log_level(),
                timeout_secs: default_timeout(),
                environment: default_environment(),
                include_error_stack: false,
                drain_timeout_secs: default_drain_timeout(),
            },
            routes: RoutesConfig::default(),
            middleware: MiddlewareConfig::default(),
            database: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.service.port, 8080);
        assert_eq!(config.service.log_level, "info");
        assert_eq!(config.service.environment, "development");
        assert_eq!(config.routes.dir, PathBuf::from("src/server/routes"));
        assert!(!config.is_production());
    }

    #[test]
    fn load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spfn.toml");
        std::fs::write(
            &path,
            r#"
[service]
name = "orders"
port = 9000

[database]
url = "postgres://localhost/orders"
max_connections = 12
"#,
        )
        .unwrap();

        let config = Config::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.service.name, "orders");
        assert_eq!(config.service.port, 9000);
        let db = config.database.unwrap();
        assert_eq!(db.url.as_deref(), Some("postgres://localhost/orders"));
        assert_eq!(db.max_connections, Some(12));
    }

    #[test]
    fn pool_options_are_environment_aware() {
        let db = DatabaseConfig {
            url: Some("postgres://localhost/app".to_string()),
            ..DatabaseConfig::default()
        };

        let dev = db.to_pool_options("development");
        let prod = db.to_pool_options("production");
        // Non-production environments get tighter pools
        assert!(dev.connect.max_connections < prod.connect.max_connections);
    }

    #[test]
    fn explicit_config_beats_environment_defaults() {
        let db = DatabaseConfig {
            url: Some("postgres://localhost/app".to_string()),
            max_connections: Some(42),
            retry_max_attempts: Some(9),
            health_enabled: Some(false),
            ..DatabaseConfig::default()
        };
        let options = db.to_pool_options("production");
        assert_eq!(options.connect.max_connections, 42);
        assert_eq!(options.retry.max_attempts, 9);
        assert!(!options.health.enabled);
    }
}
