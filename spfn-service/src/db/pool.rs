//! Connection pool management
//!
//! Owns the primary (write) session and an optional read replica, handing
//! them out to the request pipeline. Startup uses exponential-backoff retry
//! with a probe per attempt; an optional health monitor re-probes live
//! sessions on an interval and drives reconnection when they go bad.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::context;
use crate::error::{Error, Result};

use super::{ConnectOptions, Driver, Session, SharedTransaction};

/// Which session a caller wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Read,
    Write,
}

/// Startup retry parameters (exponential backoff)
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
        }
    }
}

/// Health monitoring parameters
#[derive(Debug, Clone)]
pub struct HealthOptions {
    pub enabled: bool,
    pub interval: Duration,
    pub reconnect: bool,
    pub retry_interval: Duration,
    pub max_retries: u32,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            reconnect: true,
            retry_interval: Duration::from_secs(2),
            max_retries: 3,
        }
    }
}

/// Fully resolved pool configuration
#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
    pub url: Option<String>,
    pub replica_url: Option<String>,
    pub connect: ConnectOptions,
    pub retry: RetryOptions,
    pub health: HealthOptions,
}

impl PoolOptions {
    /// Resolve options from the environment with environment-aware defaults
    ///
    /// Precedence per field: caller override (apply after this call) >
    /// `SPFN_DB_*` environment variable > default. Non-production
    /// environments get smaller pools.
    pub fn from_env(environment: &str) -> Self {
        let production = environment == "production";

        let max_connections = env_u32("SPFN_DB_MAX_CONNECTIONS")
            .unwrap_or(if production { 20 } else { 5 });
        let idle_timeout = env_u64("SPFN_DB_IDLE_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(if production {
                Duration::from_secs(600)
            } else {
                Duration::from_secs(300)
            });

        let retry = RetryOptions {
            max_attempts: env_u32("SPFN_DB_RETRY_MAX_ATTEMPTS").unwrap_or(5),
            initial_delay: env_u64("SPFN_DB_RETRY_INITIAL_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_millis(500)),
            max_delay: env_u64("SPFN_DB_RETRY_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(10)),
            factor: 2.0,
        };

        let health = HealthOptions {
            enabled: env_bool("SPFN_DB_HEALTH_ENABLED").unwrap_or(true),
            interval: env_u64("SPFN_DB_HEALTH_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(30)),
            reconnect: env_bool("SPFN_DB_HEALTH_RECONNECT").unwrap_or(true),
            retry_interval: env_u64("SPFN_DB_HEALTH_RETRY_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(2)),
            max_retries: env_u32("SPFN_DB_HEALTH_MAX_RETRIES").unwrap_or(3),
        };

        Self {
            url: std::env::var("SPFN_DATABASE_URL").ok(),
            replica_url: std::env::var("SPFN_DATABASE_REPLICA_URL").ok(),
            connect: ConnectOptions {
                max_connections,
                idle_timeout,
                ..ConnectOptions::default()
            },
            retry,
            health,
        }
    }
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
}

/// Diagnostic snapshot of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolInfo {
    pub has_write: bool,
    pub has_read: bool,
    pub is_replica: bool,
}

#[derive(Default)]
struct PoolState {
    write: Option<Arc<dyn Session>>,
    read: Option<Arc<dyn Session>>,
    is_replica: bool,
    monitor: Option<JoinHandle<()>>,
}

struct PoolInner {
    driver: Arc<dyn Driver>,
    options: RwLock<Option<PoolOptions>>,
    state: RwLock<PoolState>,
}

/// Managed primary/replica session pair
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool").finish_non_exhaustive()
    }
}

impl ConnectionPool {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                driver,
                options: RwLock::new(None),
                state: RwLock::new(PoolState::default()),
            }),
        }
    }

    /// Acquire and probe the primary session (and replica when configured),
    /// then start the health monitor if enabled.
    pub async fn init(&self, options: PoolOptions) -> Result<()> {
        let url = options
            .url
            .clone()
            .ok_or_else(|| Error::config("database URL is not configured"))?;

        let write = self.connect_with_retry(&url, &options).await?;

        let (read, is_replica) = match options.replica_url.clone() {
            Some(replica_url) => {
                let replica = self.connect_with_retry(&replica_url, &options).await?;
                (replica, true)
            }
            None => (write.clone(), false),
        };

        {
            let mut state = self.inner.state.write().await;
            state.write = Some(write);
            state.read = Some(read);
            state.is_replica = is_replica;
        }
        *self.inner.options.write().await = Some(options.clone());

        if options.health.enabled {
            self.start_monitor(options.health.clone()).await;
        }

        tracing::info!(
            replica = is_replica,
            health = options.health.enabled,
            "database pool initialized"
        );
        Ok(())
    }

    async fn connect_with_retry(
        &self,
        url: &str,
        options: &PoolOptions,
    ) -> Result<Arc<dyn Session>> {
        let retry = &options.retry;
        let mut delay = retry.initial_delay;
        let mut last_error = None;

        for attempt in 1..=retry.max_attempts.max(1) {
            match self.inner.driver.connect(url, &options.connect).await {
                Ok(session) => match session.probe().await {
                    Ok(()) => {
                        if attempt > 1 {
                            tracing::info!(attempt, "database connection established after retry");
                        }
                        return Ok(session);
                    }
                    Err(e) => {
                        tracing::warn!(attempt, "database probe failed: {}", e);
                        last_error = Some(e);
                    }
                },
                Err(e) => {
                    tracing::warn!(attempt, "database connection failed: {}", e);
                    last_error = Some(e);
                }
            }

            if attempt < retry.max_attempts {
                tokio::time::sleep(delay).await;
                let next = delay.as_secs_f64() * retry.factor;
                delay = Duration::from_secs_f64(next.min(retry.max_delay.as_secs_f64()));
            }
        }

        let cause = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Err(Error::connection(format!(
            "database unreachable after {} attempt(s): {}",
            retry.max_attempts.max(1),
            cause
        )))
    }

    /// Fetch a session; `Read` falls back to the primary when no replica exists
    pub async fn get(&self, kind: SessionKind) -> Result<Arc<dyn Session>> {
        let state = self.inner.state.read().await;
        let session = match kind {
            SessionKind::Write => state.write.clone(),
            SessionKind::Read => state.read.clone().or_else(|| state.write.clone()),
        };
        session.ok_or_else(|| Error::connection("database pool is not initialized"))
    }

    /// Stop the monitor and end both sessions, tolerating per-session errors
    pub async fn close(&self) {
        let (write, read, monitor, is_replica) = {
            let mut state = self.inner.state.write().await;
            (
                state.write.take(),
                state.read.take(),
                state.monitor.take(),
                std::mem::take(&mut state.is_replica),
            )
        };

        if let Some(handle) = monitor {
            handle.abort();
        }

        let close_write = async {
            if let Some(session) = write {
                if let Err(e) = session.close().await {
                    tracing::warn!("error closing write session: {}", e);
                }
            }
        };
        let close_read = async {
            // Without a replica the read session aliases the write session
            if is_replica {
                if let Some(session) = read {
                    if let Err(e) = session.close().await {
                        tracing::warn!("error closing read session: {}", e);
                    }
                }
            }
        };
        tokio::join!(close_write, close_read);

        tracing::info!("database pool closed");
    }

    pub async fn info(&self) -> PoolInfo {
        let state = self.inner.state.read().await;
        PoolInfo {
            has_write: state.write.is_some(),
            has_read: state.read.is_some(),
            is_replica: state.is_replica,
        }
    }

    /// Database handle for the current request: the ambient transaction when
    /// one is published, otherwise the pool's write session.
    pub async fn db(&self) -> Result<Db> {
        if let Some(ctx) = context::current() {
            if let Some(tx) = ctx.transaction() {
                return Ok(Db::Transaction(tx));
            }
        }
        Ok(Db::Session(self.get(SessionKind::Write).await?))
    }

    async fn start_monitor(&self, health: HealthOptions) {
        let pool = self.clone();
        let interval = health.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so probing starts one
            // interval after init.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                pool.run_health_check(&health).await;
            }
        });
        self.inner.state.write().await.monitor = Some(handle);
    }

    async fn run_health_check(&self, health: &HealthOptions) {
        let (write, read, is_replica) = {
            let state = self.inner.state.read().await;
            (state.write.clone(), state.read.clone(), state.is_replica)
        };

        let mut failed = write.is_none();
        if let Some(session) = &write {
            if let Err(e) = session.probe().await {
                tracing::error!("health check failed on write session: {}", e);
                failed = true;
            }
        }
        if is_replica {
            if let Some(session) = &read {
                if let Err(e) = session.probe().await {
                    tracing::error!("health check failed on read session: {}", e);
                    failed = true;
                }
            }
        }

        if failed && health.reconnect {
            self.reconnect(health).await;
        }
    }

    /// Close the dead sessions, then re-initialize with the stored options,
    /// probing each attempt, bounded by `max_retries`.
    async fn reconnect(&self, health: &HealthOptions) {
        let options = match self.inner.options.read().await.clone() {
            Some(options) => options,
            None => return,
        };
        let url = match options.url.clone() {
            Some(url) => url,
            None => return,
        };

        let (old_write, old_read, is_replica) = {
            let mut state = self.inner.state.write().await;
            (
                state.write.take(),
                state.read.take(),
                state.is_replica,
            )
        };
        if let Some(session) = old_write {
            let _ = session.close().await;
        }
        if is_replica {
            if let Some(session) = old_read {
                let _ = session.close().await;
            }
        }

        for attempt in 1..=health.max_retries.max(1) {
            tokio::time::sleep(health.retry_interval).await;
            tracing::info!(attempt, "attempting database reconnection");

            let connected = async {
                let write = self.inner.driver.connect(&url, &options.connect).await?;
                write.probe().await?;
                let (read, replica) = match options.replica_url.clone() {
                    Some(replica_url) => {
                        let read = self.inner.driver.connect(&replica_url, &options.connect).await?;
                        read.probe().await?;
                        (read, true)
                    }
                    None => (write.clone(), false),
                };
                Ok::<_, super::DriverError>((write, read, replica))
            }
            .await;

            match connected {
                Ok((write, read, replica)) => {
                    let mut state = self.inner.state.write().await;
                    state.write = Some(write);
                    state.read = Some(read);
                    state.is_replica = replica;
                    tracing::info!(attempt, "database reconnection succeeded");
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, "database reconnection failed: {}", e);
                }
            }
        }

        tracing::error!(
            retries = health.max_retries,
            "database reconnection exhausted; requests will fail until the next health check"
        );
    }
}

/// Request-facing database handle
///
/// Wraps either the ambient transaction or a pooled session and maps driver
/// errors into the framework taxonomy.
#[derive(Clone)]
pub enum Db {
    Transaction(SharedTransaction),
    Session(Arc<dyn Session>),
}

impl Db {
    pub async fn execute(&self, statement: &str, params: &[Value]) -> Result<u64> {
        match self {
            Db::Transaction(tx) => {
                let mut guard = tx.lock().await;
                let tx = guard
                    .as_mut()
                    .ok_or_else(|| Error::internal("transaction already finished"))?;
                tx.execute(statement, params).await.map_err(Error::from)
            }
            Db::Session(session) => session
                .execute(statement, params)
                .await
                .map_err(Error::from),
        }
    }

    pub async fn query(&self, statement: &str, params: &[Value]) -> Result<Vec<Value>> {
        match self {
            Db::Transaction(tx) => {
                let mut guard = tx.lock().await;
                let tx = guard
                    .as_mut()
                    .ok_or_else(|| Error::internal("transaction already finished"))?;
                tx.query(statement, params).await.map_err(Error::from)
            }
            Db::Session(session) => session.query(statement, params).await.map_err(Error::from),
        }
    }

    pub fn in_transaction(&self) -> bool {
        matches!(self, Db::Transaction(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryDriver;

    fn quick_options(url: &str) -> PoolOptions {
        PoolOptions {
            url: Some(url.to_string()),
            retry: RetryOptions {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                factor: 2.0,
            },
            health: HealthOptions {
                enabled: false,
                ..HealthOptions::default()
            },
            ..PoolOptions::default()
        }
    }

    #[tokio::test]
    async fn missing_url_is_a_config_error() {
        let pool = ConnectionPool::new(Arc::new(MemoryDriver::new()));
        let err = pool.init(PoolOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[tokio::test]
    async fn read_falls_back_to_write_without_replica() {
        let driver = MemoryDriver::new();
        let pool = ConnectionPool::new(Arc::new(driver));
        pool.init(quick_options("memory://primary")).await.unwrap();

        let info = pool.info().await;
        assert!(info.has_write);
        assert!(info.has_read);
        assert!(!info.is_replica);

        let write = pool.get(SessionKind::Write).await.unwrap();
        let read = pool.get(SessionKind::Read).await.unwrap();
        assert!(Arc::ptr_eq(&write, &read));
    }

    #[tokio::test]
    async fn replica_url_yields_distinct_sessions() {
        let driver = MemoryDriver::new();
        let pool = ConnectionPool::new(Arc::new(driver));
        let mut options = quick_options("memory://primary");
        options.replica_url = Some("memory://replica".to_string());
        pool.init(options).await.unwrap();

        let info = pool.info().await;
        assert!(info.is_replica);
        let write = pool.get(SessionKind::Write).await.unwrap();
        let read = pool.get(SessionKind::Read).await.unwrap();
        assert!(!Arc::ptr_eq(&write, &read));
    }

    #[tokio::test]
    async fn retry_attempts_are_bounded() {
        let driver = MemoryDriver::new();
        driver.fail_next_connects(10);
        let pool = ConnectionPool::new(Arc::new(driver.clone()));

        let err = pool.init(quick_options("memory://primary")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Connection);
        assert_eq!(driver.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let driver = MemoryDriver::new();
        driver.fail_next_connects(2);
        let pool = ConnectionPool::new(Arc::new(driver.clone()));

        pool.init(quick_options("memory://primary")).await.unwrap();
        assert_eq!(driver.connect_attempts(), 3);
        assert!(pool.info().await.has_write);
    }

    #[tokio::test]
    async fn close_clears_state() {
        let driver = MemoryDriver::new();
        let pool = ConnectionPool::new(Arc::new(driver));
        pool.init(quick_options("memory://primary")).await.unwrap();
        pool.close().await;

        let info = pool.info().await;
        assert!(!info.has_write);
        assert!(!info.has_read);
        assert!(pool.get(SessionKind::Write).await.is_err());
    }

    #[tokio::test]
    async fn health_monitor_reconnects_after_probe_failure() {
        let driver = MemoryDriver::new();
        let pool = ConnectionPool::new(Arc::new(driver.clone()));
        let mut options = quick_options("memory://primary");
        options.health = HealthOptions {
            enabled: true,
            interval: Duration::from_millis(10),
            reconnect: true,
            retry_interval: Duration::from_millis(1),
            max_retries: 3,
        };
        pool.init(options).await.unwrap();
        let attempts_after_init = driver.connect_attempts();

        driver.fail_next_probes(1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(driver.connect_attempts() > attempts_after_init);
        assert!(pool.info().await.has_write);
        pool.close().await;
    }

    #[tokio::test]
    async fn db_uses_pool_session_outside_transaction() {
        let driver = MemoryDriver::new();
        let pool = ConnectionPool::new(Arc::new(driver.clone()));
        pool.init(quick_options("memory://primary")).await.unwrap();

        let db = pool.db().await.unwrap();
        assert!(!db.in_transaction());
        db.execute("INSERT INTO t (v) VALUES ($1)", &[serde_json::json!(1)])
            .await
            .unwrap();
        assert_eq!(driver.committed().len(), 1);
    }

    #[tokio::test]
    async fn db_prefers_ambient_transaction() {
        let driver = MemoryDriver::new();
        let pool = ConnectionPool::new(Arc::new(driver.clone()));
        pool.init(quick_options("memory://primary")).await.unwrap();

        let ctx = crate::context::RequestContext::new();
        let tx = driver.shared_transaction_for_tests().await;
        ctx.enter_transaction(tx, "tx-test".into());

        let pool_clone = pool.clone();
        crate::context::with_context(ctx, async move {
            let db = pool_clone.db().await.unwrap();
            assert!(db.in_transaction());
        })
        .await;
    }
}
