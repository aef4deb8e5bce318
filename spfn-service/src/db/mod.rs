//! Database abstraction layer
//!
//! The runtime core does not embed an ORM or query builder. It defines the
//! contract it needs from a database backend (acquire a session, begin a
//! transaction, commit/rollback, probe) and ships two implementations: a
//! PostgreSQL driver on sqlx (`database` feature) and an in-memory driver
//! for tests and local development.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

pub mod memory;
pub mod pool;

#[cfg(feature = "database")]
pub mod postgres;

pub use pool::{ConnectionPool, Db, HealthOptions, PoolInfo, PoolOptions, RetryOptions, SessionKind};

/// Category of a driver failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverErrorKind {
    /// Unique constraint violation
    UniqueViolation,
    /// Deadlock detected by the database
    Deadlock,
    /// Connection dropped mid-operation
    ConnectionLost,
    /// Pool closed or exhausted
    PoolClosed,
    /// Operation timed out
    Timeout,
    /// Bad connection string or options
    Configuration,
    /// Anything else
    Other,
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UniqueViolation => write!(f, "unique_violation"),
            Self::Deadlock => write!(f, "deadlock"),
            Self::ConnectionLost => write!(f, "connection_lost"),
            Self::PoolClosed => write!(f, "pool_closed"),
            Self::Timeout => write!(f, "timeout"),
            Self::Configuration => write!(f, "configuration"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Structured driver error with a recognizable category
#[derive(Debug, Clone, Error)]
#[error("database {kind} error: {message}")]
pub struct DriverError {
    kind: DriverErrorKind,
    message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> DriverErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Transient errors that may succeed on retry
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            DriverErrorKind::ConnectionLost
                | DriverErrorKind::Timeout
                | DriverErrorKind::Deadlock
                | DriverErrorKind::PoolClosed
        )
    }
}

/// Connection options resolved by the pool manager
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub max_connections: u32,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// A database backend capable of opening sessions
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    async fn connect(
        &self,
        url: &str,
        opts: &ConnectOptions,
    ) -> Result<Arc<dyn Session>, DriverError>;
}

/// An open connection handle
///
/// Sessions handed out by the pool are shared across tasks and must be safe
/// for concurrent use outside a transaction.
#[async_trait]
pub trait Session: Send + Sync {
    /// Trivial read used at startup and by the health monitor
    async fn probe(&self) -> Result<(), DriverError>;

    /// Begin a transaction owned by the calling task
    async fn begin(&self) -> Result<Box<dyn Transaction>, DriverError>;

    async fn execute(&self, statement: &str, params: &[Value]) -> Result<u64, DriverError>;

    async fn query(&self, statement: &str, params: &[Value]) -> Result<Vec<Value>, DriverError>;

    async fn close(&self) -> Result<(), DriverError>;
}

/// An open transaction
///
/// Dropping an uncommitted transaction rolls it back.
#[async_trait]
pub trait Transaction: Send + Sync {
    async fn execute(&mut self, statement: &str, params: &[Value]) -> Result<u64, DriverError>;

    async fn query(&mut self, statement: &str, params: &[Value])
        -> Result<Vec<Value>, DriverError>;

    async fn commit(self: Box<Self>) -> Result<(), DriverError>;

    async fn rollback(self: Box<Self>) -> Result<(), DriverError>;
}

/// A transaction published through the request context
///
/// The slot becomes `None` once the outermost middleware frame has committed
/// or rolled back; late arrivals observe a finished transaction instead of a
/// dangling handle.
pub type SharedTransaction = Arc<Mutex<Option<Box<dyn Transaction>>>>;

/// Wrap a freshly begun transaction for context publication
pub fn share_transaction(tx: Box<dyn Transaction>) -> SharedTransaction {
    Arc::new(Mutex::new(Some(tx)))
}
