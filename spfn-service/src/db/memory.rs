//! In-memory database driver
//!
//! A statement-journal backend: executed statements are appended to a
//! committed log, transactions buffer their statements until commit, and
//! queries return the committed entries whose parameters contain every query
//! parameter. Enough surface for integration tests and local development
//! without a running database; failure injection knobs drive the pool and
//! transaction test suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use super::{
    share_transaction, ConnectOptions, Driver, DriverError, DriverErrorKind, Session,
    SharedTransaction, Transaction,
};

#[derive(Debug, Clone, PartialEq)]
struct Statement {
    sql: String,
    params: Vec<Value>,
}

impl Statement {
    fn as_row(&self) -> Value {
        serde_json::json!({
            "statement": self.sql,
            "params": self.params,
        })
    }
}

#[derive(Default)]
struct MemoryState {
    committed: Mutex<Vec<Statement>>,
    connect_attempts: AtomicU32,
    connect_failures: AtomicU32,
    probe_failures: AtomicU32,
    commit_failures: AtomicU32,
    execute_errors: Mutex<VecDeque<DriverErrorKind>>,
}

/// Cloneable in-memory driver; every session opened from the same driver
/// shares one journal.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<MemoryState>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` connection attempts with `ConnectionLost`
    pub fn fail_next_connects(&self, n: u32) {
        self.state.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` probes with `ConnectionLost`
    pub fn fail_next_probes(&self, n: u32) {
        self.state.probe_failures.store(n, Ordering::SeqCst);
    }

    /// Queue a driver error for an upcoming execute call
    pub fn inject_execute_error(&self, kind: DriverErrorKind) {
        self.state.execute_errors.lock().unwrap().push_back(kind);
    }

    /// Fail the next `n` transaction commits with `ConnectionLost`
    pub fn fail_next_commits(&self, n: u32) {
        self.state.commit_failures.store(n, Ordering::SeqCst);
    }

    /// Total connection attempts observed (successful or not)
    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Committed statements, oldest first
    pub fn committed(&self) -> Vec<Value> {
        self.state
            .committed
            .lock()
            .unwrap()
            .iter()
            .map(Statement::as_row)
            .collect()
    }

    /// Begin a transaction on a detached session, wrapped for context publication
    pub async fn shared_transaction_for_tests(&self) -> SharedTransaction {
        let session = MemorySession {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        };
        let tx = session.begin().await.expect("memory begin cannot fail");
        share_transaction(tx)
    }

    fn take_execute_error(&self) -> Option<DriverError> {
        take_injected(&self.state)
    }
}

fn take_injected(state: &MemoryState) -> Option<DriverError> {
    state
        .execute_errors
        .lock()
        .unwrap()
        .pop_front()
        .map(|kind| DriverError::new(kind, "injected failure"))
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn connect(
        &self,
        _url: &str,
        _opts: &ConnectOptions,
    ) -> Result<Arc<dyn Session>, DriverError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.state.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state
                .connect_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(DriverError::new(
                DriverErrorKind::ConnectionLost,
                "memory driver: injected connect failure",
            ));
        }

        Ok(Arc::new(MemorySession {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemorySession {
    state: Arc<MemoryState>,
    closed: AtomicBool,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DriverError::new(
                DriverErrorKind::PoolClosed,
                "session is closed",
            ))
        } else {
            Ok(())
        }
    }
}

fn params_contain(haystack: &[Value], needles: &[Value]) -> bool {
    needles.iter().all(|needle| haystack.contains(needle))
}

#[async_trait]
impl Session for MemorySession {
    async fn probe(&self) -> Result<(), DriverError> {
        self.ensure_open()?;
        let remaining = self.state.probe_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state.probe_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DriverError::new(
                DriverErrorKind::ConnectionLost,
                "memory driver: injected probe failure",
            ));
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, DriverError> {
        self.ensure_open()?;
        Ok(Box::new(MemoryTransaction {
            driver: MemoryDriver {
                state: self.state.clone(),
            },
            buffer: Vec::new(),
        }))
    }

    async fn execute(&self, statement: &str, params: &[Value]) -> Result<u64, DriverError> {
        self.ensure_open()?;
        if let Some(err) = take_injected(&self.state) {
            return Err(err);
        }
        self.state.committed.lock().unwrap().push(Statement {
            sql: statement.to_string(),
            params: params.to_vec(),
        });
        Ok(1)
    }

    async fn query(&self, _statement: &str, params: &[Value]) -> Result<Vec<Value>, DriverError> {
        self.ensure_open()?;
        Ok(self
            .state
            .committed
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| params_contain(&entry.params, params))
            .map(Statement::as_row)
            .collect())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryTransaction {
    driver: MemoryDriver,
    buffer: Vec<Statement>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn execute(&mut self, statement: &str, params: &[Value]) -> Result<u64, DriverError> {
        if let Some(err) = self.driver.take_execute_error() {
            return Err(err);
        }
        self.buffer.push(Statement {
            sql: statement.to_string(),
            params: params.to_vec(),
        });
        Ok(1)
    }

    async fn query(
        &mut self,
        _statement: &str,
        params: &[Value],
    ) -> Result<Vec<Value>, DriverError> {
        let committed = self.driver.state.committed.lock().unwrap();
        Ok(committed
            .iter()
            .chain(self.buffer.iter())
            .filter(|entry| params_contain(&entry.params, params))
            .map(Statement::as_row)
            .collect())
    }

    async fn commit(self: Box<Self>) -> Result<(), DriverError> {
        let remaining = self.driver.state.commit_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.driver
                .state
                .commit_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(DriverError::new(
                DriverErrorKind::ConnectionLost,
                "memory driver: injected commit failure",
            ));
        }
        self.driver
            .state
            .committed
            .lock()
            .unwrap()
            .extend(self.buffer);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DriverError> {
        // Buffered statements are simply discarded
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_outside_transaction_commits_immediately() {
        let driver = MemoryDriver::new();
        let session = driver
            .connect("memory://", &ConnectOptions::default())
            .await
            .unwrap();
        session
            .execute("INSERT INTO users (email) VALUES ($1)", &[serde_json::json!("a@x")])
            .await
            .unwrap();
        assert_eq!(driver.committed().len(), 1);
    }

    #[tokio::test]
    async fn committed_transaction_is_visible() {
        let driver = MemoryDriver::new();
        let session = driver
            .connect("memory://", &ConnectOptions::default())
            .await
            .unwrap();
        let mut tx = session.begin().await.unwrap();
        tx.execute("INSERT INTO users (email) VALUES ($1)", &[serde_json::json!("b@x")])
            .await
            .unwrap();
        assert!(driver.committed().is_empty());
        tx.commit().await.unwrap();

        let rows = session
            .query("SELECT * FROM users WHERE email = $1", &[serde_json::json!("b@x")])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn rolled_back_transaction_leaves_no_rows() {
        let driver = MemoryDriver::new();
        let session = driver
            .connect("memory://", &ConnectOptions::default())
            .await
            .unwrap();
        let mut tx = session.begin().await.unwrap();
        tx.execute("INSERT INTO users (email) VALUES ($1)", &[serde_json::json!("c@x")])
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let rows = session
            .query("SELECT * FROM users WHERE email = $1", &[serde_json::json!("c@x")])
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn transaction_sees_its_own_writes() {
        let driver = MemoryDriver::new();
        let session = driver
            .connect("memory://", &ConnectOptions::default())
            .await
            .unwrap();
        let mut tx = session.begin().await.unwrap();
        tx.execute("INSERT INTO t (v) VALUES ($1)", &[serde_json::json!(42)])
            .await
            .unwrap();
        let rows = tx
            .query("SELECT * FROM t WHERE v = $1", &[serde_json::json!(42)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn closed_session_rejects_operations() {
        let driver = MemoryDriver::new();
        let session = driver
            .connect("memory://", &ConnectOptions::default())
            .await
            .unwrap();
        session.close().await.unwrap();
        let err = session.probe().await.unwrap_err();
        assert_eq!(err.kind(), DriverErrorKind::PoolClosed);
    }

    #[tokio::test]
    async fn connect_failure_injection_counts_attempts() {
        let driver = MemoryDriver::new();
        driver.fail_next_connects(2);
        let opts = ConnectOptions::default();
        assert!(driver.connect("memory://", &opts).await.is_err());
        assert!(driver.connect("memory://", &opts).await.is_err());
        assert!(driver.connect("memory://", &opts).await.is_ok());
        assert_eq!(driver.connect_attempts(), 3);
    }
}
