//! Transactional request execution
//!
//! Wraps a handler so that every database operation inside it runs within one
//! transaction, published through the request context so handlers reach it
//! via `pool.db()` without parameter threading. The outermost frame owns
//! commit/rollback; nested frames reuse the transaction and only bump the
//! depth counter.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::Request;
use axum::response::Response;
use uuid::Uuid;

use crate::context;
use crate::db::{share_transaction, ConnectionPool, SessionKind};
use crate::error::{Error, ErrorMarker, Result};

use super::{Middleware, Next};

/// Default threshold above which a successful commit logs a warning
pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_secs(1);

pub struct TransactionMiddleware {
    pool: ConnectionPool,
    slow_threshold: Duration,
}

impl TransactionMiddleware {
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
        }
    }

    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }
}

#[async_trait]
impl Middleware for TransactionMiddleware {
    fn name(&self) -> &str {
        "transaction"
    }

    async fn handle(&self, request: Request, next: Next) -> Result<Response> {
        let ctx = context::current().ok_or_else(|| {
            Error::internal("transaction middleware requires an active request context")
        })?;

        // Nested frame: reuse the outer transaction, never commit or roll back
        if ctx.transaction().is_some() {
            let depth = ctx.nest_transaction();
            tracing::debug!(
                tx = ctx.transaction_id().as_deref().unwrap_or("?"),
                depth,
                "joining outer transaction"
            );
            let result = next(request).await;
            ctx.exit_transaction();
            return result;
        }

        let id = correlation_id();
        let started = Instant::now();

        let session = self.pool.get(SessionKind::Write).await?;
        let tx = session.begin().await.map_err(Error::from)?;
        let shared = share_transaction(tx);
        ctx.enter_transaction(shared.clone(), id.clone());
        tracing::debug!(tx = %id, "transaction started");

        let result = next(request).await;

        let failed = match &result {
            Err(_) => true,
            Ok(response) => response.extensions().get::<ErrorMarker>().is_some(),
        };

        let outcome = shared.lock().await.take();
        let elapsed = started.elapsed();
        ctx.exit_transaction();

        let tx = match outcome {
            Some(tx) => tx,
            None => {
                // A handler stole the handle out of the slot; nothing to finish
                tracing::warn!(tx = %id, "transaction handle was taken out of the context");
                return result;
            }
        };

        if failed {
            if let Err(e) = tx.rollback().await {
                tracing::error!(tx = %id, elapsed_ms = elapsed.as_millis() as u64, "rollback failed: {}", e);
            } else {
                tracing::info!(tx = %id, elapsed_ms = elapsed.as_millis() as u64, "transaction rolled back");
            }
            return result;
        }

        match tx.commit().await {
            Ok(()) => {
                if elapsed > self.slow_threshold {
                    tracing::warn!(
                        tx = %id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "slow transaction committed"
                    );
                } else {
                    tracing::info!(
                        tx = %id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "transaction committed"
                    );
                }
                result
            }
            Err(e) => {
                tracing::error!(tx = %id, "commit failed: {}", e);
                Err(Error::from(e))
            }
        }
    }
}

/// Short unique id used only for log correlation
fn correlation_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryDriver;
    use crate::db::{DriverErrorKind, PoolOptions, RetryOptions};
    use crate::error::ErrorKind;
    use crate::middleware::compose;
    use axum::body::Body;
    use axum::response::IntoResponse;
    use std::sync::Arc;

    async fn test_pool(driver: &MemoryDriver) -> ConnectionPool {
        let pool = ConnectionPool::new(Arc::new(driver.clone()));
        pool.init(PoolOptions {
            url: Some("memory://primary".to_string()),
            retry: RetryOptions {
                max_attempts: 1,
                ..RetryOptions::default()
            },
            health: crate::db::pool::HealthOptions {
                enabled: false,
                ..Default::default()
            },
            ..PoolOptions::default()
        })
        .await
        .unwrap();
        pool
    }

    fn request() -> Request {
        Request::builder().uri("/").body(Body::empty()).unwrap()
    }

    fn insert_handler(pool: ConnectionPool, fail_after_insert: bool) -> Next {
        Arc::new(move |_request| {
            let pool = pool.clone();
            Box::pin(async move {
                let db = pool.db().await?;
                assert!(db.in_transaction());
                db.execute(
                    "INSERT INTO users (email) VALUES ($1)",
                    &[serde_json::json!("r@x")],
                )
                .await?;
                if fail_after_insert {
                    return Err(Error::internal("handler exploded"));
                }
                Ok("created".into_response())
            })
        })
    }

    #[tokio::test]
    async fn successful_handler_commits_exactly_once() {
        let driver = MemoryDriver::new();
        let pool = test_pool(&driver).await;
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(TransactionMiddleware::new(pool.clone()))];
        let handler = compose(&chain, insert_handler(pool, false));

        let ctx = context::RequestContext::new();
        let response = context::with_context(ctx.clone(), handler(request()))
            .await
            .unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(driver.committed().len(), 1);
        assert_eq!(ctx.transaction_depth(), 0);
        assert!(ctx.transaction().is_none());
    }

    #[tokio::test]
    async fn failing_handler_rolls_back() {
        let driver = MemoryDriver::new();
        let pool = test_pool(&driver).await;
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(TransactionMiddleware::new(pool.clone()))];
        let handler = compose(&chain, insert_handler(pool.clone(), true));

        let err = context::with_context(context::RequestContext::new(), handler(request()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(driver.committed().is_empty());

        // Nothing visible afterwards through a fresh pool session
        let db = pool.db().await.unwrap();
        let rows = db
            .query(
                "SELECT * FROM users WHERE email = $1",
                &[serde_json::json!("r@x")],
            )
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn error_marker_on_response_rolls_back() {
        let driver = MemoryDriver::new();
        let pool = test_pool(&driver).await;
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(TransactionMiddleware::new(pool.clone()))];

        let terminal: Next = Arc::new(move |_request| {
            let pool = pool.clone();
            Box::pin(async move {
                let db = pool.db().await?;
                db.execute("INSERT INTO t (v) VALUES ($1)", &[serde_json::json!(1)])
                    .await?;
                // Handler maps its own failure into a response instead of Err
                Ok(Error::conflict("already exists").into_response())
            })
        });
        let handler = compose(&chain, terminal);

        let response = context::with_context(context::RequestContext::new(), handler(request()))
            .await
            .unwrap();
        assert_eq!(response.status(), http::StatusCode::CONFLICT);
        assert!(driver.committed().is_empty());
    }

    #[tokio::test]
    async fn nested_frames_share_one_transaction() {
        let driver = MemoryDriver::new();
        let pool = test_pool(&driver).await;

        let depth_seen = Arc::new(std::sync::Mutex::new(0));
        let depth_clone = depth_seen.clone();
        let pool_inner = pool.clone();
        let terminal: Next = Arc::new(move |_request| {
            let pool = pool_inner.clone();
            let depth = depth_clone.clone();
            Box::pin(async move {
                *depth.lock().unwrap() = context::current().unwrap().transaction_depth();
                let db = pool.db().await?;
                db.execute("INSERT INTO t (v) VALUES ($1)", &[serde_json::json!(7)])
                    .await?;
                Ok("ok".into_response())
            })
        });

        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(TransactionMiddleware::new(pool.clone())),
            Arc::new(TransactionMiddleware::new(pool.clone())),
        ];
        let handler = compose(&chain, terminal);

        context::with_context(context::RequestContext::new(), handler(request()))
            .await
            .unwrap();

        assert_eq!(*depth_seen.lock().unwrap(), 2);
        // One transaction, one commit: the insert appears exactly once
        assert_eq!(driver.committed().len(), 1);
    }

    #[tokio::test]
    async fn commit_failure_surfaces_connection_error() {
        let driver = MemoryDriver::new();
        let pool = test_pool(&driver).await;
        driver.fail_next_commits(1);

        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(TransactionMiddleware::new(pool.clone()))];
        let handler = compose(&chain, insert_handler(pool, false));

        let err = context::with_context(context::RequestContext::new(), handler(request()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(driver.committed().is_empty());
    }

    #[tokio::test]
    async fn unique_violation_maps_to_duplicate_entry() {
        let driver = MemoryDriver::new();
        let pool = test_pool(&driver).await;
        driver.inject_execute_error(DriverErrorKind::UniqueViolation);

        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(TransactionMiddleware::new(pool.clone()))];
        let handler = compose(&chain, insert_handler(pool, false));

        let err = context::with_context(context::RequestContext::new(), handler(request()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateEntry);
        assert!(driver.committed().is_empty());
    }

    #[tokio::test]
    async fn requires_request_context() {
        let driver = MemoryDriver::new();
        let pool = test_pool(&driver).await;
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(TransactionMiddleware::new(pool.clone()))];
        let handler = compose(&chain, insert_handler(pool, false));

        let err = handler(request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
