//! Per-route middleware chain
//!
//! Global middlewares are named units composed around every mounted handler
//! in registration order. The loader prepends a meta-publishing middleware
//! that copies the matched contract's `skip_middlewares` into the request
//! context, and wraps each global middleware in a skip gate that consults
//! that set. The transaction middleware lives in [`transaction`].

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Request;
use axum::response::Response;
use futures::future::BoxFuture;

use crate::context;
use crate::error::Result;

pub mod transaction;

pub use transaction::TransactionMiddleware;

/// Continuation of the chain: the downstream middlewares plus the handler
pub type Next = Arc<dyn Fn(Request) -> BoxFuture<'static, Result<Response>> + Send + Sync>;

/// A named middleware participating in the per-route chain
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Stable name, matchable by a contract's `skip_middlewares`
    fn name(&self) -> &str;

    async fn handle(&self, request: Request, next: Next) -> Result<Response>;
}

/// Compose `middlewares` around `terminal`, first registered outermost
pub fn compose(middlewares: &[Arc<dyn Middleware>], terminal: Next) -> Next {
    let mut next = terminal;
    for middleware in middlewares.iter().rev() {
        let current = middleware.clone();
        let downstream = next;
        next = Arc::new(move |request: Request| {
            let current = current.clone();
            let downstream = downstream.clone();
            Box::pin(async move { current.handle(request, downstream).await })
        });
    }
    next
}

/// Publishes the matched contract's skip set into the request context
///
/// Installed first on every route so the gates downstream observe the set.
pub struct MetaPublisher {
    skips: HashSet<String>,
}

impl MetaPublisher {
    pub fn new(skip_middlewares: &[&str]) -> Self {
        Self {
            skips: skip_middlewares.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl Middleware for MetaPublisher {
    fn name(&self) -> &str {
        "contract-meta"
    }

    async fn handle(&self, request: Request, next: Next) -> Result<Response> {
        if let Some(ctx) = context::current() {
            ctx.set_skips(self.skips.clone());
        }
        next(request).await
    }
}

/// Short-circuits its inner middleware when the contract skips it by name
pub struct SkipGate {
    inner: Arc<dyn Middleware>,
}

impl SkipGate {
    pub fn new(inner: Arc<dyn Middleware>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Middleware for SkipGate {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn handle(&self, request: Request, next: Next) -> Result<Response> {
        let skipped = context::current()
            .map(|ctx| ctx.skips(self.inner.name()))
            .unwrap_or(false);
        if skipped {
            tracing::debug!(middleware = self.inner.name(), "skipped by contract meta");
            return next(request).await;
        }
        self.inner.handle(request, next).await
    }
}
