//! Ambient per-request storage
//!
//! Values published here (transaction handle, correlation id, middleware skip
//! set) follow the request across `.await` points without being threaded
//! through handler signatures. Storage is task-local: concurrent requests
//! never observe each other's context. Tokio task-locals do not cross
//! `tokio::spawn`, so continuations that must inherit the context are started
//! with [`spawn_inheriting`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::db::SharedTransaction;

tokio::task_local! {
    static REQUEST_CONTEXT: RequestContext;
}

/// Mutable contents of a request context
#[derive(Default)]
struct ContextValues {
    transaction: Option<SharedTransaction>,
    transaction_id: Option<String>,
    transaction_depth: u32,
    skip_middlewares: HashSet<String>,
    values: HashMap<String, serde_json::Value>,
}

/// Handle to the ambient context of one request
///
/// Cheap to clone; all clones share the same underlying values, so mutations
/// made by a middleware are visible to the handler and vice versa.
#[derive(Clone, Default)]
pub struct RequestContext {
    inner: Arc<Mutex<ContextValues>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context pre-populated with the middleware names a matched contract skips
    pub fn with_skips(skips: HashSet<String>) -> Self {
        let ctx = Self::new();
        ctx.inner.lock().unwrap().skip_middlewares = skips;
        ctx
    }

    pub fn transaction(&self) -> Option<SharedTransaction> {
        self.inner.lock().unwrap().transaction.clone()
    }

    pub fn transaction_id(&self) -> Option<String> {
        self.inner.lock().unwrap().transaction_id.clone()
    }

    pub fn transaction_depth(&self) -> u32 {
        self.inner.lock().unwrap().transaction_depth
    }

    /// Publish a transaction handle. Returns the new nesting depth.
    pub fn enter_transaction(&self, tx: SharedTransaction, id: String) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        inner.transaction = Some(tx);
        inner.transaction_id = Some(id);
        inner.transaction_depth += 1;
        inner.transaction_depth
    }

    /// Record one more nested frame over an already-published transaction
    pub fn nest_transaction(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        inner.transaction_depth += 1;
        inner.transaction_depth
    }

    /// Unwind one transaction frame; the outermost frame clears the handle
    pub fn exit_transaction(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        inner.transaction_depth = inner.transaction_depth.saturating_sub(1);
        if inner.transaction_depth == 0 {
            inner.transaction = None;
            inner.transaction_id = None;
        }
        inner.transaction_depth
    }

    /// Replace the skip set (done by the meta-publishing middleware)
    pub fn set_skips(&self, skips: HashSet<String>) {
        self.inner.lock().unwrap().skip_middlewares = skips;
    }

    pub fn skips(&self, middleware_name: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .skip_middlewares
            .contains(middleware_name)
    }

    pub fn skip_middlewares(&self) -> HashSet<String> {
        self.inner.lock().unwrap().skip_middlewares.clone()
    }

    pub fn set_value(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.lock().unwrap().values.insert(key.into(), value);
    }

    pub fn value(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.lock().unwrap().values.get(key).cloned()
    }
}

/// Run `fut` with `ctx` as the ambient request context
///
/// Nested calls shadow the outer context for the duration of the inner future.
pub async fn with_context<F>(ctx: RequestContext, fut: F) -> F::Output
where
    F: std::future::Future,
{
    REQUEST_CONTEXT.scope(ctx, fut).await
}

/// The context of the calling task, or `None` outside any [`with_context`] scope
pub fn current() -> Option<RequestContext> {
    REQUEST_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Mutate the ambient context; returns `false` when no scope is active
pub fn set_context_value(key: impl Into<String>, value: serde_json::Value) -> bool {
    match current() {
        Some(ctx) => {
            ctx.set_value(key, value);
            true
        }
        None => false,
    }
}

/// Spawn a task that inherits the caller's request context
///
/// Plain `tokio::spawn` severs task-local storage; this wrapper captures the
/// current context and re-establishes it inside the child task. Without an
/// active scope it behaves exactly like `tokio::spawn`.
pub fn spawn_inheriting<F>(fut: F) -> JoinHandle<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    match current() {
        Some(ctx) => tokio::spawn(REQUEST_CONTEXT.scope(ctx, fut)),
        None => tokio::spawn(fut),
    }
}
