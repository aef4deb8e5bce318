//! Route registry and loader
//!
//! Maps a route tree onto an `axum::Router`. Origins mirror the on-disk
//! route directory (`users/[id]/index` mounts at `/users/:id`): `index`
//! segments collapse into the parent, `[name]` becomes the path parameter
//! `:name`, and `[...name]` becomes the rest parameter `*name`. Each mounted
//! sub-application contributes `(method, path, handler)` tuples; a duplicate
//! `(method, path)` pair is a fatal bootstrap error.
//!
//! Every route is wrapped in a fresh request-context scope, then the
//! meta-publishing middleware, the skip-gated global middlewares in
//! registration order, and the transaction middleware when the contract
//! declares it.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use axum::extract::{FromRequestParts, RawPathParams, Request};
use axum::response::IntoResponse;
use axum::routing::{on, MethodFilter};
use axum::Router;
use serde::Serialize;

use crate::app::{App, BoundRoute, RouteRequest};
use crate::context::{self, RequestContext};
use crate::contract::{Contract, HttpMethod};
use crate::db::ConnectionPool;
use crate::error::{Error, Result};
use crate::middleware::{compose, MetaPublisher, Middleware, Next, SkipGate, TransactionMiddleware};

/// Dispatch ordering class
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutePriority {
    /// No parameters in the path
    Static,
    /// Contains at least one `:name` parameter
    Dynamic,
    /// Ends in a `*name` rest parameter
    CatchAll,
}

/// One registered route, after path combination
#[derive(Clone)]
pub struct RouteEntry {
    pub contract: Contract,
    pub path: String,
    pub file_origin: String,
    pub priority: RoutePriority,
    handler: BoundRoute,
}

/// Registration summary returned by [`build_router`]
#[derive(Debug, Clone, Serialize, Default)]
pub struct RegistrySummary {
    pub total: usize,
    pub by_priority: BTreeMap<RoutePriority, usize>,
    pub by_tag: BTreeMap<String, usize>,
}

/// Route-tree registrations keyed by file origin
#[derive(Default)]
pub struct RouteSet {
    mounts: Vec<(String, App)>,
}

impl RouteSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount a sub-application under a route-tree origin such as
    /// `users/[id]/index`
    pub fn mount(mut self, origin: impl Into<String>, app: App) -> Self {
        self.mounts.push((origin.into(), app));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

/// Options controlling registry assembly
#[derive(Default)]
pub struct RegistryOptions {
    /// Global middlewares, installed in order behind skip gates
    pub middlewares: Vec<Arc<dyn Middleware>>,
    /// Pool used by transaction-wrapped routes
    pub pool: Option<ConnectionPool>,
    /// Route directory to cross-check registrations against
    pub route_dir: Option<std::path::PathBuf>,
}

/// Assemble the router from a route set
///
/// Fails on bind errors and `(method, path)` collisions. The returned router
/// is frozen; the summary feeds diagnostics.
pub fn build_router(
    route_set: RouteSet,
    options: RegistryOptions,
) -> Result<(Router, RegistrySummary)> {
    let mut entries: Vec<RouteEntry> = Vec::new();
    let mut seen: HashMap<(HttpMethod, String), String> = HashMap::new();
    let mut mounted_origins: Vec<String> = Vec::new();

    for (origin, app) in route_set.mounts {
        let base = canonical_path(&origin);
        let (routes, bind_errors) = app.into_routes();

        if let Some(first) = bind_errors.first() {
            return Err(Error::config(format!(
                "route '{}' has invalid contract bindings: {}",
                origin, first
            )));
        }

        for bound in routes {
            let path = combine_paths(&base, bound.contract.path);
            let key = (bound.contract.method, path.clone());
            if let Some(previous) = seen.get(&key) {
                return Err(Error::config(format!(
                    "duplicate route {} {} (registered by '{}' and '{}')",
                    key.0, key.1, previous, origin
                )));
            }
            seen.insert(key, origin.clone());

            entries.push(RouteEntry {
                priority: priority_of(&path),
                contract: bound.contract,
                path,
                file_origin: origin.clone(),
                handler: bound,
            });
        }
        mounted_origins.push(origin);
    }

    if let Some(dir) = options.route_dir.as_deref() {
        cross_check_route_dir(dir, &mounted_origins);
    }

    // Static > Dynamic > CatchAll; most static prefix first, longer path
    // breaking ties.
    entries.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(static_prefix_len(&b.path).cmp(&static_prefix_len(&a.path)))
            .then(b.path.len().cmp(&a.path.len()))
    });

    let mut summary = RegistrySummary {
        total: entries.len(),
        ..RegistrySummary::default()
    };
    for entry in &entries {
        *summary.by_priority.entry(entry.priority).or_default() += 1;
        for tag in entry.contract.meta.tags {
            *summary.by_tag.entry(tag.to_string()).or_default() += 1;
        }
    }

    let mut router = Router::new();
    for entry in entries {
        let axum_path = to_axum_path(&entry.path);
        let filter = method_filter(entry.contract.method);
        let chain = route_chain(&entry, &options)?;

        let handler = move |request: Request| {
            let chain = chain.clone();
            async move {
                let ctx = RequestContext::new();
                match context::with_context(ctx, chain(request)).await {
                    Ok(response) => response,
                    Err(error) => error.into_response(),
                }
            }
        };

        tracing::debug!(
            method = %entry.contract.method,
            path = %entry.path,
            origin = %entry.file_origin,
            priority = ?entry.priority,
            "route registered"
        );
        router = router.route(&axum_path, on(filter, handler));
    }

    tracing::info!(
        total = summary.total,
        "route registry built"
    );
    Ok((router, summary))
}

/// Compose the per-route middleware chain around the bound handler
fn route_chain(entry: &RouteEntry, options: &RegistryOptions) -> Result<Next> {
    let mut chain: Vec<Arc<dyn Middleware>> = Vec::new();
    chain.push(Arc::new(MetaPublisher::new(
        entry.contract.meta.skip_middlewares,
    )));
    for middleware in &options.middlewares {
        chain.push(Arc::new(SkipGate::new(middleware.clone())));
    }
    if entry.contract.meta.transactional {
        let pool = options.pool.clone().ok_or_else(|| {
            Error::config(format!(
                "route {} {} is transactional but no connection pool is configured",
                entry.contract.method, entry.path
            ))
        })?;
        chain.push(Arc::new(TransactionMiddleware::new(pool)));
    }

    let bound = entry.handler.clone();
    let terminal: Next = Arc::new(move |request: Request| {
        let bound = bound.clone();
        Box::pin(async move {
            let (mut parts, body) = request.into_parts();
            let path_params = RawPathParams::from_request_parts(&mut parts, &())
                .await
                .map(|params| {
                    params
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect()
                })
                .unwrap_or_default();
            let bytes = axum::body::to_bytes(body, usize::MAX)
                .await
                .map_err(|e| Error::bad_request(format!("failed to read request body: {}", e)))?;

            (bound.handler)(RouteRequest {
                path_params,
                query: parts.uri.query().map(str::to_string),
                headers: parts.headers,
                body: bytes,
            })
            .await
        })
    });

    Ok(compose(&chain, terminal))
}

fn method_filter(method: HttpMethod) -> MethodFilter {
    match method {
        HttpMethod::Get => MethodFilter::GET,
        HttpMethod::Post => MethodFilter::POST,
        HttpMethod::Put => MethodFilter::PUT,
        HttpMethod::Patch => MethodFilter::PATCH,
        HttpMethod::Delete => MethodFilter::DELETE,
        HttpMethod::Head => MethodFilter::HEAD,
        HttpMethod::Options => MethodFilter::OPTIONS,
    }
}

// ============================================================================
// Path transforms
// ============================================================================

/// Canonical URL path for a route-tree origin
///
/// `users/[id]/index` → `/users/:id`; `docs/[...slug]` → `/docs/*slug`;
/// `index` → `/`. A trailing source extension is ignored.
pub fn canonical_path(origin: &str) -> String {
    let trimmed = origin
        .trim_matches('/')
        .trim_end_matches(".rs")
        .trim_end_matches(".ts");

    let mut segments = Vec::new();
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "index" {
            continue;
        }
        segments.push(rewrite_segment(segment));
    }

    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// `[id]` → `:id`, `[...slug]` → `*slug`, everything else untouched
fn rewrite_segment(segment: &str) -> String {
    if let Some(inner) = segment.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        if let Some(rest) = inner.strip_prefix("...") {
            return format!("*{}", rest);
        }
        return format!(":{}", inner);
    }
    segment.to_string()
}

/// Combine a mount base with a contract path
///
/// Absolute non-root contract paths replace the base, a root path keeps the
/// base, and relative paths append.
pub fn combine_paths(base: &str, contract_path: &str) -> String {
    if contract_path == "/" || contract_path.is_empty() {
        return if base.is_empty() { "/".to_string() } else { base.to_string() };
    }
    if contract_path.starts_with('/') {
        return contract_path.to_string();
    }
    if base == "/" || base.is_empty() {
        format!("/{}", contract_path)
    } else {
        format!("{}/{}", base, contract_path)
    }
}

/// Dispatch class of a combined path
pub fn priority_of(path: &str) -> RoutePriority {
    if path.split('/').any(|s| s.starts_with('*')) {
        RoutePriority::CatchAll
    } else if path.split('/').any(|s| s.starts_with(':')) {
        RoutePriority::Dynamic
    } else {
        RoutePriority::Static
    }
}

/// Number of leading static segments before the first parameter
fn static_prefix_len(path: &str) -> usize {
    path.split('/')
        .filter(|s| !s.is_empty())
        .take_while(|s| !s.starts_with(':') && !s.starts_with('*'))
        .count()
}

/// Rewrite `:name` / `*name` into axum's `{name}` / `{*name}` syntax
fn to_axum_path(path: &str) -> String {
    if path == "/" {
        return path.to_string();
    }
    let segments: Vec<String> = path
        .split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{}}}", name)
            } else if let Some(name) = segment.strip_prefix('*') {
                format!("{{*{}}}", name)
            } else {
                segment.to_string()
            }
        })
        .collect();
    segments.join("/")
}

// ============================================================================
// Filesystem cross-check
// ============================================================================

/// Compare mounted origins with the files actually present in the route
/// directory; files without a registration are reported, not fatal.
fn cross_check_route_dir(dir: &Path, mounted: &[String]) {
    if !dir.exists() {
        tracing::debug!(dir = %dir.display(), "route directory does not exist, skipping cross-check");
        return;
    }

    for discovered in discover_route_origins(dir) {
        let registered = mounted
            .iter()
            .any(|origin| normalize_origin(origin) == discovered);
        if !registered {
            tracing::warn!(
                origin = %discovered,
                "route file present on disk but no sub-application is mounted for it"
            );
        }
    }
}

fn normalize_origin(origin: &str) -> String {
    origin
        .trim_matches('/')
        .trim_end_matches(".rs")
        .trim_end_matches(".ts")
        .to_string()
}

/// Enumerate routable files beneath `dir`, as origins relative to it
///
/// Files named `contract.*` are metadata, `mod.rs` is module plumbing, and
/// hidden entries are ignored.
pub fn discover_route_origins(dir: &Path) -> Vec<String> {
    let mut origins = Vec::new();
    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let stem = match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) => stem,
            None => continue,
        };
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        if !matches!(ext, "rs" | "ts") {
            continue;
        }
        if stem == "contract" || stem == "mod" || stem.starts_with('.') {
            continue;
        }
        if let Ok(rel) = path.strip_prefix(dir) {
            let mut origin = rel.to_string_lossy().replace('\\', "/");
            if let Some(idx) = origin.rfind('.') {
                origin.truncate(idx);
            }
            origins.push(origin);
        }
    }
    origins.sort();
    origins
}
