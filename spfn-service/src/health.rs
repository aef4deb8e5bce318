//! Health check endpoints
//!
//! A framework-provided sub-application exposing `/health` (liveness) and
//! `/ready` (readiness). Readiness probes the connection pool; a failing
//! probe flips the response to 503 so orchestrators stop routing traffic
//! until the pool's health monitor has recovered the sessions.

use std::collections::HashMap;

use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::app::{create_app, App, Input};
use crate::contract::{Contract, ContractMeta};
use crate::db::{ConnectionPool, SessionKind};

/// Liveness contract, skipped by every global middleware
pub const HEALTH_CONTRACT: Contract = Contract::get("/health")
    .with_meta(ContractMeta::new().public().tagged(&["health"]));

/// Readiness contract
pub const READY_CONTRACT: Contract = Contract::get("/ready")
    .with_meta(ContractMeta::new().public().tagged(&["health"]));

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service name
    pub service: String,

    /// Version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Readiness check response with dependency status
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    /// Overall readiness status
    pub ready: bool,

    /// Service name
    pub service: String,

    /// Dependency statuses
    pub dependencies: HashMap<String, DependencyStatus>,
}

/// Individual dependency status
#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    /// Dependency is healthy
    pub healthy: bool,

    /// Optional message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Build the health sub-application
///
/// Mount it at the route-tree root: `RouteSet::new().mount("index",
/// health_app(name, pool))`.
pub fn health_app(service_name: impl Into<String>, pool: Option<ConnectionPool>) -> App {
    let service_name = service_name.into();
    let health_name = service_name.clone();

    create_app()
        .bind::<(), (), (), _, _, _>(HEALTH_CONTRACT, move |_input: Input<(), (), ()>| {
            let service = health_name.clone();
            async move {
                Ok(Json(HealthResponse {
                    status: "healthy".to_string(),
                    service,
                    version: Some(env!("CARGO_PKG_VERSION").to_string()),
                }))
            }
        })
        .bind::<(), (), (), _, _, _>(READY_CONTRACT, move |_input: Input<(), (), ()>| {
            let service = service_name.clone();
            let pool = pool.clone();
            async move {
                let mut dependencies = HashMap::new();
                let mut ready = true;

                if let Some(pool) = &pool {
                    let status = probe_pool(pool).await;
                    ready = status.healthy;
                    dependencies.insert("database".to_string(), status);
                }

                let status = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok((
                    status,
                    Json(ReadinessResponse {
                        ready,
                        service,
                        dependencies,
                    }),
                ))
            }
        })
}

async fn probe_pool(pool: &ConnectionPool) -> DependencyStatus {
    let session = match pool.get(SessionKind::Write).await {
        Ok(session) => session,
        Err(e) => {
            return DependencyStatus {
                healthy: false,
                message: Some(e.to_string()),
            }
        }
    };
    match session.probe().await {
        Ok(()) => DependencyStatus {
            healthy: true,
            message: Some("connected".to_string()),
        },
        Err(e) => {
            tracing::error!("readiness probe failed: {}", e);
            DependencyStatus {
                healthy: false,
                message: Some(e.to_string()),
            }
        }
    }
}
