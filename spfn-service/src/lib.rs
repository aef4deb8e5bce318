//! # spfn-service
//!
//! Contract-driven HTTP service framework runtime. Endpoints are declared as
//! [`Contract`](contract::Contract) values bound to handlers, discovered
//! through a file-system route tree, and executed through a per-route
//! middleware chain with ambient (task-local) transaction context. A managed
//! connection pool (primary plus optional read replica) backs the database
//! layer, and a codegen orchestrator watches the route tree to keep a typed
//! client in sync with the declared contracts.
//!
//! ## Example
//!
//! ```rust,no_run
//! use spfn_service::prelude::*;
//!
//! #[derive(serde::Deserialize)]
//! struct UserParams {
//!     id: String,
//! }
//!
//! const GET_USER_CONTRACT: Contract = Contract::get("/users/:id");
//!
//! #[tokio::main]
//! async fn main() -> std::process::ExitCode {
//!     let users = create_app().bind::<UserParams, (), (), _, _, _>(
//!         GET_USER_CONTRACT,
//!         |input: Input<UserParams, (), ()>| async move {
//!             Ok(Json(serde_json::json!({ "id": input.params.id })))
//!         },
//!     );
//!
//!     ServiceBuilder::new()
//!         .routes(RouteSet::new().mount("users/[id]", users))
//!         .run()
//!         .await
//! }
//! ```

pub mod app;
pub mod client;
pub mod config;
pub mod context;
pub mod contract;
pub mod db;
pub mod envfile;
pub mod error;
pub mod health;
pub mod middleware;
pub mod observability;
pub mod responses;
pub mod routes;
pub mod server;
pub mod service_builder;

#[cfg(feature = "codegen")]
pub mod codegen;

#[cfg(feature = "codegen")]
pub mod scanner;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::app::{create_app, App, Input};
    pub use crate::client::{ApiClient, ApiClientError, ClientConfig, ClientOverrides, QueryValue};
    pub use crate::config::{Config, DatabaseConfig};
    pub use crate::context::{
        current as current_context, set_context_value, spawn_inheriting, with_context,
        RequestContext,
    };
    pub use crate::contract::{Contract, ContractMeta, HttpMethod};
    pub use crate::db::{
        ConnectionPool, Db, Driver, PoolInfo, PoolOptions, Session, SessionKind, Transaction,
    };
    pub use crate::envfile::{self, validators, EnvLoadOptions};
    pub use crate::error::{Error, ErrorKind, FieldError, Result};
    pub use crate::health::{health_app, HealthResponse, ReadinessResponse};
    pub use crate::middleware::{Middleware, Next, TransactionMiddleware};
    pub use crate::observability::{init_tracing, Logger};
    pub use crate::responses::{Created, NoContent, Success};
    pub use crate::routes::{RegistrySummary, RoutePriority, RouteSet};
    pub use crate::server::Server;
    pub use crate::service_builder::{ServiceBuilder, SpfnService};

    #[cfg(feature = "codegen")]
    pub use crate::codegen::{Generator, GeneratorContext, Orchestrator};

    #[cfg(feature = "codegen")]
    pub use crate::scanner::{scan_contracts, ScanOptions, ScannedContract};

    pub use axum::{
        extract::Request,
        http::{HeaderMap, HeaderValue, StatusCode},
        response::{IntoResponse, Json, Response},
        Router,
    };

    pub use serde::{Deserialize, Serialize};

    // Re-export tracing macros
    pub use tracing::{debug, error, info, instrument, trace, warn};

    // Re-export the async runtime and helpers
    pub use async_trait::async_trait;
    pub use tokio;
    pub use tokio_util::sync::CancellationToken;
}
