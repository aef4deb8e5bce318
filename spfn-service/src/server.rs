//! HTTP server with graceful shutdown
//!
//! Applies the tower layer stack (CORS, compression, request deadline, body
//! limit, tracing, panic recovery) and serves until a shutdown signal.
//! In-flight requests get a bounded drain window before the server gives up
//! on them.

use axum::Router;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    cors::CorsLayer,
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::{config::Config, error::Result};

/// Server instance
pub struct Server {
    config: Config,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the server with the given router until `shutdown` fires
    ///
    /// The token is also cancelled by SIGINT/SIGTERM, so callers can pass a
    /// fresh token and rely on signals alone.
    pub async fn serve(self, app: Router, shutdown: CancellationToken) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.service.port));

        tracing::info!("starting {} on {}", self.config.service.name, addr);
        self.log_middleware_config();

        let body_limit = self.config.middleware.body_limit_mb * 1024 * 1024;
        let mut app = app
            .layer(self.build_cors_layer())
            .layer(TimeoutLayer::new(self.config.request_timeout()))
            .layer(RequestBodyLimitLayer::new(body_limit))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new())
                    .on_response(DefaultOnResponse::new()),
            );
        if self.config.middleware.compression {
            app = app.layer(CompressionLayer::new());
        }
        if self.config.middleware.catch_panic {
            app = app.layer(CatchPanicLayer::new());
        }

        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("server listening on {}", addr);

        // Cancel the token on SIGINT/SIGTERM so everything downstream of it
        // (codegen watcher included) unwinds together.
        {
            let token = shutdown.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                token.cancel();
            });
        }

        let drain_timeout = self.config.drain_timeout();
        let graceful = {
            let token = shutdown.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
        };

        tokio::select! {
            result = graceful => {
                result?;
                tracing::info!("server shutdown complete");
            }
            _ = drain_deadline(shutdown.clone(), drain_timeout) => {
                tracing::warn!(
                    timeout_secs = drain_timeout.as_secs(),
                    "drain window elapsed, abandoning in-flight requests"
                );
            }
        }

        Ok(())
    }

    /// Log middleware configuration for debugging
    fn log_middleware_config(&self) {
        tracing::info!("middleware configuration:");
        tracing::info!("  - panic recovery: {}", self.config.middleware.catch_panic);
        tracing::info!(
            "  - request body limit: {} MB",
            self.config.middleware.body_limit_mb
        );
        tracing::info!("  - compression: {}", self.config.middleware.compression);
        tracing::info!("  - cors mode: {}", self.config.middleware.cors_mode);
        tracing::info!(
            "  - request deadline: {} seconds",
            self.config.service.timeout_secs
        );
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build CORS layer based on configuration
    fn build_cors_layer(&self) -> CorsLayer {
        match self.config.middleware.cors_mode.as_str() {
            "permissive" => CorsLayer::permissive(),
            "restrictive" | "disabled" => CorsLayer::new(),
            other => {
                tracing::warn!("unknown CORS mode: {}, defaulting to permissive", other);
                CorsLayer::permissive()
            }
        }
    }
}

/// Resolves one drain window after the shutdown token fires
async fn drain_deadline(token: CancellationToken, drain: Duration) {
    token.cancelled().await;
    tokio::time::sleep(drain).await;
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        },
    }
}
