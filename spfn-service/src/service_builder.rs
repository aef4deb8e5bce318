//! Service bootstrap
//!
//! Wires the pieces together in the startup order the runtime expects:
//! env files, configuration, tracing, error format, connection pool, route
//! registry, and (optionally) the codegen watcher. Shutdown unwinds in
//! reverse: stop accepting, drain, stop the watcher, close the pool.

#[cfg(feature = "codegen")]
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::{ConnectionPool, Driver};
use crate::envfile::{self, EnvLoadOptions};
use crate::error::{set_error_format, Error, ErrorFormat, Result};
use crate::middleware::Middleware;
use crate::observability::init_tracing;
use crate::routes::{build_router, RegistryOptions, RegistrySummary, RouteSet};
use crate::server::Server;

#[cfg(feature = "codegen")]
use crate::codegen::{
    load_codegen_config, GeneratorContext, GeneratorRegistry, Orchestrator,
};

/// Builder assembling a runnable service
pub struct ServiceBuilder {
    config: Option<Config>,
    route_set: RouteSet,
    middlewares: Vec<Arc<dyn Middleware>>,
    driver: Option<Arc<dyn Driver>>,
    pool: Option<ConnectionPool>,
    env_options: EnvLoadOptions,
    #[cfg(feature = "codegen")]
    codegen_watch: bool,
    #[cfg(feature = "codegen")]
    generator_registry: GeneratorRegistry,
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            route_set: RouteSet::new(),
            middlewares: Vec::new(),
            driver: None,
            pool: None,
            env_options: EnvLoadOptions::default(),
            #[cfg(feature = "codegen")]
            codegen_watch: false,
            #[cfg(feature = "codegen")]
            generator_registry: GeneratorRegistry::with_builtins(),
        }
    }

    /// Provide a pre-loaded configuration (otherwise `spfn.toml` + env)
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Route tree to mount
    pub fn routes(mut self, route_set: RouteSet) -> Self {
        self.route_set = route_set;
        self
    }

    /// Install a global middleware (registration order is execution order)
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Database driver; defaults to PostgreSQL when the `database` feature
    /// is enabled
    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Supply an already-initialized pool instead of letting the builder
    /// create one; handlers can then close over the same handle.
    pub fn pool(mut self, pool: ConnectionPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Options for the env-file loader
    pub fn env_options(mut self, options: EnvLoadOptions) -> Self {
        self.env_options = options;
        self
    }

    /// Start the codegen watcher alongside the server
    #[cfg(feature = "codegen")]
    pub fn with_codegen_watch(mut self) -> Self {
        self.codegen_watch = true;
        self
    }

    /// Register a custom generator factory (configuration `name` or `path`)
    #[cfg(feature = "codegen")]
    pub fn register_generator<F>(mut self, key: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&serde_json::Map<String, serde_json::Value>) -> Result<Arc<dyn crate::codegen::Generator>>
            + Send
            + Sync
            + 'static,
    {
        self.generator_registry.register(key, factory);
        self
    }

    /// Run the startup sequence and produce a servable service
    pub async fn build(self) -> Result<SpfnService> {
        // (a) env files first so configuration sees their values
        let env_result = envfile::load(self.env_options.clone());
        if !env_result.success {
            for failure in &env_result.failed {
                tracing::warn!(file = %failure.path.display(), "env file failed: {}", failure.reason);
            }
        }

        let config = match self.config {
            Some(config) => config,
            None => Config::load()?,
        };

        init_tracing(&config)?;
        set_error_format(ErrorFormat {
            include_stack: config.service.include_error_stack,
            production: config.is_production(),
        });

        // (b) connection pool
        let pool = match self.pool.clone() {
            Some(pool) => Some(pool),
            None => Self::init_pool(self.driver.clone(), &config).await?,
        };

        // (c)–(e) terminal error handling is installed per-route by the
        // registry; mount routes with the global middleware chain
        let registry_options = RegistryOptions {
            middlewares: self.middlewares,
            pool: pool.clone(),
            route_dir: Some(config.routes.dir.clone()),
        };
        let (router, summary) = build_router(self.route_set, registry_options)?;

        // (f) codegen
        #[cfg(feature = "codegen")]
        let codegen = if self.codegen_watch {
            let project_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            let ctx = GeneratorContext {
                route_dir: project_root.join(&config.routes.dir),
                out_dir: project_root.join("src/generated"),
                project_root,
            };
            let codegen_config = load_codegen_config(&ctx.project_root);
            let orchestrator =
                Orchestrator::from_config(&codegen_config, &self.generator_registry, ctx);
            tracing::info!(
                generators = ?orchestrator.generator_names(),
                "codegen watcher enabled"
            );
            Some(orchestrator)
        } else {
            None
        };

        Ok(SpfnService {
            config,
            router,
            summary,
            pool,
            #[cfg(feature = "codegen")]
            codegen,
            cancel: CancellationToken::new(),
        })
    }

    async fn init_pool(
        driver: Option<Arc<dyn Driver>>,
        config: &Config,
    ) -> Result<Option<ConnectionPool>> {
        let database = match &config.database {
            Some(database) => database.clone(),
            None => {
                // An SPFN_DATABASE_URL alone is enough to bring the pool up
                if std::env::var("SPFN_DATABASE_URL").is_err() {
                    return Ok(None);
                }
                crate::config::DatabaseConfig::default()
            }
        };

        let options = database.to_pool_options(&config.service.environment);
        if options.url.is_none() {
            return Err(Error::config(
                "database section is present but no connection URL is configured",
            ));
        }

        let driver = match driver {
            Some(driver) => driver,
            None => default_driver()?,
        };

        let pool = ConnectionPool::new(driver);
        pool.init(options).await?;
        Ok(Some(pool))
    }

    /// Build and serve, mapping failures to process exit codes
    pub async fn run(self) -> ExitCode {
        let service = match self.build().await {
            Ok(service) => service,
            Err(e) => {
                tracing::error!("bootstrap failed: {}", e);
                return ExitCode::from(1);
            }
        };

        match service.serve().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!("unrecoverable server error: {}", e);
                ExitCode::from(2)
            }
        }
    }
}

#[cfg(feature = "database")]
fn default_driver() -> Result<Arc<dyn Driver>> {
    Ok(Arc::new(crate::db::postgres::PostgresDriver::new()))
}

#[cfg(not(feature = "database"))]
fn default_driver() -> Result<Arc<dyn Driver>> {
    Err(Error::config(
        "a database is configured but no driver is available; \
         enable the `database` feature or supply one with ServiceBuilder::driver",
    ))
}

/// A fully wired service, ready to serve
#[derive(Debug)]
pub struct SpfnService {
    config: Config,
    router: Router,
    summary: RegistrySummary,
    pool: Option<ConnectionPool>,
    #[cfg(feature = "codegen")]
    codegen: Option<Orchestrator>,
    cancel: CancellationToken,
}

impl SpfnService {
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Route registration summary (totals by priority and tag)
    pub fn summary(&self) -> &RegistrySummary {
        &self.summary
    }

    /// The assembled router, for in-process testing
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn pool(&self) -> Option<&ConnectionPool> {
        self.pool.as_ref()
    }

    /// Token that stops the server (signals cancel it too)
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Serve until signalled, then unwind: drain, stop the codegen watcher,
    /// close the pool.
    pub async fn serve(self) -> Result<()> {
        #[cfg(feature = "codegen")]
        let watcher = self.codegen.map(|orchestrator| {
            let token = self.cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = orchestrator.watch(token).await {
                    tracing::error!("codegen watcher failed: {}", e);
                }
            })
        });

        let server = Server::new(self.config.clone());
        let result = server.serve(self.router, self.cancel.clone()).await;

        self.cancel.cancel();
        #[cfg(feature = "codegen")]
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }
        if let Some(pool) = &self.pool {
            pool.close().await;
        }

        result
    }
}
