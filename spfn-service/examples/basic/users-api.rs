//! Users API example
//!
//! Shows the contract-driven flow end to end:
//!
//! - Contracts declared as `pub const` values (the scanner picks these up)
//! - Typed path/query/body validation via `bind`
//! - A transactional create endpoint using the ambient database handle
//! - Per-contract middleware skipping (`GET /users` skips `auth`)
//! - Health endpoints mounted as a regular sub-application
//!
//! Run with: cargo run --example users-api
//!
//! Test with:
//!   curl http://localhost:8080/health
//!   curl http://localhost:8080/ready
//!   curl http://localhost:8080/users
//!   curl http://localhost:8080/users/1?verbose=true
//!   curl -X POST http://localhost:8080/users -H 'content-type: application/json' \
//!        -d '{"email":"alice@example.com","username":"alice"}'

use std::sync::Arc;

use spfn_service::db::memory::MemoryDriver;
use spfn_service::db::ConnectionPool;
use spfn_service::health::health_app;
use spfn_service::middleware::{Middleware, Next};
use spfn_service::prelude::*;

pub const LIST_USERS_CONTRACT: Contract = Contract::get("/users")
    .with_meta(ContractMeta::new().skip(&["auth"]).tagged(&["users"]))
    .describe("List all users");

pub const GET_USER_CONTRACT: Contract = Contract::get("/users/:id")
    .with_meta(ContractMeta::new().tagged(&["users"]))
    .describe("Fetch one user");

pub const CREATE_USER_CONTRACT: Contract = Contract::post("/users")
    .with_meta(ContractMeta::new().transactional().tagged(&["users"]))
    .describe("Create a user inside a transaction");

#[derive(Deserialize)]
struct UserParams {
    id: u64,
}

#[derive(Deserialize)]
struct GetUserQuery {
    #[serde(default)]
    verbose: bool,
}

#[derive(Deserialize, Serialize)]
struct CreateUser {
    email: String,
    username: String,
}

/// Toy credential check; real deployments plug in their own middleware
struct AuthMiddleware;

#[async_trait]
impl Middleware for AuthMiddleware {
    fn name(&self) -> &str {
        "auth"
    }

    async fn handle(&self, request: Request, next: Next) -> Result<Response> {
        if request.headers().get("authorization").is_none() {
            return Err(Error::unauthorized("missing Authorization header"));
        }
        next(request).await
    }
}

fn users_app(pool: ConnectionPool) -> App {
    let create_pool = pool.clone();

    create_app()
        .bind::<(), (), (), _, _, _>(LIST_USERS_CONTRACT, |_input: Input<(), (), ()>| async {
            Ok(Json(serde_json::json!([
                { "id": 1, "username": "alice" },
                { "id": 2, "username": "bob" },
            ])))
        })
        .bind::<UserParams, GetUserQuery, (), _, _, _>(
            GET_USER_CONTRACT,
            |input: Input<UserParams, GetUserQuery, ()>| async move {
                let mut user = serde_json::json!({
                    "id": input.params.id,
                    "username": format!("user{}", input.params.id),
                });
                if input.query.verbose {
                    user["email"] = serde_json::json!(format!("user{}@example.com", input.params.id));
                }
                Ok(Json(user))
            },
        )
        .bind::<(), (), CreateUser, _, _, _>(CREATE_USER_CONTRACT, move |input: Input<(), (), CreateUser>| {
            let pool = create_pool.clone();
            async move {
                let db = pool.db().await?;
                db.execute(
                    "INSERT INTO users (email, username) VALUES ($1, $2)",
                    &[
                        serde_json::json!(input.data().email),
                        serde_json::json!(input.data().username),
                    ],
                )
                .await?;
                Ok(Created(serde_json::json!({ "email": input.data().email })))
            }
        })
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    // The in-memory driver keeps the example self-contained; swap in the
    // default PostgreSQL driver by configuring [database] in spfn.toml.
    let mut config = Config::default();
    config.service.name = "users-api".to_string();
    let database = DatabaseConfig {
        url: Some("memory://users".to_string()),
        ..DatabaseConfig::default()
    };

    // Build the pool up front so the route apps can close over it
    let pool = ConnectionPool::new(Arc::new(MemoryDriver::new()));
    if let Err(e) = pool
        .init(database.to_pool_options(&config.service.environment))
        .await
    {
        eprintln!("failed to initialize pool: {}", e);
        return std::process::ExitCode::from(1);
    }

    let routes = RouteSet::new()
        .mount("index", health_app("users-api", Some(pool.clone())))
        .mount("users/index", users_app(pool.clone()));

    ServiceBuilder::new()
        .config(config)
        .pool(pool)
        .routes(routes)
        .middleware(Arc::new(AuthMiddleware))
        .run()
        .await
}
