//! Sub-applications and contract binding
//!
//! Each route file builds an [`App`]: a set of contract/handler pairs that
//! the loader mounts under the file's canonical path. `bind` attaches a
//! handler to a [`Contract`] and wraps it so that path parameters, query
//! string and JSON body are validated against the declared types before the
//! handler runs; a failure becomes a 400 with structured field details.
//!
//! Query values arrive as strings (repeated keys become arrays). Typed
//! deserialize is attempted on the raw strings first and retried with
//! number/bool coercion, so both `limit: u32` and `limit: String` targets
//! work.

use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use http::HeaderMap;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::contract::Contract;
use crate::error::{Error, FieldError, Result};

/// Raw request material handed to a bound handler by the router
#[derive(Debug, Default)]
pub struct RouteRequest {
    pub path_params: Vec<(String, String)>,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: axum::body::Bytes,
}

/// Validated inputs exposed to a handler
pub struct Input<P, Q, B> {
    pub params: P,
    pub query: Q,
    body: B,
    pub headers: HeaderMap,
}

impl<P, Q, B> Input<P, Q, B> {
    /// Parsed request body
    pub fn data(&self) -> &B {
        &self.body
    }

    pub fn into_data(self) -> B {
        self.body
    }
}

type ErasedHandler =
    Arc<dyn Fn(RouteRequest) -> BoxFuture<'static, Result<Response>> + Send + Sync>;

/// One contract/handler pair registered on an [`App`]
#[derive(Clone)]
pub struct BoundRoute {
    pub contract: Contract,
    pub handler: ErasedHandler,
}

/// A collection of route registrations emitted by one route file
#[derive(Default, Clone)]
pub struct App {
    routes: Vec<BoundRoute>,
    errors: Vec<String>,
}

/// Entry point used by route files: `create_app().bind(CONTRACT, handler)`
pub fn create_app() -> App {
    App::default()
}

impl App {
    /// Attach a handler to a contract
    ///
    /// `P`, `Q`, `B` are the parameter, query and body types; use `()` for
    /// inputs the contract does not declare. An invalid contract is recorded
    /// and surfaces as a bootstrap error when the registry is built.
    pub fn bind<P, Q, B, H, Fut, R>(mut self, contract: Contract, handler: H) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        Q: DeserializeOwned + Send + 'static,
        B: DeserializeOwned + Send + 'static,
        H: Fn(Input<P, Q, B>) -> Fut + Clone + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<R>> + Send + 'static,
        R: IntoResponse + 'static,
    {
        if let Err(e) = contract.validate() {
            self.errors.push(e.to_string());
            return self;
        }

        let erased: ErasedHandler = Arc::new(move |request: RouteRequest| {
            let handler = handler.clone();
            Box::pin(async move {
                let input = validate_request::<P, Q, B>(request)?;
                handler(input).await.map(IntoResponse::into_response)
            })
        });

        self.routes.push(BoundRoute {
            contract,
            handler: erased,
        });
        self
    }

    pub fn routes(&self) -> &[BoundRoute] {
        &self.routes
    }

    pub fn bind_errors(&self) -> &[String] {
        &self.errors
    }

    pub fn into_routes(self) -> (Vec<BoundRoute>, Vec<String>) {
        (self.routes, self.errors)
    }
}

// ============================================================================
// Request validation
// ============================================================================

fn validate_request<P, Q, B>(request: RouteRequest) -> Result<Input<P, Q, B>>
where
    P: DeserializeOwned,
    Q: DeserializeOwned,
    B: DeserializeOwned,
{
    let mut failures = Vec::new();

    let params_value = params_to_value(&request.path_params);
    let params = decode_section::<P>(params_value, "params", &mut failures);

    let query_value = query_to_value(request.query.as_deref().unwrap_or(""));
    let query = decode_section::<Q>(query_value, "query", &mut failures);

    let body_value = if request.body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice::<Value>(&request.body) {
            Ok(value) => value,
            Err(e) => {
                failures.push(FieldError::new("body", format!("invalid JSON: {}", e)));
                Value::Null
            }
        }
    };
    let body = decode_section::<B>(body_value, "body", &mut failures);

    if !failures.is_empty() {
        return Err(Error::validation(failures));
    }

    // All three decoded or we'd have returned above
    Ok(Input {
        params: params.unwrap(),
        query: query.unwrap(),
        body: body.unwrap(),
        headers: request.headers,
    })
}

fn decode_section<T: DeserializeOwned>(
    value: Value,
    section: &str,
    failures: &mut Vec<FieldError>,
) -> Option<T> {
    let retry = coerce_scalars(value.clone());
    match serde_json::from_value::<T>(value) {
        Ok(decoded) => Some(decoded),
        Err(first) => match serde_json::from_value::<T>(retry) {
            Ok(decoded) => Some(decoded),
            Err(_) => {
                failures.push(FieldError::new(section, first.to_string()));
                None
            }
        },
    }
}

fn params_to_value(params: &[(String, String)]) -> Value {
    if params.is_empty() {
        return Value::Null;
    }
    let map: serde_json::Map<String, Value> = params
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    Value::Object(map)
}

/// Decode a query string into a JSON object; repeated keys become arrays
fn query_to_value(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    let mut map = serde_json::Map::new();
    for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
        let key = key.into_owned();
        let value = Value::String(value.into_owned());
        match map.get_mut(&key) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                map.insert(key, value);
            }
        }
    }
    Value::Object(map)
}

/// Re-type string scalars that parse as numbers or booleans
fn coerce_scalars(value: Value) -> Value {
    match value {
        Value::String(s) => coerce_string(s),
        Value::Array(items) => Value::Array(items.into_iter().map(coerce_scalars).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, coerce_scalars(v)))
                .collect(),
        ),
        other => other,
    }
}

fn coerce_string(s: String) -> Value {
    if s == "true" {
        return Value::Bool(true);
    }
    if s == "false" {
        return Value::Bool(false);
    }
    if let Ok(i) = s.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        return Value::from(f);
    }
    Value::String(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::Contract;
    use axum::Json;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct UserParams {
        id: String,
    }

    #[derive(Deserialize)]
    struct ListQuery {
        limit: u32,
        #[serde(default)]
        tag: Vec<String>,
    }

    #[derive(Deserialize, serde::Serialize)]
    struct CreateUser {
        email: String,
    }

    fn request(
        params: &[(&str, &str)],
        query: Option<&str>,
        body: &str,
    ) -> RouteRequest {
        RouteRequest {
            path_params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            query: query.map(String::from),
            headers: HeaderMap::new(),
            body: axum::body::Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    #[tokio::test]
    async fn bound_handler_receives_validated_input() {
        let app = create_app().bind::<UserParams, ListQuery, CreateUser, _, _, _>(
            Contract::post("/users/:id"),
            |input: Input<UserParams, ListQuery, CreateUser>| async move {
                assert_eq!(input.params.id, "42");
                assert_eq!(input.query.limit, 10);
                assert_eq!(input.query.tag, vec!["a", "b"]);
                assert_eq!(input.data().email, "x@y");
                Ok(Json(serde_json::json!({ "ok": true })))
            },
        );

        let route = &app.routes()[0];
        let response = (route.handler)(request(
            &[("id", "42")],
            Some("limit=10&tag=a&tag=b"),
            r#"{"email":"x@y"}"#,
        ))
        .await
        .unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_body_yields_validation_details() {
        let app = create_app().bind::<(), (), CreateUser, _, _, _>(
            Contract::post("/users"),
            |_input| async move { Ok(Json(serde_json::json!({}))) },
        );

        let route = &app.routes()[0];
        let err = (route.handler)(request(&[], None, r#"{"email":5}"#))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        let details = err.details().unwrap().as_array().unwrap();
        assert_eq!(details[0]["field"], "body");
    }

    #[tokio::test]
    async fn missing_body_for_typed_contract_fails() {
        let app = create_app().bind::<(), (), CreateUser, _, _, _>(
            Contract::post("/users"),
            |_input| async move { Ok(Json(serde_json::json!({}))) },
        );

        let route = &app.routes()[0];
        let err = (route.handler)(request(&[], None, "")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn unit_types_accept_absent_inputs() {
        let app = create_app().bind::<(), (), (), _, _, _>(
            Contract::get("/health"),
            |_input| async move { Ok(Json(serde_json::json!({ "up": true }))) },
        );

        let route = &app.routes()[0];
        let response = (route.handler)(request(&[], None, "")).await.unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_json_reports_body_field() {
        let app = create_app().bind::<(), (), CreateUser, _, _, _>(
            Contract::post("/users"),
            |_input| async move { Ok(Json(serde_json::json!({}))) },
        );

        let route = &app.routes()[0];
        let err = (route.handler)(request(&[], None, "{not json"))
            .await
            .unwrap_err();
        let details = err.details().unwrap().as_array().unwrap();
        assert!(details[0]["message"]
            .as_str()
            .unwrap()
            .contains("invalid JSON"));
    }

    #[test]
    fn invalid_contract_recorded_at_bind_time() {
        let app = create_app().bind::<(), (), (), _, _, _>(
            Contract::get(""),
            |_input| async move { Ok(()) },
        );
        assert!(app.routes().is_empty());
        assert_eq!(app.bind_errors().len(), 1);
    }

    #[test]
    fn repeated_query_keys_become_arrays() {
        let value = query_to_value("a=1&a=2&b=solo");
        assert_eq!(value["a"], serde_json::json!(["1", "2"]));
        assert_eq!(value["b"], serde_json::json!("solo"));
    }

    #[test]
    fn scalar_coercion() {
        let value = coerce_scalars(serde_json::json!({"n": "42", "f": "1.5", "b": "true", "s": "x"}));
        assert_eq!(value["n"], serde_json::json!(42));
        assert_eq!(value["f"], serde_json::json!(1.5));
        assert_eq!(value["b"], serde_json::json!(true));
        assert_eq!(value["s"], serde_json::json!("x"));
    }
}
