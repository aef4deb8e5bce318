//! Runtime support for generated API clients
//!
//! The client generator emits one function per scanned contract; those
//! functions delegate to [`ApiClient::request`] here for path-parameter
//! substitution, query serialization, JSON bodies and error wrapping.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    /// Default headers sent with every request
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            headers: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Partial configuration merged by [`ApiClient::with_config`]
#[derive(Debug, Clone, Default)]
pub struct ClientOverrides {
    pub base_url: Option<String>,
    /// Headers to add or replace (matched case-insensitively by name,
    /// notably `Authorization`)
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

/// A single query value: scalar, or repeated key
#[derive(Debug, Clone)]
pub enum QueryValue {
    Single(String),
    Many(Vec<String>),
}

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        QueryValue::Single(value.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(value: String) -> Self {
        QueryValue::Single(value)
    }
}

impl From<Vec<String>> for QueryValue {
    fn from(values: Vec<String>) -> Self {
        QueryValue::Many(values)
    }
}

/// Error produced by generated client calls
#[derive(Debug, Error)]
pub enum ApiClientError {
    /// The server answered with a non-success status
    #[error("{status} {status_text} for {url}")]
    Status {
        status: u16,
        status_text: String,
        url: String,
        response: Option<Value>,
    },
    /// The request never completed
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    /// The response body was not valid JSON
    #[error("invalid response from {url}: {message}")]
    Decode { url: String, message: String },
}

/// HTTP client handed to generated functions
#[derive(Debug, Clone)]
pub struct ApiClient {
    config: ClientConfig,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Produce a new client with `overrides` merged over this one's config
    ///
    /// Overriding headers replace same-named defaults; everything else is
    /// carried over.
    pub fn with_config(&self, overrides: ClientOverrides) -> Self {
        let mut config = self.config.clone();
        if let Some(base_url) = overrides.base_url {
            config.base_url = base_url;
        }
        if let Some(timeout) = overrides.timeout {
            config.timeout = timeout;
        }
        for (name, value) in overrides.headers {
            if let Some(existing) = config
                .headers
                .iter_mut()
                .find(|(n, _)| n.eq_ignore_ascii_case(&name))
            {
                existing.1 = value;
            } else {
                config.headers.push((name, value));
            }
        }
        Self::new(config)
    }

    /// Substitute `:name` path parameters and append the query string
    pub fn build_url(
        &self,
        path_template: &str,
        params: &[(&str, String)],
        query: &[(String, QueryValue)],
    ) -> String {
        let path = substitute_params(path_template, params);
        let query_string = serialize_query(query);
        let base = self.config.base_url.trim_end_matches('/');
        if query_string.is_empty() {
            format!("{}{}", base, path)
        } else {
            format!("{}{}?{}", base, path, query_string)
        }
    }

    /// Execute a request for a generated client function
    pub async fn request(
        &self,
        method: &str,
        path_template: &str,
        params: &[(&str, String)],
        query: &[(String, QueryValue)],
        body: Option<&Value>,
    ) -> Result<Value, ApiClientError> {
        let url = self.build_url(path_template, params, query);
        let method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|_| {
            ApiClientError::Transport {
                url: url.clone(),
                message: format!("invalid method '{}'", method),
            }
        })?;

        let mut request = self.http.request(method, &url);
        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| ApiClientError::Transport {
            url: url.clone(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let response_body = response.json::<Value>().await.ok();
            return Err(ApiClientError::Status {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
                url,
                response: response_body,
            });
        }

        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }

        response.json::<Value>().await.map_err(|e| ApiClientError::Decode {
            url,
            message: e.to_string(),
        })
    }
}

/// Replace `:name` segments with their values
fn substitute_params(template: &str, params: &[(&str, String)]) -> String {
    let segments: Vec<String> = template
        .split('/')
        .map(|segment| {
            let name = segment
                .strip_prefix(':')
                .or_else(|| segment.strip_prefix('*'));
            match name {
                Some(name) => params
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_else(|| segment.to_string()),
                None => segment.to_string(),
            }
        })
        .collect();
    segments.join("/")
}

/// Serialize query pairs; `Many` values repeat the key
fn serialize_query(query: &[(String, QueryValue)]) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in query {
        match value {
            QueryValue::Single(v) => {
                serializer.append_pair(key, v);
            }
            QueryValue::Many(values) => {
                for v in values {
                    serializer.append_pair(key, v);
                }
            }
        }
    }
    serializer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ApiClient {
        ApiClient::new(ClientConfig {
            base_url: "http://api.test".to_string(),
            ..ClientConfig::default()
        })
    }

    #[test]
    fn url_substitution_and_query() {
        let url = client().build_url(
            "/users/:id/posts/:post_id",
            &[("id", "42".to_string()), ("post_id", "7".to_string())],
            &[
                ("limit".to_string(), QueryValue::Single("10".to_string())),
                (
                    "tag".to_string(),
                    QueryValue::Many(vec!["a".to_string(), "b".to_string()]),
                ),
            ],
        );
        assert_eq!(url, "http://api.test/users/42/posts/7?limit=10&tag=a&tag=b");
    }

    #[test]
    fn rest_params_substitute_too() {
        let url = client().build_url(
            "/files/*path",
            &[("path", "docs/readme.md".to_string())],
            &[],
        );
        assert_eq!(url, "http://api.test/files/docs/readme.md");
    }

    #[test]
    fn query_values_are_encoded() {
        let url = client().build_url(
            "/search",
            &[],
            &[("q".to_string(), QueryValue::Single("a b&c".to_string()))],
        );
        assert_eq!(url, "http://api.test/search?q=a+b%26c");
    }

    #[test]
    fn with_config_merges_headers() {
        let base = ApiClient::new(ClientConfig {
            base_url: "http://api.test".to_string(),
            headers: vec![
                ("Authorization".to_string(), "Bearer old".to_string()),
                ("X-Trace".to_string(), "1".to_string()),
            ],
            ..ClientConfig::default()
        });

        let derived = base.with_config(ClientOverrides {
            headers: vec![
                ("authorization".to_string(), "Bearer new".to_string()),
                ("X-Extra".to_string(), "2".to_string()),
            ],
            ..ClientOverrides::default()
        });

        let headers = &derived.config().headers;
        assert_eq!(headers.len(), 3);
        assert!(headers
            .iter()
            .any(|(n, v)| n == "Authorization" && v == "Bearer new"));
        assert!(headers.iter().any(|(n, v)| n == "X-Extra" && v == "2"));

        // The original client is untouched
        assert!(base
            .config()
            .headers
            .iter()
            .any(|(_, v)| v == "Bearer old"));
    }

    #[tokio::test]
    async fn built_urls_match_mounted_routes() {
        use crate::app::create_app;
        use crate::contract::Contract;
        use crate::routes::{build_router, RegistryOptions, RouteSet};
        use axum::body::Body;
        use tower::ServiceExt;

        #[derive(serde::Deserialize)]
        struct Params {
            id: String,
        }

        #[derive(serde::Deserialize)]
        struct Query {
            limit: u32,
        }

        let app = create_app().bind::<Params, Query, (), _, _, _>(
            Contract::get("/users/:id"),
            |input: crate::app::Input<Params, Query, ()>| async move {
                Ok(axum::Json(serde_json::json!({
                    "id": input.params.id,
                    "limit": input.query.limit,
                })))
            },
        );
        let (router, _) =
            build_router(RouteSet::new().mount("users/[id]", app), RegistryOptions::default())
                .unwrap();

        // The URL the generated client would build, minus the base
        let url = client().build_url(
            "/users/:id",
            &[("id", "42".to_string())],
            &[("limit".to_string(), QueryValue::Single("10".to_string()))],
        );
        let path_and_query = url.strip_prefix("http://api.test").unwrap();

        let response = router
            .oneshot(
                http::Request::builder()
                    .uri(path_and_query)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
    }

    #[test]
    fn with_config_overrides_base_url_and_timeout() {
        let derived = client().with_config(ClientOverrides {
            base_url: Some("https://prod.test".to_string()),
            timeout: Some(Duration::from_secs(5)),
            ..ClientOverrides::default()
        });
        assert_eq!(derived.config().base_url, "https://prod.test");
        assert_eq!(derived.config().timeout, Duration::from_secs(5));
    }
}
