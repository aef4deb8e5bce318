//! Endpoint contracts
//!
//! A [`Contract`] is the declarative record of an endpoint's wire shape:
//! method, path template, and metadata. Contracts are const-constructible so
//! route modules can export them as `pub const` items, which is also what
//! the static scanner looks for when generating clients.
//!
//! ```
//! use spfn_service::contract::{Contract, ContractMeta};
//!
//! pub const GET_USER_CONTRACT: Contract = Contract::get("/users/:id")
//!     .with_meta(ContractMeta::new().skip(&["auth"]))
//!     .describe("Fetch a single user");
//! ```

use crate::error::{Error, Result};

/// HTTP methods a contract may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            "HEAD" => Some(Self::Head),
            "OPTIONS" => Some(Self::Options),
            _ => None,
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<HttpMethod> for http::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => http::Method::GET,
            HttpMethod::Post => http::Method::POST,
            HttpMethod::Put => http::Method::PUT,
            HttpMethod::Patch => http::Method::PATCH,
            HttpMethod::Delete => http::Method::DELETE,
            HttpMethod::Head => http::Method::HEAD,
            HttpMethod::Options => http::Method::OPTIONS,
        }
    }
}

/// Contract metadata read by the loader when composing the middleware chain
#[derive(Debug, Clone, Copy)]
pub struct ContractMeta {
    /// Human-readable endpoint description
    pub description: Option<&'static str>,
    /// Global middlewares to skip for this endpoint, by name
    pub skip_middlewares: &'static [&'static str],
    /// Endpoint requires no credentials
    pub public: bool,
    /// Wrap the handler in a database transaction
    pub transactional: bool,
    /// Free-form grouping tags (surfaced in the registry summary)
    pub tags: &'static [&'static str],
}

impl ContractMeta {
    pub const fn new() -> Self {
        Self {
            description: None,
            skip_middlewares: &[],
            public: false,
            transactional: false,
            tags: &[],
        }
    }

    pub const fn skip(mut self, names: &'static [&'static str]) -> Self {
        self.skip_middlewares = names;
        self
    }

    pub const fn public(mut self) -> Self {
        self.public = true;
        self
    }

    pub const fn transactional(mut self) -> Self {
        self.transactional = true;
        self
    }

    pub const fn tagged(mut self, tags: &'static [&'static str]) -> Self {
        self.tags = tags;
        self
    }
}

impl Default for ContractMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Declarative record of one endpoint
///
/// Immutable after construction; two contracts sharing `(method, path)` are
/// rejected when the registry is built.
#[derive(Debug, Clone, Copy)]
pub struct Contract {
    pub method: HttpMethod,
    pub path: &'static str,
    pub meta: ContractMeta,
}

impl Contract {
    pub const fn new(method: HttpMethod, path: &'static str) -> Self {
        Self {
            method,
            path,
            meta: ContractMeta::new(),
        }
    }

    pub const fn get(path: &'static str) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub const fn post(path: &'static str) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    pub const fn put(path: &'static str) -> Self {
        Self::new(HttpMethod::Put, path)
    }

    pub const fn patch(path: &'static str) -> Self {
        Self::new(HttpMethod::Patch, path)
    }

    pub const fn delete(path: &'static str) -> Self {
        Self::new(HttpMethod::Delete, path)
    }

    pub const fn head(path: &'static str) -> Self {
        Self::new(HttpMethod::Head, path)
    }

    pub const fn options(path: &'static str) -> Self {
        Self::new(HttpMethod::Options, path)
    }

    pub const fn with_meta(mut self, meta: ContractMeta) -> Self {
        self.meta = meta;
        self
    }

    pub const fn describe(mut self, description: &'static str) -> Self {
        self.meta.description = Some(description);
        self
    }

    /// Bind-time validation; a malformed contract fails at startup, never at
    /// first request.
    ///
    /// Paths may be absolute (`/users/:id`, replaces the mount base) or
    /// relative (`detail`, appended to it); only an empty path or a
    /// misplaced rest parameter is rejected.
    pub fn validate(&self) -> Result<()> {
        if self.path.is_empty() {
            return Err(Error::config(format!(
                "contract {} has an empty path",
                self.method
            )));
        }
        if let Some(rest) = self.path.find("*") {
            // A rest parameter is only valid as the final segment
            let tail = &self.path[rest..];
            if tail.contains('/') {
                return Err(Error::config(format!(
                    "contract {} {}: rest parameter must be the final segment",
                    self.method, self.path
                )));
            }
        }
        Ok(())
    }

    /// Named path parameters, in order of appearance
    pub fn path_params(&self) -> Vec<&'static str> {
        self.path
            .split('/')
            .filter_map(|segment| {
                segment
                    .strip_prefix(':')
                    .or_else(|| segment.strip_prefix('*'))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_USERS_CONTRACT: Contract = Contract::get("/users")
        .with_meta(ContractMeta::new().tagged(&["users"]))
        .describe("List users");

    #[test]
    fn const_contract_construction() {
        assert_eq!(LIST_USERS_CONTRACT.method, HttpMethod::Get);
        assert_eq!(LIST_USERS_CONTRACT.path, "/users");
        assert_eq!(LIST_USERS_CONTRACT.meta.description, Some("List users"));
        assert_eq!(LIST_USERS_CONTRACT.meta.tags, &["users"]);
    }

    #[test]
    fn meta_skip_and_flags() {
        const C: Contract = Contract::post("/orders")
            .with_meta(ContractMeta::new().skip(&["auth", "metrics"]).transactional());
        assert_eq!(C.meta.skip_middlewares, &["auth", "metrics"]);
        assert!(C.meta.transactional);
        assert!(!C.meta.public);
    }

    #[test]
    fn validate_rejects_malformed_paths() {
        assert!(Contract::get("").validate().is_err());
        assert!(Contract::get("/files/*rest/more").validate().is_err());
        assert!(Contract::get("/files/*rest").validate().is_ok());
        // Relative paths append to the mount base and are valid
        assert!(Contract::get("detail").validate().is_ok());
    }

    #[test]
    fn path_params_extraction() {
        let contract = Contract::get("/users/:id/posts/:post_id");
        assert_eq!(contract.path_params(), vec!["id", "post_id"]);

        let contract = Contract::get("/files/*path");
        assert_eq!(contract.path_params(), vec!["path"]);

        assert!(Contract::get("/users").path_params().is_empty());
    }

    #[test]
    fn method_parse_is_case_insensitive() {
        assert_eq!(HttpMethod::parse("get"), Some(HttpMethod::Get));
        assert_eq!(HttpMethod::parse("DELETE"), Some(HttpMethod::Delete));
        assert_eq!(HttpMethod::parse("TRACE"), None);
    }
}
