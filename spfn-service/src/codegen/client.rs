//! Built-in typed-client generator
//!
//! Consumes the contract scanner's output and emits a Rust module with one
//! async function per contract, grouped into modules by resource (the first
//! non-parameter path segment). Generated functions delegate to the runtime
//! [`ApiClient`](crate::client::ApiClient) for URL building, query
//! serialization and error wrapping.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::scanner::{scan_contracts, ScanOptions, ScannedContract};

use super::{Generator, GeneratorContext};

/// Generator wired in under the `contract` configuration name
pub struct ContractClientGenerator {
    watch_pattern: String,
    out_file: String,
}

impl Default for ContractClientGenerator {
    fn default() -> Self {
        Self {
            watch_pattern: "src/server/routes/**/*.rs".to_string(),
            out_file: "client.rs".to_string(),
        }
    }
}

impl ContractClientGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the configuration entry's free-form options
    ///
    /// Recognized keys: `routes` (watch glob), `output` (file name under the
    /// codegen output directory).
    pub fn from_options(options: &serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        let mut generator = Self::default();
        if let Some(routes) = options.get("routes") {
            generator.watch_pattern = routes
                .as_str()
                .ok_or_else(|| Error::config("contract generator: 'routes' must be a string"))?
                .to_string();
        }
        if let Some(output) = options.get("output") {
            generator.out_file = output
                .as_str()
                .ok_or_else(|| Error::config("contract generator: 'output' must be a string"))?
                .to_string();
        }
        Ok(generator)
    }
}

#[async_trait]
impl Generator for ContractClientGenerator {
    fn name(&self) -> &str {
        "contract"
    }

    fn watch_patterns(&self) -> Vec<String> {
        vec![self.watch_pattern.clone()]
    }

    async fn generate(&self, ctx: &GeneratorContext) -> Result<()> {
        let contracts = scan_contracts(&ScanOptions::new(&ctx.route_dir));
        let source = emit_client(&contracts);

        std::fs::create_dir_all(&ctx.out_dir)?;
        let out_path = ctx.out_dir.join(&self.out_file);
        std::fs::write(&out_path, source)?;
        tracing::info!(
            contracts = contracts.len(),
            out = %out_path.display(),
            "client module generated"
        );
        Ok(())
    }
}

/// Render the client module for a set of scanned contracts
pub fn emit_client(contracts: &[ScannedContract]) -> String {
    let mut out = String::new();
    out.push_str("// Generated by spfn codegen. Do not edit.\n");
    out.push_str("#![allow(dead_code, unused_imports)]\n\n");
    out.push_str("use serde_json::Value;\n");
    out.push_str("use spfn_service::client::{ApiClient, ApiClientError, ClientConfig, QueryValue};\n\n");
    out.push_str("/// Build a client for this API\n");
    out.push_str("pub fn create_client(config: ClientConfig) -> ApiClient {\n");
    out.push_str("    ApiClient::new(config)\n");
    out.push_str("}\n");

    let mut by_resource: BTreeMap<String, Vec<&ScannedContract>> = BTreeMap::new();
    for contract in contracts {
        by_resource
            .entry(resource_of(&contract.path))
            .or_default()
            .push(contract);
    }

    for (resource, group) in by_resource {
        out.push('\n');
        out.push_str(&format!("pub mod {} {{\n", resource));
        out.push_str("    use super::*;\n");

        let mut used_names: BTreeMap<String, usize> = BTreeMap::new();
        for contract in group {
            out.push('\n');
            out.push_str(&emit_function(contract, &mut used_names));
        }
        out.push_str("}\n");
    }

    out
}

fn emit_function(contract: &ScannedContract, used_names: &mut BTreeMap<String, usize>) -> String {
    let mut name = function_name(&contract.contract_name);
    let seen = used_names.entry(name.clone()).or_insert(0);
    *seen += 1;
    if *seen > 1 {
        name = format!("{}_{}", name, seen);
    }

    let params = path_params(&contract.path);
    let has_body = !matches!(contract.method.as_str(), "GET" | "HEAD" | "OPTIONS");

    let mut signature_args = vec!["client: &ApiClient".to_string()];
    for param in &params {
        signature_args.push(format!("{}: impl std::fmt::Display", ident_of(param)));
    }
    signature_args.push("query: &[(String, QueryValue)]".to_string());
    if has_body {
        signature_args.push("body: Option<&Value>".to_string());
    }

    let param_pairs: Vec<String> = params
        .iter()
        .map(|p| format!("(\"{}\", {}.to_string())", p, ident_of(p)))
        .collect();
    let body_arg = if has_body { "body" } else { "None" };

    let mut out = String::new();
    out.push_str(&format!(
        "    /// `{} {}` from `{}` ({})\n",
        contract.method, contract.path, contract.contract_name, contract.import_path
    ));
    out.push_str(&format!(
        "    pub async fn {}(\n        {},\n    ) -> Result<Value, ApiClientError> {{\n",
        name,
        signature_args.join(",\n        ")
    ));
    out.push_str(&format!(
        "        client\n            .request(\"{}\", \"{}\", &[{}], query, {})\n            .await\n",
        contract.method,
        contract.path,
        param_pairs.join(", "),
        body_arg
    ));
    out.push_str("    }\n");
    out
}

/// First non-parameter path segment, as a module identifier
fn resource_of(path: &str) -> String {
    path.split('/')
        .find(|s| !s.is_empty() && !s.starts_with(':') && !s.starts_with('*'))
        .map(ident_of)
        .unwrap_or_else(|| "root".to_string())
}

/// Function name from the const identifier: strip the `_CONTRACT`/`_SCHEMA`
/// suffix and lowercase
fn function_name(contract_name: &str) -> String {
    let trimmed = contract_name
        .trim_end_matches("_CONTRACT")
        .trim_end_matches("_SCHEMA");
    let lowered = trimmed.to_lowercase();
    if lowered.is_empty() {
        "call".to_string()
    } else {
        ident_of(&lowered)
    }
}

fn ident_of(raw: &str) -> String {
    let mut ident: String = raw
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if ident.chars().next().map(|c| c.is_numeric()).unwrap_or(true) {
        ident = format!("r_{}", ident);
    }
    ident
}

fn path_params(path: &str) -> Vec<String> {
    path.split('/')
        .filter_map(|segment| {
            segment
                .strip_prefix(':')
                .or_else(|| segment.strip_prefix('*'))
                .map(str::to_string)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scanned(method: &str, path: &str, name: &str) -> ScannedContract {
        ScannedContract {
            method: method.to_string(),
            path: path.to_string(),
            contract_name: name.to_string(),
            import_path: format!("@/server/routes{}/contract", path),
            source_file: PathBuf::from("contract.rs"),
        }
    }

    #[test]
    fn functions_are_grouped_by_resource() {
        let source = emit_client(&[
            scanned("GET", "/users/:id", "GET_USER_CONTRACT"),
            scanned("GET", "/users", "LIST_USERS_CONTRACT"),
            scanned("POST", "/orders", "CREATE_ORDER_CONTRACT"),
        ]);

        assert!(source.contains("pub mod users {"));
        assert!(source.contains("pub mod orders {"));
        assert!(source.contains("pub async fn get_user("));
        assert!(source.contains("pub async fn list_users("));
        assert!(source.contains("pub async fn create_order("));
    }

    #[test]
    fn path_params_become_display_arguments() {
        let source = emit_client(&[scanned("GET", "/users/:id/posts/:post_id", "GET_POST_CONTRACT")]);
        assert!(source.contains("id: impl std::fmt::Display"));
        assert!(source.contains("post_id: impl std::fmt::Display"));
        assert!(source.contains(r#"("id", id.to_string()), ("post_id", post_id.to_string())"#));
    }

    #[test]
    fn body_parameter_only_for_body_methods() {
        let get = emit_client(&[scanned("GET", "/users", "LIST_USERS_CONTRACT")]);
        assert!(!get.contains("body: Option<&Value>"));
        assert!(get.contains("query, None"));

        let post = emit_client(&[scanned("POST", "/users", "CREATE_USER_CONTRACT")]);
        assert!(post.contains("body: Option<&Value>"));
        assert!(post.contains("query, body"));
    }

    #[test]
    fn root_contracts_land_in_root_module() {
        let source = emit_client(&[scanned("GET", "/", "PING_CONTRACT")]);
        assert!(source.contains("pub mod root {"));
        assert!(source.contains("pub async fn ping("));
    }

    #[test]
    fn duplicate_function_names_are_disambiguated() {
        let source = emit_client(&[
            scanned("GET", "/users", "GET_USER_CONTRACT"),
            scanned("GET", "/users/:id", "GET_USER_CONTRACT"),
        ]);
        assert!(source.contains("pub async fn get_user("));
        assert!(source.contains("pub async fn get_user_2("));
    }

    #[tokio::test]
    async fn generate_writes_the_client_file() {
        let dir = tempfile::tempdir().unwrap();
        let route_dir = dir.path().join("routes");
        std::fs::create_dir_all(route_dir.join("users")).unwrap();
        std::fs::write(
            route_dir.join("users/contract.rs"),
            r#"pub const GET_USER_CONTRACT: Contract = Contract::get("/users/:id");"#,
        )
        .unwrap();

        let ctx = GeneratorContext {
            project_root: dir.path().to_path_buf(),
            route_dir,
            out_dir: dir.path().join("generated"),
        };

        ContractClientGenerator::new().generate(&ctx).await.unwrap();

        let emitted = std::fs::read_to_string(dir.path().join("generated/client.rs")).unwrap();
        assert!(emitted.contains("pub async fn get_user("));
        assert!(emitted.contains(r#".request("GET", "/users/:id""#));
    }

    #[test]
    fn options_override_defaults() {
        let mut options = serde_json::Map::new();
        options.insert(
            "routes".to_string(),
            serde_json::json!("api/routes/**/*.rs"),
        );
        options.insert("output".to_string(), serde_json::json!("api_client.rs"));

        let generator = ContractClientGenerator::from_options(&options).unwrap();
        assert_eq!(generator.watch_patterns(), vec!["api/routes/**/*.rs"]);
        assert_eq!(generator.out_file, "api_client.rs");
    }

    #[test]
    fn bad_option_types_fail() {
        let mut options = serde_json::Map::new();
        options.insert("routes".to_string(), serde_json::json!(42));
        assert!(ContractClientGenerator::from_options(&options).is_err());
    }
}
