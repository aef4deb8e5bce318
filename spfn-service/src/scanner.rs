//! Static contract scanner
//!
//! Walks the route tree for `contract.rs` files and extracts every top-level
//! `pub const` contract without executing any code: sources are parsed with
//! `syn` and the method/path are read straight off the AST. Both the struct
//! literal form (`Contract { method: HttpMethod::Get, path: "/users/:id", .. }`)
//! and the builder form (`Contract::get("/users/:id").describe(...)`) are
//! recognized. The result feeds client generation.

use std::path::{Path, PathBuf};

use serde::Serialize;
use syn::{Expr, Item, Lit};

use crate::contract::HttpMethod;
use crate::routes::{canonical_path, combine_paths};

/// One contract discovered by the scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScannedContract {
    /// Uppercase HTTP verb
    pub method: String,
    /// Full URL path after combining with the file's base path
    pub path: String,
    /// The const item's identifier
    pub contract_name: String,
    /// Alias-rooted logical import path for generators
    pub import_path: String,
    /// Source file the contract was found in
    pub source_file: PathBuf,
}

/// Scanner configuration
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Route tree root
    pub route_dir: PathBuf,
    /// Alias prefix used for `import_path` (defaults to `@/server/routes`)
    pub alias_prefix: String,
    /// Legacy layout: scan every source file in this directory as a
    /// contracts file
    pub legacy_contracts_dir: Option<PathBuf>,
}

impl ScanOptions {
    pub fn new(route_dir: impl Into<PathBuf>) -> Self {
        Self {
            route_dir: route_dir.into(),
            alias_prefix: "@/server/routes".to_string(),
            legacy_contracts_dir: None,
        }
    }
}

/// Scan the route tree for contract exports
///
/// A missing directory yields an empty list; a file that fails to parse is
/// logged as a warning and skipped.
pub fn scan_contracts(options: &ScanOptions) -> Vec<ScannedContract> {
    let mut results = Vec::new();

    if options.route_dir.exists() {
        for entry in walkdir::WalkDir::new(&options.route_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            if !is_contract_file(path) || in_tests_dir(path, &options.route_dir) {
                continue;
            }
            scan_file(path, &options.route_dir, &options.alias_prefix, &mut results);
        }
    } else {
        tracing::debug!(
            dir = %options.route_dir.display(),
            "route directory not found, nothing to scan"
        );
    }

    if let Some(legacy_dir) = &options.legacy_contracts_dir {
        if legacy_dir.exists() {
            for entry in walkdir::WalkDir::new(legacy_dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                let path = entry.path();
                if path.extension().and_then(|s| s.to_str()) != Some("rs") {
                    continue;
                }
                scan_file(path, legacy_dir, &options.alias_prefix, &mut results);
            }
        }
    }

    results
}

fn is_contract_file(path: &Path) -> bool {
    path.file_name().and_then(|s| s.to_str()) == Some("contract.rs")
}

fn in_tests_dir(path: &Path, root: &Path) -> bool {
    path.strip_prefix(root)
        .map(|rel| rel.components().any(|c| c.as_os_str() == "tests"))
        .unwrap_or(false)
}

fn scan_file(path: &Path, root: &Path, alias_prefix: &str, results: &mut Vec<ScannedContract>) {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            tracing::warn!(file = %path.display(), "failed to read contract file: {}", e);
            return;
        }
    };

    let file = match syn::parse_file(&source) {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(file = %path.display(), "failed to parse contract file: {}", e);
            return;
        }
    };

    let base = base_path(path, root);
    let import_path = import_path_for(path, root, alias_prefix);

    collect_items(&file.items, &base, &import_path, path, results);
}

fn collect_items(
    items: &[Item],
    base: &str,
    import_path: &str,
    source_file: &Path,
    results: &mut Vec<ScannedContract>,
) {
    for item in items {
        match item {
            Item::Const(item_const) => {
                let name = item_const.ident.to_string();
                let lowered = name.to_lowercase();
                if !lowered.contains("contract") && !lowered.contains("schema") {
                    continue;
                }
                if let Some((method, literal_path)) = extract_contract(&item_const.expr) {
                    results.push(ScannedContract {
                        method: method.as_str().to_string(),
                        path: combine_paths(base, &literal_path),
                        contract_name: name,
                        import_path: import_path.to_string(),
                        source_file: source_file.to_path_buf(),
                    });
                }
            }
            Item::Mod(item_mod) => {
                if let Some((_, nested)) = &item_mod.content {
                    collect_items(nested, base, import_path, source_file, results);
                }
            }
            _ => {}
        }
    }
}

/// Pull `(method, path)` out of a contract initializer expression
fn extract_contract(expr: &Expr) -> Option<(HttpMethod, String)> {
    // Builder chains wrap the constructor: peel method calls off until the
    // underlying call or struct literal is reached.
    let mut inner = expr;
    loop {
        match inner {
            Expr::MethodCall(call) => inner = &call.receiver,
            Expr::Group(group) => inner = &group.expr,
            Expr::Paren(paren) => inner = &paren.expr,
            _ => break,
        }
    }

    match inner {
        Expr::Struct(struct_expr) => {
            if last_segment(&struct_expr.path)? != "Contract" {
                return None;
            }
            let mut method = None;
            let mut path = None;
            for field in &struct_expr.fields {
                let name = match &field.member {
                    syn::Member::Named(ident) => ident.to_string(),
                    syn::Member::Unnamed(_) => continue,
                };
                match name.as_str() {
                    "method" => method = method_from_expr(&field.expr),
                    "path" => path = string_literal(&field.expr),
                    _ => {}
                }
            }
            Some((method?, path?))
        }
        Expr::Call(call) => {
            let func_path = match call.func.as_ref() {
                Expr::Path(p) => &p.path,
                _ => return None,
            };
            let segments: Vec<String> = func_path
                .segments
                .iter()
                .map(|s| s.ident.to_string())
                .collect();
            if !segments.iter().any(|s| s == "Contract") {
                return None;
            }
            let constructor = segments.last()?.as_str();
            match constructor {
                "new" => {
                    // Contract::new(HttpMethod::Verb, "/path")
                    let method = call.args.first().and_then(method_from_expr)?;
                    let path = call.args.iter().nth(1).and_then(string_literal)?;
                    Some((method, path))
                }
                verb => {
                    // Contract::get("/path") and friends
                    let method = HttpMethod::parse(verb)?;
                    let path = call.args.first().and_then(string_literal)?;
                    Some((method, path))
                }
            }
        }
        _ => None,
    }
}

/// Method from either a string literal or an `HttpMethod::Verb` path
fn method_from_expr(expr: &Expr) -> Option<HttpMethod> {
    match expr {
        Expr::Lit(lit) => match &lit.lit {
            Lit::Str(s) => HttpMethod::parse(&s.value()),
            _ => None,
        },
        Expr::Path(path) => HttpMethod::parse(&last_segment(&path.path)?),
        Expr::Cast(cast) => method_from_expr(&cast.expr),
        _ => None,
    }
}

fn string_literal(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Lit(lit) => match &lit.lit {
            Lit::Str(s) => Some(s.value()),
            _ => None,
        },
        Expr::Cast(cast) => string_literal(&cast.expr),
        Expr::Group(group) => string_literal(&group.expr),
        _ => None,
    }
}

fn last_segment(path: &syn::Path) -> Option<String> {
    path.segments.last().map(|s| s.ident.to_string())
}

/// Base URL path derived from the file's directory (same transform as the
/// route loader)
fn base_path(file: &Path, root: &Path) -> String {
    let rel_dir = file
        .parent()
        .and_then(|dir| dir.strip_prefix(root).ok())
        .map(|rel| rel.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default();
    canonical_path(&rel_dir)
}

fn import_path_for(file: &Path, root: &Path, alias_prefix: &str) -> String {
    let rel = file
        .strip_prefix(root)
        .map(|rel| rel.to_string_lossy().replace('\\', "/"))
        .unwrap_or_else(|_| file.to_string_lossy().into_owned());
    let without_ext = rel.trim_end_matches(".rs");
    format!("{}/{}", alias_prefix.trim_end_matches('/'), without_ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_tree(files: &[(&str, &str)]) -> Vec<ScannedContract> {
        let dir = tempfile::tempdir().unwrap();
        for (rel, contents) in files {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }
        scan_contracts(&ScanOptions::new(dir.path()))
    }

    #[test]
    fn struct_literal_contract_is_extracted() {
        let results = scan_tree(&[(
            "users/contract.rs",
            r#"
use spfn_service::contract::{Contract, ContractMeta, HttpMethod};

pub const GET_USER_CONTRACT: Contract = Contract {
    method: HttpMethod::Get,
    path: "/users/:id",
    meta: ContractMeta::new(),
};
"#,
        )]);

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].method, "GET");
        assert_eq!(results[0].path, "/users/:id");
        assert_eq!(results[0].contract_name, "GET_USER_CONTRACT");
        assert_eq!(results[0].import_path, "@/server/routes/users/contract");
    }

    #[test]
    fn builder_form_combines_with_base_path() {
        let results = scan_tree(&[(
            "items/contract.rs",
            r#"
pub const LIST_ITEMS_CONTRACT: Contract = Contract::get("/").describe("List items");
pub const CREATE_ITEM_CONTRACT: Contract = Contract::post("create");
"#,
        )]);

        assert_eq!(results.len(), 2);
        // Root path keeps the base, relative appends
        assert_eq!(results[0].path, "/items");
        assert_eq!(results[0].method, "GET");
        assert_eq!(results[1].path, "/items/create");
        assert_eq!(results[1].method, "POST");
    }

    #[test]
    fn contract_new_form_is_recognized() {
        let results = scan_tree(&[(
            "orders/contract.rs",
            r#"
pub const ORDER_SCHEMA: Contract = Contract::new(HttpMethod::Delete, "/orders/:id");
"#,
        )]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].method, "DELETE");
        assert_eq!(results[0].path, "/orders/:id");
    }

    #[test]
    fn unrelated_consts_are_ignored() {
        let results = scan_tree(&[(
            "misc/contract.rs",
            r#"
pub const LIMIT: usize = 10;
pub const HELPER_CONTRACT: &str = "not a contract value";
pub const PING_CONTRACT: Contract = Contract::get("/ping");
"#,
        )]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].contract_name, "PING_CONTRACT");
    }

    #[test]
    fn malformed_source_is_skipped() {
        let results = scan_tree(&[
            ("bad/contract.rs", "pub const BROKEN_CONTRACT: Contract = {{{"),
            ("good/contract.rs", "pub const OK_CONTRACT: Contract = Contract::get(\"/good\");"),
        ]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "/good");
    }

    #[test]
    fn tests_directories_contribute_nothing() {
        let results = scan_tree(&[(
            "tests/contract.rs",
            r#"pub const TEST_CONTRACT: Contract = Contract::get("/nope");"#,
        )]);
        assert!(results.is_empty());
    }

    #[test]
    fn missing_directory_yields_empty_list() {
        let results = scan_contracts(&ScanOptions::new("/definitely/not/here"));
        assert!(results.is_empty());
    }

    #[test]
    fn bracketed_directories_map_to_params() {
        let results = scan_tree(&[(
            "users/[id]/contract.rs",
            r#"pub const USER_DETAIL_CONTRACT: Contract = Contract::get("/");"#,
        )]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "/users/:id");
    }
}
