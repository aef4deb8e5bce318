//! Layered environment-file loading
//!
//! Files are applied in a fixed precedence order (`.env`, `.env.{mode}`,
//! `.env.local`, `.env.{mode}.local`, then explicit extra paths), later
//! files overriding earlier ones. Values already present in the process
//! environment are never overridden. Under `mode = test`, `.env.local` is
//! skipped so test runs stay isolated from developer machines, the
//! `.env.test*` files are only ever picked up in that mode, and
//! `.env.development` participates below them so keys no test file defines
//! fall back to the development layer.
//!
//! Loading is once-per-process; [`reset_for_tests`] drops the cache.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::error::{Error, Result};

/// Options for [`load`]
#[derive(Debug, Clone, Default)]
pub struct EnvLoadOptions {
    /// Runtime mode; defaults to `SPFN_ENV`, then `development`
    pub mode: Option<String>,
    /// Directory holding the env files; defaults to the working directory
    pub dir: Option<PathBuf>,
    /// Explicit custom paths, applied last (highest precedence)
    pub extra_paths: Vec<PathBuf>,
    /// Bypass the cache and re-read the files
    pub force: bool,
}

/// A file that existed but could not be parsed
#[derive(Debug, Clone)]
pub struct EnvFileFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of one load pass
#[derive(Debug, Clone, Default)]
pub struct EnvLoadResult {
    /// Files applied, in application order
    pub loaded: Vec<PathBuf>,
    /// Files that existed but failed to parse
    pub failed: Vec<EnvFileFailure>,
    /// Merged key/value view of the files (process env not included)
    pub parsed: BTreeMap<String, String>,
    pub success: bool,
}

static CACHE: Lazy<Mutex<Option<EnvLoadResult>>> = Lazy::new(|| Mutex::new(None));

/// Load the layered env files once per process
///
/// Subsequent calls return the cached result unless `force` is set.
pub fn load(options: EnvLoadOptions) -> EnvLoadResult {
    if !options.force {
        if let Some(cached) = CACHE.lock().unwrap().clone() {
            return cached;
        }
    }

    let mode = options
        .mode
        .clone()
        .or_else(|| std::env::var("SPFN_ENV").ok())
        .unwrap_or_else(|| "development".to_string());
    let dir = options.dir.clone().unwrap_or_else(|| PathBuf::from("."));

    let mut result = EnvLoadResult::default();

    for path in file_candidates(&dir, &mode, &options.extra_paths) {
        if !path.exists() {
            continue;
        }
        match read_env_file(&path) {
            Ok(pairs) => {
                for (key, value) in pairs {
                    result.parsed.insert(key, value);
                }
                tracing::debug!(file = %path.display(), "env file applied");
                result.loaded.push(path);
            }
            Err(reason) => {
                tracing::warn!(file = %path.display(), "env file skipped: {}", reason);
                result.failed.push(EnvFileFailure { path, reason });
            }
        }
    }

    // The process environment always wins over file values
    for (key, value) in &result.parsed {
        if std::env::var(key).is_err() {
            std::env::set_var(key, value);
        }
    }

    result.success = result.failed.is_empty();
    *CACHE.lock().unwrap() = Some(result.clone());
    result
}

/// Drop the cached load result so the next [`load`] re-reads the files
pub fn reset_for_tests() {
    *CACHE.lock().unwrap() = None;
}

/// File list in application order for the given mode
fn file_candidates(dir: &Path, mode: &str, extras: &[PathBuf]) -> Vec<PathBuf> {
    let mut candidates = vec![dir.join(".env")];
    // Test runs read the development layer first so keys no `.env.test*`
    // file defines still resolve; the test files override it below.
    if mode == "test" {
        candidates.push(dir.join(".env.development"));
    }
    candidates.push(dir.join(format!(".env.{}", mode)));
    if mode != "test" {
        candidates.push(dir.join(".env.local"));
    }
    candidates.push(dir.join(format!(".env.{}.local", mode)));
    candidates.extend(extras.iter().cloned());
    candidates
}

fn read_env_file(path: &Path) -> std::result::Result<Vec<(String, String)>, String> {
    let iter = dotenvy::from_path_iter(path).map_err(|e| e.to_string())?;
    let mut pairs = Vec::new();
    for item in iter {
        let (key, value) = item.map_err(|e| e.to_string())?;
        pairs.push((key, value));
    }
    Ok(pairs)
}

/// Fetch a key that must be present, from the process environment
pub fn require(key: &str) -> Result<String> {
    std::env::var(key)
        .map_err(|_| Error::config(format!("required environment variable '{}' is not set", key)))
}

/// Optional value lookup with default and validation
#[derive(Default)]
pub struct GetOptions {
    pub default: Option<String>,
    pub validator: Option<Validator>,
}

/// Fetch a key with an optional default and validator
pub fn get(key: &str, options: GetOptions) -> Result<Option<String>> {
    let value = std::env::var(key).ok().or(options.default);
    if let (Some(value), Some(validator)) = (&value, &options.validator) {
        validator(value).map_err(|reason| {
            Error::config(format!(
                "environment variable '{}' is invalid: {}",
                key, reason
            ))
        })?;
    }
    Ok(value)
}

/// A value predicate with a failure reason
pub type Validator = Arc<dyn Fn(&str) -> std::result::Result<(), String> + Send + Sync>;

/// Standard validators for [`get`]
pub mod validators {
    use super::Validator;
    use std::sync::Arc;

    pub fn url() -> Validator {
        Arc::new(|value| {
            if value.contains("://") && !value.starts_with("://") {
                Ok(())
            } else {
                Err("expected a URL with a scheme".to_string())
            }
        })
    }

    pub fn number() -> Validator {
        Arc::new(|value| {
            value
                .parse::<f64>()
                .map(|_| ())
                .map_err(|_| "expected a number".to_string())
        })
    }

    pub fn boolean() -> Validator {
        Arc::new(|value| match value {
            "true" | "false" | "1" | "0" => Ok(()),
            _ => Err("expected a boolean".to_string()),
        })
    }

    pub fn one_of(allowed: &[&str]) -> Validator {
        let allowed: Vec<String> = allowed.iter().map(|s| s.to_string()).collect();
        Arc::new(move |value| {
            if allowed.iter().any(|a| a == value) {
                Ok(())
            } else {
                Err(format!("expected one of: {}", allowed.join(", ")))
            }
        })
    }

    pub fn pattern(re: &str) -> Validator {
        let regex = regex::Regex::new(re).expect("validator pattern must be a valid regex");
        Arc::new(move |value| {
            if regex.is_match(value) {
                Ok(())
            } else {
                Err(format!("expected to match pattern {}", regex.as_str()))
            }
        })
    }

    pub fn min_length(n: usize) -> Validator {
        Arc::new(move |value| {
            if value.len() >= n {
                Ok(())
            } else {
                Err(format!("expected at least {} characters", n))
            }
        })
    }

    /// All validators must pass, reported in order
    pub fn all_of(validators: Vec<Validator>) -> Validator {
        Arc::new(move |value| {
            for validator in &validators {
                validator(value)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The loader cache and process environment are global; serialize the
    // tests that touch them.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn layering_in_development_mode() {
        let _guard = TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".env", "LAYER_TEST_DEV=base\n");
        write(dir.path(), ".env.development", "LAYER_TEST_DEV=development\n");
        write(dir.path(), ".env.local", "LAYER_TEST_DEV=local\n");
        write(dir.path(), ".env.development.local", "LAYER_TEST_DEV=dev-local\n");

        reset_for_tests();
        let result = load(EnvLoadOptions {
            mode: Some("development".to_string()),
            dir: Some(dir.path().to_path_buf()),
            force: true,
            ..EnvLoadOptions::default()
        });

        assert!(result.success);
        assert_eq!(result.loaded.len(), 4);
        assert_eq!(result.parsed["LAYER_TEST_DEV"], "dev-local");
    }

    #[test]
    fn test_mode_skips_env_local() {
        let _guard = TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".env", "LAYER_TEST_TST=base\n");
        write(dir.path(), ".env.test", "LAYER_TEST_TST=test\n");
        write(dir.path(), ".env.local", "LAYER_TEST_TST=local\n");

        reset_for_tests();
        let result = load(EnvLoadOptions {
            mode: Some("test".to_string()),
            dir: Some(dir.path().to_path_buf()),
            force: true,
            ..EnvLoadOptions::default()
        });

        // .env.local must not participate under test mode
        assert!(!result
            .loaded
            .iter()
            .any(|p| p.file_name().unwrap() == ".env.local"));
        assert_eq!(result.parsed["LAYER_TEST_TST"], "test");
    }

    #[test]
    fn four_canonical_files_across_both_modes() {
        let _guard = TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".env", "LAYER_TEST_CANON=base\n");
        write(dir.path(), ".env.development", "LAYER_TEST_CANON=development\n");
        write(dir.path(), ".env.local", "LAYER_TEST_CANON=local\n");
        write(
            dir.path(),
            ".env.development.local",
            "LAYER_TEST_CANON=dev-local\n",
        );

        reset_for_tests();
        let dev = load(EnvLoadOptions {
            mode: Some("development".to_string()),
            dir: Some(dir.path().to_path_buf()),
            force: true,
            ..EnvLoadOptions::default()
        });
        assert_eq!(dev.parsed["LAYER_TEST_CANON"], "dev-local");

        // Under test mode the local files drop out and, with no .env.test*
        // defining the key, the development layer wins.
        reset_for_tests();
        let test = load(EnvLoadOptions {
            mode: Some("test".to_string()),
            dir: Some(dir.path().to_path_buf()),
            force: true,
            ..EnvLoadOptions::default()
        });
        assert_eq!(test.parsed["LAYER_TEST_CANON"], "development");
        assert!(!test
            .loaded
            .iter()
            .any(|p| p.file_name().unwrap() == ".env.local"
                || p.file_name().unwrap() == ".env.development.local"));

        // Once a test file defines the key, it takes precedence
        write(dir.path(), ".env.test", "LAYER_TEST_CANON=test\n");
        reset_for_tests();
        let test = load(EnvLoadOptions {
            mode: Some("test".to_string()),
            dir: Some(dir.path().to_path_buf()),
            force: true,
            ..EnvLoadOptions::default()
        });
        assert_eq!(test.parsed["LAYER_TEST_CANON"], "test");
    }

    #[test]
    fn process_environment_wins_over_files() {
        let _guard = TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("LAYER_TEST_PROC", "from-process");
        write(dir.path(), ".env", "LAYER_TEST_PROC=from-file\n");

        reset_for_tests();
        load(EnvLoadOptions {
            mode: Some("development".to_string()),
            dir: Some(dir.path().to_path_buf()),
            force: true,
            ..EnvLoadOptions::default()
        });

        assert_eq!(std::env::var("LAYER_TEST_PROC").unwrap(), "from-process");
    }

    #[test]
    fn cached_result_is_reused_until_reset() {
        let _guard = TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".env", "LAYER_TEST_CACHE=one\n");

        reset_for_tests();
        let first = load(EnvLoadOptions {
            mode: Some("development".to_string()),
            dir: Some(dir.path().to_path_buf()),
            force: true,
            ..EnvLoadOptions::default()
        });

        // Different directory, but cache returns the first result
        let second = load(EnvLoadOptions {
            mode: Some("development".to_string()),
            dir: Some(PathBuf::from("/nonexistent")),
            ..EnvLoadOptions::default()
        });
        assert_eq!(first.loaded, second.loaded);
    }

    #[test]
    fn require_missing_key_fails() {
        let err = require("LAYER_TEST_DEFINITELY_MISSING").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn get_applies_default_and_validator() {
        let value = get(
            "LAYER_TEST_MISSING_WITH_DEFAULT",
            GetOptions {
                default: Some("8080".to_string()),
                validator: Some(validators::number()),
            },
        )
        .unwrap();
        assert_eq!(value.as_deref(), Some("8080"));

        let err = get(
            "LAYER_TEST_MISSING_WITH_DEFAULT",
            GetOptions {
                default: Some("not-a-number".to_string()),
                validator: Some(validators::number()),
            },
        )
        .unwrap_err();
        assert!(err.message().contains("expected a number"));
    }

    #[test]
    fn validator_combinators() {
        let v = validators::all_of(vec![validators::min_length(4), validators::pattern("^[a-z]+$")]);
        assert!(v("abcd").is_ok());
        assert!(v("abc").is_err());
        assert!(v("ABCD").is_err());

        assert!(validators::url()("postgres://localhost/db").is_ok());
        assert!(validators::url()("localhost").is_err());

        assert!(validators::one_of(&["a", "b"])("a").is_ok());
        assert!(validators::one_of(&["a", "b"])("c").is_err());

        assert!(validators::boolean()("true").is_ok());
        assert!(validators::boolean()("maybe").is_err());
    }
}
