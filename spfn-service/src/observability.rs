//! Tracing setup and the structured logging façade
//!
//! The transport is chosen once at process start from `SPFN_LOG_FORMAT`
//! (`pretty`, `json` or `compact`); records flow through `tracing`, so any
//! additional transports are subscriber layers and failures there never
//! reach callers. [`Logger`] adds the module-scoped, context-carrying
//! surface used across the framework.

use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::Result;

/// Initialize the tracing subscriber
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_new(&config.service.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let format = std::env::var("SPFN_LOG_FORMAT").unwrap_or_else(|_| {
        if config.is_production() {
            "json".to_string()
        } else {
            "pretty".to_string()
        }
    });

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
        "compact" => tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .try_init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };

    if result.is_ok() {
        tracing::info!(
            service = %config.service.name,
            format = %format,
            "tracing initialized"
        );
    }
    Ok(())
}

/// Log severity accepted by [`Logger::log`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// Module-scoped structured logger
///
/// `child` fixes a nested module tag; all records carry the module path and
/// optional JSON context.
#[derive(Debug, Clone)]
pub struct Logger {
    module: String,
}

impl Logger {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
        }
    }

    /// A logger with `module` appended to this one's scope
    pub fn child(&self, module: &str) -> Logger {
        Logger {
            module: format!("{}.{}", self.module, module),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message, None, None);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message, None, None);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message, None, None);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message, None, None);
    }

    pub fn fatal(&self, message: &str) {
        self.log(LogLevel::Fatal, message, None, None);
    }

    /// Full form: level, message, optional context, optional error
    pub fn log(
        &self,
        level: LogLevel,
        message: &str,
        context: Option<&serde_json::Value>,
        error: Option<&dyn std::error::Error>,
    ) {
        let context = context.map(|c| c.to_string()).unwrap_or_default();
        let error = error.map(|e| e.to_string()).unwrap_or_default();
        match level {
            LogLevel::Debug => {
                tracing::debug!(module = %self.module, context = %context, error = %error, "{}", message)
            }
            LogLevel::Info => {
                tracing::info!(module = %self.module, context = %context, error = %error, "{}", message)
            }
            LogLevel::Warn => {
                tracing::warn!(module = %self.module, context = %context, error = %error, "{}", message)
            }
            LogLevel::Error => {
                tracing::error!(module = %self.module, context = %context, error = %error, "{}", message)
            }
            LogLevel::Fatal => {
                tracing::error!(module = %self.module, context = %context, error = %error, fatal = true, "{}", message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_loggers_nest_module_tags() {
        let root = Logger::new("spfn");
        let db = root.child("db");
        let pool = db.child("pool");
        assert_eq!(root.module(), "spfn");
        assert_eq!(db.module(), "spfn.db");
        assert_eq!(pool.module(), "spfn.db.pool");
    }

    #[test]
    fn logging_does_not_panic_without_subscriber() {
        let logger = Logger::new("test");
        logger.debug("debug line");
        logger.info("info line");
        logger.warn("warn line");
        logger.error("error line");
        logger.fatal("fatal line");
        logger.log(
            LogLevel::Error,
            "with extras",
            Some(&serde_json::json!({"request": "r-1"})),
            Some(&std::io::Error::new(std::io::ErrorKind::Other, "io")),
        );
    }

    #[test]
    fn init_tracing_is_idempotent() {
        let config = Config::default();
        init_tracing(&config).unwrap();
        init_tracing(&config).unwrap();
    }
}
