//! Error taxonomy and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::db::{DriverError, DriverErrorKind};

/// Result type alias using the framework error
pub type Result<T> = std::result::Result<T, Error>;

/// Recognized error kinds, each with a fixed HTTP status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Configuration or bootstrap failure
    Config,
    /// Schema validation or parse failure
    BadRequest,
    /// Missing or invalid credentials
    Unauthorized,
    /// Policy denial
    Forbidden,
    /// Lookup miss
    NotFound,
    /// Resource conflict, optimistic-lock failure
    Conflict,
    /// Unique constraint violation
    DuplicateEntry,
    /// Rate limiting
    TooManyRequests,
    /// Structured field errors
    Validation,
    /// Database deadlock
    Deadlock,
    /// Database unavailable
    Connection,
    /// Unclassified failure
    Internal,
    /// Shutdown in progress or dependency down
    ServiceUnavailable,
}

impl ErrorKind {
    /// HTTP status code for this kind
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Config => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::DuplicateEntry => StatusCode::CONFLICT,
            Self::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::Deadlock => StatusCode::CONFLICT,
            Self::Connection => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Wire name emitted in the `type` field of error responses
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Config => "ConfigError",
            Self::BadRequest => "BadRequestError",
            Self::Unauthorized => "UnauthorizedError",
            Self::Forbidden => "ForbiddenError",
            Self::NotFound => "NotFoundError",
            Self::Conflict => "ConflictError",
            Self::DuplicateEntry => "DuplicateEntryError",
            Self::TooManyRequests => "TooManyRequestsError",
            Self::Validation => "ValidationError",
            Self::Deadlock => "DeadlockError",
            Self::Connection => "ConnectionError",
            Self::Internal => "InternalServerError",
            Self::ServiceUnavailable => "ServiceUnavailableError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// A single field failure inside a validation error
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldError {
    /// Dotted path to the offending field (e.g. `body.email`)
    pub field: String,
    /// Human-readable reason
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Main error type for the framework
///
/// Every error carries a kind (status + wire type), a message, optional
/// structured details, and an optional cause description.
#[derive(Debug, Error)]
#[error("{}: {}{}", .kind.type_name(), .message, cause_suffix(.cause))]
pub struct Error {
    kind: ErrorKind,
    message: String,
    details: Option<serde_json::Value>,
    cause: Option<String>,
    trace: Option<String>,
}

fn cause_suffix(cause: &Option<String>) -> String {
    match cause {
        Some(cause) => format!(" (caused by: {})", cause),
        None => String::new(),
    }
}

impl Error {
    /// Create an error of an arbitrary kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let trace = if kind.status().is_server_error() && stack_capture_enabled() {
            Some(std::backtrace::Backtrace::force_capture().to_string())
        } else {
            None
        };
        Self {
            kind,
            message: message.into(),
            details: None,
            cause: None,
            trace,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn duplicate_entry(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DuplicateEntry, message)
    }

    /// Rate-limit error; `retry_after` lands in `details.retryAfter` (seconds)
    pub fn too_many_requests(message: impl Into<String>, retry_after: Option<u64>) -> Self {
        let mut err = Self::new(ErrorKind::TooManyRequests, message);
        if let Some(secs) = retry_after {
            err.details = Some(serde_json::json!({ "retryAfter": secs }));
        }
        err
    }

    /// Structured validation failure
    pub fn validation(fields: Vec<FieldError>) -> Self {
        let details = serde_json::to_value(&fields).unwrap_or(serde_json::Value::Null);
        let mut err = Self::new(ErrorKind::Validation, "Request validation failed");
        err.details = Some(details);
        err
    }

    pub fn deadlock(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Deadlock, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    /// Attach structured details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach an underlying cause description
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&serde_json::Value> {
        self.details.as_ref()
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::internal(format!("I/O error: {}", err))
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::config(err.to_string())
    }
}

/// Recognizer for database driver errors
///
/// Translates driver failure categories into the framework taxonomy before
/// they reach the terminal handler.
impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        let message = err.message().to_string();
        match err.kind() {
            DriverErrorKind::UniqueViolation => Error::duplicate_entry(message),
            DriverErrorKind::Deadlock => Error::deadlock(message),
            DriverErrorKind::ConnectionLost | DriverErrorKind::PoolClosed => {
                Error::connection(message)
            }
            DriverErrorKind::Timeout => Error::connection(message),
            DriverErrorKind::Configuration => Error::config(message),
            DriverErrorKind::Other => Error::internal(message),
        }
    }
}

// ============================================================================
// Response rendering
// ============================================================================

/// Process-wide response formatting flags, set once at bootstrap
#[derive(Debug, Clone, Copy)]
pub struct ErrorFormat {
    /// Emit the captured trace on 5xx responses
    pub include_stack: bool,
    /// Production mode suppresses traces regardless of the flag
    pub production: bool,
}

impl Default for ErrorFormat {
    fn default() -> Self {
        Self {
            include_stack: false,
            production: true,
        }
    }
}

static ERROR_FORMAT: once_cell::sync::OnceCell<ErrorFormat> = once_cell::sync::OnceCell::new();

/// Install the response format. Later calls are ignored (first writer wins).
pub fn set_error_format(format: ErrorFormat) {
    let _ = ERROR_FORMAT.set(format);
}

fn error_format() -> ErrorFormat {
    ERROR_FORMAT.get().copied().unwrap_or_default()
}

fn stack_capture_enabled() -> bool {
    let fmt = error_format();
    fmt.include_stack && !fmt.production
}

/// Inner payload of an error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub timestamp: String,
}

/// Error response envelope: `{"error": {...}}`
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Marker stored in response extensions so upstream middleware (notably the
/// transaction wrapper) can detect a failed request without re-parsing the body.
#[derive(Debug, Clone, Copy)]
pub struct ErrorMarker {
    pub kind: ErrorKind,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(
                kind = %self.kind,
                status = status.as_u16(),
                "request failed: {}",
                self.message
            );
        } else {
            tracing::warn!(
                kind = %self.kind,
                status = status.as_u16(),
                "request rejected: {}",
                self.message
            );
        }

        let fmt = error_format();
        // 4xx never carries a trace; 5xx only outside production and when opted in
        let stack = if status.is_server_error() && fmt.include_stack && !fmt.production {
            self.trace.clone()
        } else {
            None
        };

        let body = ErrorResponse {
            error: ErrorBody {
                message: self.message.clone(),
                error_type: self.kind.type_name().to_string(),
                status_code: status.as_u16(),
                details: self.details.clone(),
                stack,
                timestamp: Utc::now().to_rfc3339(),
            },
        };

        let mut response = (status, Json(body)).into_response();
        response.extensions_mut().insert(ErrorMarker { kind: self.kind });
        response
    }
}

/// Map any unrecognized error into the taxonomy
pub fn internal_from(err: impl fmt::Display) -> Error {
    Error::internal(err.to_string())
}
