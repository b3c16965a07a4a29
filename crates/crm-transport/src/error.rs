//! Error handling for the request orchestration layer.
//!
//! Every failure that reaches application code is a [`TransportError`]. Its
//! [`ErrorKind`] places it in the small taxonomy pages care about (network,
//! timeout, HTTP status, WebSocket connection, queue cleared, generic), and
//! [`format_error_message`] turns it into one short sentence for the user.

use std::{collections::BTreeMap, time::Duration};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// The main result type used throughout the crate.
pub type TransportResult<T> = Result<T, TransportError>;

/// Comprehensive error type for all transport operations.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The backend could not be reached (DNS, connect, reset).
    #[error("Network error: {message}")]
    Network { message: String },

    /// The request deadline elapsed.
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// The backend answered with a non-2xx status.
    #[error("HTTP error: status={status}, message={}", .body.summary())]
    Http { status: u16, body: ApiErrorBody },

    /// The access token could not be refreshed; stored tokens were cleared.
    #[error("Session expired")]
    SessionExpired,

    /// Socket-level WebSocket failure.
    #[error("WebSocket error: {message}")]
    WebSocket { message: String },

    /// The WebSocket connection closed while the request was pending.
    #[error("Connection closed: {}", .reason.as_deref().unwrap_or("no reason"))]
    ConnectionClosed { reason: Option<String> },

    /// A WebSocket request was attempted without an open connection.
    #[error("WebSocket is not connected")]
    NotConnected,

    /// The backend answered a WebSocket request with `status: error`.
    #[error("Remote error [{}]: {message}", .code.as_deref().unwrap_or("unknown"))]
    Remote {
        message: String,
        code: Option<String>,
    },

    /// A WebSocket request exceeded its configured timeout.
    #[error("Request {request_id} timed out after {duration:?}")]
    RequestTimeout {
        duration: Duration,
        request_id: String,
    },

    /// Too many in-flight WebSocket requests.
    #[error("Capacity exceeded: {message}")]
    CapacityExceeded { message: String },

    /// The queued request was cancelled by [`RequestQueue::clear`](crate::queue::RequestQueue::clear).
    #[error("Request queue cleared")]
    QueueCleared,

    /// Serialization/deserialization errors.
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Configuration errors.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Internal errors (should not happen in normal operation).
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket {
            message: e.to_string(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            // reqwest does not report the deadline it hit
            Self::Timeout {
                duration: Duration::ZERO,
            }
        } else if e.is_connect() || e.is_request() {
            Self::network(e.to_string())
        } else if e.is_builder() {
            Self::config(e.to_string())
        } else {
            Self::network(e.to_string())
        }
    }
}

impl TransportError {
    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create an HTTP status error from a status code and raw response body.
    pub fn http(status: u16, body: &[u8]) -> Self {
        Self::Http {
            status,
            body: ApiErrorBody::parse(body),
        }
    }

    /// Create a WebSocket error.
    pub fn websocket(message: impl Into<String>) -> Self {
        Self::WebSocket {
            message: message.into(),
        }
    }

    /// Create a connection-closed error.
    pub fn connection_closed(reason: Option<String>) -> Self {
        Self::ConnectionClosed { reason }
    }

    /// Create a remote (backend-reported) error.
    pub fn remote(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Remote {
            message: message.into(),
            code,
        }
    }

    /// Create a request-timeout error.
    pub fn request_timeout(duration: Duration, request_id: impl Into<String>) -> Self {
        Self::RequestTimeout {
            duration,
            request_id: request_id.into(),
        }
    }

    /// Create a capacity-exceeded error.
    pub fn capacity_exceeded(message: impl Into<String>) -> Self {
        Self::CapacityExceeded {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Taxonomy bucket of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::Network,
            Self::Timeout { .. } | Self::RequestTimeout { .. } => ErrorKind::Timeout,
            Self::Http { .. } | Self::SessionExpired => ErrorKind::HttpStatus,
            Self::WebSocket { .. } | Self::ConnectionClosed { .. } | Self::NotConnected => {
                ErrorKind::WebSocketConnection
            }
            Self::QueueCleared => ErrorKind::QueueCleared,
            Self::Remote { .. }
            | Self::CapacityExceeded { .. }
            | Self::Serialization { .. }
            | Self::Config { .. }
            | Self::Internal { .. } => ErrorKind::Generic,
        }
    }

    /// HTTP status code, if this error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::SessionExpired => Some(401),
            _ => None,
        }
    }

    /// Whether retrying the same call later could succeed.
    ///
    /// Network, timeout, 5xx and socket failures are retryable; 4xx are not.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::WebSocketConnection => true,
            ErrorKind::HttpStatus => self.status().is_some_and(|s| s >= 500),
            ErrorKind::QueueCleared | ErrorKind::Generic => false,
        }
    }

    /// Whether this is an authentication failure (401).
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Http { status: 401, .. })
    }
}

/// Error taxonomy surfaced to application code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport unreachable.
    Network,
    /// Deadline exceeded.
    Timeout,
    /// 4xx/5xx response.
    HttpStatus,
    /// Socket-level WebSocket failure.
    WebSocketConnection,
    /// Explicit administrative cancellation.
    QueueCleared,
    /// Anything else.
    Generic,
}

/// Structured error body extracted from common API error shapes.
///
/// Recognizes `detail`, `message`, `error`, `non_field_errors` and per-field
/// arrays of strings (`{"email": ["Enter a valid email."]}`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApiErrorBody {
    /// Top-level message (`detail`, `message` or `error`).
    pub message: Option<String>,
    /// Field name to validation messages.
    pub field_errors: BTreeMap<String, Vec<String>>,
    /// Messages not tied to one field.
    pub non_field_errors: Vec<String>,
    /// Raw body text, kept for logging.
    pub raw: Option<String>,
}

#[derive(Deserialize)]
struct RawErrorBody {
    #[serde(default)]
    detail: Option<Value>,
    #[serde(default)]
    message: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    non_field_errors: Option<Value>,
    #[serde(flatten)]
    rest: BTreeMap<String, Value>,
}

impl ApiErrorBody {
    /// Parse a raw response body. Never fails; unknown shapes keep only `raw`.
    pub fn parse(body: &[u8]) -> Self {
        let raw = (!body.is_empty()).then(|| String::from_utf8_lossy(body).into_owned());

        let Ok(parsed) = serde_json::from_slice::<RawErrorBody>(body) else {
            return Self {
                raw,
                ..Self::default()
            };
        };

        let message = [parsed.detail, parsed.message, parsed.error]
            .into_iter()
            .flatten()
            .find_map(|v| first_string(&v));

        let non_field_errors = parsed
            .non_field_errors
            .map(|v| string_list(&v))
            .unwrap_or_default();

        let field_errors = parsed
            .rest
            .into_iter()
            .filter_map(|(field, value)| {
                let messages = string_list(&value);
                (!messages.is_empty()).then_some((field, messages))
            })
            .collect();

        Self {
            message,
            field_errors,
            non_field_errors,
            raw,
        }
    }

    /// First field-level error as `"field: message"`.
    pub fn first_field_error(&self) -> Option<String> {
        self.field_errors
            .iter()
            .find_map(|(field, msgs)| msgs.first().map(|m| format!("{field}: {m}")))
    }

    /// Best single-line description of the body.
    pub fn summary(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.non_field_errors.first().cloned())
            .or_else(|| self.first_field_error())
            .or_else(|| self.raw.clone())
            .unwrap_or_default()
    }
}

fn first_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(first_string),
        _ => None,
    }
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect(),
        _ => Vec::new(),
    }
}

/// Context a call was made in; changes the wording of auth failures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorContext {
    /// Any call made with an existing session.
    #[default]
    General,
    /// The login call itself.
    Login,
}

/// Map an error to one short, non-technical sentence.
pub fn format_error_message(error: &TransportError, context: ErrorContext) -> String {
    match error {
        TransportError::Network { .. } => {
            "Unable to reach the server. Please check your connection and try again.".to_string()
        }
        TransportError::Timeout { .. } | TransportError::RequestTimeout { .. } => {
            "The request took too long. Please try again.".to_string()
        }
        TransportError::SessionExpired => session_message(context),
        TransportError::Http { status, body } => match *status {
            401 => session_message(context),
            400 | 422 => body
                .first_field_error()
                .or_else(|| body.non_field_errors.first().cloned())
                .or_else(|| body.message.clone())
                .unwrap_or_else(|| "Please check the information you entered.".to_string()),
            403 => "You do not have permission to perform this action.".to_string(),
            404 => "The requested item could not be found.".to_string(),
            409 => body
                .message
                .clone()
                .unwrap_or_else(|| "This item conflicts with an existing record.".to_string()),
            429 => "Too many requests. Please wait a moment and try again.".to_string(),
            s if s >= 500 => "The server encountered an error. Please try again later.".to_string(),
            _ => body
                .message
                .clone()
                .unwrap_or_else(|| "The request could not be completed.".to_string()),
        },
        TransportError::WebSocket { .. }
        | TransportError::ConnectionClosed { .. }
        | TransportError::NotConnected => {
            "Lost connection to the live service. Reconnecting may help.".to_string()
        }
        TransportError::Remote { message, .. } => message.clone(),
        TransportError::QueueCleared => "The request was cancelled.".to_string(),
        TransportError::CapacityExceeded { .. }
        | TransportError::Serialization { .. }
        | TransportError::Config { .. }
        | TransportError::Internal { .. } => {
            "An unexpected error occurred. Please try again.".to_string()
        }
    }
}

fn session_message(context: ErrorContext) -> String {
    match context {
        ErrorContext::Login => "Invalid email or password.".to_string(),
        ErrorContext::General => "Your session has expired. Please log in again.".to_string(),
    }
}
