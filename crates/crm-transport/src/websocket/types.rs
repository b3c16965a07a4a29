//! Core type definitions for the WebSocket client.

use std::fmt;

/// Unique identifier for request-response correlation.
/// Uses ULID for lexicographically sortable, unique IDs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a new unique request ID using ULID.
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a WebSocket client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Opening handshake in progress.
    Connecting,
    /// Socket open and ready for traffic.
    Connected,
    /// No socket, either initially, after a close, or after `disconnect`.
    #[default]
    Disconnected,
    /// The last connection attempt or the socket itself failed.
    Error,
}

impl ConnectionState {
    /// Check if the connection is ready for traffic.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether a request sent now fails immediately with `NotConnected`.
    pub fn rejects_requests(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Handle returned by `add_state_listener`, used to remove the listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);
