//! WebSocket client with request/response correlation and reconnection.
//!
//! Each feature of the backend (Apollo lead search, LinkedIn lookup, ...)
//! exposes one WebSocket endpoint. A [`WsClient`] keeps one persistent
//! connection to it and multiplexes concurrent requests over that socket,
//! matching every response to its caller by a generated `request_id`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐  ActorCommand   ┌─────────────────┐     ┌──────────────┐
//! │  WsClient   │────────────────▶│ ConnectionActor │────▶│   Backend    │
//! │  (Clone)    │◀── watch ───────│   (Background)  │◀────│   /ws        │
//! └──────┬──────┘                 └───────┬─────────┘     └──────────────┘
//!        │                                │
//!        └──────────────┬─────────────────┘
//!                       ▼
//!            ┌─────────────────────┐
//!            │ PendingRequestStore │
//!            │   (scc::HashMap)    │
//!            └─────────────────────┘
//! ```
//!
//! The caller registers a pending entry and hands the encoded frame to the
//! actor. The actor owns the socket, settles entries as responses arrive and
//! rejects whatever is left when the connection goes away.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──open──▶ Connected
//!                                 │                  │   │
//!                        handshake failure    socket error  clean close
//!                                 ▼                  ▼   ▼
//!                               Error ◀──────────────┘  Disconnected
//!                                 │                         │
//!                                 └──── backoff elapsed ────┴──▶ Connecting
//! ```
//!
//! `disconnect(true)` is the only terminal transition: it cancels
//! reconnection and rejects every pending request until the next
//! [`WsClient::connect`].
//!
//! # Configuration
//!
//! | Setting | Default | Description |
//! |---------|---------|-------------|
//! | `connect_timeout` | 10s | Max duration of the opening handshake |
//! | `request_timeout` | none | Per-request response deadline |
//! | `reconnect_initial_delay` | 1s | First reconnection delay |
//! | `reconnect_max_delay` | 30s | Reconnection delay cap |
//! | `reconnect_max_attempts` | 10 | Attempts before giving up |
//! | `max_pending_requests` | 1000 | Maximum concurrent pending requests |
//!
//! # Errors
//!
//! - [`TransportError::NotConnected`](crate::error::TransportError::NotConnected) - send while disconnected or errored
//! - [`TransportError::Remote`](crate::error::TransportError::Remote) - the backend answered with `status: error`
//! - [`TransportError::ConnectionClosed`](crate::error::TransportError::ConnectionClosed) - connection lost with the request in flight
//! - [`TransportError::RequestTimeout`](crate::error::TransportError::RequestTimeout) - no response within `request_timeout`
//! - [`TransportError::CapacityExceeded`](crate::error::TransportError::CapacityExceeded) - too many pending requests

mod actions;
mod actor;
mod client;
mod config;
mod pending;
mod protocol;
mod state;
mod types;

pub use actions::{
    AnalyzeRequest, AnalyzeResponse, CountContactsRequest, CountContactsResponse,
    GetUuidsRequest, GetUuidsResponse, SearchContactsRequest, SearchContactsResponse,
    UrlParameter, WsAction,
};
pub use client::WsClient;
pub use config::WsConfig;
pub use pending::{PendingRequest, PendingRequestStore};
pub use protocol::{ErrorPayload, ResponseFrame, ResponseStatus, encode_request};
pub use types::{ConnectionState, ListenerId, RequestId};
