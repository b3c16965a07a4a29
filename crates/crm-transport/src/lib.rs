//! # CRM Transport
//!
//! Client-side request orchestration for the CRM backend.
//!
//! Every page of the dashboard talks to the backend through this layer. It
//! keeps the REST API from seeing more than one request at a time, avoids
//! redundant reads and multiplexes feature requests over WebSockets.
//!
//! ## Features
//!
//! - **Request Queue**: one request in flight at a time, served by priority
//!   then arrival order
//! - **Response Cache**: TTL cache of successful GET responses, invalidated
//!   on writes
//! - **HTTP Client**: cache and queue composed around a pluggable
//!   [`Transport`], with bearer-token refresh in [`AuthenticatedClient`]
//! - **WebSocket Client**: request/response correlation by `request_id`,
//!   connection state tracking and reconnection with backoff
//! - **Pagination**: offset and cursor pages over list endpoints
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use crm_transport::{
//!     AuthConfig, AuthenticatedClient, FileTokenStore, HttpClient, HttpConfig, RequestOptions,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HttpConfig::builder("https://crm.example.com/api")
//!         .timeout(std::time::Duration::from_secs(30))
//!         .build()?;
//!     let tokens = Arc::new(FileTokenStore::open("tokens.json")?);
//!     let client = AuthenticatedClient::new(HttpClient::new(config)?, tokens, AuthConfig::default());
//!
//!     let contacts = client
//!         .request("/contacts/", RequestOptions::get().query("search", "acme").priority(5))
//!         .await?;
//!     println!("{}", contacts.data);
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cache;
pub mod error;
pub mod http;
pub mod metrics;
pub mod pagination;
pub mod queue;
mod reconnect;
pub mod transport;
pub mod websocket;

// Re-export commonly used types
pub use auth::{
    AuthConfig, AuthenticatedClient, FileTokenStore, MemoryTokenStore, TokenPair, TokenStore,
};
pub use cache::{CacheConfig, CachePattern, ResponseCache, generate_cache_key};
pub use error::{
    ApiErrorBody, ErrorContext, ErrorKind, TransportError, TransportResult, format_error_message,
};
pub use http::{ApiResponse, HttpClient, HttpConfig, HttpConfigBuilder, RequestOptions};
pub use metrics::{ClientMetrics, MetricsSnapshot};
pub use pagination::{DEFAULT_PAGE_SIZE, Page, PageQuery};
pub use queue::{QueueConfig, QueueStatus, RequestQueue};
pub use transport::{Method, ReqwestTransport, Request, Response, Transport};
pub use websocket::{ConnectionState, WsClient, WsConfig};
