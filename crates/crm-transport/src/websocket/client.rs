//! User-facing WebSocket client API.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use super::{
    actions::WsAction,
    actor::{ActorCommand, ConnectionActor},
    config::WsConfig,
    pending::PendingRequestStore,
    protocol::encode_request,
    state::StateListeners,
    types::{ConnectionState, ListenerId, RequestId},
};
use crate::{
    auth::TokenStore,
    error::{TransportError, TransportResult},
};

/// Request/response client over one feature WebSocket.
///
/// Many logical requests share one socket and are matched to their responses
/// by `request_id`, so responses may arrive in any order.
///
/// The client is cheap to clone and can be shared across tasks. The
/// background actor stops when the last clone is dropped.
///
/// # Example
///
/// ```rust,no_run
/// use crm_transport::websocket::{CountContactsRequest, WsClient, WsConfig};
///
/// # async fn run() -> crm_transport::TransportResult<()> {
/// let client = WsClient::new(WsConfig::new("wss://crm.example.com/apollo/ws"), None)?;
/// client.connect().await?;
///
/// let count = client
///     .request(&CountContactsRequest::new("https://app.apollo.io/#/people?page=1"))
///     .await?;
/// println!("{} contacts", count.count);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct WsClient {
    /// Channel to send commands to the actor.
    cmd_tx: mpsc::Sender<ActorCommand>,
    /// Shared pending request store.
    pending: Arc<PendingRequestStore>,
    state_rx: watch::Receiver<ConnectionState>,
    listeners: Arc<StateListeners>,
    config: Arc<WsConfig>,
}

impl std::fmt::Debug for WsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClient")
            .field("url", &self.config.url)
            .field("state", &self.state())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl WsClient {
    /// Create a client and spawn its actor. Does not connect.
    ///
    /// When a token store is given, its access token is appended to the URL
    /// on every connection attempt. Must be called within a Tokio runtime.
    pub fn new(config: WsConfig, tokens: Option<Arc<dyn TokenStore>>) -> TransportResult<Self> {
        config.validate().map_err(TransportError::config)?;

        let config = Arc::new(config);
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let pending = Arc::new(PendingRequestStore::new(config.max_pending_requests));
        let listeners = Arc::new(StateListeners::default());

        let actor = ConnectionActor::new(
            Arc::clone(&config),
            cmd_rx,
            Arc::clone(&pending),
            tokens,
            state_tx,
            Arc::clone(&listeners),
        );
        tokio::spawn(actor.run());

        info!(url = %config.url, "WebSocket client created");

        Ok(Self {
            cmd_tx,
            pending,
            state_rx,
            listeners,
            config,
        })
    }

    /// Open the connection.
    ///
    /// Returns immediately when already connected. Callers that arrive while
    /// an attempt is in flight share its outcome. Re-enables automatic
    /// reconnection after a permanent disconnect.
    pub async fn connect(&self) -> TransportResult<()> {
        if self.state().is_connected() {
            return Ok(());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(ActorCommand::Connect { reply_tx }).await?;
        reply_rx
            .await
            .map_err(|_| TransportError::internal("Connect channel dropped"))?
    }

    /// Close the connection.
    ///
    /// `permanent` rejects every pending request with a connection-closed
    /// error and disables automatic reconnection until the next
    /// [`connect`](Self::connect). Otherwise pending requests are kept and a
    /// later `connect` resumes.
    pub async fn disconnect(&self, permanent: bool) -> TransportResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(ActorCommand::Disconnect {
            permanent,
            reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| TransportError::internal("Disconnect channel dropped"))
    }

    /// Send `action` with `data` and await the correlated response data.
    ///
    /// Fails fast with [`TransportError::NotConnected`] when disconnected or
    /// errored. While connecting, the request is written once the attempt
    /// succeeds.
    pub async fn send(&self, action: &str, data: Value) -> TransportResult<Value> {
        if self.state().rejects_requests() {
            return Err(TransportError::NotConnected);
        }

        let request_id = RequestId::new();
        let frame = encode_request(action, &request_id, &data)?;
        let reply_rx = self
            .pending
            .add(request_id.clone(), action)
            .ok_or_else(|| TransportError::capacity_exceeded("Too many pending requests"))?;

        debug!(request_id = %request_id, action, "Queueing WebSocket request");
        if let Err(e) = self
            .command(ActorCommand::Send {
                request_id: request_id.clone(),
                frame,
            })
            .await
        {
            self.pending.remove(&request_id);
            return Err(e);
        }

        let settled = match self.config.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, reply_rx).await {
                Ok(settled) => settled,
                Err(_) => {
                    self.pending.remove(&request_id);
                    return Err(TransportError::request_timeout(
                        timeout,
                        request_id.to_string(),
                    ));
                }
            },
            None => reply_rx.await,
        };
        settled.map_err(|_| TransportError::internal("Response channel dropped"))?
    }

    /// Send a typed action and decode its typed response.
    pub async fn request<A: WsAction>(&self, request: &A) -> TransportResult<A::Response> {
        let data = serde_json::to_value(request)?;
        let response = self.send(A::ACTION, data).await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Register a callback invoked on every state transition.
    ///
    /// Callbacks run on the actor task and must not block.
    pub fn add_state_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.listeners.add(Arc::new(listener))
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn remove_state_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Client configuration.
    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    async fn command(&self, cmd: ActorCommand) -> TransportResult<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| TransportError::connection_closed(Some("Actor shut down".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    #[test]
    fn test_ws_client_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<WsClient>();
        assert_sync::<WsClient>();
    }

    #[tokio::test]
    async fn test_send_before_connect_fails_fast() {
        let client = WsClient::new(WsConfig::new("ws://127.0.0.1:9/ws"), None).unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let err = client.send("analyze", json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let err = WsClient::new(WsConfig::new("http://example.com"), None).unwrap_err();
        assert!(matches!(err, TransportError::Config { .. }));
    }

    #[tokio::test]
    async fn test_failed_connect_reports_error_state() {
        // Nothing listens on the discard port.
        let config = WsConfig::new("ws://127.0.0.1:9/ws")
            .connect_timeout(Duration::from_secs(2))
            .reconnect_max_attempts(Some(0));
        let client = WsClient::new(config, None).unwrap();

        assert!(client.connect().await.is_err());
        assert_eq!(client.state(), ConnectionState::Error);
        assert!(matches!(
            client.send("analyze", json!({})).await,
            Err(TransportError::NotConnected)
        ));
    }
}
