//! Connection actor for WebSocket lifecycle management.
//!
//! The actor runs in a background task and owns the socket. It handles:
//! - Connection establishment, with concurrent `connect()` callers sharing one attempt
//! - Automatic reconnection with exponential backoff after drops and failures
//! - Routing of inbound frames to pending requests by `request_id`
//! - Commands from the client API, processed strictly in arrival order

use std::{collections::VecDeque, sync::Arc, time::Duration};

use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, watch},
    time::Instant,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, info, warn};

use super::{
    config::WsConfig,
    pending::PendingRequestStore,
    protocol::ResponseFrame,
    state::StateListeners,
    types::{ConnectionState, RequestId},
};
use crate::{
    auth::TokenStore,
    error::{TransportError, TransportResult},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Commands sent from the client API to the connection actor.
pub(crate) enum ActorCommand {
    /// Open the socket if it is not open.
    Connect {
        reply_tx: oneshot::Sender<TransportResult<()>>,
    },
    /// Write a request frame. The request is already registered as pending.
    Send {
        request_id: RequestId,
        frame: String,
    },
    /// Close the socket.
    Disconnect {
        /// Reject pending requests and stop reconnecting.
        permanent: bool,
        reply_tx: oneshot::Sender<()>,
    },
}

/// The connection actor manages a WebSocket connection lifecycle.
pub(crate) struct ConnectionActor {
    config: Arc<WsConfig>,
    cmd_rx: mpsc::Receiver<ActorCommand>,
    pending: Arc<PendingRequestStore>,
    tokens: Option<Arc<dyn TokenStore>>,
    state_tx: watch::Sender<ConnectionState>,
    listeners: Arc<StateListeners>,
    write: Option<WsWrite>,
    read: Option<WsRead>,
    /// Commands received while a connection attempt was in flight.
    deferred: VecDeque<ActorCommand>,
    /// Cleared by a permanent disconnect, set again by `connect()`.
    auto_reconnect: bool,
    reconnect_attempt: u32,
    reconnect_at: Option<Instant>,
    shutdown: bool,
}

impl ConnectionActor {
    pub(crate) fn new(
        config: Arc<WsConfig>,
        cmd_rx: mpsc::Receiver<ActorCommand>,
        pending: Arc<PendingRequestStore>,
        tokens: Option<Arc<dyn TokenStore>>,
        state_tx: watch::Sender<ConnectionState>,
        listeners: Arc<StateListeners>,
    ) -> Self {
        Self {
            config,
            cmd_rx,
            pending,
            tokens,
            state_tx,
            listeners,
            write: None,
            read: None,
            deferred: VecDeque::new(),
            auto_reconnect: true,
            reconnect_attempt: 0,
            reconnect_at: None,
            shutdown: false,
        }
    }

    /// Main entry point: run until every client handle is dropped.
    pub(crate) async fn run(mut self) {
        info!(url = %self.config.url, "Starting WebSocket actor");

        while !self.shutdown {
            if let Some(cmd) = self.deferred.pop_front() {
                self.handle_command(cmd).await;
                continue;
            }

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        info!("All client handles dropped; shutting down actor");
                        self.shutdown = true;
                    }
                },

                msg = next_message(&mut self.read) => {
                    self.handle_inbound(msg).await;
                }

                () = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    info!(attempt = self.reconnect_attempt, "Reconnecting WebSocket");
                    self.attempt_connect(Vec::new()).await;
                }
            }
        }

        self.close_socket().await;
        self.pending
            .clear_with_error(&TransportError::connection_closed(Some(
                "Client dropped".to_string(),
            )));
        info!("WebSocket actor stopped");
    }

    async fn handle_command(&mut self, cmd: ActorCommand) {
        match cmd {
            ActorCommand::Connect { reply_tx } => {
                self.auto_reconnect = true;
                if self.write.is_some() {
                    let _ = reply_tx.send(Ok(()));
                    return;
                }
                // An explicit connect supersedes a scheduled retry.
                self.reconnect_at = None;
                self.reconnect_attempt = 0;
                self.attempt_connect(vec![reply_tx]).await;
            }
            ActorCommand::Send { request_id, frame } => {
                self.handle_send(request_id, frame).await;
            }
            ActorCommand::Disconnect { permanent, reply_tx } => {
                self.handle_disconnect(permanent).await;
                let _ = reply_tx.send(());
            }
        }
    }

    /// Open the socket. Connect commands that arrive meanwhile join `waiters`;
    /// every other command is deferred until the attempt settles.
    async fn attempt_connect(&mut self, mut waiters: Vec<oneshot::Sender<TransportResult<()>>>) {
        self.set_state(ConnectionState::Connecting);

        let token = self.tokens.as_ref().and_then(|t| t.access_token());
        let outcome = match self.config.connect_url(token.as_deref()) {
            Ok(url) => {
                debug!(url = %self.config.url, "Connecting to WebSocket");
                let connect_timeout = self.config.connect_timeout;
                let connect = tokio::time::timeout(connect_timeout, connect_async(url));
                tokio::pin!(connect);

                loop {
                    tokio::select! {
                        res = &mut connect => break match res {
                            Ok(Ok((ws, _response))) => Ok(ws),
                            Ok(Err(e)) => Err(TransportError::from(e)),
                            Err(_) => Err(TransportError::timeout(connect_timeout)),
                        },
                        cmd = self.cmd_rx.recv(), if !self.shutdown => match cmd {
                            Some(ActorCommand::Connect { reply_tx }) => waiters.push(reply_tx),
                            Some(other) => self.deferred.push_back(other),
                            None => self.shutdown = true,
                        },
                    }
                }
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(ws) => {
                let (write, read) = ws.split();
                self.write = Some(write);
                self.read = Some(read);
                self.reconnect_attempt = 0;
                info!(url = %self.config.url, "WebSocket connected");
                self.set_state(ConnectionState::Connected);
                for tx in waiters {
                    let _ = tx.send(Ok(()));
                }
            }
            Err(e) => {
                warn!(url = %self.config.url, error = %e, "WebSocket connection failed");
                self.set_state(ConnectionState::Error);
                for tx in waiters {
                    let _ = tx.send(Err(e.clone()));
                }
                self.schedule_reconnect();
            }
        }
    }

    async fn handle_send(&mut self, request_id: RequestId, frame: String) {
        let Some(write) = self.write.as_mut() else {
            self.pending
                .resolve(&request_id, Err(TransportError::NotConnected));
            return;
        };

        debug!(request_id = %request_id, "Sending WebSocket request");
        if let Err(e) = write.send(Message::Text(frame.into())).await {
            warn!(request_id = %request_id, error = %e, "Failed to send request");
            self.pending
                .resolve(&request_id, Err(TransportError::from(e)));
        }
    }

    async fn handle_disconnect(&mut self, permanent: bool) {
        self.reconnect_at = None;
        self.close_socket().await;

        if permanent {
            self.auto_reconnect = false;
            let rejected = self
                .pending
                .clear_with_error(&TransportError::connection_closed(Some(
                    "Disconnected by client".to_string(),
                )));
            info!(rejected, "WebSocket disconnected permanently");
        } else {
            info!(pending = self.pending.len(), "WebSocket disconnected");
        }

        self.set_state(ConnectionState::Disconnected);
    }

    async fn handle_inbound(&mut self, msg: Option<Result<Message, WsError>>) {
        match msg {
            Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => self.handle_text(text),
                Err(_) => debug!(len = data.len(), "Ignoring non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Ping(data))) => {
                if let Some(write) = self.write.as_mut() {
                    let _ = write.send(Message::Pong(data)).await;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|r| !r.is_empty());
                info!(reason = ?reason, "WebSocket closed by server");
                self.connection_lost(
                    ConnectionState::Disconnected,
                    TransportError::connection_closed(reason),
                );
            }
            Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
            Some(Err(e)) => {
                error!(error = %e, "WebSocket error");
                self.connection_lost(ConnectionState::Error, TransportError::from(e));
            }
            None => {
                info!("WebSocket stream ended");
                self.connection_lost(
                    ConnectionState::Disconnected,
                    TransportError::connection_closed(None),
                );
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let frame = match ResponseFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "Ignoring malformed frame");
                return;
            }
        };

        let Some(request_id) = frame.request_id.clone().map(RequestId::from) else {
            debug!("Ignoring frame without request_id");
            return;
        };

        let Some(pending) = self.pending.take(&request_id) else {
            debug!(request_id = %request_id, "Dropping response for unknown request");
            return;
        };

        if let Some(action) = frame.action.as_deref() {
            if action != pending.action {
                warn!(
                    request_id = %request_id,
                    expected = %pending.action,
                    received = action,
                    "Response action does not match request"
                );
            }
        }

        debug!(
            request_id = %request_id,
            elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
            "Response received"
        );
        pending.settle(frame.into_result());
    }

    /// Tear down after an unexpected close or socket error.
    fn connection_lost(&mut self, state: ConnectionState, error: TransportError) {
        self.write = None;
        self.read = None;
        self.set_state(state);
        let rejected = self.pending.clear_with_error(&error);
        if rejected > 0 {
            warn!(rejected, "Rejected pending requests after connection loss");
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if !self.auto_reconnect || self.shutdown {
            return;
        }
        if let Some(max) = self.config.reconnect_max_attempts {
            if self.reconnect_attempt >= max {
                error!(attempts = self.reconnect_attempt, "Max reconnection attempts exceeded");
                return;
            }
        }

        let delay: Duration = self.config.backoff().delay_for(self.reconnect_attempt);
        self.reconnect_attempt += 1;
        self.reconnect_at = Some(Instant::now() + delay);
        debug!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.reconnect_attempt,
            "Scheduled reconnect"
        );
    }

    async fn close_socket(&mut self) {
        self.read = None;
        if let Some(mut write) = self.write.take() {
            if let Err(e) = write.close().await {
                debug!(error = %e, "Error while closing WebSocket");
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "WebSocket state changed");
            self.listeners.notify(state);
        }
    }
}

/// Next frame from the socket, or never when there is no socket.
async fn next_message(read: &mut Option<WsRead>) -> Option<Result<Message, WsError>> {
    match read {
        Some(read) => read.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
