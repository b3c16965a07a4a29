//! Settings of a feature WebSocket client.

use std::time::Duration;

use url::Url;

use crate::{
    error::{TransportError, TransportResult},
    reconnect::BackoffConfig,
};

/// Configuration for a feature WebSocket (e.g. `wss://host/apollo/ws`).
#[derive(Clone, Debug)]
pub struct WsConfig {
    /// `ws://` or `wss://` endpoint, without the token.
    pub url: String,
    /// Query parameter that carries the access token.
    pub token_query_param: String,

    /// Delay before the first automatic reconnect.
    pub reconnect_initial_delay: Duration,
    /// Upper bound of the reconnect delay.
    pub reconnect_max_delay: Duration,
    /// Growth of the delay per failed attempt.
    pub reconnect_backoff_factor: f64,
    /// Attempts before giving up; `None` retries forever.
    pub reconnect_max_attempts: Option<u32>,
    /// Share of each delay replaced by a random sample, in `[0, 1]`.
    pub reconnect_jitter: f64,

    /// Response deadline per request; `None` waits until a response or teardown.
    pub request_timeout: Option<Duration>,
    /// Requests allowed to await a response at once.
    pub max_pending_requests: usize,
    /// Buffer between client handles and the connection actor.
    pub command_channel_capacity: usize,
    /// Deadline of the opening handshake.
    pub connect_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token_query_param: "token".to_string(),
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_backoff_factor: 2.0,
            reconnect_max_attempts: Some(10),
            reconnect_jitter: 0.1,
            request_timeout: None,
            max_pending_requests: 1000,
            command_channel_capacity: 64,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl WsConfig {
    /// Defaults for the given endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Query parameter that carries the access token.
    #[must_use]
    pub fn token_query_param(mut self, name: impl Into<String>) -> Self {
        self.token_query_param = name.into();
        self
    }

    #[must_use]
    pub fn reconnect_initial_delay(mut self, delay: Duration) -> Self {
        self.reconnect_initial_delay = delay;
        self
    }

    #[must_use]
    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = delay;
        self
    }

    #[must_use]
    pub fn reconnect_backoff_factor(mut self, factor: f64) -> Self {
        self.reconnect_backoff_factor = factor;
        self
    }

    /// `None` retries forever.
    #[must_use]
    pub fn reconnect_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.reconnect_max_attempts = attempts;
        self
    }

    /// Between 0.0 (no jitter) and 1.0.
    #[must_use]
    pub fn reconnect_jitter(mut self, jitter: f64) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Response deadline applied by [`WsClient::send`](super::WsClient::send).
    #[must_use]
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    #[must_use]
    pub fn command_channel_capacity(mut self, capacity: usize) -> Self {
        self.command_channel_capacity = capacity;
        self
    }

    /// Handshake deadline.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub(crate) fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.reconnect_initial_delay,
            max_delay: self.reconnect_max_delay,
            factor: self.reconnect_backoff_factor,
            jitter: self.reconnect_jitter,
        }
    }

    /// URL to open, with the access token appended when present.
    pub fn connect_url(&self, token: Option<&str>) -> TransportResult<String> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| TransportError::config(format!("Invalid WebSocket URL: {e}")))?;
        if let Some(token) = token {
            url.query_pairs_mut()
                .append_pair(&self.token_query_param, token);
        }
        Ok(url.into())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("URL cannot be empty".to_string());
        }
        let url = Url::parse(&self.url).map_err(|e| format!("Invalid URL: {e}"))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err("URL must use ws:// or wss://".to_string());
        }
        if self.token_query_param.is_empty() {
            return Err("Token query parameter cannot be empty".to_string());
        }
        self.backoff().validate()?;
        if self.request_timeout.is_some_and(|t| t.is_zero()) {
            return Err("Request timeout must be > 0".to_string());
        }
        if self.max_pending_requests == 0 {
            return Err("Max pending requests must be > 0".to_string());
        }
        if self.command_channel_capacity == 0 {
            return Err("Command channel capacity must be > 0".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        Ok(())
    }
}
