//! Core transport abstractions and types.

use std::{collections::HashMap, fmt, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{TransportError, TransportResult};

/// HTTP methods used against the CRM backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Upper-case method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for http::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => http::Method::GET,
            Method::Post => http::Method::POST,
            Method::Put => http::Method::PUT,
            Method::Patch => http::Method::PATCH,
            Method::Delete => http::Method::DELETE,
        }
    }
}

/// A fully resolved outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method
    pub method: Method,

    /// Absolute request URL, without query string
    pub url: String,

    /// Request headers
    pub headers: HashMap<String, String>,

    /// Query parameters
    pub query: Vec<(String, String)>,

    /// JSON request body
    pub body: Option<Value>,

    /// Request timeout
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a new request.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            query: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// Create a POST request.
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    /// Add a header, replacing any previous value.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add multiple headers.
    #[must_use]
    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in headers {
            self.headers.insert(name.into(), value.into());
        }
        self
    }

    /// Add a query parameter.
    #[must_use]
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Set the JSON body.
    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Raw response as returned by a [`Transport`].
#[derive(Debug, Clone)]
pub struct Response {
    /// Response status code
    pub status: u16,

    /// Response headers, names lower-cased
    pub headers: HashMap<String, String>,

    /// Response body
    pub body: Bytes,

    /// Round-trip time
    pub duration: Duration,
}

impl Response {
    /// Create a new response.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
            duration: Duration::ZERO,
        }
    }

    /// Check if the response indicates success.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> TransportResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Parse the body as a JSON value. An empty body is `null`.
    pub fn json_value(&self) -> TransportResult<Value> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        self.json()
    }

    /// Get a header value by lower-case name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Set the round-trip duration.
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

/// The seam between the request pipeline and the network.
///
/// Implementations return non-2xx responses as [`Response`]s; status
/// interpretation belongs to the caller. Transport failures must already be
/// normalized into [`TransportError::Network`] or [`TransportError::Timeout`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a request and return a response.
    async fn send(&self, request: Request) -> TransportResult<Response>;
}

/// [`Transport`] backed by a pooled `reqwest` client.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a transport with the given user agent.
    pub fn new(user_agent: &str) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| TransportError::config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wrap an existing `reqwest` client.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: Request) -> TransportResult<Response> {
        let started = Instant::now();
        let timeout = request.timeout;

        let mut builder = self
            .client
            .request(request.method.into(), &request.url)
            .query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let map_err = |e: reqwest::Error| match timeout {
            Some(duration) if e.is_timeout() => TransportError::timeout(duration),
            _ => TransportError::from(e),
        };

        let response = builder.send().await.map_err(map_err)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(map_err)?;
        let duration = started.elapsed();

        debug!(
            method = %request.method,
            url = %request.url,
            status,
            elapsed_ms = duration.as_millis() as u64,
            "HTTP response received"
        );

        Ok(Response {
            status,
            headers,
            body,
            duration,
        })
    }
}
