//! REST client with caching, queuing, timeouts and a single network retry.
//!
//! Every call goes through [`HttpClient::request`]:
//!
//! 1. optional cache invalidation requested by the caller,
//! 2. cache lookup for GET requests,
//! 3. the network call itself, executed through the [`RequestQueue`] or directly,
//! 4. status mapping into [`TransportError`] and cache maintenance on success.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    cache::{CachePattern, ResponseCache, generate_cache_key},
    error::{TransportError, TransportResult},
    metrics::ClientMetrics,
    queue::RequestQueue,
    transport::{Method, ReqwestTransport, Request, Response, Transport},
};

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for endpoints known to be slow, such as aggregate counts.
pub const DEFAULT_SLOW_TIMEOUT: Duration = Duration::from_secs(120);
/// Delay before the single retry of a request that failed at the network level.
pub const DEFAULT_NETWORK_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Header carrying the feature write key on mutating requests.
pub const DEFAULT_WRITE_KEY_HEADER: &str = "X-Contacts-Write-Key";

/// Environment variable holding the API base URL.
pub const ENV_API_URL: &str = "CRM_API_URL";
/// Environment variable overriding the default timeout, in seconds.
pub const ENV_API_TIMEOUT_SECS: &str = "CRM_API_TIMEOUT_SECS";

/// Configuration for the HTTP client.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Base URL all relative paths are joined to
    pub base_url: String,

    /// Default timeout for requests
    pub timeout: Duration,

    /// Timeout for URLs containing one of `slow_path_fragments`
    pub slow_timeout: Duration,

    /// URL fragments that select `slow_timeout`
    pub slow_path_fragments: Vec<String>,

    /// User agent string
    pub user_agent: String,

    /// Default headers to include with all requests
    pub default_headers: HashMap<String, String>,

    /// Header name for the write key
    pub write_key_header: String,

    /// Write key sent on non-GET requests
    pub write_key: Option<String>,

    /// Whether requests go through the queue unless overridden
    pub use_queue: bool,

    /// Whether GET responses are cached unless overridden
    pub use_cache: bool,

    /// Wait before retrying a request that failed with a network error
    pub network_retry_delay: Duration,
}

impl HttpConfig {
    /// Create a new HTTP configuration with defaults.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: DEFAULT_TIMEOUT,
            slow_timeout: DEFAULT_SLOW_TIMEOUT,
            slow_path_fragments: vec!["count".to_string()],
            user_agent: concat!("crm-transport/", env!("CARGO_PKG_VERSION")).to_string(),
            default_headers: HashMap::from([(
                "Accept".to_string(),
                "application/json".to_string(),
            )]),
            write_key_header: DEFAULT_WRITE_KEY_HEADER.to_string(),
            write_key: None,
            use_queue: true,
            use_cache: true,
            network_retry_delay: DEFAULT_NETWORK_RETRY_DELAY,
        }
    }

    /// Create a builder for the HTTP configuration.
    pub fn builder(base_url: impl Into<String>) -> HttpConfigBuilder {
        HttpConfigBuilder::new(base_url)
    }

    /// Load the configuration from `CRM_API_URL` and `CRM_API_TIMEOUT_SECS`.
    pub fn from_env() -> TransportResult<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load the configuration through a variable lookup function.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> TransportResult<Self> {
        let base_url = lookup(ENV_API_URL)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| TransportError::config(format!("{ENV_API_URL} is not set")))?;

        let mut config = Self::new(base_url.trim());
        if let Some(raw) = lookup(ENV_API_TIMEOUT_SECS) {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                TransportError::config(format!("{ENV_API_TIMEOUT_SECS} must be an integer"))
            })?;
            config.timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> TransportResult<()> {
        if self.base_url.is_empty() {
            return Err(TransportError::config("Base URL cannot be empty"));
        }

        if self.timeout.is_zero() || self.slow_timeout.is_zero() {
            return Err(TransportError::config("Timeout cannot be zero"));
        }

        if self.write_key.is_some() && self.write_key_header.is_empty() {
            return Err(TransportError::config("Write key header cannot be empty"));
        }

        url::Url::parse(&self.base_url)
            .map_err(|e| TransportError::config(format!("Invalid base URL: {e}")))?;

        Ok(())
    }

    /// Timeout to apply to a URL when the caller gives none.
    pub fn timeout_for(&self, url: &str) -> Duration {
        if self
            .slow_path_fragments
            .iter()
            .any(|fragment| url.contains(fragment.as_str()))
        {
            self.slow_timeout
        } else {
            self.timeout
        }
    }
}

/// Builder for HTTP configuration.
pub struct HttpConfigBuilder {
    config: HttpConfig,
}

impl HttpConfigBuilder {
    /// Create a new builder.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            config: HttpConfig::new(base_url),
        }
    }

    /// Set the default timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the slow-endpoint timeout.
    #[must_use]
    pub fn slow_timeout(mut self, timeout: Duration) -> Self {
        self.config.slow_timeout = timeout;
        self
    }

    /// Add a URL fragment that selects the slow-endpoint timeout.
    #[must_use]
    pub fn slow_path_fragment(mut self, fragment: impl Into<String>) -> Self {
        self.config.slow_path_fragments.push(fragment.into());
        self
    }

    /// Set the user agent.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Add a default header.
    #[must_use]
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config
            .default_headers
            .insert(name.into(), value.into());
        self
    }

    /// Set the write key and the header that carries it.
    #[must_use]
    pub fn write_key(mut self, header: impl Into<String>, key: impl Into<String>) -> Self {
        self.config.write_key_header = header.into();
        self.config.write_key = Some(key.into());
        self
    }

    /// Route requests through the queue by default.
    #[must_use]
    pub fn use_queue(mut self, enabled: bool) -> Self {
        self.config.use_queue = enabled;
        self
    }

    /// Cache GET responses by default.
    #[must_use]
    pub fn use_cache(mut self, enabled: bool) -> Self {
        self.config.use_cache = enabled;
        self
    }

    /// Set the delay before retrying a network failure.
    #[must_use]
    pub fn network_retry_delay(mut self, delay: Duration) -> Self {
        self.config.network_retry_delay = delay;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TransportResult<HttpConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Per-call options for [`HttpClient::request`].
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    /// HTTP method
    pub method: Method,

    /// Extra headers, merged over the configured defaults
    pub headers: HashMap<String, String>,

    /// Query parameters
    pub query: Vec<(String, String)>,

    /// JSON body
    pub body: Option<Value>,

    /// Explicit timeout, overriding the configured one
    pub timeout: Option<Duration>,

    /// Queue priority, higher runs first
    pub priority: u8,

    /// Override the configured queue usage
    pub use_queue: Option<bool>,

    /// Override the configured cache usage
    pub use_cache: Option<bool>,

    /// Skip the cache lookup but still store the fresh response
    pub skip_cache: bool,

    /// TTL for the stored response
    pub cache_ttl: Option<Duration>,

    /// Invalidate matching cache entries before the call
    pub invalidate_cache: Option<CachePattern>,

    /// Fail on the first network error instead of retrying once
    pub no_retry: bool,

    /// Leave out the feature write key even on writes
    pub omit_write_key: bool,
}

impl RequestOptions {
    /// Options for a GET request.
    pub fn get() -> Self {
        Self::default()
    }

    /// Options for a request with the given method and JSON body.
    pub fn with_body(method: Method, body: Value) -> Self {
        Self {
            method,
            body: Some(body),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn queries<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.query
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    #[must_use]
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn use_queue(mut self, enabled: bool) -> Self {
        self.use_queue = Some(enabled);
        self
    }

    #[must_use]
    pub fn use_cache(mut self, enabled: bool) -> Self {
        self.use_cache = Some(enabled);
        self
    }

    #[must_use]
    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    #[must_use]
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn invalidate_cache(mut self, pattern: impl Into<CachePattern>) -> Self {
        self.invalidate_cache = Some(pattern.into());
        self
    }

    #[must_use]
    pub fn no_retry(mut self) -> Self {
        self.no_retry = true;
        self
    }

    #[must_use]
    pub fn without_write_key(mut self) -> Self {
        self.omit_write_key = true;
        self
    }
}

/// A successful response.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiResponse {
    /// HTTP status (200 for cache hits)
    pub status: u16,

    /// Response headers; empty for cache hits
    pub headers: HashMap<String, String>,

    /// Parsed JSON body, `null` when empty
    pub data: Value,

    /// Whether the response was served from the cache
    pub from_cache: bool,

    /// Network round-trip time; zero for cache hits
    pub duration: Duration,
}

impl ApiResponse {
    fn cached(data: Value) -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            data,
            from_cache: true,
            duration: Duration::ZERO,
        }
    }

    /// Deserialize the body.
    pub fn json<T: DeserializeOwned>(&self) -> TransportResult<T> {
        Ok(T::deserialize(&self.data)?)
    }

    /// Consume the response and deserialize the body.
    pub fn into_json<T: DeserializeOwned>(self) -> TransportResult<T> {
        Ok(serde_json::from_value(self.data)?)
    }
}

/// What to do with the cache once a request succeeds.
struct CachePlan {
    key: String,
    store: bool,
    ttl: Option<Duration>,
}

struct ClientInner {
    config: HttpConfig,
    transport: Arc<dyn Transport>,
    cache: Arc<ResponseCache>,
    queue: RequestQueue,
    metrics: Arc<ClientMetrics>,
}

/// HTTP client for the CRM REST API.
///
/// Cheap to clone; clones share the cache, queue and metrics.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("config", &self.inner.config)
            .field("cache", &self.inner.cache)
            .field("queue", &self.inner.queue)
            .finish()
    }
}

impl HttpClient {
    /// Create a client backed by `reqwest`.
    pub fn new(config: HttpConfig) -> TransportResult<Self> {
        let transport = ReqwestTransport::new(&config.user_agent)?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a client over a custom transport, with its own cache and queue.
    pub fn with_transport(config: HttpConfig, transport: Arc<dyn Transport>) -> TransportResult<Self> {
        Self::with_parts(
            config,
            transport,
            Arc::new(ResponseCache::default()),
            RequestQueue::default(),
        )
    }

    /// Create a client that shares an existing cache and queue.
    pub fn with_parts(
        config: HttpConfig,
        transport: Arc<dyn Transport>,
        cache: Arc<ResponseCache>,
        queue: RequestQueue,
    ) -> TransportResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                cache,
                queue,
                metrics: Arc::new(ClientMetrics::new()),
            }),
        })
    }

    /// Get the client configuration.
    pub fn config(&self) -> &HttpConfig {
        &self.inner.config
    }

    /// The response cache.
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.inner.cache
    }

    /// The request queue.
    pub fn queue(&self) -> &RequestQueue {
        &self.inner.queue
    }

    /// Get client metrics.
    pub fn metrics(&self) -> &ClientMetrics {
        &self.inner.metrics
    }

    /// Resolve a path against the base URL. Absolute URLs pass through.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!(
                "{}/{}",
                self.inner.config.base_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        }
    }

    /// Perform a request through the cache, the queue and the transport.
    pub async fn request(&self, path: &str, options: RequestOptions) -> TransportResult<ApiResponse> {
        let config = &self.inner.config;
        let RequestOptions {
            method,
            headers,
            query,
            body,
            timeout,
            priority,
            use_queue,
            use_cache,
            skip_cache,
            cache_ttl,
            invalidate_cache,
            no_retry,
            omit_write_key,
        } = options;

        if let Some(pattern) = invalidate_cache {
            self.inner.cache.clear_by_pattern(pattern);
        }

        let url = self.url_for(path);
        let key = generate_cache_key(&url, method.as_str(), &query, body.as_ref());
        let cacheable = method == Method::Get && use_cache.unwrap_or(config.use_cache);

        if cacheable && !skip_cache {
            if let Some(data) = self.inner.cache.get(&key) {
                self.inner.metrics.record_cache_hit();
                debug!(%url, "Serving response from cache");
                return Ok(ApiResponse::cached(data));
            }
            self.inner.metrics.record_cache_miss();
        }

        let mut request = Request::new(method, url)
            .headers(config.default_headers.clone())
            .timeout(timeout.unwrap_or_else(|| config.timeout_for(path)));
        if method != Method::Get && !omit_write_key {
            if let Some(write_key) = &config.write_key {
                request = request.header(config.write_key_header.clone(), write_key.clone());
            }
        }
        request = request.headers(headers);
        request.query = query;
        request.body = body;

        let plan = CachePlan {
            key,
            store: cacheable,
            ttl: cache_ttl,
        };
        let inner = Arc::clone(&self.inner);
        let job = move || async move { inner.execute(request, plan, !no_retry).await };

        if use_queue.unwrap_or(config.use_queue) {
            self.inner.queue.enqueue(job, priority).await
        } else {
            job().await
        }
    }

    /// Send a GET request.
    pub async fn get(&self, path: &str) -> TransportResult<ApiResponse> {
        self.request(path, RequestOptions::get()).await
    }

    /// Send a GET request and deserialize the body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> TransportResult<T> {
        self.get(path).await?.into_json()
    }

    /// Send a POST request.
    pub async fn post<B: Serialize>(&self, path: &str, body: &B) -> TransportResult<ApiResponse> {
        self.send_with_body(Method::Post, path, body).await
    }

    /// Send a PUT request.
    pub async fn put<B: Serialize>(&self, path: &str, body: &B) -> TransportResult<ApiResponse> {
        self.send_with_body(Method::Put, path, body).await
    }

    /// Send a PATCH request.
    pub async fn patch<B: Serialize>(&self, path: &str, body: &B) -> TransportResult<ApiResponse> {
        self.send_with_body(Method::Patch, path, body).await
    }

    /// Send a DELETE request.
    pub async fn delete(&self, path: &str) -> TransportResult<ApiResponse> {
        self.request(path, RequestOptions::get().method(Method::Delete))
            .await
    }

    async fn send_with_body<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> TransportResult<ApiResponse> {
        let body = serde_json::to_value(body)?;
        self.request(path, RequestOptions::with_body(method, body))
            .await
    }
}

impl ClientInner {
    async fn execute(
        &self,
        request: Request,
        plan: CachePlan,
        retry: bool,
    ) -> TransportResult<ApiResponse> {
        let method = request.method;
        let url = request.url.clone();

        self.metrics.record_sent();
        let sent = if retry {
            self.send_with_retry(request).await
        } else {
            self.send_once(request).await
        };
        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                self.metrics.record_failure();
                return Err(e);
            }
        };

        if !response.is_success() {
            self.metrics.record_failure();
            warn!(%method, %url, status = response.status, "Request failed");
            return Err(TransportError::http(response.status, &response.body));
        }

        let data = match response.json_value() {
            Ok(data) => data,
            Err(e) => {
                self.metrics.record_failure();
                return Err(e);
            }
        };
        self.metrics.record_success(response.duration);

        if method == Method::Get {
            if plan.store {
                self.cache.set(plan.key, data.clone(), plan.ttl);
            }
        } else {
            self.cache.clear_by_pattern(base_url(&url));
        }

        Ok(ApiResponse {
            status: response.status,
            headers: response.headers,
            data,
            from_cache: false,
            duration: response.duration,
        })
    }

    /// Send once, retrying a single time after a plain network failure.
    async fn send_with_retry(&self, request: Request) -> TransportResult<Response> {
        match self.send_once(request.clone()).await {
            Err(TransportError::Network { message }) => {
                warn!(
                    url = %request.url,
                    error = %message,
                    delay_ms = self.config.network_retry_delay.as_millis() as u64,
                    "Network error, retrying once"
                );
                tokio::time::sleep(self.config.network_retry_delay).await;
                self.send_once(request).await
            }
            other => other,
        }
    }

    async fn send_once(&self, request: Request) -> TransportResult<Response> {
        let timeout = request.timeout.unwrap_or(self.config.timeout);
        let started = tokio::time::Instant::now();
        match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(Ok(response)) if response.duration.is_zero() => {
                Ok(response.with_duration(started.elapsed()))
            }
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout(timeout)),
        }
    }
}

/// URL without its query string, used to invalidate cached reads after a write.
fn base_url(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}
