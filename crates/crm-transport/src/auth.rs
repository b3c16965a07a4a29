//! Bearer-token authentication with transparent refresh.
//!
//! [`AuthenticatedClient`] attaches the stored access token to every request.
//! When the backend answers 401 it refreshes the token once, retries the call
//! once, and otherwise ends the session with [`TransportError::SessionExpired`].

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    error::{ErrorContext, TransportError, TransportResult},
    http::{ApiResponse, HttpClient, RequestOptions},
    transport::Method,
};

/// Default token refresh endpoint.
pub const DEFAULT_REFRESH_PATH: &str = "/auth/token/refresh/";
/// Default login endpoint.
pub const DEFAULT_LOGIN_PATH: &str = "/auth/login/";

/// Access and refresh token pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
}

/// Storage for the session tokens.
///
/// Both tokens are always written and cleared together.
pub trait TokenStore: Send + Sync + fmt::Debug {
    /// Current access token.
    fn access_token(&self) -> Option<String>;

    /// Current refresh token.
    fn refresh_token(&self) -> Option<String>;

    /// Replace both tokens.
    fn set_tokens(&self, tokens: &TokenPair) -> TransportResult<()>;

    /// Remove both tokens.
    fn clear(&self) -> TransportResult<()>;
}

/// In-memory token store.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<Option<TokenPair>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with tokens.
    pub fn with_tokens(tokens: TokenPair) -> Self {
        Self {
            tokens: RwLock::new(Some(tokens)),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn access_token(&self) -> Option<String> {
        self.tokens.read().as_ref().map(|t| t.access.clone())
    }

    fn refresh_token(&self) -> Option<String> {
        self.tokens.read().as_ref().and_then(|t| t.refresh.clone())
    }

    fn set_tokens(&self, tokens: &TokenPair) -> TransportResult<()> {
        *self.tokens.write() = Some(tokens.clone());
        Ok(())
    }

    fn clear(&self) -> TransportResult<()> {
        *self.tokens.write() = None;
        Ok(())
    }
}

/// Token store persisted as a JSON file.
///
/// The file is read once on open and rewritten on every change.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    tokens: RwLock<Option<TokenPair>>,
}

impl FileTokenStore {
    /// Open the store, loading tokens if the file exists.
    ///
    /// A missing file means no session. A corrupt file is ignored with a warning.
    pub fn open(path: impl Into<PathBuf>) -> TransportResult<Self> {
        let path = path.into();
        let tokens = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<TokenPair>(&bytes) {
                Ok(tokens) => Some(tokens),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable token file");
                    None
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(TransportError::config(format!(
                    "Failed to read token file {}: {e}",
                    path.display()
                )));
            }
        };

        Ok(Self {
            path,
            tokens: RwLock::new(tokens),
        })
    }

    /// Location of the token file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn access_token(&self) -> Option<String> {
        self.tokens.read().as_ref().map(|t| t.access.clone())
    }

    fn refresh_token(&self) -> Option<String> {
        self.tokens.read().as_ref().and_then(|t| t.refresh.clone())
    }

    fn set_tokens(&self, tokens: &TokenPair) -> TransportResult<()> {
        let bytes = serde_json::to_vec_pretty(tokens)?;
        let mut guard = self.tokens.write();
        fs::write(&self.path, bytes).map_err(|e| {
            TransportError::internal(format!(
                "Failed to write token file {}: {e}",
                self.path.display()
            ))
        })?;
        *guard = Some(tokens.clone());
        Ok(())
    }

    fn clear(&self) -> TransportResult<()> {
        let mut guard = self.tokens.write();
        *guard = None;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransportError::internal(format!(
                "Failed to remove token file {}: {e}",
                self.path.display()
            ))),
        }
    }
}

/// Authentication endpoints.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Endpoint that exchanges a refresh token for a new access token
    pub refresh_path: String,

    /// Endpoint that exchanges credentials for a token pair
    pub login_path: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            login_path: DEFAULT_LOGIN_PATH.to_string(),
        }
    }
}

impl AuthConfig {
    #[must_use]
    pub fn refresh_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_path = path.into();
        self
    }

    #[must_use]
    pub fn login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    /// Wording context for errors raised by a call to `path`.
    pub fn error_context(&self, path: &str) -> ErrorContext {
        if path.contains(self.login_path.trim_end_matches('/')) {
            ErrorContext::Login
        } else {
            ErrorContext::General
        }
    }
}

#[derive(Deserialize)]
struct RefreshResponse {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
}

/// [`HttpClient`] that authenticates with bearer tokens.
#[derive(Clone, Debug)]
pub struct AuthenticatedClient {
    http: HttpClient,
    tokens: Arc<dyn TokenStore>,
    config: Arc<AuthConfig>,
    refresh_lock: Arc<tokio::sync::Mutex<()>>,
}

impl AuthenticatedClient {
    pub fn new(http: HttpClient, tokens: Arc<dyn TokenStore>, config: AuthConfig) -> Self {
        Self {
            http,
            tokens,
            config: Arc::new(config),
            refresh_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// The wrapped client.
    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    /// The token store.
    pub fn tokens(&self) -> &Arc<dyn TokenStore> {
        &self.tokens
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Whether an access token is present.
    pub fn is_authenticated(&self) -> bool {
        self.tokens.access_token().is_some()
    }

    /// Perform an authenticated request, refreshing the token once on 401.
    pub async fn request(&self, path: &str, options: RequestOptions) -> TransportResult<ApiResponse> {
        let sent_token = self.tokens.access_token();
        let error = match self
            .http
            .request(path, authorize(options.clone(), sent_token.as_deref()))
            .await
        {
            Err(e) if e.is_unauthorized() => e,
            other => return other,
        };

        // Bad credentials, not an expired session
        if self.config.error_context(path) == ErrorContext::Login {
            return Err(error);
        }

        debug!(path, "Received 401, refreshing access token");
        let token = self.refresh_access_token(sent_token.as_deref()).await?;

        match self
            .http
            .request(path, authorize(options, Some(&token)))
            .await
        {
            Err(e) if e.is_unauthorized() => {
                warn!(path, "Still unauthorized after token refresh");
                self.expire_session();
                Err(TransportError::SessionExpired)
            }
            other => other,
        }
    }

    /// Send an authenticated GET request.
    pub async fn get(&self, path: &str) -> TransportResult<ApiResponse> {
        self.request(path, RequestOptions::get()).await
    }

    /// Send an authenticated GET request and deserialize the body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> TransportResult<T> {
        self.get(path).await?.into_json()
    }

    /// Send an authenticated POST request.
    pub async fn post<B: Serialize>(&self, path: &str, body: &B) -> TransportResult<ApiResponse> {
        let body = serde_json::to_value(body)?;
        self.request(path, RequestOptions::with_body(Method::Post, body))
            .await
    }

    /// Send an authenticated PUT request.
    pub async fn put<B: Serialize>(&self, path: &str, body: &B) -> TransportResult<ApiResponse> {
        let body = serde_json::to_value(body)?;
        self.request(path, RequestOptions::with_body(Method::Put, body))
            .await
    }

    /// Send an authenticated PATCH request.
    pub async fn patch<B: Serialize>(&self, path: &str, body: &B) -> TransportResult<ApiResponse> {
        let body = serde_json::to_value(body)?;
        self.request(path, RequestOptions::with_body(Method::Patch, body))
            .await
    }

    /// Send an authenticated DELETE request.
    pub async fn delete(&self, path: &str) -> TransportResult<ApiResponse> {
        self.request(path, RequestOptions::get().method(Method::Delete))
            .await
    }

    /// Exchange credentials for tokens and store them.
    ///
    /// Errors are returned unchanged; format them with [`ErrorContext::Login`].
    pub async fn login<C: Serialize>(&self, credentials: &C) -> TransportResult<TokenPair> {
        let body = serde_json::to_value(credentials)?;
        let response = self
            .http
            .request(
                &self.config.login_path,
                RequestOptions::with_body(Method::Post, body)
                    .use_queue(false)
                    .use_cache(false)
                    .without_write_key(),
            )
            .await?;
        let tokens: TokenPair = response.into_json()?;
        self.tokens.set_tokens(&tokens)?;
        info!("Logged in");
        Ok(tokens)
    }

    /// Drop the session tokens and every cached response.
    pub fn logout(&self) -> TransportResult<()> {
        self.http.cache().clear();
        self.tokens.clear()?;
        info!("Logged out");
        Ok(())
    }

    /// Obtain a fresh access token, single-flighted across concurrent callers.
    ///
    /// `stale` is the token the failed request carried. If the store already
    /// holds a different token, another caller refreshed it and it is reused.
    async fn refresh_access_token(&self, stale: Option<&str>) -> TransportResult<String> {
        let _guard = self.refresh_lock.lock().await;

        if let Some(current) = self.tokens.access_token() {
            if Some(current.as_str()) != stale {
                debug!("Access token already refreshed by another request");
                return Ok(current);
            }
        }

        let Some(refresh) = self.tokens.refresh_token() else {
            warn!("No refresh token available");
            self.expire_session();
            return Err(TransportError::SessionExpired);
        };

        // A failed refresh ends the session; it is never retried.
        let options = RequestOptions::with_body(Method::Post, json!({ "refresh": refresh }))
            .use_queue(false)
            .use_cache(false)
            .no_retry()
            .without_write_key();
        let refreshed = self
            .http
            .request(&self.config.refresh_path, options)
            .await
            .and_then(ApiResponse::into_json::<RefreshResponse>);

        match refreshed {
            Ok(RefreshResponse {
                access,
                refresh: rotated,
            }) => {
                let tokens = TokenPair {
                    access: access.clone(),
                    refresh: rotated.or(Some(refresh)),
                };
                self.tokens.set_tokens(&tokens)?;
                info!("Access token refreshed");
                Ok(access)
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                self.expire_session();
                Err(TransportError::SessionExpired)
            }
        }
    }

    fn expire_session(&self) {
        if let Err(e) = self.tokens.clear() {
            warn!(error = %e, "Failed to clear tokens");
        }
    }
}

fn authorize(options: RequestOptions, token: Option<&str>) -> RequestOptions {
    match token {
        Some(token) => options.header("Authorization", format!("Bearer {token}")),
        None => options,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        error::format_error_message,
        http::HttpConfig,
        transport::{Transport, mock::ScriptedTransport},
    };

    fn tokens(access: &str, refresh: Option<&str>) -> TokenPair {
        TokenPair {
            access: access.to_string(),
            refresh: refresh.map(str::to_string),
        }
    }

    fn client(
        transport: &Arc<ScriptedTransport>,
        store: Arc<dyn TokenStore>,
    ) -> AuthenticatedClient {
        let http = HttpClient::with_transport(
            HttpConfig::new("https://crm.example.com/api"),
            Arc::clone(transport) as Arc<dyn Transport>,
        )
        .unwrap();
        AuthenticatedClient::new(http, store, AuthConfig::default())
    }

    fn bearer(request: &crate::transport::Request) -> Option<&str> {
        request.headers.get("Authorization").map(String::as_str)
    }

    #[tokio::test]
    async fn test_attaches_bearer_token() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({"ok": true}));
        let store = Arc::new(MemoryTokenStore::with_tokens(tokens("a1", Some("r1"))));
        let client = client(&transport, store);

        client.get("/me/").await.unwrap();
        assert_eq!(bearer(&transport.requests()[0]), Some("Bearer a1"));
    }

    #[tokio::test]
    async fn test_refreshes_once_and_retries_with_merged_headers() {
        let transport = ScriptedTransport::new();
        transport.push_json(401, json!({"detail": "Token expired"}));
        transport.push_json(200, json!({"access": "a2"}));
        transport.push_json(200, json!({"id": 5}));
        let store = Arc::new(MemoryTokenStore::with_tokens(tokens("a1", Some("r1"))));
        let client = client(&transport, store.clone());

        let response = client
            .request(
                "/contacts/5/",
                RequestOptions::get().header("X-Trace", "abc").use_cache(false),
            )
            .await
            .unwrap();
        assert_eq!(response.data, json!({"id": 5}));

        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[1].url.ends_with(DEFAULT_REFRESH_PATH));
        assert_eq!(requests[1].body, Some(json!({"refresh": "r1"})));
        assert_eq!(bearer(&requests[1]), None);
        assert_eq!(bearer(&requests[2]), Some("Bearer a2"));
        assert_eq!(requests[2].headers.get("X-Trace"), Some(&"abc".to_string()));

        // refresh token kept when the backend does not rotate it
        assert_eq!(store.access_token().as_deref(), Some("a2"));
        assert_eq!(store.refresh_token().as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_rotated_refresh_token_is_stored() {
        let transport = ScriptedTransport::new();
        transport.push_json(401, json!({}));
        transport.push_json(200, json!({"access": "a2", "refresh": "r2"}));
        transport.push_json(200, json!([]));
        let store = Arc::new(MemoryTokenStore::with_tokens(tokens("a1", Some("r1"))));
        let client = client(&transport, store.clone());

        client.get("/contacts/").await.unwrap();
        assert_eq!(store.refresh_token().as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_failed_refresh_expires_session() {
        let transport = ScriptedTransport::new();
        transport.push_json(401, json!({}));
        transport.push_json(401, json!({"detail": "Token is blacklisted"}));
        let store = Arc::new(MemoryTokenStore::with_tokens(tokens("a1", Some("r1"))));
        let client = client(&transport, store.clone());

        let err = client.get("/contacts/").await.unwrap_err();
        assert!(matches!(err, TransportError::SessionExpired));
        assert_eq!(
            format_error_message(&err, ErrorContext::General),
            "Your session has expired. Please log in again."
        );
        assert_eq!(store.access_token(), None);
        assert_eq!(store.refresh_token(), None);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_refresh_network_error_is_not_retried() {
        let transport = ScriptedTransport::new();
        transport.push_json(401, json!({}));
        transport.push(Err(TransportError::network("reset during refresh")));
        transport.push_json(200, json!({"access": "a2"}));
        transport.push_json(200, json!({"ok": true}));
        let store = Arc::new(MemoryTokenStore::with_tokens(tokens("a1", Some("r1"))));
        let client = client(&transport, store.clone());

        let err = client.get("/contacts/").await.unwrap_err();
        assert!(matches!(err, TransportError::SessionExpired));

        let requests = transport.requests();
        let refresh_calls = requests
            .iter()
            .filter(|r| r.url.ends_with(DEFAULT_REFRESH_PATH))
            .count();
        assert_eq!(refresh_calls, 1);
        assert_eq!(transport.calls(), 2);
        assert_eq!(store.access_token(), None);
    }

    #[tokio::test]
    async fn test_write_key_is_not_sent_to_auth_endpoints() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({"access": "a1", "refresh": "r1"}));
        transport.push_json(401, json!({}));
        transport.push_json(200, json!({"access": "a2"}));
        transport.push_json(201, json!({"id": 1}));
        let http = HttpClient::with_transport(
            HttpConfig::builder("https://crm.example.com/api")
                .write_key("X-Contacts-Write-Key", "secret")
                .build()
                .unwrap(),
            Arc::clone(&transport) as Arc<dyn Transport>,
        )
        .unwrap();
        let client = AuthenticatedClient::new(
            http,
            Arc::new(MemoryTokenStore::new()),
            AuthConfig::default(),
        );

        client
            .login(&json!({"email": "ada@example.com", "password": "pw"}))
            .await
            .unwrap();
        client.post("/contacts/", &json!({"name": "Ada"})).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 4);
        let write_key = |r: &crate::transport::Request| r.headers.get("X-Contacts-Write-Key").cloned();
        assert!(requests[0].url.ends_with(DEFAULT_LOGIN_PATH));
        assert_eq!(write_key(&requests[0]), None);
        assert!(requests[2].url.ends_with(DEFAULT_REFRESH_PATH));
        assert_eq!(write_key(&requests[2]), None);
        assert_eq!(write_key(&requests[1]).as_deref(), Some("secret"));
        assert_eq!(write_key(&requests[3]).as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_missing_refresh_token_expires_without_refresh_call() {
        let transport = ScriptedTransport::new();
        transport.push_json(401, json!({}));
        let store = Arc::new(MemoryTokenStore::with_tokens(tokens("a1", None)));
        let client = client(&transport, store.clone());

        let err = client.get("/contacts/").await.unwrap_err();
        assert!(matches!(err, TransportError::SessionExpired));
        assert_eq!(transport.calls(), 1);
        assert!(!client.is_authenticated());
    }

    #[tokio::test]
    async fn test_second_401_expires_session() {
        let transport = ScriptedTransport::new();
        transport.push_json(401, json!({}));
        transport.push_json(200, json!({"access": "a2"}));
        transport.push_json(401, json!({}));
        let store = Arc::new(MemoryTokenStore::with_tokens(tokens("a1", Some("r1"))));
        let client = client(&transport, store.clone());

        let err = client.get("/contacts/").await.unwrap_err();
        assert!(matches!(err, TransportError::SessionExpired));
        assert_eq!(transport.calls(), 3);
        assert_eq!(store.access_token(), None);
    }

    #[tokio::test]
    async fn test_already_rotated_token_is_reused() {
        let transport = ScriptedTransport::new();
        let store = Arc::new(MemoryTokenStore::with_tokens(tokens("a2", Some("r1"))));
        let client = client(&transport, store);

        let token = client.refresh_access_token(Some("a1")).await.unwrap();
        assert_eq!(token, "a2");
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_login_stores_tokens_and_bad_credentials_are_not_refreshed() {
        let transport = ScriptedTransport::new();
        transport.push_json(401, json!({"detail": "No active account"}));
        transport.push_json(200, json!({"access": "a1", "refresh": "r1"}));
        let store = Arc::new(MemoryTokenStore::new());
        let client = client(&transport, store.clone());
        let credentials = json!({"email": "ada@example.com", "password": "pw"});

        let err = client.login(&credentials).await.unwrap_err();
        assert_eq!(
            format_error_message(&err, client.config().error_context(DEFAULT_LOGIN_PATH)),
            "Invalid email or password."
        );
        assert_eq!(transport.calls(), 1);

        let tokens = client.login(&credentials).await.unwrap();
        assert_eq!(tokens.access, "a1");
        assert_eq!(store.refresh_token().as_deref(), Some("r1"));

        client.logout().unwrap();
        assert!(!client.is_authenticated());
    }

    #[test]
    fn test_file_token_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = FileTokenStore::open(&path).unwrap();
        assert_eq!(store.access_token(), None);
        store.set_tokens(&tokens("a1", Some("r1"))).unwrap();

        let reopened = FileTokenStore::open(&path).unwrap();
        assert_eq!(reopened.access_token().as_deref(), Some("a1"));
        assert_eq!(reopened.refresh_token().as_deref(), Some("r1"));

        reopened.clear().unwrap();
        assert!(!path.exists());
        assert_eq!(FileTokenStore::open(&path).unwrap().access_token(), None);
    }

    #[test]
    fn test_corrupt_token_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, b"not json").unwrap();

        let store = FileTokenStore::open(&path).unwrap();
        assert_eq!(store.access_token(), None);
    }
}
