//! Response cache with per-entry TTL and pattern invalidation.
//!
//! Keys are derived from method, URL, query parameters and body with
//! [`generate_cache_key`]. Expired entries are purged lazily when a lookup
//! encounters them, or eagerly through [`ResponseCache::clear_by_pattern`].

use std::{collections::BTreeMap, fmt, time::Duration};

use regex::Regex;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

/// Default time-to-live for cached responses.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Configuration for the response cache.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// TTL applied when a write does not specify one.
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

impl CacheConfig {
    /// Set the default TTL.
    #[must_use]
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.default_ttl.is_zero() {
            return Err("Default cache TTL must be > 0".to_string());
        }
        Ok(())
    }
}

/// One cached response.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    /// Cached JSON payload.
    pub data: Value,
    /// When the entry was written.
    pub stored_at: Instant,
    /// How long the entry stays fresh.
    pub ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) > self.ttl
    }
}

/// Invalidation pattern: substring or regular expression over cache keys.
#[derive(Clone, Debug)]
pub enum CachePattern {
    /// Matches keys containing the string.
    Substring(String),
    /// Matches keys the expression finds a match in.
    Regex(Regex),
}

impl CachePattern {
    /// Test a key against the pattern.
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Substring(s) => key.contains(s.as_str()),
            Self::Regex(re) => re.is_match(key),
        }
    }
}

impl fmt::Display for CachePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Substring(s) => write!(f, "{s}"),
            Self::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

impl From<&str> for CachePattern {
    fn from(s: &str) -> Self {
        Self::Substring(s.to_string())
    }
}

impl From<String> for CachePattern {
    fn from(s: String) -> Self {
        Self::Substring(s)
    }
}

impl From<Regex> for CachePattern {
    fn from(re: Regex) -> Self {
        Self::Regex(re)
    }
}

/// Build a deterministic cache key for a request.
///
/// The method is upper-cased, the URL is kept verbatim, query parameters are
/// sorted and the body is rendered with object keys in sorted order, so two
/// semantically identical requests always map to the same key.
pub fn generate_cache_key(
    url: &str,
    method: &str,
    params: &[(String, String)],
    body: Option<&Value>,
) -> String {
    let mut key = format!("{} {url}", method.to_ascii_uppercase());

    if !params.is_empty() {
        let mut sorted: Vec<&(String, String)> = params.iter().collect();
        sorted.sort();
        let query = sorted
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        key.push('?');
        key.push_str(&query);
    }

    if let Some(body) = body {
        key.push(' ');
        key.push_str(&canonical_json(body));
    }

    key
}

fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, sort(v))).collect();
                Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

/// Key/value store of cached responses.
///
/// Cheap to share behind an `Arc`; all operations take `&self`.
pub struct ResponseCache {
    entries: scc::HashMap<String, CacheEntry>,
    config: CacheConfig,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("entries", &self.entries.len())
            .field("config", &self.config)
            .finish()
    }
}

impl ResponseCache {
    /// Create an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: scc::HashMap::new(),
            config,
        }
    }

    /// The cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a live entry, purging it if it has expired.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let hit = self.entries.read(key, |_, entry| {
            (!entry.is_expired(now)).then(|| entry.data.clone())
        })?;

        if hit.is_none() {
            self.entries.remove_if(key, |entry| entry.is_expired(now));
            debug!(key, "Cache entry expired");
        }
        hit
    }

    /// Store or overwrite an entry. `ttl` falls back to the configured default.
    pub fn set(&self, key: impl Into<String>, data: Value, ttl: Option<Duration>) {
        let entry = CacheEntry {
            data,
            stored_at: Instant::now(),
            ttl: ttl.unwrap_or(self.config.default_ttl),
        };
        self.entries.upsert(key.into(), entry);
    }

    /// Remove one entry. Returns `true` if it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry whose key matches the pattern.
    ///
    /// Returns the number of removed entries.
    pub fn clear_by_pattern(&self, pattern: impl Into<CachePattern>) -> usize {
        let pattern = pattern.into();
        let mut removed = 0;
        self.entries.retain(|key, _| {
            let matched = pattern.matches(key);
            if matched {
                removed += 1;
            }
            !matched
        });
        if removed > 0 {
            debug!(%pattern, removed, "Invalidated cache entries");
        }
        removed
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let expired = entry.is_expired(now);
            if expired {
                removed += 1;
            }
            !expired
        });
        removed
    }

    /// Remove everything.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_key_is_deterministic() {
        let body = json!({"b": 1, "a": {"y": 2, "x": 1}});
        let reordered = json!({"a": {"x": 1, "y": 2}, "b": 1});

        let k1 = generate_cache_key(
            "/contacts/",
            "get",
            &params(&[("page", "1"), ("search", "acme")]),
            Some(&body),
        );
        let k2 = generate_cache_key(
            "/contacts/",
            "GET",
            &params(&[("search", "acme"), ("page", "1")]),
            Some(&reordered),
        );
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_key_changes_with_each_input() {
        let base = generate_cache_key("/contacts/", "GET", &params(&[("page", "1")]), None);
        assert_ne!(
            base,
            generate_cache_key("/companies/", "GET", &params(&[("page", "1")]), None)
        );
        assert_ne!(
            base,
            generate_cache_key("/contacts/", "POST", &params(&[("page", "1")]), None)
        );
        assert_ne!(
            base,
            generate_cache_key("/contacts/", "GET", &params(&[("page", "2")]), None)
        );
        assert_ne!(
            base,
            generate_cache_key(
                "/contacts/",
                "GET",
                &params(&[("page", "1")]),
                Some(&json!({}))
            )
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_get_and_expiry() {
        let cache = ResponseCache::default();
        cache.set("GET /x", json!({"ok": true}), Some(Duration::from_secs(10)));
        assert_eq!(cache.get("GET /x"), Some(json!({"ok": true})));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("GET /x"), None);
        // expired entry purged on lookup
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_ttl_applies() {
        let cache = ResponseCache::new(CacheConfig::default().default_ttl(Duration::from_secs(60)));
        cache.set("k", json!(1), None);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get("k"), Some(json!(1)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_clear_by_regex_pattern() {
        let cache = ResponseCache::default();
        cache.set("GET /x", json!("v"), None);
        cache.set("GET /y", json!("w"), None);

        let removed = cache.clear_by_pattern(Regex::new(r"/x").unwrap());
        assert_eq!(removed, 1);
        assert_eq!(cache.get("GET /x"), None);
        assert_eq!(cache.get("GET /y"), Some(json!("w")));
    }

    #[test]
    fn test_clear_by_substring_pattern() {
        let cache = ResponseCache::default();
        cache.set("GET /contacts/?page=1", json!([]), None);
        cache.set("GET /contacts/?page=2", json!([]), None);
        cache.set("GET /companies/", json!([]), None);

        assert_eq!(cache.clear_by_pattern("/contacts/"), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_missing_key_is_miss() {
        let cache = ResponseCache::default();
        assert_eq!(cache.get("nope"), None);
        assert!(!cache.remove("nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = ResponseCache::default();
        cache.set("short", json!(1), Some(Duration::from_secs(1)));
        cache.set("long", json!(2), Some(Duration::from_secs(100)));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(
            CacheConfig::default()
                .default_ttl(Duration::ZERO)
                .validate()
                .is_err()
        );
    }
}
