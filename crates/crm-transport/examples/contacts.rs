//! Contacts REST Example
//!
//! Lists contacts page by page through the queued, cached HTTP client.
//!
//! Run with: `CRM_API_URL=http://localhost:8000/api cargo run -p crm-transport --example contacts`
//!
//! Set `CRM_ACCESS_TOKEN` and `CRM_REFRESH_TOKEN` to call protected endpoints.

use std::sync::Arc;

use crm_transport::{
    AuthConfig, AuthenticatedClient, DEFAULT_PAGE_SIZE, ErrorContext, HttpClient, HttpConfig,
    MemoryTokenStore, Page, PageQuery, RequestOptions, TokenPair, TokenStore,
    format_error_message,
};
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct Contact {
    uuid: String,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("crm_transport=debug".parse()?))
        .init();

    let config = HttpConfig::from_env()?;
    println!("Backend: {}", config.base_url);

    let http = HttpClient::new(config)?;

    // Example 1: one page with filters, served from the cache on repeat
    let filters = vec![("country".to_string(), "Germany".to_string())];
    let query = PageQuery::first(DEFAULT_PAGE_SIZE);
    match http
        .fetch_page::<Contact>("/contacts/", &filters, &query)
        .await
    {
        Ok(page) => print_page(&page),
        Err(e) => println!("Listing failed: {}", format_error_message(&e, ErrorContext::General)),
    }
    let again = http
        .request(
            "/contacts/",
            RequestOptions::get()
                .queries(filters.iter().cloned())
                .queries(query.to_params()),
        )
        .await;
    if let Ok(again) = again {
        println!("Second read from cache: {}", again.from_cache);
    }

    // Example 2: every page, capped at three
    match http
        .fetch_all::<Contact>("/contacts/", &filters, DEFAULT_PAGE_SIZE, Some(3))
        .await
    {
        Ok(all) => println!("Fetched {} contacts across pages", all.len()),
        Err(e) => println!("Listing failed: {}", format_error_message(&e, ErrorContext::General)),
    }

    // Example 3: an urgent count jumps ahead of queued work
    let urgent = http.request("/contacts/count/", RequestOptions::get().priority(10));
    let background = http.request("/companies/", RequestOptions::get().priority(1));
    let (urgent, background) = tokio::join!(urgent, background);
    println!(
        "count ok: {}, companies ok: {}",
        urgent.is_ok(),
        background.is_ok()
    );

    // Example 4: authenticated write with token refresh on 401
    if let Ok(access) = std::env::var("CRM_ACCESS_TOKEN") {
        let tokens: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::with_tokens(TokenPair {
            access,
            refresh: std::env::var("CRM_REFRESH_TOKEN").ok(),
        }));
        let client = AuthenticatedClient::new(http.clone(), tokens, AuthConfig::default());
        match client
            .post("/contacts/", &json!({"first_name": "Ada", "last_name": "Lovelace"}))
            .await
        {
            Ok(created) => println!("Created contact: {}", created.data),
            Err(e) => println!("Create failed: {}", format_error_message(&e, ErrorContext::General)),
        }
    }

    let metrics = http.metrics().snapshot();
    println!(
        "sent={} ok={} failed={} cache_hits={} avg={:?}",
        metrics.requests_sent,
        metrics.requests_successful,
        metrics.requests_failed,
        metrics.cache_hits,
        metrics.avg_response_time
    );

    Ok(())
}

fn print_page(page: &Page<Contact>) {
    println!(
        "Page with {} contacts (total: {:?}, more: {})",
        page.results.len(),
        page.count,
        page.has_next()
    );
    for contact in &page.results {
        println!(
            "  {} {} <{}>",
            contact.first_name.as_deref().unwrap_or("-"),
            contact.last_name.as_deref().unwrap_or("-"),
            contact.email.as_deref().unwrap_or("no email")
        );
    }
}
