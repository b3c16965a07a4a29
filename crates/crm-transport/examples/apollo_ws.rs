//! Apollo WebSocket Example
//!
//! Analyzes an Apollo search URL, counts the matching contacts and pages
//! through them over one multiplexed WebSocket.
//!
//! Run with: `CRM_WS_URL=ws://localhost:8000/apollo/ws CRM_ACCESS_TOKEN=... cargo run -p crm-transport --example apollo_ws`

use std::{sync::Arc, time::Duration};

use crm_transport::{
    DEFAULT_PAGE_SIZE, ErrorContext, MemoryTokenStore, TokenPair, TokenStore, WsClient, WsConfig,
    format_error_message,
    websocket::{AnalyzeRequest, CountContactsRequest, SearchContactsRequest},
};
use tracing_subscriber::EnvFilter;

const APOLLO_URL: &str =
    "https://app.apollo.io/#/people?personTitles[]=ceo&personLocations[]=Germany&page=1";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("crm_transport=debug".parse()?))
        .init();

    let url = std::env::var("CRM_WS_URL").unwrap_or_else(|_| "ws://localhost:8000/apollo/ws".to_string());
    let tokens = std::env::var("CRM_ACCESS_TOKEN").ok().map(|access| {
        Arc::new(MemoryTokenStore::with_tokens(TokenPair {
            access,
            refresh: None,
        })) as Arc<dyn TokenStore>
    });

    let config = WsConfig::new(url).request_timeout(Some(Duration::from_secs(30)));
    let client = WsClient::new(config, tokens)?;
    client.add_state_listener(|state| println!("connection: {state}"));

    if let Err(e) = client.connect().await {
        println!("{}", format_error_message(&e, ErrorContext::General));
        return Ok(());
    }

    // Example 1: the three requests share the socket and may complete in any order
    let analyze = AnalyzeRequest::new(APOLLO_URL);
    let count_request = CountContactsRequest::new(APOLLO_URL);
    let search = SearchContactsRequest::new(APOLLO_URL).limit(DEFAULT_PAGE_SIZE);
    let (analysis, count, first_page) = tokio::join!(
        client.request(&analyze),
        client.request(&count_request),
        client.request(&search),
    );

    match analysis {
        Ok(analysis) => {
            for param in &analysis.parameters {
                println!(
                    "{} = {:?} -> {}",
                    param.name,
                    param.values,
                    param.mapped_to.as_deref().unwrap_or("unmapped")
                );
            }
        }
        Err(e) => println!("analyze failed: {e}"),
    }
    match count {
        Ok(count) => println!("{} matching contacts", count.count),
        Err(e) => println!("count failed: {e}"),
    }

    // Example 2: follow the cursor
    let mut page = first_page?;
    let mut fetched = page.results.len();
    while page.has_more && fetched < 100 {
        let Some(cursor) = page.next_cursor.clone() else {
            break;
        };
        let next = SearchContactsRequest::new(APOLLO_URL)
            .limit(DEFAULT_PAGE_SIZE)
            .cursor(cursor);
        page = client.request(&next).await?;
        fetched += page.results.len();
    }
    println!("Fetched {fetched} contacts");

    client.disconnect(true).await?;
    Ok(())
}
