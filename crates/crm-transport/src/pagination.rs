//! Paginated list endpoints.
//!
//! The backend answers list calls in one of two shapes:
//!
//! - offset pages: `{"count": 120, "next": "...?page=3", "previous": ..., "results": [...]}`
//! - cursor pages: `{"results": [...], "next_cursor": "abc", "has_more": true}`
//!
//! [`Page`] accepts both and [`Page::next_query`] produces the query for the
//! following page in the same style.

use serde::{Deserialize, de::DeserializeOwned};
use tracing::debug;

use crate::{
    error::TransportResult,
    http::{HttpClient, RequestOptions},
};

/// Default page size requested by [`HttpClient::fetch_all`] callers that do not care.
pub const DEFAULT_PAGE_SIZE: u32 = 25;

/// Which page to request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageQuery {
    /// One-based page number.
    Offset { page: u32, page_size: u32 },
    /// Opaque cursor; `None` requests the first page.
    Cursor {
        cursor: Option<String>,
        page_size: u32,
    },
}

impl PageQuery {
    /// First offset page.
    pub fn first(page_size: u32) -> Self {
        Self::Offset { page: 1, page_size }
    }

    /// First cursor page.
    pub fn first_cursor(page_size: u32) -> Self {
        Self::Cursor {
            cursor: None,
            page_size,
        }
    }

    /// Query parameters for this page.
    pub fn to_params(&self) -> Vec<(String, String)> {
        match self {
            Self::Offset { page, page_size } => vec![
                ("page".to_string(), page.to_string()),
                ("page_size".to_string(), page_size.to_string()),
            ],
            Self::Cursor { cursor, page_size } => {
                let mut params = vec![("page_size".to_string(), page_size.to_string())];
                if let Some(cursor) = cursor {
                    params.push(("cursor".to_string(), cursor.clone()));
                }
                params
            }
        }
    }

    fn page_size(&self) -> u32 {
        match self {
            Self::Offset { page_size, .. } | Self::Cursor { page_size, .. } => *page_size,
        }
    }
}

/// One page of results.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Page<T> {
    pub results: Vec<T>,

    /// Total number of items (offset pages only)
    #[serde(default)]
    pub count: Option<u64>,

    /// URL of the next page (offset pages only)
    #[serde(default)]
    pub next: Option<String>,

    /// URL of the previous page (offset pages only)
    #[serde(default)]
    pub previous: Option<String>,

    /// Cursor of the next page (cursor pages only)
    #[serde(default)]
    pub next_cursor: Option<String>,

    /// Whether more items follow (cursor pages only)
    #[serde(default)]
    pub has_more: Option<bool>,
}

impl<T> Page<T> {
    /// Whether another page exists.
    pub fn has_next(&self) -> bool {
        match self.has_more {
            Some(has_more) => has_more && self.next_cursor.is_some(),
            None => self.next.is_some() || self.next_cursor.is_some(),
        }
    }

    /// Query for the page after this one, given the query that produced it.
    pub fn next_query(&self, current: &PageQuery) -> Option<PageQuery> {
        if !self.has_next() {
            return None;
        }
        let page_size = current.page_size();
        if let Some(cursor) = &self.next_cursor {
            return Some(PageQuery::Cursor {
                cursor: Some(cursor.clone()),
                page_size,
            });
        }
        match current {
            PageQuery::Offset { page, .. } => Some(PageQuery::Offset {
                page: page + 1,
                page_size,
            }),
            PageQuery::Cursor { .. } => None,
        }
    }
}

impl HttpClient {
    /// Fetch one page of a list endpoint.
    ///
    /// `filters` are sent alongside the paging parameters. The call goes through
    /// the cache and queue like any other GET.
    pub async fn fetch_page<T: DeserializeOwned>(
        &self,
        path: &str,
        filters: &[(String, String)],
        query: &PageQuery,
    ) -> TransportResult<Page<T>> {
        let options = RequestOptions::get()
            .queries(filters.iter().cloned())
            .queries(query.to_params());
        self.request(path, options).await?.into_json()
    }

    /// Fetch pages until exhausted or `max_pages` pages were read.
    pub async fn fetch_all<T: DeserializeOwned>(
        &self,
        path: &str,
        filters: &[(String, String)],
        page_size: u32,
        max_pages: Option<usize>,
    ) -> TransportResult<Vec<T>> {
        let mut items = Vec::new();
        let mut query = Some(PageQuery::first(page_size));
        let mut pages = 0usize;

        while let Some(current) = query {
            if max_pages.is_some_and(|max| pages >= max) {
                debug!(path, pages, "Stopping pagination at page limit");
                break;
            }
            let page: Page<T> = self.fetch_page(path, filters, &current).await?;
            pages += 1;
            query = page.next_query(&current);
            items.extend(page.results);
        }

        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{
        http::HttpConfig,
        transport::{Transport, mock::ScriptedTransport},
    };

    #[test]
    fn test_offset_page_shape() {
        let page: Page<u32> = serde_json::from_value(json!({
            "count": 3,
            "next": "https://crm.example.com/api/contacts/?page=2",
            "previous": null,
            "results": [1, 2]
        }))
        .unwrap();

        assert_eq!(page.count, Some(3));
        assert!(page.has_next());
        assert_eq!(
            page.next_query(&PageQuery::first(2)),
            Some(PageQuery::Offset {
                page: 2,
                page_size: 2
            })
        );
    }

    #[test]
    fn test_cursor_page_shape() {
        let page: Page<u32> = serde_json::from_value(json!({
            "results": [1],
            "next_cursor": "c2",
            "has_more": true
        }))
        .unwrap();
        assert_eq!(
            page.next_query(&PageQuery::first_cursor(10)),
            Some(PageQuery::Cursor {
                cursor: Some("c2".to_string()),
                page_size: 10
            })
        );

        let last: Page<u32> =
            serde_json::from_value(json!({"results": [], "next_cursor": null, "has_more": false}))
                .unwrap();
        assert_eq!(last.next_query(&PageQuery::first_cursor(10)), None);
    }

    #[test]
    fn test_query_params() {
        assert_eq!(
            PageQuery::Offset {
                page: 3,
                page_size: 50
            }
            .to_params(),
            vec![
                ("page".to_string(), "3".to_string()),
                ("page_size".to_string(), "50".to_string())
            ]
        );
        assert_eq!(PageQuery::first_cursor(5).to_params().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_all_follows_pages() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            200,
            json!({"count": 3, "next": "p2", "previous": null, "results": ["a", "b"]}),
        );
        transport.push_json(
            200,
            json!({"count": 3, "next": null, "previous": "p1", "results": ["c"]}),
        );
        let client = HttpClient::with_transport(
            HttpConfig::new("https://crm.example.com/api"),
            Arc::clone(&transport) as Arc<dyn Transport>,
        )
        .unwrap();

        let filters = vec![("search".to_string(), "acme".to_string())];
        let all: Vec<String> = client
            .fetch_all("/contacts/", &filters, 2, None)
            .await
            .unwrap();
        assert_eq!(all, vec!["a", "b", "c"]);

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].query.contains(&("page".to_string(), "2".to_string())));
        assert!(requests[1].query.contains(&("search".to_string(), "acme".to_string())));
    }

    #[tokio::test]
    async fn test_fetch_all_respects_page_limit() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({"next": "p2", "results": [1]}));
        let client = HttpClient::with_transport(
            HttpConfig::new("https://crm.example.com/api"),
            Arc::clone(&transport) as Arc<dyn Transport>,
        )
        .unwrap();

        let all: Vec<u32> = client.fetch_all("/contacts/", &[], 1, Some(1)).await.unwrap();
        assert_eq!(all, vec![1]);
        assert_eq!(transport.calls(), 1);
    }
}
