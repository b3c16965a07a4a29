//! Typed actions of the Apollo lead-search WebSocket.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

/// A request that can be sent over [`WsClient::request`](super::WsClient::request).
pub trait WsAction: Serialize {
    /// Value of the frame's `action` field.
    const ACTION: &'static str;
    /// Shape of the response `data`.
    type Response: DeserializeOwned;
}

/// Break an Apollo search URL into its filter parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AnalyzeRequest {
    pub url: String,
}

impl AnalyzeRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// One parameter found in an Apollo URL.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct UrlParameter {
    pub name: String,
    #[serde(default)]
    pub values: Vec<String>,
    /// Contact filter the parameter maps to, if any.
    #[serde(default)]
    pub mapped_to: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct AnalyzeResponse {
    #[serde(default)]
    pub parameters: Vec<UrlParameter>,
    /// Parameters the backend could not map to a contact filter.
    #[serde(default)]
    pub unmapped: Vec<String>,
}

impl WsAction for AnalyzeRequest {
    const ACTION: &'static str = "analyze";
    type Response = AnalyzeResponse;
}

/// Search contacts matching the filters of an Apollo URL.
///
/// Paginates by offset, or by cursor when `cursor` is set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SearchContactsRequest {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl SearchContactsRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            limit: None,
            offset: None,
            cursor: None,
        }
    }

    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub fn cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct SearchContactsResponse {
    /// Contact records, passed through as returned.
    #[serde(default)]
    pub results: Vec<Value>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

impl WsAction for SearchContactsRequest {
    const ACTION: &'static str = "search_contacts";
    type Response = SearchContactsResponse;
}

/// Count contacts matching an Apollo URL.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CountContactsRequest {
    pub url: String,
}

impl CountContactsRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct CountContactsResponse {
    pub count: u64,
}

impl WsAction for CountContactsRequest {
    const ACTION: &'static str = "count_contacts";
    type Response = CountContactsResponse;
}

/// Fetch the UUIDs of contacts matching an Apollo URL.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GetUuidsRequest {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl GetUuidsRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            limit: None,
        }
    }

    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct GetUuidsResponse {
    #[serde(default)]
    pub uuids: Vec<String>,
    #[serde(default)]
    pub count: u64,
}

impl WsAction for GetUuidsRequest {
    const ACTION: &'static str = "get_uuids";
    type Response = GetUuidsResponse;
}
