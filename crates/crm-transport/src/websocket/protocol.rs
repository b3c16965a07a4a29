//! Wire frames of the feature WebSocket protocol.
//!
//! Request:
//!
//! ```json
//! {"action": "search_contacts", "request_id": "01J...", "data": {...}}
//! ```
//!
//! Response:
//!
//! ```json
//! {"request_id": "01J...", "action": "search_contacts", "status": "success", "data": {...}}
//! {"request_id": "01J...", "action": "search_contacts", "status": "error",
//!  "error": {"message": "Invalid Apollo URL", "code": "invalid_url"}}
//! ```
//!
//! Correlation is solely by `request_id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::RequestId;
use crate::error::{TransportError, TransportResult};

#[derive(Serialize)]
struct RequestFrame<'a> {
    action: &'a str,
    request_id: &'a str,
    data: &'a Value,
}

/// Encode a request frame.
pub fn encode_request(action: &str, request_id: &RequestId, data: &Value) -> TransportResult<String> {
    Ok(serde_json::to_string(&RequestFrame {
        action,
        request_id: request_id.as_str(),
        data,
    })?)
}

/// Outcome reported by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Error payload of a failed response.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub message: Option<String>,
    /// String or numeric code, as sent by the server.
    #[serde(default)]
    pub code: Option<Value>,
}

/// Inbound frame.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ResponseFrame {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub status: Option<ResponseStatus>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: Option<ErrorPayload>,
}

impl ResponseFrame {
    /// Parse an inbound text frame.
    pub fn parse(text: &str) -> TransportResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Settle the frame into the caller's result.
    ///
    /// A frame is an error when `status` is `error` or when it carries an
    /// `error` object without a status.
    pub fn into_result(self) -> TransportResult<Value> {
        let failed = match self.status {
            Some(ResponseStatus::Error) => true,
            Some(ResponseStatus::Success) => false,
            None => self.error.is_some(),
        };
        if !failed {
            return Ok(self.data);
        }

        let payload = self.error.unwrap_or_default();
        let message = payload
            .message
            .or_else(|| {
                self.data
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| "Request failed".to_string());
        let code = payload.code.map(|code| match code {
            Value::String(s) => s,
            other => other.to_string(),
        });
        Err(TransportError::remote(message, code))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_encode_request() {
        let id = RequestId::from("01HZX");
        let text = encode_request("count_contacts", &id, &json!({"url": "u"})).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"action": "count_contacts", "request_id": "01HZX", "data": {"url": "u"}})
        );
    }

    #[test]
    fn test_success_frame() {
        let frame = ResponseFrame::parse(
            r#"{"request_id": "1", "action": "count_contacts", "status": "success", "data": {"count": 42}}"#,
        )
        .unwrap();
        assert_eq!(frame.request_id.as_deref(), Some("1"));
        assert_eq!(frame.into_result().unwrap(), json!({"count": 42}));
    }

    #[test]
    fn test_error_frame() {
        let frame = ResponseFrame::parse(
            r#"{"request_id": "1", "status": "error", "error": {"message": "Invalid Apollo URL", "code": 400}}"#,
        )
        .unwrap();
        match frame.into_result().unwrap_err() {
            TransportError::Remote { message, code } => {
                assert_eq!(message, "Invalid Apollo URL");
                assert_eq!(code.as_deref(), Some("400"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_error_without_payload_uses_fallback_message() {
        let frame = ResponseFrame::parse(r#"{"request_id": "1", "status": "error"}"#).unwrap();
        assert!(matches!(
            frame.into_result(),
            Err(TransportError::Remote { message, code: None }) if message == "Request failed"
        ));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(ResponseFrame::parse("not json").is_err());
    }
}
