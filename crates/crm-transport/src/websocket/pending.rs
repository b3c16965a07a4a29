//! Requests written to the socket and still awaiting their response.
//!
//! Keyed by `request_id` in an `scc::HashMap`. Each entry leaves the store
//! exactly once, when it is settled or abandoned.

use serde_json::Value;
use tokio::{sync::oneshot, time::Instant};

use super::types::RequestId;
use crate::error::{TransportError, TransportResult};

/// One caller waiting for a correlated response.
pub struct PendingRequest {
    /// Settles the caller's future.
    pub response_tx: oneshot::Sender<TransportResult<Value>>,
    /// Action the request was sent with.
    pub action: String,
    /// Registration time, for latency logs.
    pub created_at: Instant,
}

impl PendingRequest {
    /// Settle the caller. Returns `false` if the caller stopped waiting.
    pub fn settle(self, result: TransportResult<Value>) -> bool {
        self.response_tx.send(result).is_ok()
    }
}

/// Shared between [`WsClient`](super::WsClient) and the connection actor.
pub struct PendingRequestStore {
    requests: scc::HashMap<RequestId, PendingRequest>,
    max_pending: usize,
}

impl PendingRequestStore {
    /// Store that accepts at most `max_pending` entries.
    pub fn new(max_pending: usize) -> Self {
        Self {
            requests: scc::HashMap::new(),
            max_pending,
        }
    }

    /// Register `id` and return the receiver its outcome is delivered on.
    ///
    /// `None` when the store is full or `id` is already pending.
    pub fn add(
        &self,
        id: RequestId,
        action: impl Into<String>,
    ) -> Option<oneshot::Receiver<TransportResult<Value>>> {
        if !self.has_capacity() {
            return None;
        }

        let (tx, rx) = oneshot::channel();
        let pending = PendingRequest {
            response_tx: tx,
            action: action.into(),
            created_at: Instant::now(),
        };

        if self.requests.insert(id, pending).is_err() {
            return None;
        }

        Some(rx)
    }

    /// Take a pending request out of the store.
    pub fn take(&self, id: &RequestId) -> Option<PendingRequest> {
        self.requests.remove(id).map(|(_, pending)| pending)
    }

    /// Resolve a pending request.
    ///
    /// Returns `true` if the request was found, `false` otherwise.
    pub fn resolve(&self, id: &RequestId, result: TransportResult<Value>) -> bool {
        match self.take(id) {
            Some(pending) => {
                pending.settle(result);
                true
            }
            None => false,
        }
    }

    /// Forget `id` without settling it. Used when the caller gave up.
    pub fn remove(&self, id: &RequestId) -> bool {
        self.requests.remove(id).is_some()
    }

    pub fn has_capacity(&self) -> bool {
        self.requests.len() < self.max_pending
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Reject every pending request with a clone of `error`.
    ///
    /// Returns the number of rejected requests.
    pub fn clear_with_error(&self, error: &TransportError) -> usize {
        let mut ids = Vec::new();
        self.requests.scan(|id, _| ids.push(id.clone()));

        let mut rejected = 0;
        for id in ids {
            if let Some(pending) = self.take(&id) {
                pending.settle(Err(error.clone()));
                rejected += 1;
            }
        }
        rejected
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_add_and_resolve() {
        let store = PendingRequestStore::new(10);
        let id = RequestId::new();

        let rx = store.add(id.clone(), "analyze").unwrap();
        assert_eq!(store.len(), 1);

        assert!(store.resolve(&id, Ok(json!({"ok": true}))));
        assert!(store.is_empty());
        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": true}));
    }

    #[test]
    fn test_capacity_limit() {
        let store = PendingRequestStore::new(3);
        let receivers: Vec<_> = (0..3)
            .map(|_| store.add(RequestId::new(), "a").unwrap())
            .collect();

        assert!(store.add(RequestId::new(), "a").is_none());
        assert!(!store.has_capacity());
        drop(receivers);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let store = PendingRequestStore::new(10);
        let id = RequestId::from("same");
        let _rx = store.add(id.clone(), "a").unwrap();
        assert!(store.add(id, "a").is_none());
    }

    #[test]
    fn test_resolve_nonexistent() {
        let store = PendingRequestStore::new(10);
        assert!(!store.resolve(&RequestId::new(), Ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_clear_with_error_rejects_all() {
        let store = PendingRequestStore::new(10);
        let a = store.add(RequestId::new(), "a").unwrap();
        let b = store.add(RequestId::new(), "b").unwrap();

        let rejected = store.clear_with_error(&TransportError::connection_closed(None));
        assert_eq!(rejected, 2);
        assert!(store.is_empty());
        assert!(matches!(
            a.await.unwrap(),
            Err(TransportError::ConnectionClosed { .. })
        ));
        assert!(matches!(
            b.await.unwrap(),
            Err(TransportError::ConnectionClosed { .. })
        ));
    }
}
