//! Registry of connection state callbacks.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

use super::types::{ConnectionState, ListenerId};

type Listener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Callbacks invoked by the actor on every state transition.
#[derive(Default)]
pub(crate) struct StateListeners {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
}

impl StateListeners {
    pub(crate) fn add(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Invoke every listener. Callbacks run outside the lock so they may
    /// add or remove listeners.
    pub(crate) fn notify(&self, state: ConnectionState) {
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(state);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.listeners.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_notify_remove() {
        let listeners = StateListeners::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let id = listeners.add(Arc::new(move |state| sink.lock().push(state)));
        listeners.notify(ConnectionState::Connecting);
        listeners.notify(ConnectionState::Connected);

        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        listeners.notify(ConnectionState::Error);

        assert_eq!(
            *seen.lock(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert_eq!(listeners.len(), 0);
    }
}
