//! Online/offline signal shared between the host and the offline queue

use std::sync::Arc;

use tokio::sync::watch;

/// A connectivity change reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

/// Broadcasts the current connectivity state.
///
/// Repeated events with the same state do not wake subscribers.
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn handle(&self, event: ConnectivityEvent) {
        self.set_online(event == ConnectivityEvent::Online);
    }

    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_repeated_events_do_not_notify() {
        let connectivity = Connectivity::new(true);
        let mut rx = connectivity.subscribe();

        connectivity.handle(ConnectivityEvent::Online);
        assert!(!rx.has_changed().unwrap());

        connectivity.handle(ConnectivityEvent::Offline);
        connectivity.handle(ConnectivityEvent::Offline);
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
        assert!(!rx.has_changed().unwrap());
        assert!(!connectivity.is_online());
    }
}
