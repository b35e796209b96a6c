// Connectivity state
// Mirrors the host's online/offline signal and publishes transitions

use std::sync::Arc;
use tokio::sync::watch;

/// Shared online/offline flag.
///
/// Starts online. UI surfaces report transitions through the `lifecycle`
/// message; the scheduler listens for the offline → online edge.
#[derive(Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(true);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Update the flag; returns true when the state actually changed
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            if online {
                tracing::info!("Network connection restored");
            } else {
                tracing::warn!("Network connection lost, writes will be queued");
            }
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_online() {
        assert!(NetworkMonitor::new().is_online());
    }

    #[test]
    fn test_set_online_reports_changes_only() {
        let monitor = NetworkMonitor::new();
        assert!(!monitor.set_online(true));
        assert!(monitor.set_online(false));
        assert!(!monitor.is_online());
        assert!(!monitor.set_online(false));
        assert!(monitor.set_online(true));
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let monitor = NetworkMonitor::new();
        let mut rx = monitor.subscribe();

        let clone = monitor.clone();
        clone.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
    }
}
