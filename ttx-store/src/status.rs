//! Process-local status notifications
//!
//! Listeners register a bounded `mpsc` sender per transaction ID. [`StatusSupport::notify`]
//! snapshots the senders under the read lock and delivers outside it, so a
//! slow listener never blocks registration or removal of others.
//!
//! Delivery is best effort and at most once: a listener that is not registered
//! when `notify` takes its snapshot misses the event for good.

use crate::types::StatusEvent;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Listener registry keyed by transaction ID
#[derive(Debug, Default)]
pub struct StatusSupport {
    listeners: RwLock<HashMap<String, Vec<mpsc::Sender<StatusEvent>>>>,
}

impl StatusSupport {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for events of `tx_id`
    pub fn add_status_listener(&self, tx_id: &str, listener: mpsc::Sender<StatusEvent>) {
        self.listeners
            .write()
            .entry(tx_id.to_string())
            .or_default()
            .push(listener);
    }

    /// Remove `listener` from `tx_id`; the entry goes away with its last listener
    pub fn delete_status_listener(&self, tx_id: &str, listener: &mpsc::Sender<StatusEvent>) {
        let mut listeners = self.listeners.write();
        if let Some(registered) = listeners.get_mut(tx_id) {
            registered.retain(|l| !l.same_channel(listener));
            if registered.is_empty() {
                listeners.remove(tx_id);
            }
        }
    }

    /// Number of listeners registered for `tx_id`
    pub fn listener_count(&self, tx_id: &str) -> usize {
        self.listeners.read().get(tx_id).map_or(0, Vec::len)
    }

    /// Deliver `event` to every listener of its transaction
    ///
    /// Waits for room on full channels; listeners whose receiver is gone are skipped.
    pub async fn notify(&self, event: StatusEvent) {
        let snapshot = {
            let listeners = self.listeners.read();
            match listeners.get(&event.tx_id) {
                Some(registered) => registered.clone(),
                None => return,
            }
        };

        tracing::debug!(
            tx_id = %event.tx_id,
            status = %event.status,
            listeners = snapshot.len(),
            "notifying status listeners"
        );

        for listener in snapshot {
            if listener.send(event.clone()).await.is_err() {
                tracing::debug!(tx_id = %event.tx_id, "status listener dropped its receiver");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxStatus;
    use std::sync::Arc;
    use std::time::Duration;

    fn event(tx_id: &str) -> StatusEvent {
        StatusEvent {
            tx_id: tx_id.to_string(),
            status: TxStatus::Confirmed,
            message: "ok".to_string(),
        }
    }

    #[test]
    fn test_add_and_delete_listener() {
        let ss = StatusSupport::new();
        let (tx, _rx) = mpsc::channel(1);

        ss.add_status_listener("tx123", tx.clone());
        assert_eq!(ss.listener_count("tx123"), 1);

        ss.delete_status_listener("tx123", &tx);
        assert_eq!(ss.listener_count("tx123"), 0);
        assert!(ss.listeners.read().get("tx123").is_none());
    }

    #[tokio::test]
    async fn test_notify_delivers_once() {
        let ss = StatusSupport::new();
        let (tx, mut rx) = mpsc::channel(4);
        ss.add_status_listener("tx1", tx.clone());

        ss.notify(event("tx1")).await;

        let got = rx.recv().await.unwrap();
        assert_eq!(got.tx_id, "tx1");
        assert_eq!(got.status, TxStatus::Confirmed);
        assert!(rx.try_recv().is_err());

        ss.delete_status_listener("tx1", &tx);
        tokio::time::timeout(Duration::from_secs(1), ss.notify(event("tx1")))
            .await
            .expect("notify without listeners must not block");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notify_fans_out_per_tx() {
        let ss = StatusSupport::new();
        let (a, mut rx_a) = mpsc::channel(1);
        let (b, mut rx_b) = mpsc::channel(1);
        let (other, mut rx_other) = mpsc::channel(1);
        ss.add_status_listener("tx1", a);
        ss.add_status_listener("tx1", b);
        ss.add_status_listener("tx2", other);

        ss.notify(event("tx1")).await;

        assert_eq!(rx_a.recv().await.unwrap().tx_id, "tx1");
        assert_eq!(rx_b.recv().await.unwrap().tx_id, "tx1");
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_blocked_listener_does_not_block_registration() {
        let ss = Arc::new(StatusSupport::new());
        // capacity 1 and never drained: the second event blocks delivery
        let (slow, _slow_rx) = mpsc::channel(1);
        ss.add_status_listener("tx1", slow);
        ss.notify(event("tx1")).await;

        let notifier = {
            let ss = ss.clone();
            tokio::spawn(async move { ss.notify(event("tx1")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (tx, _rx) = mpsc::channel(1);
        ss.add_status_listener("tx2", tx.clone());
        ss.delete_status_listener("tx2", &tx);
        assert!(!notifier.is_finished());
        notifier.abort();
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_skipped() {
        let ss = StatusSupport::new();
        let (gone, rx) = mpsc::channel(1);
        drop(rx);
        let (live, mut live_rx) = mpsc::channel(1);
        ss.add_status_listener("tx1", gone);
        ss.add_status_listener("tx1", live);

        ss.notify(event("tx1")).await;
        assert!(live_rx.recv().await.is_some());
    }
}
