//! Transfer event fan-out and speed sampling
//!
//! Every persisted mutation of a transfer record publishes a
//! [`TransferEvent`] carrying the full record. Delivery is best-effort:
//! slow subscribers observe a lag marker and coalesce to the latest
//! state; the terminal state is always recoverable from the record store.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;

use muxdrive_core::domain::{Transfer, TransferId};

/// Broadcast buffer per subscriber.
const EVENT_CAPACITY: usize = 256;

/// Minimum interval between speed samples.
const SPEED_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// Snapshot of one transfer, published on every mutation.
#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub transfer: Transfer,
    /// Rolling speed estimate in bytes per second, when known.
    pub speed_bps: Option<u64>,
}

/// Fan-out bus plus per-transfer speed trackers.
pub struct EventBus {
    sender: broadcast::Sender<TransferEvent>,
    speeds: DashMap<TransferId, SpeedSample>,
}

struct SpeedSample {
    at: Instant,
    bytes: u64,
    bps: Option<u64>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sender,
            speeds: DashMap::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.sender.subscribe()
    }

    /// Publishes the record, updating its rolling speed estimate.
    pub fn publish(&self, transfer: Transfer) {
        let speed_bps = self.sample(&transfer);
        // No receivers is fine; events are advisory.
        let _ = self.sender.send(TransferEvent {
            transfer,
            speed_bps,
        });
    }

    /// Drops the tracker once a transfer reaches a terminal state.
    pub fn forget(&self, id: &TransferId) {
        self.speeds.remove(id);
    }

    fn sample(&self, transfer: &Transfer) -> Option<u64> {
        let now = Instant::now();
        let mut entry = self.speeds.entry(transfer.id).or_insert_with(|| SpeedSample {
            at: now,
            bytes: transfer.transferred,
            bps: None,
        });
        let elapsed = now.duration_since(entry.at);
        if elapsed >= SPEED_SAMPLE_INTERVAL {
            let delta = transfer.transferred.saturating_sub(entry.bytes);
            let bps = (delta as f64 / elapsed.as_secs_f64()) as u64;
            entry.at = now;
            entry.bytes = transfer.transferred;
            entry.bps = Some(bps);
        }
        entry.bps
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muxdrive_core::domain::TransferKind;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let t = Transfer::new(TransferKind::FileUpload, "a".into());
        let id = t.id;
        bus.publish(t);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.transfer.id, id);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(Transfer::new(TransferKind::FileDownload, "b".into()));
    }

    #[tokio::test]
    async fn test_speed_sample_needs_interval() {
        let bus = EventBus::new();
        let mut t = Transfer::new(TransferKind::FileUpload, "c".into());
        t.transferred = 0;
        bus.publish(t.clone());

        // Immediately after the first sample there is no rate yet.
        t.transferred = 1024;
        bus.publish(t.clone());

        tokio::time::sleep(Duration::from_millis(300)).await;
        t.transferred = 4096;
        let speed = bus.sample(&t);
        assert!(speed.is_some());
        assert!(speed.unwrap() > 0);
    }
}
