//! Device monitoring
//!
//! ```text
//!   Transport                 DeviceMonitor                Subscribers
//!   enumerate() ──┐      ┌──────────────────────┐
//!                 ├─────▶│ poll tick            │──▶ broadcast<Arc<DeviceSnapshot>>
//!   describe()  ──┘      │ de-dup per slot      │──▶ DeviceRegistry
//!                        │ detach detection     │──▶ EventSink
//!                        └──────────────────────┘
//! ```
//!
//! Each subscriber gets its own bounded buffer. A subscriber that falls
//! behind loses the oldest snapshots; the polling loop never waits for it.

mod poller;

use std::sync::Arc;

use futures_util::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::device::DeviceSnapshot;

pub use poller::DeviceMonitor;

/// Independent view of the snapshot sequence
///
/// Sees every snapshot emitted after it was created. Dropping it and
/// subscribing again restarts the sequence from "now".
pub struct SnapshotSubscriber {
    rx: broadcast::Receiver<Arc<DeviceSnapshot>>,
    dropped: u64,
}

impl SnapshotSubscriber {
    pub(crate) fn new(rx: broadcast::Receiver<Arc<DeviceSnapshot>>) -> Self {
        Self { rx, dropped: 0 }
    }

    /// Next snapshot, or `None` once the monitor is gone
    pub async fn next(&mut self) -> Option<Arc<DeviceSnapshot>> {
        loop {
            match self.rx.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Snapshot subscriber lagged, dropped {skipped} oldest snapshot(s)");
                    self.dropped += skipped;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Snapshot already buffered, without waiting
    pub fn try_next(&mut self) -> Option<Arc<DeviceSnapshot>> {
        loop {
            match self.rx.try_recv() {
                Ok(snapshot) => return Some(snapshot),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    self.dropped += skipped;
                }
                Err(_) => return None,
            }
        }
    }

    /// Snapshots lost to buffer overflow so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Adapt into a `Stream`
    pub fn into_stream(self) -> impl Stream<Item = Arc<DeviceSnapshot>> {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|snapshot| (snapshot, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::device::SlotId;

    fn snap(slot: &str) -> Arc<DeviceSnapshot> {
        Arc::new(DeviceSnapshot::detached(SlotId::new(slot)))
    }

    #[tokio::test]
    async fn test_lagging_subscriber_drops_oldest() {
        let (tx, rx) = broadcast::channel(2);
        let mut sub = SnapshotSubscriber::new(rx);

        for slot in ["a", "b", "c", "d"] {
            tx.send(snap(slot)).unwrap();
        }

        assert_eq!(sub.next().await.unwrap().slot, SlotId::new("c"));
        assert_eq!(sub.next().await.unwrap().slot, SlotId::new("d"));
        assert_eq!(sub.dropped(), 2);
    }

    #[tokio::test]
    async fn test_stream_ends_when_monitor_dropped() {
        let (tx, rx) = broadcast::channel(4);
        let stream = SnapshotSubscriber::new(rx).into_stream();
        tx.send(snap("a")).unwrap();
        drop(tx);

        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
    }
}
