//! Polling loop
//!
//! Polls the transport at a fixed interval and turns raw enumeration results
//! into de-duplicated snapshot events.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SnapshotSubscriber;
use crate::{
    device::{DeviceSnapshot, SlotId},
    events::{Component, EngineEvent, EventKind, EventSink},
    registry::DeviceRegistry,
    transport::DeviceTransport,
};

/// Watches one transport for attach, detach and mode changes
pub struct DeviceMonitor {
    transport: Arc<dyn DeviceTransport>,
    registry: Arc<DeviceRegistry>,
    events: Arc<dyn EventSink>,
    tx: broadcast::Sender<Arc<DeviceSnapshot>>,
    /// Last emitted snapshot per slot; held for the whole tick
    last_emitted: Mutex<BTreeMap<SlotId, Arc<DeviceSnapshot>>>,
    poll_interval: Duration,
}

impl DeviceMonitor {
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        registry: Arc<DeviceRegistry>,
        events: Arc<dyn EventSink>,
        poll_interval: Duration,
        buffer: usize,
    ) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self {
            transport,
            registry,
            events,
            tx,
            last_emitted: Mutex::new(BTreeMap::new()),
            poll_interval,
        }
    }

    /// New independent subscriber starting from the next emission
    pub fn subscribe(&self) -> SnapshotSubscriber {
        SnapshotSubscriber::new(self.tx.subscribe())
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run one poll tick, returning the number of snapshots emitted
    ///
    /// Enumeration failures emit nothing and leave the de-dup state intact,
    /// so the next successful tick resumes where this one left off.
    pub async fn poll_once(&self) -> usize {
        let mut last = self.last_emitted.lock().await;

        let slots = match self.transport.enumerate().await {
            Ok(slots) => slots,
            Err(e) => {
                warn!("Enumeration via {} failed: {e}", self.transport.name());
                self.events.emit(EngineEvent::new(
                    None,
                    Component::Monitor,
                    EventKind::TransportError,
                    format!("enumeration failed: {e}"),
                ));
                return 0;
            }
        };

        let mut present = BTreeSet::new();
        let mut emitted = 0;

        for slot in slots {
            let snapshot = match self.transport.describe(&slot).await {
                Ok(snapshot) => snapshot,
                Err(e) if e.is_disconnect() => {
                    debug!("{slot} vanished between enumerate and describe");
                    continue;
                }
                Err(e) => {
                    // Keep the slot alive; a flaky describe is not a detach
                    debug!("Describe {slot} failed: {e}");
                    present.insert(slot);
                    continue;
                }
            };
            present.insert(slot.clone());

            let previous = last.get(&slot);
            if previous.is_some_and(|p| p.same_state(&snapshot)) {
                continue;
            }

            let kind = if previous.is_some_and(|p| !p.is_detached()) {
                EventKind::DeviceChanged
            } else {
                EventKind::DeviceAttached
            };

            let snapshot = Arc::new(snapshot);
            last.insert(slot, Arc::clone(&snapshot));
            self.emit(snapshot, kind);
            emitted += 1;
        }

        let gone: Vec<SlotId> = last
            .keys()
            .filter(|slot| !present.contains(*slot))
            .cloned()
            .collect();
        for slot in gone {
            last.remove(&slot);
            self.emit(
                Arc::new(DeviceSnapshot::detached(slot)),
                EventKind::DeviceDetached,
            );
            emitted += 1;
        }

        emitted
    }

    fn emit(&self, snapshot: Arc<DeviceSnapshot>, kind: EventKind) {
        let key = self.registry.observe(&snapshot);
        debug!("Snapshot: {snapshot}");

        self.events.emit(EngineEvent::new(
            key.as_ref(),
            Component::Monitor,
            kind,
            snapshot.to_string(),
        ));

        // No subscribers is fine
        let _ = self.tx.send(snapshot);
    }

    /// Poll until `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Device monitor started ({} transport, every {:?})",
            self.transport.name(),
            self.poll_interval
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                _ = shutdown.cancelled() => {
                    info!("Device monitor received shutdown");
                    break;
                }
            }
        }

        info!("Device monitor stopped");
    }

    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(shutdown))
    }
}
