//! Engine event stream
//!
//! Decouples the engine from presentation. Components emit [`EngineEvent`]
//! through an [`EventSink`] without knowing who listens; the UI/log window
//! consumes the stream and decides how to render it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::device::DeviceKey;

/// Component that produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    Monitor,
    Transition,
    Compatibility,
    Workflow,
    Toolbox,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Monitor => "monitor",
            Self::Transition => "transition",
            Self::Compatibility => "compatibility",
            Self::Workflow => "workflow",
            Self::Toolbox => "toolbox",
        };
        f.write_str(name)
    }
}

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    DeviceAttached,
    DeviceChanged,
    DeviceDetached,
    TransportError,
    TransitionRequested,
    TransitionConfirmed,
    TransitionRejected,
    TransitionTimedOut,
    TransitionDeviceGone,
    TransitionCancelled,
    TransitionFailed,
    CapabilityGate,
    RunStarted,
    StepSucceeded,
    StepRetryable,
    StepFatal,
    RunSucceeded,
    RunFailed,
    RunAborted,
    ToolboxSucceeded,
    ToolboxFailed,
}

impl EventKind {
    /// Outcomes a user should notice in the log window
    pub fn is_problem(&self) -> bool {
        matches!(
            self,
            Self::TransportError
                | Self::TransitionRejected
                | Self::TransitionTimedOut
                | Self::TransitionDeviceGone
                | Self::TransitionFailed
                | Self::StepRetryable
                | Self::StepFatal
                | Self::RunFailed
                | Self::RunAborted
                | Self::ToolboxFailed
        )
    }
}

/// One structured event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub timestamp: DateTime<Utc>,
    pub device: Option<DeviceKey>,
    pub component: Component,
    pub kind: EventKind,
    pub detail: String,
}

impl EngineEvent {
    pub fn new(
        device: Option<&DeviceKey>,
        component: Component,
        kind: EventKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            device: device.cloned(),
            component,
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let device = self.device.as_ref().map_or("-", DeviceKey::as_str);
        write!(
            f,
            "{} [{}] {} {:?}: {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            device,
            self.component,
            self.kind,
            self.detail
        )
    }
}

/// Receiver of engine events
///
/// Emission is fire-and-forget and must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// Forwards events onto an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelSink {
    /// Returns the sink and the receiving end for the consumer
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: EngineEvent) {
        // Best-effort: if the consumer is gone, the event is dropped
        let _ = self.tx.send(event);
    }
}

/// Writes events as structured tracing records
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: EngineEvent) {
        let device = event.device.as_ref().map_or("-", DeviceKey::as_str);
        if event.kind.is_problem() {
            warn!(
                device,
                component = %event.component,
                kind = ?event.kind,
                "{}",
                event.detail
            );
        } else if matches!(event.kind, EventKind::DeviceChanged) {
            debug!(
                device,
                component = %event.component,
                kind = ?event.kind,
                "{}",
                event.detail
            );
        } else {
            info!(
                device,
                component = %event.component,
                kind = ?event.kind,
                "{}",
                event.detail
            );
        }
    }
}

/// Fans one event out to several sinks
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<S: EventSink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: EngineEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new();
        let key = DeviceKey::new("ecid-1");
        sink.emit(EngineEvent::new(
            Some(&key),
            Component::Toolbox,
            EventKind::ToolboxSucceeded,
            "exit-to-recovery",
        ));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.device, Some(key));
        assert_eq!(event.kind, EventKind::ToolboxSucceeded);
    }

    #[test]
    fn test_channel_sink_without_consumer_does_not_panic() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(EngineEvent::new(
            None,
            Component::Monitor,
            EventKind::TransportError,
            "gone",
        ));
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let (a, mut rx_a) = ChannelSink::new();
        let (b, mut rx_b) = ChannelSink::new();
        let fanout = FanoutSink::new().with(a).with(b).with(NullSink);

        fanout.emit(EngineEvent::new(
            None,
            Component::Monitor,
            EventKind::DeviceAttached,
            "usb-1",
        ));

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_problem_classification() {
        assert!(EventKind::TransitionRejected.is_problem());
        assert!(!EventKind::TransitionConfirmed.is_problem());
    }
}
