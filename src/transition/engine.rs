//! Transition execution
//!
//! Validates a request against the table, issues exactly one driver command
//! while holding the device lock, and waits for the monitor to report the
//! device in the target mode.

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::table::{check, command_for, TransitionOrigin, Verdict};
use crate::{
    capabilities::{Capability, CompatibilityProbe},
    device::{DeviceKey, DeviceSnapshot, Mode},
    events::{Component, EngineEvent, EventKind, EventSink},
    monitor::{DeviceMonitor, SnapshotSubscriber},
    registry::DeviceGuard,
    transport::{CommandAck, CommandTarget, DeviceCommand, DeviceTransport, TransportError},
};

/// How a transition request ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum TransitionOutcome {
    /// Device observed in the target mode
    Confirmed(Mode),
    /// Command issued, no confirmation in time; re-observe before acting
    TimedOut {
        target: Mode,
        last_observed: Option<Mode>,
    },
    /// Refused before any command was issued
    Rejected(String),
    /// Device absent, detached while waiting, or dropped off mid-command
    DeviceGone,
    /// Caller cancelled; `observed` is the mode seen after settling
    Cancelled { observed: Option<Mode> },
    /// Driver reported an error other than disconnection
    Failed(String),
}

impl TransitionOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(_))
    }

    fn event_kind(&self) -> EventKind {
        match self {
            Self::Confirmed(_) => EventKind::TransitionConfirmed,
            Self::TimedOut { .. } => EventKind::TransitionTimedOut,
            Self::Rejected(_) => EventKind::TransitionRejected,
            Self::DeviceGone => EventKind::TransitionDeviceGone,
            Self::Cancelled { .. } => EventKind::TransitionCancelled,
            Self::Failed(_) => EventKind::TransitionFailed,
        }
    }
}

impl fmt::Display for TransitionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seen = |m: &Option<Mode>| m.map_or("unknown".to_string(), |m| m.to_string());
        match self {
            Self::Confirmed(mode) => write!(f, "confirmed in {mode}"),
            Self::TimedOut {
                target,
                last_observed,
            } => write!(
                f,
                "timed out waiting for {target} (last observed {})",
                seen(last_observed)
            ),
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
            Self::DeviceGone => f.write_str("device gone"),
            Self::Cancelled { observed } => {
                write!(f, "cancelled (device in {})", seen(observed))
            }
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Result of issuing one driver command under cancellation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Completed(Result<CommandAck, TransportError>),
    /// Cancellation fired first. Holds the driver's real result if it
    /// arrived within the settle window.
    Cancelled(Option<Result<CommandAck, TransportError>>),
}

/// Drives devices between boot modes
pub struct ModeTransitionEngine {
    transport: Arc<dyn DeviceTransport>,
    monitor: Arc<DeviceMonitor>,
    probe: Arc<CompatibilityProbe>,
    events: Arc<dyn EventSink>,
    confirm_timeout: Duration,
    cancel_settle: Duration,
}

impl ModeTransitionEngine {
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        monitor: Arc<DeviceMonitor>,
        probe: Arc<CompatibilityProbe>,
        events: Arc<dyn EventSink>,
        confirm_timeout: Duration,
        cancel_settle: Duration,
    ) -> Self {
        Self {
            transport,
            monitor,
            probe,
            events,
            confirm_timeout,
            cancel_settle,
        }
    }

    pub fn monitor(&self) -> &Arc<DeviceMonitor> {
        &self.monitor
    }

    /// Wait for exclusive access to a device
    pub async fn lock(&self, key: &DeviceKey) -> DeviceGuard {
        self.monitor.registry().acquire(key).await
    }

    /// Move a device to `target`, taking the device lock for the duration
    pub async fn request_transition(
        &self,
        key: &DeviceKey,
        target: Mode,
        origin: TransitionOrigin,
        cancel: &CancellationToken,
    ) -> TransitionOutcome {
        let guard = self.lock(key).await;
        self.transition_locked(&guard, key, target, origin, cancel)
            .await
    }

    /// Same as [`request_transition`](Self::request_transition) for a caller
    /// that already holds the device lock
    pub async fn transition_locked(
        &self,
        _guard: &DeviceGuard,
        key: &DeviceKey,
        target: Mode,
        origin: TransitionOrigin,
        cancel: &CancellationToken,
    ) -> TransitionOutcome {
        let Some(snapshot) = self.monitor.registry().latest(key) else {
            return self.finish(key, None, target, TransitionOutcome::DeviceGone);
        };
        let current = snapshot.mode;

        match check(current, target, origin) {
            Verdict::AlreadyThere => {
                debug!("{key} already in {target}");
                return self.finish(key, Some(current), target, TransitionOutcome::Confirmed(target));
            }
            Verdict::Rejected(reason) => {
                return self.finish(key, Some(current), target, TransitionOutcome::Rejected(reason));
            }
            Verdict::Allowed => {}
        }

        if target == Mode::BootFiles && !self.probe.supports(&snapshot, Capability::BootFilesMode) {
            let firmware = snapshot
                .firmware
                .map_or_else(|| "unknown".to_string(), |f| f.to_string());
            let outcome = TransitionOutcome::Rejected(format!(
                "firmware {firmware} does not support BootFiles mode"
            ));
            return self.finish(key, Some(current), target, outcome);
        }

        let Some(command) = command_for(target, snapshot.firmware) else {
            let outcome = TransitionOutcome::Rejected(format!("no command reaches {target}"));
            return self.finish(key, Some(current), target, outcome);
        };

        // Subscribe before issuing so the confirming snapshot cannot be missed
        let mut subscriber = self.monitor.subscribe();

        self.events.emit(EngineEvent::new(
            Some(key),
            Component::Transition,
            EventKind::TransitionRequested,
            format!("{current} → {target} via {command}"),
        ));
        info!("Transition {key}: {current} → {target} ({command})");

        let outcome = match self.dispatch_to(&snapshot, key, &command, cancel).await {
            // Re-entry produces no mode change to observe; the ack is the confirmation
            Dispatch::Completed(Ok(_)) if current == target => TransitionOutcome::Confirmed(target),
            Dispatch::Completed(Ok(_)) => {
                self.await_confirmation(&mut subscriber, &snapshot, key, target, cancel)
                    .await
            }
            Dispatch::Completed(Err(e)) => self.command_error(key, e).await,
            Dispatch::Cancelled(_) => TransitionOutcome::Cancelled {
                observed: self.settled_mode(key).await,
            },
        };

        self.finish(key, Some(current), target, outcome)
    }

    /// Issue one command to a locked device, honoring cancellation
    pub async fn dispatch(
        &self,
        _guard: &DeviceGuard,
        key: &DeviceKey,
        command: &DeviceCommand,
        cancel: &CancellationToken,
    ) -> Dispatch {
        let Some(snapshot) = self.monitor.registry().latest(key) else {
            return Dispatch::Completed(Err(TransportError::NotFound(key.to_string())));
        };
        self.dispatch_to(&snapshot, key, command, cancel).await
    }

    async fn dispatch_to(
        &self,
        snapshot: &DeviceSnapshot,
        key: &DeviceKey,
        command: &DeviceCommand,
        cancel: &CancellationToken,
    ) -> Dispatch {
        let target = CommandTarget {
            key: key.clone(),
            slot: snapshot.slot.clone(),
        };

        let send = self.transport.send_command(&target, command);
        tokio::pin!(send);

        tokio::select! {
            result = &mut send => Dispatch::Completed(result),
            _ = cancel.cancelled() => {
                warn!("Cancelling {command} on {key}");
                if let Err(e) = self.transport.cancel_outstanding(key).await {
                    warn!("Driver cancel for {key} failed: {e}");
                }
                match tokio::time::timeout(self.cancel_settle, &mut send).await {
                    Ok(result) => Dispatch::Cancelled(Some(result)),
                    Err(_) => {
                        warn!("{command} on {key} did not settle within {:?}", self.cancel_settle);
                        Dispatch::Cancelled(None)
                    }
                }
            }
        }
    }

    async fn await_confirmation(
        &self,
        subscriber: &mut SnapshotSubscriber,
        origin: &DeviceSnapshot,
        key: &DeviceKey,
        target: Mode,
        cancel: &CancellationToken,
    ) -> TransitionOutcome {
        let deadline = Instant::now() + self.confirm_timeout;
        let mut last_observed = Some(origin.mode);

        loop {
            tokio::select! {
                next = subscriber.next() => {
                    let Some(snapshot) = next else {
                        return TransitionOutcome::Failed("device monitor stopped".to_string());
                    };

                    if snapshot.is_detached() && snapshot.slot == origin.slot {
                        return TransitionOutcome::DeviceGone;
                    }
                    if snapshot.key().as_ref() != Some(key) {
                        continue;
                    }

                    last_observed = Some(snapshot.mode);
                    if snapshot.mode == target {
                        return TransitionOutcome::Confirmed(target);
                    }
                    debug!("{key} passed through {} on the way to {target}", snapshot.mode);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return TransitionOutcome::TimedOut { target, last_observed };
                }
                _ = cancel.cancelled() => {
                    return TransitionOutcome::Cancelled {
                        observed: self.settled_mode(key).await,
                    };
                }
            }
        }
    }

    async fn command_error(&self, key: &DeviceKey, err: TransportError) -> TransitionOutcome {
        match err {
            e if e.is_disconnect() => TransitionOutcome::DeviceGone,
            TransportError::Cancelled => TransitionOutcome::Cancelled {
                observed: self.settled_mode(key).await,
            },
            e => TransitionOutcome::Failed(e.to_string()),
        }
    }

    /// Refresh the device's state and report its mode after a cancel
    async fn settled_mode(&self, key: &DeviceKey) -> Option<Mode> {
        let _ = tokio::time::timeout(self.cancel_settle, self.monitor.poll_once()).await;
        self.monitor.registry().latest(key).map(|s| s.mode)
    }

    fn finish(
        &self,
        key: &DeviceKey,
        current: Option<Mode>,
        target: Mode,
        outcome: TransitionOutcome,
    ) -> TransitionOutcome {
        let from = current.map_or("absent".to_string(), |m| m.to_string());
        let detail = format!("{from} → {target}: {outcome}");
        match &outcome {
            TransitionOutcome::Confirmed(_) => info!("Transition {key} {detail}"),
            _ => warn!("Transition {key} {detail}"),
        }

        self.events.emit(EngineEvent::new(
            Some(key),
            Component::Transition,
            outcome.event_kind(),
            detail,
        ));
        outcome
    }
}
