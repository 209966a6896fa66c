//! Standalone device operations
//!
//! Toolbox operations are single guarded actions outside any workflow: mode
//! exits, boot-file (re)entry, ramdisk boot, restore and jailbreak. Each one
//! checks access, checks the device's current mode against a precondition
//! table, and reports exactly one event.

use std::{fmt, path::PathBuf, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    access::AccessPolicy,
    device::{DeviceKey, Mode},
    events::{Component, EngineEvent, EventKind, EventSink},
    transition::{Dispatch, ModeTransitionEngine, TransitionOrigin, TransitionOutcome},
    transport::{DeviceCommand, JailbreakVariant},
    workflow::StepOutcome,
};

/// One toolbox action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolboxOperation {
    ExitToNormal,
    ExitToRecovery,
    ExitToDfu,
    ExitToPurple,
    /// Load (or reload) boot files
    EnterBootFiles,
    /// Upload the configured ramdisk and boot it
    BootRamdisk,
    Restore,
    Jailbreak(JailbreakVariant),
}

impl ToolboxOperation {
    pub const ALL: [ToolboxOperation; 11] = [
        Self::ExitToNormal,
        Self::ExitToRecovery,
        Self::ExitToDfu,
        Self::ExitToPurple,
        Self::EnterBootFiles,
        Self::BootRamdisk,
        Self::Restore,
        Self::Jailbreak(JailbreakVariant::Automatic),
        Self::Jailbreak(JailbreakVariant::Checkra1n),
        Self::Jailbreak(JailbreakVariant::Palera1nRootful),
        Self::Jailbreak(JailbreakVariant::Palera1nRootless),
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ExitToNormal => "exit-to-normal",
            Self::ExitToRecovery => "exit-to-recovery",
            Self::ExitToDfu => "exit-to-dfu",
            Self::ExitToPurple => "exit-to-purple",
            Self::EnterBootFiles => "enter-bootfiles",
            Self::BootRamdisk => "boot-ramdisk",
            Self::Restore => "restore",
            Self::Jailbreak(JailbreakVariant::Automatic) => "jailbreak-automatic",
            Self::Jailbreak(JailbreakVariant::Checkra1n) => "jailbreak-checkra1n",
            Self::Jailbreak(JailbreakVariant::Palera1nRootful) => "jailbreak-palera1n-rootful",
            Self::Jailbreak(JailbreakVariant::Palera1nRootless) => "jailbreak-palera1n-rootless",
        }
    }

    /// Mode the operation moves the device into, for mode operations
    pub fn target_mode(&self) -> Option<Mode> {
        match self {
            Self::ExitToNormal => Some(Mode::Normal),
            Self::ExitToRecovery => Some(Mode::Recovery),
            Self::ExitToDfu => Some(Mode::Dfu),
            Self::ExitToPurple => Some(Mode::Purple),
            Self::EnterBootFiles => Some(Mode::BootFiles),
            Self::BootRamdisk | Self::Restore | Self::Jailbreak(_) => None,
        }
    }

    /// The mode operation that ends in `mode`
    pub fn for_mode(mode: Mode) -> Option<Self> {
        match mode {
            Mode::Normal => Some(Self::ExitToNormal),
            Mode::Recovery => Some(Self::ExitToRecovery),
            Mode::Dfu => Some(Self::ExitToDfu),
            Mode::Purple => Some(Self::ExitToPurple),
            Mode::BootFiles => Some(Self::EnterBootFiles),
            Mode::Unknown => None,
        }
    }

    /// Modes the device must be in for the operation to run
    pub fn allowed_from(&self) -> &'static [Mode] {
        use Mode::*;
        match self {
            Self::ExitToNormal => &Mode::ALL,
            Self::ExitToRecovery | Self::ExitToDfu | Self::Restore => &[Normal, Recovery, Dfu],
            Self::ExitToPurple => &[Normal, Recovery, Dfu, Purple],
            Self::EnterBootFiles => &[Recovery, Dfu, BootFiles],
            Self::BootRamdisk => &[Recovery, Dfu],
            Self::Jailbreak(JailbreakVariant::Automatic) => &[Normal],
            Self::Jailbreak(_) => &[Dfu],
        }
    }
}

impl fmt::Display for ToolboxOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ToolboxOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|op| op.name()).collect();
                format!("unknown operation '{s}' (expected one of: {})", names.join(", "))
            })
    }
}

/// Outcome of one toolbox call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolboxReport {
    pub operation: ToolboxOperation,
    pub device: DeviceKey,
    pub outcome: StepOutcome,
    pub detail: String,
    pub mode_before: Option<Mode>,
    pub mode_after: Option<Mode>,
    pub at: DateTime<Utc>,
}

impl ToolboxReport {
    pub fn is_success(&self) -> bool {
        self.outcome == StepOutcome::Success
    }
}

impl fmt::Display for ToolboxReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}: {} - {}", self.operation, self.device, self.outcome, self.detail)
    }
}

/// Runs toolbox operations
pub struct ToolboxDispatcher {
    transitions: Arc<ModeTransitionEngine>,
    access: Arc<dyn AccessPolicy>,
    events: Arc<dyn EventSink>,
    ramdisk: Option<PathBuf>,
}

impl ToolboxDispatcher {
    pub fn new(
        transitions: Arc<ModeTransitionEngine>,
        access: Arc<dyn AccessPolicy>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            transitions,
            access,
            events,
            ramdisk: None,
        }
    }

    /// Ramdisk image used by [`ToolboxOperation::BootRamdisk`]
    pub fn with_ramdisk(mut self, path: Option<PathBuf>) -> Self {
        self.ramdisk = path;
        self
    }

    pub async fn run(
        &self,
        key: &DeviceKey,
        operation: ToolboxOperation,
        cancel: &CancellationToken,
    ) -> ToolboxReport {
        if !self.access.permits(&operation) {
            return self.report(key, operation, None, StepOutcome::FatalFailure, "not permitted");
        }

        let guard = self.transitions.lock(key).await;
        let registry = self.transitions.monitor().registry();

        let Some(mode) = registry.latest(key).map(|s| s.mode) else {
            return self.report(key, operation, None, StepOutcome::FatalFailure, "device not present");
        };

        if !operation.allowed_from().contains(&mode) {
            let detail = format!("{operation} not available from {mode}");
            return self.report(key, operation, Some(mode), StepOutcome::FatalFailure, detail);
        }

        let (outcome, detail) = match operation.target_mode() {
            Some(target) if target == mode && operation != ToolboxOperation::EnterBootFiles => {
                (StepOutcome::Success, format!("already in {mode}"))
            }
            Some(target) => {
                let result = self
                    .transitions
                    .transition_locked(&guard, key, target, TransitionOrigin::Toolbox, cancel)
                    .await;
                (transition_outcome(&result), result.to_string())
            }
            None => {
                let command = match operation {
                    ToolboxOperation::Jailbreak(variant) => DeviceCommand::Jailbreak { variant },
                    ToolboxOperation::BootRamdisk => match self.ramdisk_image() {
                        Ok(path) => DeviceCommand::BootRamdisk { path },
                        Err(detail) => {
                            let outcome = StepOutcome::FatalFailure;
                            return self.report(key, operation, Some(mode), outcome, detail);
                        }
                    },
                    _ => DeviceCommand::Restore,
                };
                match self.transitions.dispatch(&guard, key, &command, cancel).await {
                    Dispatch::Completed(Ok(ack)) => (
                        StepOutcome::Success,
                        ack.message.unwrap_or_else(|| format!("{command} completed")),
                    ),
                    Dispatch::Completed(Err(e)) if e.is_retryable() => {
                        (StepOutcome::RetryableFailure, e.to_string())
                    }
                    Dispatch::Completed(Err(e)) => (StepOutcome::FatalFailure, e.to_string()),
                    Dispatch::Cancelled(result) => (
                        StepOutcome::RetryableFailure,
                        match result {
                            Some(Ok(_)) => format!("cancelled after {command} completed"),
                            Some(Err(e)) => format!("cancelled: {e}"),
                            None => format!("cancelled; {command} did not report a result"),
                        },
                    ),
                }
            }
        };

        drop(guard);
        self.report(key, operation, Some(mode), outcome, detail)
    }

    fn ramdisk_image(&self) -> Result<PathBuf, String> {
        let path = self
            .ramdisk
            .as_ref()
            .ok_or_else(|| "no ramdisk configured".to_string())?;
        if !path.is_file() {
            return Err(format!("ramdisk not found: {}", path.display()));
        }
        Ok(path.clone())
    }

    fn report(
        &self,
        key: &DeviceKey,
        operation: ToolboxOperation,
        mode_before: Option<Mode>,
        outcome: StepOutcome,
        detail: impl Into<String>,
    ) -> ToolboxReport {
        let report = ToolboxReport {
            operation,
            device: key.clone(),
            outcome,
            detail: detail.into(),
            mode_before,
            mode_after: self
                .transitions
                .monitor()
                .registry()
                .latest(key)
                .map(|s| s.mode),
            at: Utc::now(),
        };

        let kind = if report.is_success() {
            info!("{report}");
            EventKind::ToolboxSucceeded
        } else {
            warn!("{report}");
            EventKind::ToolboxFailed
        };
        self.events.emit(EngineEvent::new(
            Some(key),
            Component::Toolbox,
            kind,
            report.to_string(),
        ));
        report
    }
}

fn transition_outcome(outcome: &TransitionOutcome) -> StepOutcome {
    match outcome {
        TransitionOutcome::Confirmed(_) => StepOutcome::Success,
        TransitionOutcome::TimedOut { .. } | TransitionOutcome::Cancelled { .. } => {
            StepOutcome::RetryableFailure
        }
        TransitionOutcome::Rejected(_)
        | TransitionOutcome::DeviceGone
        | TransitionOutcome::Failed(_) => StepOutcome::FatalFailure,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        access::{AllowAll, StaticPolicy},
        capabilities::CompatibilityProbe,
        events::ChannelSink,
        monitor::DeviceMonitor,
        registry::DeviceRegistry,
        transport::{CommandKind, DeviceTransport, SimulatedDevice, SimulatedTransport},
    };

    struct Harness {
        transport: Arc<SimulatedTransport>,
        toolbox: ToolboxDispatcher,
        shutdown: CancellationToken,
        events: tokio::sync::mpsc::UnboundedReceiver<EngineEvent>,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    async fn harness(mode: Mode, access: Arc<dyn AccessPolicy>) -> Harness {
        harness_with_ramdisk(mode, access, None).await
    }

    async fn harness_with_ramdisk(
        mode: Mode,
        access: Arc<dyn AccessPolicy>,
        ramdisk: Option<PathBuf>,
    ) -> Harness {
        let transport = Arc::new(
            SimulatedTransport::new()
                .with_device("usb-1", SimulatedDevice::new("ecid-1", "15.7", mode)),
        );
        let (sink, events) = ChannelSink::new();
        let sink: Arc<dyn EventSink> = Arc::new(sink);
        let monitor = Arc::new(DeviceMonitor::new(
            Arc::clone(&transport) as Arc<dyn DeviceTransport>,
            Arc::new(DeviceRegistry::new()),
            Arc::clone(&sink),
            Duration::from_millis(10),
            64,
        ));
        monitor.poll_once().await;
        let shutdown = CancellationToken::new();
        monitor.spawn(shutdown.clone());

        let transitions = Arc::new(ModeTransitionEngine::new(
            Arc::clone(&transport) as Arc<dyn DeviceTransport>,
            monitor,
            Arc::new(CompatibilityProbe::default()),
            Arc::clone(&sink),
            Duration::from_secs(2),
            Duration::from_millis(200),
        ));

        Harness {
            transport,
            toolbox: ToolboxDispatcher::new(transitions, access, sink).with_ramdisk(ramdisk),
            shutdown,
            events,
        }
    }

    fn key() -> DeviceKey {
        DeviceKey::new("ecid-1")
    }

    #[tokio::test]
    async fn test_exit_to_recovery_from_normal() {
        let h = harness(Mode::Normal, Arc::new(AllowAll)).await;
        let report = h
            .toolbox
            .run(&key(), ToolboxOperation::ExitToRecovery, &CancellationToken::new())
            .await;

        assert!(report.is_success(), "{report}");
        assert_eq!(report.mode_before, Some(Mode::Normal));
        assert_eq!(report.mode_after, Some(Mode::Recovery));
    }

    #[tokio::test]
    async fn test_exit_is_idempotent() {
        let mut h = harness(Mode::Recovery, Arc::new(AllowAll)).await;
        let report = h
            .toolbox
            .run(&key(), ToolboxOperation::ExitToRecovery, &CancellationToken::new())
            .await;

        assert!(report.is_success());
        assert_eq!(report.detail, "already in Recovery");
        assert_eq!(h.transport.command_count(), 0);

        let toolbox_events: Vec<_> = std::iter::from_fn(|| h.events.try_recv().ok())
            .filter(|e| e.component == Component::Toolbox)
            .collect();
        assert_eq!(toolbox_events.len(), 1);
        assert_eq!(toolbox_events[0].kind, EventKind::ToolboxSucceeded);
    }

    #[tokio::test]
    async fn test_precondition_rejects_without_command() {
        let h = harness(Mode::Normal, Arc::new(AllowAll)).await;
        let cancel = CancellationToken::new();

        let report = h
            .toolbox
            .run(&key(), ToolboxOperation::Jailbreak(JailbreakVariant::Checkra1n), &cancel)
            .await;
        assert_eq!(report.outcome, StepOutcome::FatalFailure);
        assert_eq!(report.detail, "jailbreak-checkra1n not available from Normal");

        let report = h
            .toolbox
            .run(&key(), ToolboxOperation::EnterBootFiles, &cancel)
            .await;
        assert_eq!(report.outcome, StepOutcome::FatalFailure);
        assert_eq!(h.transport.command_count(), 0);
    }

    #[tokio::test]
    async fn test_denied_operation_touches_nothing() {
        let mut h = harness(
            Mode::Normal,
            Arc::new(StaticPolicy::new(["exit-to-normal"])),
        )
        .await;

        let report = h
            .toolbox
            .run(&key(), ToolboxOperation::Restore, &CancellationToken::new())
            .await;
        assert_eq!(report.outcome, StepOutcome::FatalFailure);
        assert_eq!(report.detail, "not permitted");
        assert_eq!(h.transport.command_count(), 0);

        let last = std::iter::from_fn(|| h.events.try_recv().ok()).last().unwrap();
        assert_eq!(last.kind, EventKind::ToolboxFailed);
    }

    #[tokio::test]
    async fn test_bootfiles_reentry_reloads() {
        let h = harness(Mode::BootFiles, Arc::new(AllowAll)).await;
        let report = h
            .toolbox
            .run(&key(), ToolboxOperation::EnterBootFiles, &CancellationToken::new())
            .await;

        assert!(report.is_success(), "{report}");
        assert_eq!(
            h.transport.commands_for(&key()).first().map(|c| c.kind()),
            Some(CommandKind::LoadBootFiles)
        );
    }

    #[tokio::test]
    async fn test_purple_from_dfu_and_back() {
        let h = harness(Mode::Dfu, Arc::new(AllowAll)).await;
        let cancel = CancellationToken::new();

        let report = h.toolbox.run(&key(), ToolboxOperation::ExitToPurple, &cancel).await;
        assert!(report.is_success(), "{report}");

        let report = h.toolbox.run(&key(), ToolboxOperation::ExitToDfu, &cancel).await;
        assert_eq!(report.outcome, StepOutcome::FatalFailure);

        let report = h.toolbox.run(&key(), ToolboxOperation::ExitToNormal, &cancel).await;
        assert!(report.is_success(), "{report}");
        assert_eq!(report.mode_after, Some(Mode::Normal));
    }

    #[tokio::test]
    async fn test_jailbreak_from_dfu() {
        let h = harness(Mode::Dfu, Arc::new(AllowAll)).await;
        let report = h
            .toolbox
            .run(
                &key(),
                ToolboxOperation::Jailbreak(JailbreakVariant::Palera1nRootless),
                &CancellationToken::new(),
            )
            .await;

        assert!(report.is_success(), "{report}");
        assert_eq!(
            h.transport.commands_for(&key()),
            vec![DeviceCommand::Jailbreak {
                variant: JailbreakVariant::Palera1nRootless
            }]
        );
    }

    #[tokio::test]
    async fn test_mode_request_goes_through_access_policy() {
        let mut h = harness(
            Mode::Normal,
            Arc::new(StaticPolicy::new(["exit-to-normal"])),
        )
        .await;
        let cancel = CancellationToken::new();

        let op = ToolboxOperation::for_mode(Mode::Purple).unwrap();
        let report = h.toolbox.run(&key(), op, &cancel).await;
        assert_eq!(report.outcome, StepOutcome::FatalFailure);
        assert_eq!(report.detail, "not permitted");
        assert_eq!(h.transport.command_count(), 0);

        let op = ToolboxOperation::for_mode(Mode::Normal).unwrap();
        let report = h.toolbox.run(&key(), op, &cancel).await;
        assert!(report.is_success(), "{report}");

        let kinds: Vec<_> = std::iter::from_fn(|| h.events.try_recv().ok())
            .filter(|e| e.component == Component::Toolbox)
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::ToolboxFailed, EventKind::ToolboxSucceeded]);
    }

    #[test]
    fn test_for_mode_targets_that_mode() {
        for mode in Mode::ALL {
            match ToolboxOperation::for_mode(mode) {
                Some(op) => assert_eq!(op.target_mode(), Some(mode)),
                None => assert_eq!(mode, Mode::Unknown),
            }
        }
    }

    #[tokio::test]
    async fn test_missing_ramdisk_sends_nothing() {
        let h = harness_with_ramdisk(
            Mode::Recovery,
            Arc::new(AllowAll),
            Some(PathBuf::from("/nonexistent/ramdisk.img4")),
        )
        .await;
        let report = h
            .toolbox
            .run(&key(), ToolboxOperation::BootRamdisk, &CancellationToken::new())
            .await;

        assert_eq!(report.outcome, StepOutcome::FatalFailure);
        assert_eq!(report.detail, "ramdisk not found: /nonexistent/ramdisk.img4");
        assert_eq!(h.transport.command_count(), 0);

        let h = harness(Mode::Dfu, Arc::new(AllowAll)).await;
        let report = h
            .toolbox
            .run(&key(), ToolboxOperation::BootRamdisk, &CancellationToken::new())
            .await;
        assert_eq!(report.detail, "no ramdisk configured");
        assert_eq!(h.transport.command_count(), 0);
    }

    #[tokio::test]
    async fn test_boot_ramdisk_sends_image_path() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("ramdisk.img4");
        std::fs::write(&image, b"img4").unwrap();

        let h = harness_with_ramdisk(Mode::Dfu, Arc::new(AllowAll), Some(image.clone())).await;
        let cancel = CancellationToken::new();

        let report = h.toolbox.run(&key(), ToolboxOperation::BootRamdisk, &cancel).await;
        assert!(report.is_success(), "{report}");
        assert_eq!(
            h.transport.commands_for(&key()),
            vec![DeviceCommand::BootRamdisk { path: image }]
        );
    }

    #[tokio::test]
    async fn test_boot_ramdisk_needs_boot_loader_mode() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("ramdisk.img4");
        std::fs::write(&image, b"img4").unwrap();

        let h = harness_with_ramdisk(Mode::Normal, Arc::new(AllowAll), Some(image)).await;
        let report = h
            .toolbox
            .run(&key(), ToolboxOperation::BootRamdisk, &CancellationToken::new())
            .await;
        assert_eq!(report.detail, "boot-ramdisk not available from Normal");
        assert_eq!(h.transport.command_count(), 0);
    }

    #[test]
    fn test_parse_operation_names() {
        for op in ToolboxOperation::ALL {
            assert_eq!(op.name().parse::<ToolboxOperation>().unwrap(), op);
        }
        assert!("format-disk".parse::<ToolboxOperation>().is_err());
    }
}
