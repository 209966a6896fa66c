//! Step sequencing
//!
//! Executes a run's steps in order from its checkpoint. Every step holds the
//! device lock for its duration. Nothing is retried automatically: a
//! retryable failure parks the run until the caller resumes it.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    kind::{StepName, WorkflowKind},
    run::{RunStatus, StepOutcome, StepResult, WorkflowOptions, WorkflowRun},
};
use crate::{
    capabilities::{CapabilityGate, CompatibilityProbe},
    device::{DeviceKey, Mode},
    events::{Component, EngineEvent, EventKind, EventSink},
    registry::DeviceGuard,
    transition::{Dispatch, ModeTransitionEngine, TransitionOrigin, TransitionOutcome},
    transport::{CommandAck, DeviceCommand, TransportError},
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("Device {0} is not present")]
    DeviceAbsent(DeviceKey),

    #[error("Another workflow run is active for {0}")]
    RunInProgress(DeviceKey),

    /// The caller's copy is behind the runner's record of the run
    #[error("Run {0} is out of date or has been retired")]
    StaleRun(Uuid),
}

/// What `start` produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowStart {
    /// Run created and executed as far as it could go
    Running(WorkflowRun),
    /// Device lacks a required capability; nothing was executed
    Gated(CapabilityGate),
}

/// Result of one step attempt, plus whether cancellation cut it short
struct StepExecution {
    result: StepResult,
    cancelled: bool,
}

impl StepExecution {
    fn completed(result: StepResult) -> Self {
        Self {
            result,
            cancelled: false,
        }
    }
}

/// Runner-side state of one run id
#[derive(Debug, Clone, Copy)]
struct RunRecord {
    /// Number of recorded step results; a copy with a different count is stale
    results: usize,
    status: RunStatus,
    executing: bool,
    /// Replaced by `restart` or dropped by `discard`
    retired: bool,
}

impl RunRecord {
    fn of(run: &WorkflowRun, executing: bool) -> Self {
        Self {
            results: run.results().len(),
            status: run.status(),
            executing,
            retired: false,
        }
    }
}

#[derive(Default)]
struct Ledger {
    /// Device → id of its active (non-terminal) run
    by_device: HashMap<DeviceKey, Uuid>,
    runs: HashMap<Uuid, RunRecord>,
}

/// Runs bypass workflows
///
/// The runner keeps the authoritative record of every run it has seen, so a
/// stale or duplicated `WorkflowRun` can never execute a step twice.
pub struct BypassWorkflow {
    transitions: Arc<ModeTransitionEngine>,
    probe: Arc<CompatibilityProbe>,
    events: Arc<dyn EventSink>,
    ledger: Mutex<Ledger>,
    /// Consecutive retryable failures of one step that turn fatal; 0 disables
    max_step_attempts: u32,
}

impl BypassWorkflow {
    pub fn new(
        transitions: Arc<ModeTransitionEngine>,
        probe: Arc<CompatibilityProbe>,
        events: Arc<dyn EventSink>,
        max_step_attempts: u32,
    ) -> Self {
        Self {
            transitions,
            probe,
            events,
            ledger: Mutex::new(Ledger::default()),
            max_step_attempts,
        }
    }

    /// Gate, create and execute a new run
    pub async fn start(
        &self,
        key: &DeviceKey,
        kind: WorkflowKind,
        options: WorkflowOptions,
        cancel: &CancellationToken,
    ) -> Result<WorkflowStart, WorkflowError> {
        let snapshot = self
            .transitions
            .monitor()
            .registry()
            .latest(key)
            .ok_or_else(|| WorkflowError::DeviceAbsent(key.clone()))?;

        if let Err(gate) = self.probe.gate(&snapshot, kind, &options) {
            warn!("{kind} refused for {key}: {gate}");
            self.events.emit(EngineEvent::new(
                Some(key),
                Component::Compatibility,
                EventKind::CapabilityGate,
                gate.to_string(),
            ));
            return Ok(WorkflowStart::Gated(gate));
        }

        let run = WorkflowRun::new(key.clone(), kind, options);
        self.claim(&run, true)?;

        info!("Starting {run}");
        self.events.emit(EngineEvent::new(
            Some(key),
            Component::Workflow,
            EventKind::RunStarted,
            format!("{kind} run {} options {}", run.id(), options.summary()),
        ));

        Ok(WorkflowStart::Running(self.execute(run, cancel).await))
    }

    /// Continue from the checkpoint
    ///
    /// A terminal run is returned unchanged without touching the device. A
    /// copy that is already executing elsewhere is refused with
    /// `RunInProgress`; a copy older than the runner's record, or of a run
    /// that has since finished or been retired, is refused with `StaleRun`.
    pub async fn resume(
        &self,
        run: WorkflowRun,
        cancel: &CancellationToken,
    ) -> Result<WorkflowRun, WorkflowError> {
        if run.is_terminal() {
            debug!("Resume of terminal {run} is a no-op");
            return Ok(run);
        }
        self.claim(&run, true)?;
        info!("Resuming {run}");
        Ok(self.execute(run, cancel).await)
    }

    /// Drop a run and create a fresh pending one with the same kind and options
    ///
    /// The new run is not executed; pass it to [`resume`](Self::resume).
    pub fn restart(&self, run: WorkflowRun) -> Result<WorkflowRun, WorkflowError> {
        let key = run.device().clone();
        let fresh = WorkflowRun::new(key.clone(), run.kind(), *run.options());
        info!("Restarting {} as run {}", run, fresh.id());

        self.retire(&run)?;
        self.claim(&fresh, false)?;
        Ok(fresh)
    }

    /// Release the run's device slot without executing anything
    ///
    /// The run id is retired; resuming any copy of it is refused afterwards.
    /// A run that is executing right now is left alone.
    pub fn discard(&self, run: WorkflowRun) {
        match self.retire(&run) {
            Ok(()) => info!("Discarded {run}"),
            Err(e) => warn!("Cannot discard {run}: {e}"),
        }
    }

    /// Whether a non-terminal run currently holds the device
    pub fn has_active_run(&self, key: &DeviceKey) -> bool {
        self.ledger.lock().by_device.contains_key(key)
    }

    fn claim(&self, run: &WorkflowRun, executing: bool) -> Result<(), WorkflowError> {
        let mut ledger = self.ledger.lock();

        if let Some(record) = ledger.runs.get(&run.id()) {
            if record.executing {
                return Err(WorkflowError::RunInProgress(run.device().clone()));
            }
            if record.retired
                || record.status.is_terminal()
                || record.results != run.results().len()
            {
                return Err(WorkflowError::StaleRun(run.id()));
            }
        }

        match ledger.by_device.get(run.device()) {
            Some(id) if *id != run.id() => Err(WorkflowError::RunInProgress(run.device().clone())),
            _ => {
                ledger.by_device.insert(run.device().clone(), run.id());
                ledger.runs.insert(run.id(), RunRecord::of(run, executing));
                Ok(())
            }
        }
    }

    /// Record where an execution left the run and free the device if it finished
    fn settle(&self, run: &WorkflowRun) {
        let mut ledger = self.ledger.lock();
        ledger.runs.insert(run.id(), RunRecord::of(run, false));
        if run.is_terminal() && ledger.by_device.get(run.device()) == Some(&run.id()) {
            ledger.by_device.remove(run.device());
        }
    }

    fn retire(&self, run: &WorkflowRun) -> Result<(), WorkflowError> {
        let mut ledger = self.ledger.lock();
        let record = ledger
            .runs
            .entry(run.id())
            .or_insert_with(|| RunRecord::of(run, false));
        if record.executing {
            return Err(WorkflowError::RunInProgress(run.device().clone()));
        }
        record.retired = true;

        if ledger.by_device.get(run.device()) == Some(&run.id()) {
            ledger.by_device.remove(run.device());
        }
        Ok(())
    }

    async fn execute(&self, mut run: WorkflowRun, cancel: &CancellationToken) -> WorkflowRun {
        run.begin();

        while let Some(step) = run.next_step() {
            if cancel.is_cancelled() {
                run.abort();
                break;
            }

            let attempt = run.failed_attempts(step) + 1;
            let StepExecution {
                mut result,
                cancelled,
            } = self.run_step(&run, step, attempt, cancel).await;

            if !cancelled
                && result.outcome == StepOutcome::RetryableFailure
                && self.max_step_attempts > 0
                && attempt >= self.max_step_attempts
            {
                result.outcome = StepOutcome::FatalFailure;
                result.detail = format!("{} (giving up after {attempt} attempts)", result.detail);
            }

            self.report_step(&run, &result);
            let outcome = result.outcome;
            run.record(result);

            if cancelled {
                run.abort();
                break;
            }
            if outcome != StepOutcome::Success {
                break;
            }
        }

        self.report_status(&run);
        self.settle(&run);
        run
    }

    async fn run_step(
        &self,
        run: &WorkflowRun,
        step: StepName,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> StepExecution {
        let key = run.device();
        let guard = self.transitions.lock(key).await;
        debug!("{key}: {step} attempt {attempt}");

        match step {
            StepName::ProbeCompatibility => {
                StepExecution::completed(self.probe_step(run, step, attempt))
            }
            StepName::EnterBootFilesMode => self.enter_bootfiles(&guard, key, attempt, cancel).await,
            StepName::ProbeAndBackupTokens => {
                let mode = self.current_mode(key);
                if mode != Some(Mode::BootFiles) {
                    let found = mode.map_or("absent".to_string(), |m| m.to_string());
                    return StepExecution::completed(StepResult::new(
                        step,
                        attempt,
                        StepOutcome::FatalFailure,
                        format!("device left BootFiles mode (now {found})"),
                    ));
                }
                if let Err(result) = self.recheck(run, step, attempt) {
                    return StepExecution::completed(result);
                }
                self.command_step(&guard, key, step, attempt, DeviceCommand::BackupTokens, cancel)
                    .await
            }
            StepName::Activate => {
                let command = DeviceCommand::Activate {
                    flags: *run.options(),
                };
                self.command_step(&guard, key, step, attempt, command, cancel)
                    .await
            }
            StepName::DisableFmi => {
                self.command_step(&guard, key, step, attempt, DeviceCommand::DisableFmi, cancel)
                    .await
            }
        }
    }

    fn current_mode(&self, key: &DeviceKey) -> Option<Mode> {
        self.transitions
            .monitor()
            .registry()
            .latest(key)
            .map(|s| s.mode)
    }

    fn probe_step(&self, run: &WorkflowRun, step: StepName, attempt: u32) -> StepResult {
        match self.recheck(run, step, attempt) {
            Ok(detail) => StepResult::new(step, attempt, StepOutcome::Success, detail),
            Err(result) => result,
        }
    }

    /// Re-run the capability gate against the device's current snapshot
    fn recheck(&self, run: &WorkflowRun, step: StepName, attempt: u32) -> Result<String, StepResult> {
        let Some(snapshot) = self.transitions.monitor().registry().latest(run.device()) else {
            return Err(StepResult::new(
                step,
                attempt,
                StepOutcome::FatalFailure,
                "device not present",
            ));
        };

        // BootFiles snapshots come from the ramdisk and may not report firmware
        if snapshot.firmware.is_none() && snapshot.mode == Mode::BootFiles {
            return Ok("firmware not reported in BootFiles, keeping start-time result".to_string());
        }

        self.probe
            .gate(&snapshot, run.kind(), run.options())
            .map(|caps| format!("compatible: {caps}"))
            .map_err(|gate| {
                StepResult::new(step, attempt, StepOutcome::FatalFailure, gate.to_string())
            })
    }

    async fn enter_bootfiles(
        &self,
        guard: &DeviceGuard,
        key: &DeviceKey,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> StepExecution {
        let step = StepName::EnterBootFilesMode;

        match self.current_mode(key) {
            Some(Mode::BootFiles) => {
                return StepExecution::completed(StepResult::new(
                    step,
                    attempt,
                    StepOutcome::Success,
                    "already in BootFiles",
                ));
            }
            // Boot files load from the boot loader; drop to Recovery first
            Some(Mode::Normal) => {
                let outcome = self
                    .transitions
                    .transition_locked(guard, key, Mode::Recovery, TransitionOrigin::Workflow, cancel)
                    .await;
                if !outcome.is_confirmed() {
                    return transition_step(step, attempt, outcome);
                }
            }
            _ => {}
        }

        let outcome = self
            .transitions
            .transition_locked(guard, key, Mode::BootFiles, TransitionOrigin::Workflow, cancel)
            .await;
        transition_step(step, attempt, outcome)
    }

    async fn command_step(
        &self,
        guard: &DeviceGuard,
        key: &DeviceKey,
        step: StepName,
        attempt: u32,
        command: DeviceCommand,
        cancel: &CancellationToken,
    ) -> StepExecution {
        match self.transitions.dispatch(guard, key, &command, cancel).await {
            Dispatch::Completed(result) => {
                StepExecution::completed(command_result(step, attempt, &command, result))
            }
            Dispatch::Cancelled(Some(result)) => StepExecution {
                result: command_result(step, attempt, &command, result),
                cancelled: true,
            },
            Dispatch::Cancelled(None) => StepExecution {
                result: StepResult::new(
                    step,
                    attempt,
                    StepOutcome::RetryableFailure,
                    format!("cancelled; {command} did not report a result"),
                ),
                cancelled: true,
            },
        }
    }

    fn report_step(&self, run: &WorkflowRun, result: &StepResult) {
        let kind = match result.outcome {
            StepOutcome::Success => EventKind::StepSucceeded,
            StepOutcome::RetryableFailure => EventKind::StepRetryable,
            StepOutcome::FatalFailure => EventKind::StepFatal,
        };
        match result.outcome {
            StepOutcome::Success => info!("{}: {result}", run.device()),
            _ => warn!("{}: {result}", run.device()),
        }
        self.events.emit(EngineEvent::new(
            Some(run.device()),
            Component::Workflow,
            kind,
            result.to_string(),
        ));
    }

    fn report_status(&self, run: &WorkflowRun) {
        let kind = match run.status() {
            RunStatus::Succeeded => EventKind::RunSucceeded,
            RunStatus::Failed => EventKind::RunFailed,
            RunStatus::Aborted => EventKind::RunAborted,
            RunStatus::Pending | RunStatus::InProgress => {
                debug!("{run} awaiting resume");
                return;
            }
        };
        info!("{run}");
        self.events.emit(EngineEvent::new(
            Some(run.device()),
            Component::Workflow,
            kind,
            run.to_string(),
        ));
    }
}

fn transition_step(step: StepName, attempt: u32, outcome: TransitionOutcome) -> StepExecution {
    let (step_outcome, cancelled) = match &outcome {
        TransitionOutcome::Confirmed(_) => (StepOutcome::Success, false),
        TransitionOutcome::TimedOut { .. } => (StepOutcome::RetryableFailure, false),
        TransitionOutcome::Cancelled { .. } => (StepOutcome::RetryableFailure, true),
        TransitionOutcome::Rejected(_)
        | TransitionOutcome::DeviceGone
        | TransitionOutcome::Failed(_) => (StepOutcome::FatalFailure, false),
    };
    StepExecution {
        result: StepResult::new(step, attempt, step_outcome, outcome.to_string()),
        cancelled,
    }
}

fn command_result(
    step: StepName,
    attempt: u32,
    command: &DeviceCommand,
    result: Result<CommandAck, TransportError>,
) -> StepResult {
    match result {
        Ok(ack) => {
            let detail = match (&ack.message, &ack.artifact) {
                (Some(message), _) => format!("{command}: {message}"),
                (None, Some(artifact)) => format!("{command}: {} byte artifact", artifact.len()),
                (None, None) => format!("{command}: done"),
            };
            StepResult::new(step, attempt, StepOutcome::Success, detail).with_artifact(ack.artifact)
        }
        Err(e) if e.is_retryable() => {
            StepResult::new(step, attempt, StepOutcome::RetryableFailure, e.to_string())
        }
        Err(e) => StepResult::new(step, attempt, StepOutcome::FatalFailure, e.to_string()),
    }
}
