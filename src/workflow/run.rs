//! Workflow run record
//!
//! A [`WorkflowRun`] is the caller-owned record of one execution: the
//! options it was started with, every step result in order, and a checkpoint
//! that only moves forward. Mutation is crate-private so the checkpoint and
//! history invariants hold no matter who holds the run.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::kind::{StepName, WorkflowKind};
use crate::{device::DeviceKey, transport::ActivationFlags};

/// Options fixed at run creation
pub type WorkflowOptions = ActivationFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepOutcome {
    Success,
    /// Safe to try the same step again on resume
    RetryableFailure,
    /// The run cannot continue
    FatalFailure,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::RetryableFailure => "retryable failure",
            Self::FatalFailure => "fatal failure",
        };
        f.write_str(name)
    }
}

/// Result of one step attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: StepName,
    pub outcome: StepOutcome,
    pub detail: String,
    /// Opaque payload produced by the step (backed-up tokens)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Vec<u8>>,
    pub at: DateTime<Utc>,
    /// 1-based attempt number for this step within the run
    pub attempt: u32,
}

impl StepResult {
    pub fn new(step: StepName, attempt: u32, outcome: StepOutcome, detail: impl Into<String>) -> Self {
        Self {
            step,
            outcome,
            detail: detail.into(),
            artifact: None,
            at: Utc::now(),
            attempt,
        }
    }

    pub fn with_artifact(mut self, artifact: Option<Vec<u8>>) -> Self {
        self.artifact = artifact;
        self
    }
}

impl fmt::Display for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (attempt {}): {} - {}",
            self.step, self.attempt, self.outcome, self.detail
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    /// Cancelled by the caller
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::InProgress => "in progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// One execution of a workflow against one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    id: Uuid,
    device: DeviceKey,
    kind: WorkflowKind,
    options: WorkflowOptions,
    results: Vec<StepResult>,
    checkpoint: usize,
    status: RunStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub(crate) fn new(device: DeviceKey, kind: WorkflowKind, options: WorkflowOptions) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            device,
            kind,
            options,
            results: Vec::new(),
            checkpoint: 0,
            status: RunStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn device(&self) -> &DeviceKey {
        &self.device
    }

    pub fn kind(&self) -> WorkflowKind {
        self.kind
    }

    pub fn options(&self) -> &WorkflowOptions {
        &self.options
    }

    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    /// Index of the next step to execute
    pub fn checkpoint(&self) -> usize {
        self.checkpoint
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn next_step(&self) -> Option<StepName> {
        if self.is_terminal() {
            return None;
        }
        self.kind.steps().get(self.checkpoint).copied()
    }

    /// Consecutive failed attempts of `step` since it last succeeded
    pub fn failed_attempts(&self, step: StepName) -> u32 {
        self.results
            .iter()
            .rev()
            .take_while(|r| r.step == step && r.outcome != StepOutcome::Success)
            .count() as u32
    }

    /// Artifact of the latest successful attempt of `step`
    pub fn artifact(&self, step: StepName) -> Option<&[u8]> {
        self.results
            .iter()
            .rev()
            .find(|r| r.step == step && r.outcome == StepOutcome::Success)
            .and_then(|r| r.artifact.as_deref())
    }

    pub fn last_result(&self) -> Option<&StepResult> {
        self.results.last()
    }

    pub(crate) fn begin(&mut self) {
        if self.status == RunStatus::Pending {
            self.set_status(RunStatus::InProgress);
        }
    }

    /// Append a result and advance the run accordingly
    pub(crate) fn record(&mut self, result: StepResult) {
        debug_assert_eq!(self.next_step(), Some(result.step));

        let status = match result.outcome {
            StepOutcome::Success => {
                self.checkpoint += 1;
                if result.step.is_terminal() || self.checkpoint >= self.kind.steps().len() {
                    RunStatus::Succeeded
                } else {
                    RunStatus::InProgress
                }
            }
            StepOutcome::RetryableFailure => RunStatus::InProgress,
            StepOutcome::FatalFailure => RunStatus::Failed,
        };

        self.results.push(result);
        self.set_status(status);
    }

    pub(crate) fn abort(&mut self) {
        if !self.is_terminal() {
            self.set_status(RunStatus::Aborted);
        }
    }

    fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

impl fmt::Display for WorkflowRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} run {} on {}: {} ({}/{} steps)",
            self.kind,
            self.id,
            self.device,
            self.status,
            self.checkpoint,
            self.kind.steps().len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(kind: WorkflowKind) -> WorkflowRun {
        WorkflowRun::new(DeviceKey::new("ecid-1"), kind, WorkflowOptions::default())
    }

    #[test]
    fn test_retryable_keeps_checkpoint() {
        let mut run = run(WorkflowKind::PasscodeScreen);
        run.begin();
        run.record(StepResult::new(
            StepName::EnterBootFilesMode,
            1,
            StepOutcome::Success,
            "ok",
        ));
        run.record(StepResult::new(
            StepName::ProbeAndBackupTokens,
            1,
            StepOutcome::RetryableFailure,
            "busy",
        ));

        assert_eq!(run.checkpoint(), 1);
        assert_eq!(run.status(), RunStatus::InProgress);
        assert_eq!(run.next_step(), Some(StepName::ProbeAndBackupTokens));
        assert_eq!(run.failed_attempts(StepName::ProbeAndBackupTokens), 1);
    }

    #[test]
    fn test_terminal_step_success_finishes_run() {
        let mut run = run(WorkflowKind::HelloScreen);
        run.begin();
        run.record(StepResult::new(
            StepName::ProbeCompatibility,
            1,
            StepOutcome::Success,
            "ok",
        ));
        run.record(StepResult::new(StepName::Activate, 1, StepOutcome::Success, "ok"));

        assert_eq!(run.status(), RunStatus::Succeeded);
        assert_eq!(run.next_step(), None);
    }

    #[test]
    fn test_fatal_stops_run() {
        let mut run = run(WorkflowKind::FmiOff);
        run.begin();
        run.record(StepResult::new(
            StepName::ProbeCompatibility,
            1,
            StepOutcome::FatalFailure,
            "unsupported",
        ));
        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.next_step(), None);

        run.abort();
        assert_eq!(run.status(), RunStatus::Failed);
    }

    #[test]
    fn test_artifact_lookup() {
        let mut run = run(WorkflowKind::PasscodeScreen);
        run.begin();
        run.record(StepResult::new(
            StepName::EnterBootFilesMode,
            1,
            StepOutcome::Success,
            "ok",
        ));
        run.record(
            StepResult::new(StepName::ProbeAndBackupTokens, 1, StepOutcome::Success, "ok")
                .with_artifact(Some(b"tokens".to_vec())),
        );
        assert_eq!(
            run.artifact(StepName::ProbeAndBackupTokens),
            Some(b"tokens".as_slice())
        );
    }
}
