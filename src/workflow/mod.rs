//! Bypass workflows
//!
//! A workflow is a fixed, ordered list of named steps. Runs are checkpointed
//! so that a retried run never repeats a step that already succeeded, and
//! terminal steps (`activate`, `disable-fmi`) are never entered twice.
//!
//! ```text
//! HelloScreen     probe-compatibility → activate
//! PasscodeScreen  enter-bootfiles-mode → probe-and-backup-tokens → activate
//! FmiOff          probe-compatibility → disable-fmi
//! ```

mod kind;
mod run;
mod runner;

pub use kind::{StepName, WorkflowKind};
pub use run::{RunStatus, StepOutcome, StepResult, WorkflowOptions, WorkflowRun};
pub use runner::{BypassWorkflow, WorkflowError, WorkflowStart};
