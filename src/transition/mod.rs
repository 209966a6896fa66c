//! Boot-mode transitions
//!
//! [`table`] holds the permitted (current, target) pairs and the command that
//! realizes each target; [`ModeTransitionEngine`] executes a request and
//! confirms it through the device monitor.

mod engine;
mod table;

pub use engine::{Dispatch, ModeTransitionEngine, TransitionOutcome};
pub use table::{check, command_for, TransitionOrigin, Verdict};
