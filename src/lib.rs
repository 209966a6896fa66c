//! # devflow
//!
//! Device boot-mode transitions and bypass-workflow orchestration.
//!
//! The crate watches attached devices, drives them between boot modes
//! (Normal, Recovery, DFU, Purple, BootFiles), gates multi-step workflows on
//! firmware compatibility and exposes a toolbox of single-shot operations.
//!
//! # Architecture
//!
//! ```text
//! Engine
//!   ├─> DeviceMonitor (polls the transport, broadcasts snapshots)
//!   │     └─> DeviceRegistry (latest snapshot per device key)
//!   ├─> CompatibilityProbe (firmware → capability set)
//!   ├─> ModeTransitionEngine (per-device lock, command + confirmation)
//!   ├─> BypassWorkflow (checkpointed step runner)
//!   └─> ToolboxDispatcher (access-checked single operations)
//! ```
//!
//! # Data Flow
//!
//! **Observation:** Transport → Monitor → Registry / subscribers
//!
//! **Control:** Workflow / Toolbox → Transition engine → Transport, confirmed by Monitor
//!
//! **Reporting:** every component → [`events::EventSink`]

#![warn(clippy::all)]

/// Toolbox access policy
pub mod access;

/// Firmware capability lookup and gating
pub mod capabilities;

/// Configuration loading and validation
pub mod config;

/// Device identity, firmware and mode model
pub mod device;

/// Fully wired orchestration engine
pub mod engine;

/// Structured engine events
pub mod events;

/// Device presence monitor
pub mod monitor;

/// Latest-known device state
pub mod registry;

/// Error presentation and startup diagnostics
pub mod runtime;

/// Single-shot toolbox operations
pub mod toolbox;

/// Mode transition rules and confirmation
pub mod transition;

/// Driver interface and implementations
pub mod transport;

/// Checkpointed bypass workflows
pub mod workflow;

pub use engine::Engine;
