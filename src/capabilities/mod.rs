//! Firmware compatibility and capability gating
//!
//! Decides whether a device, as described by its latest snapshot, can run a
//! given workflow. The decision is a pure lookup over a
//! [`CompatibilityTable`] loaded once at startup.
//!
//! # Usage
//!
//! ```ignore
//! let probe = CompatibilityProbe::new(CompatibilityTable::load(path)?);
//!
//! match probe.gate(&snapshot, WorkflowKind::PasscodeScreen, &options) {
//!     Ok(caps) => info!("Device supports {caps}"),
//!     Err(gate) => warn!("{gate}"),
//! }
//! ```

mod probe;
mod set;
mod table;

pub use probe::{required_capabilities, CapabilityGate, CompatibilityProbe};
pub use set::{Capability, CapabilitySet};
pub use table::{CompatibilityRow, CompatibilityTable};
