//! Snapshot → capability probing

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::{
    set::{Capability, CapabilitySet},
    table::CompatibilityTable,
};
use crate::{
    device::{DeviceSnapshot, FirmwareVersion, Mode},
    transport::ActivationFlags,
    workflow::WorkflowKind,
};

/// Capabilities a workflow needs before it may start
///
/// Option flags add the capability that implements them, so a HelloScreen
/// run that asks to block updates also needs `supports-update-blocking`.
pub fn required_capabilities(kind: WorkflowKind, options: &ActivationFlags) -> CapabilitySet {
    let mut required: CapabilitySet = match kind {
        WorkflowKind::HelloScreen => [Capability::Activation].into_iter().collect(),
        WorkflowKind::PasscodeScreen => [
            Capability::BootFilesMode,
            Capability::TokenBackup,
            Capability::Activation,
        ]
        .into_iter()
        .collect(),
        WorkflowKind::FmiOff => return [Capability::FmiOff].into_iter().collect(),
    };

    if options.block_updates {
        required.insert(Capability::UpdateBlocking);
    }
    if options.block_restores {
        required.insert(Capability::RestoreBlocking);
    }
    if options.skip_setup {
        required.insert(Capability::SetupSkip);
    }
    required
}

/// Refusal to start a workflow on a device
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[error("{kind} not supported on {mode} device (firmware {firmware_label}): missing {missing}")]
pub struct CapabilityGate {
    pub kind: WorkflowKind,
    pub mode: Mode,
    pub firmware: Option<FirmwareVersion>,
    #[serde(skip)]
    firmware_label: String,
    pub probed: CapabilitySet,
    pub missing: CapabilitySet,
}

/// Pure lookup of a snapshot against the compatibility table
#[derive(Debug, Clone, Default)]
pub struct CompatibilityProbe {
    table: CompatibilityTable,
}

impl CompatibilityProbe {
    pub fn new(table: CompatibilityTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &CompatibilityTable {
        &self.table
    }

    /// Capabilities the device offers for `kind`
    ///
    /// Unknown firmware or an unidentified device yields the empty set.
    pub fn probe(&self, snapshot: &DeviceSnapshot, kind: WorkflowKind) -> CapabilitySet {
        match Self::probe_firmware(snapshot) {
            Some(firmware) => self.table.lookup(firmware, kind),
            None => CapabilitySet::new(),
        }
    }

    /// Whether any workflow kind grants `capability` to this device
    pub fn supports(&self, snapshot: &DeviceSnapshot, capability: Capability) -> bool {
        Self::probe_firmware(snapshot)
            .is_some_and(|firmware| self.table.lookup_any(firmware).contains(capability))
    }

    /// Probe and compare against the workflow's requirements
    pub fn gate(
        &self,
        snapshot: &DeviceSnapshot,
        kind: WorkflowKind,
        options: &ActivationFlags,
    ) -> Result<CapabilitySet, CapabilityGate> {
        let probed = self.probe(snapshot, kind);
        let required = required_capabilities(kind, options);
        debug!(
            "Compatibility for {kind} on {}: probed [{probed}], required [{required}]",
            snapshot.slot
        );

        if required.is_subset(&probed) {
            return Ok(probed);
        }

        Err(CapabilityGate {
            kind,
            mode: snapshot.mode,
            firmware: snapshot.firmware,
            firmware_label: snapshot
                .firmware
                .map_or_else(|| "unknown".to_string(), |f| f.to_string()),
            missing: required.difference(&probed),
            probed,
        })
    }

    fn probe_firmware(snapshot: &DeviceSnapshot) -> Option<&FirmwareVersion> {
        if snapshot.mode == Mode::Unknown {
            return None;
        }
        snapshot.firmware.as_ref()
    }
}
