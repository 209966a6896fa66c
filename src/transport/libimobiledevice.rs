//! libimobiledevice command-line transport
//!
//! Drives real hardware through the stock tools: `idevice_id` and
//! `ideviceinfo` for devices booted into the OS, `irecovery` for devices in
//! Recovery/DFU, `ideviceenterrecovery` and `idevicediagnostics` for mode
//! changes. Workflow-specific commands (token backup, activation) have no
//! stock tool and are reported as unsupported.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{CommandAck, CommandTarget, DeviceCommand, DeviceTransport, TransportError};
use crate::device::{DeviceIdentity, DeviceKey, DeviceSnapshot, FirmwareVersion, Mode, SlotId};

/// Tools the transport shells out to
pub const REQUIRED_TOOLS: &[&str] = &[
    "idevice_id",
    "ideviceinfo",
    "ideviceenterrecovery",
    "idevicediagnostics",
    "irecovery",
];

const ECID_PREFIX: &str = "ecid:";

/// How a slot was discovered
///
/// Slots are named after the ECID so a device keeps its slot when it drops
/// from the OS into Recovery/DFU and moves from `idevice_id` to `irecovery`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SlotSource {
    Booted { udid: String },
    BootLoader,
}

/// Transport backed by libimobiledevice utilities
#[derive(Debug)]
pub struct LibimobiledeviceTransport {
    command_timeout: Duration,
    sources: Mutex<HashMap<SlotId, SlotSource>>,
}

impl Default for LibimobiledeviceTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl LibimobiledeviceTransport {
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            command_timeout,
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Names of required tools that are not on `PATH`
    pub async fn check_dependencies() -> Vec<&'static str> {
        let mut missing = Vec::new();
        for tool in REQUIRED_TOOLS {
            let found = Command::new("which")
                .arg(tool)
                .output()
                .await
                .map(|o| o.status.success())
                .unwrap_or(false);
            if !found {
                missing.push(*tool);
            }
        }
        missing
    }

    async fn run(&self, tool: &str, args: &[&str]) -> Result<String, TransportError> {
        debug!("Running {tool} {}", args.join(" "));

        let output = tokio::time::timeout(
            self.command_timeout,
            Command::new(tool).args(args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| TransportError::Timeout(format!("{tool} exceeded {:?}", self.command_timeout)))?
        .map_err(|e| TransportError::Tool {
            tool: tool.to_string(),
            message: e.to_string(),
        })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(classify_tool_error(tool, stderr))
        }
    }

    async fn describe_booted(&self, slot: &SlotId, udid: &str) -> Result<DeviceSnapshot, TransportError> {
        let mut identity = DeviceIdentity {
            udid: Some(udid.to_string()),
            ..Default::default()
        };
        let mut firmware = None;
        let mut product_type = None;

        for key in [
            "UniqueChipID",
            "SerialNumber",
            "InternationalMobileEquipmentIdentity",
            "ProductVersion",
            "ProductType",
        ] {
            let value = match self.run("ideviceinfo", &["-u", udid, "-k", key]).await {
                Ok(v) => v.trim().to_string(),
                Err(e) if e.is_disconnect() => return Err(e),
                Err(e) => {
                    warn!("Could not read {key} for {udid}: {e}");
                    continue;
                }
            };
            if value.is_empty() {
                continue;
            }
            match key {
                "UniqueChipID" => identity.ecid = Some(normalize_ecid(&value)),
                "SerialNumber" => identity.serial = Some(value),
                "InternationalMobileEquipmentIdentity" => identity.imei = Some(value),
                "ProductVersion" => firmware = value.parse::<FirmwareVersion>().ok(),
                "ProductType" => product_type = Some(value),
                _ => {}
            }
        }

        let mut snapshot = DeviceSnapshot::new(slot.clone(), identity, firmware, Mode::Normal);
        snapshot.product_type = product_type;
        Ok(snapshot)
    }

    async fn describe_boot_loader(&self, slot: &SlotId) -> Result<DeviceSnapshot, TransportError> {
        let output = self.run("irecovery", &["-q"]).await?;
        Ok(parse_irecovery_query(slot.clone(), &output))
    }

    fn source(&self, slot: &SlotId) -> Option<SlotSource> {
        self.sources.lock().get(slot).cloned()
    }

    fn udid_for(&self, target: &CommandTarget) -> Option<String> {
        match self.source(&target.slot) {
            Some(SlotSource::Booted { udid }) => Some(udid),
            _ => None,
        }
    }
}

#[async_trait]
impl DeviceTransport for LibimobiledeviceTransport {
    fn name(&self) -> &'static str {
        "libimobiledevice"
    }

    async fn enumerate(&self) -> Result<Vec<SlotId>, TransportError> {
        let mut found = HashMap::new();

        let udids = match self.run("idevice_id", &["-l"]).await {
            Ok(out) => out
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect::<Vec<_>>(),
            Err(TransportError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        for udid in udids {
            let slot = match self
                .run("ideviceinfo", &["-u", &udid, "-k", "UniqueChipID"])
                .await
            {
                Ok(ecid) if !ecid.trim().is_empty() => {
                    SlotId::new(format!("{ECID_PREFIX}{}", normalize_ecid(&ecid)))
                }
                _ => SlotId::new(format!("udid:{udid}")),
            };
            found.insert(slot, SlotSource::Booted { udid });
        }

        // irecovery only sees devices in a boot-loader mode
        if let Ok(out) = self.run("irecovery", &["-q"]).await {
            let snapshot = parse_irecovery_query(SlotId::new(""), &out);
            if let Some(ecid) = snapshot.identity.ecid {
                found.insert(
                    SlotId::new(format!("{ECID_PREFIX}{ecid}")),
                    SlotSource::BootLoader,
                );
            }
        }

        let slots = found.keys().cloned().collect();
        *self.sources.lock() = found;
        Ok(slots)
    }

    async fn describe(&self, slot: &SlotId) -> Result<DeviceSnapshot, TransportError> {
        match self.source(slot) {
            Some(SlotSource::Booted { udid }) => self.describe_booted(slot, &udid).await,
            Some(SlotSource::BootLoader) => self.describe_boot_loader(slot).await,
            None => Err(TransportError::NotFound(slot.to_string())),
        }
    }

    async fn send_command(
        &self,
        target: &CommandTarget,
        command: &DeviceCommand,
    ) -> Result<CommandAck, TransportError> {
        let udid = self.udid_for(target);
        match (command, udid.as_deref()) {
            (DeviceCommand::EnterRecovery, Some(udid)) => {
                self.run("ideviceenterrecovery", &[udid]).await?;
                Ok(CommandAck::with_message("recovery requested"))
            }
            (DeviceCommand::ExitToNormal, None) => {
                self.run("irecovery", &["-n"]).await?;
                Ok(CommandAck::with_message("auto-boot set, rebooting"))
            }
            (DeviceCommand::ExitToNormal, Some(udid)) => {
                self.run("idevicediagnostics", &["-u", udid, "restart"])
                    .await?;
                Ok(CommandAck::with_message("restart requested"))
            }
            (DeviceCommand::BootRamdisk { path }, None) => {
                let path = path.to_string_lossy();
                self.run("irecovery", &["-f", &path]).await?;
                self.run("irecovery", &["-c", "bootx"]).await?;
                Ok(CommandAck::with_message("ramdisk uploaded, booting"))
            }
            (other, _) => Err(TransportError::Unsupported(format!(
                "{other} has no libimobiledevice equivalent"
            ))),
        }
    }

    async fn cancel_outstanding(&self, _key: &DeviceKey) -> Result<(), TransportError> {
        // Child processes are killed when their futures are dropped
        Ok(())
    }
}

fn classify_tool_error(tool: &str, stderr: String) -> TransportError {
    if stderr.contains("No device found") || stderr.contains("ERROR: Unable to connect") {
        TransportError::NotFound(stderr)
    } else if stderr.contains("Could not connect to lockdownd") {
        TransportError::Disconnected(stderr)
    } else {
        TransportError::Tool {
            tool: tool.to_string(),
            message: stderr,
        }
    }
}

fn normalize_ecid(value: &str) -> String {
    match value.trim().parse::<u64>() {
        Ok(n) => format!("0x{n:X}"),
        Err(_) => value.trim().to_string(),
    }
}

/// Parse `irecovery -q` output (`KEY: value` lines)
fn parse_irecovery_query(slot: SlotId, output: &str) -> DeviceSnapshot {
    let mut identity = DeviceIdentity::default();
    let mut mode = Mode::Unknown;
    let mut product_type = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "ECID" => identity.ecid = Some(value.to_uppercase().replacen("0X", "0x", 1)),
            "SRNM" if value != "N/A" => identity.serial = Some(value.to_string()),
            "PRODUCT" => product_type = Some(value.to_string()),
            "MODE" => {
                mode = match value {
                    "Recovery" => Mode::Recovery,
                    "DFU" | "WTF" => Mode::Dfu,
                    _ => Mode::Unknown,
                }
            }
            _ => {}
        }
    }

    let mut snapshot = DeviceSnapshot::new(slot, identity, None, mode);
    snapshot.product_type = product_type;
    snapshot
}
