//! Observed device model
//!
//! A [`DeviceSnapshot`] is an immutable record of what the transport reported
//! for one physical slot at one point in time. Snapshots are never mutated;
//! every observation produces a new one, shared as `Arc<DeviceSnapshot>`.

mod firmware;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use firmware::{FirmwareVersion, ParseFirmwareError};

/// Boot/operating mode of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Booted into the operating system
    Normal,
    /// Recovery (iBoot) mode
    Recovery,
    /// Device Firmware Update mode
    Dfu,
    /// Factory diagnostics mode
    Purple,
    /// Custom boot files loaded (ramdisk environment)
    BootFiles,
    /// Not identifiable, or detached
    Unknown,
}

impl Mode {
    pub const ALL: [Mode; 6] = [
        Mode::Normal,
        Mode::Recovery,
        Mode::Dfu,
        Mode::Purple,
        Mode::BootFiles,
        Mode::Unknown,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Recovery => "Recovery",
            Self::Dfu => "DFU",
            Self::Purple => "Purple",
            Self::BootFiles => "BootFiles",
            Self::Unknown => "Unknown",
        }
    }

    /// Low-level boot modes where the OS is not running
    pub fn is_boot_loader(&self) -> bool {
        matches!(self, Self::Recovery | Self::Dfu)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "recovery" => Ok(Self::Recovery),
            "dfu" => Ok(Self::Dfu),
            "purple" => Ok(Self::Purple),
            "bootfiles" | "boot-files" | "boot_files" => Ok(Self::BootFiles),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

/// Physical transport slot (raw descriptor) a device occupies
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub String);

impl SlotId {
    pub fn new(slot: impl Into<String>) -> Self {
        Self(slot.into())
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key under which requests for one device are serialized
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey(pub String);

impl DeviceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity fields reported by the device
///
/// All fields are optional: pre-activation devices and boot-loader modes
/// expose only a subset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub ecid: Option<String>,
    pub udid: Option<String>,
    pub serial: Option<String>,
    pub imei: Option<String>,
}

impl DeviceIdentity {
    pub fn is_empty(&self) -> bool {
        self.ecid.is_none() && self.udid.is_none() && self.serial.is_none() && self.imei.is_none()
    }

    /// ECID survives mode changes, so it is preferred over UDID and serial
    pub fn key(&self) -> Option<DeviceKey> {
        self.ecid
            .as_deref()
            .or(self.udid.as_deref())
            .or(self.serial.as_deref())
            .map(DeviceKey::new)
    }
}

/// Immutable observation of one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub slot: SlotId,
    pub identity: DeviceIdentity,
    pub product_type: Option<String>,
    pub firmware: Option<FirmwareVersion>,
    pub mode: Mode,
    pub observed_at: DateTime<Utc>,
}

impl DeviceSnapshot {
    pub fn new(
        slot: SlotId,
        identity: DeviceIdentity,
        firmware: Option<FirmwareVersion>,
        mode: Mode,
    ) -> Self {
        Self {
            slot,
            identity,
            product_type: None,
            firmware,
            mode,
            observed_at: Utc::now(),
        }
    }

    pub fn with_product_type(mut self, product_type: impl Into<String>) -> Self {
        self.product_type = Some(product_type.into());
        self
    }

    /// Detach marker for a slot: mode Unknown, identity cleared
    pub fn detached(slot: SlotId) -> Self {
        Self::new(slot, DeviceIdentity::default(), None, Mode::Unknown)
    }

    pub fn is_detached(&self) -> bool {
        self.mode == Mode::Unknown && self.identity.is_empty()
    }

    pub fn key(&self) -> Option<DeviceKey> {
        self.identity.key()
    }

    /// Whether two snapshots describe the same observable state
    ///
    /// Timestamps are ignored; this is the de-duplication criterion.
    pub fn same_state(&self, other: &DeviceSnapshot) -> bool {
        self.mode == other.mode
            && self.identity == other.identity
            && self.firmware == other.firmware
    }
}

impl fmt::Display for DeviceSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key() {
            Some(key) => write!(f, "{} [{}] mode={}", self.slot, key, self.mode)?,
            None => write!(f, "{} [no identity] mode={}", self.slot, self.mode)?,
        }
        if let Some(fw) = &self.firmware {
            write!(f, " fw={fw}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(ecid: &str) -> DeviceIdentity {
        DeviceIdentity {
            ecid: Some(ecid.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_identity_key_preference() {
        let id = DeviceIdentity {
            ecid: None,
            udid: Some("udid-1".into()),
            serial: Some("SER".into()),
            imei: None,
        };
        assert_eq!(id.key(), Some(DeviceKey::new("udid-1")));
        assert_eq!(identity("0x1A").key(), Some(DeviceKey::new("0x1A")));
        assert_eq!(DeviceIdentity::default().key(), None);
    }

    #[test]
    fn test_detached_snapshot() {
        let snap = DeviceSnapshot::detached(SlotId::new("usb-1"));
        assert!(snap.is_detached());
        assert_eq!(snap.key(), None);
    }

    #[test]
    fn test_same_state_ignores_timestamp() {
        let a = DeviceSnapshot::new(SlotId::new("usb-1"), identity("e"), None, Mode::Normal);
        let mut b = a.clone();
        b.observed_at += chrono::Duration::seconds(5);
        assert!(a.same_state(&b));

        let c = DeviceSnapshot::new(SlotId::new("usb-1"), identity("e"), None, Mode::Dfu);
        assert!(!a.same_state(&c));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("dfu".parse::<Mode>().unwrap(), Mode::Dfu);
        assert_eq!("boot-files".parse::<Mode>().unwrap(), Mode::BootFiles);
        assert!("sideways".parse::<Mode>().is_err());
    }
}
