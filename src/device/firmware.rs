//! Firmware version parsing and ordering

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dotted numeric firmware version (`major.minor.patch`)
///
/// Missing components parse as zero, so `"15"` and `"15.0.0"` compare equal.
/// Accepts the short family labels used by boot-file selection (`"ios15"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid firmware version: {0:?}")]
pub struct ParseFirmwareError(pub String);

impl FirmwareVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Family label such as `ios15`
    pub fn family(&self) -> String {
        format!("ios{}", self.major)
    }
}

impl FromStr for FirmwareVersion {
    type Err = ParseFirmwareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("ios")
            .or_else(|| trimmed.strip_prefix("iOS"))
            .unwrap_or(trimmed);

        if digits.is_empty() {
            return Err(ParseFirmwareError(s.to_string()));
        }

        let mut parts = [0u32; 3];
        for (i, part) in digits.split('.').enumerate() {
            if i >= parts.len() {
                return Err(ParseFirmwareError(s.to_string()));
            }
            parts[i] = part
                .parse::<u32>()
                .map_err(|_| ParseFirmwareError(s.to_string()))?;
        }

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl TryFrom<String> for FirmwareVersion {
    type Error = ParseFirmwareError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FirmwareVersion> for String {
    fn from(value: FirmwareVersion) -> Self {
        value.to_string()
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
