//! Protocol family prefixes.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Identifies the wireless protocol family a device manager speaks.
///
/// The prefix is the high byte of every [`DeviceManagerId`] and
/// [`DeviceId`], so a device identity alone is enough to route a command
/// to the right kind of peer.
///
/// [`DeviceManagerId`]: crate::types::DeviceManagerId
/// [`DeviceId`]: crate::types::DeviceId
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DevicePrefix {
    /// Z-Wave mesh devices.
    #[serde(rename = "Z-Wave")]
    ZWave,
    /// Proprietary RF dongle devices.
    #[serde(rename = "RF")]
    Rf,
    /// Virtual devices (testing and simulation).
    #[serde(rename = "Virtual")]
    Virtual,
}

impl DevicePrefix {
    /// Raw byte used as the high byte of device and peer identities.
    #[must_use]
    pub const fn raw(self) -> u8 {
        match self {
            Self::ZWave => 0xa8,
            Self::Rf => 0xa1,
            Self::Virtual => 0xa5,
        }
    }

    /// Looks up a prefix by its raw byte.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownPrefix`] if the byte maps to no known
    /// protocol family.
    pub fn from_raw(raw: u8) -> Result<Self, Error> {
        match raw {
            0xa8 => Ok(Self::ZWave),
            0xa1 => Ok(Self::Rf),
            0xa5 => Ok(Self::Virtual),
            other => Err(Error::UnknownPrefix(format!("0x{other:02x}"))),
        }
    }

    /// Wire name of the prefix.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ZWave => "Z-Wave",
            Self::Rf => "RF",
            Self::Virtual => "Virtual",
        }
    }
}

// Prefixes order by their raw byte, so identities built on top of them
// sort by raw value rather than by declaration order.
impl Ord for DevicePrefix {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw().cmp(&other.raw())
    }
}

impl PartialOrd for DevicePrefix {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DevicePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DevicePrefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Z-Wave" => Ok(Self::ZWave),
            "RF" => Ok(Self::Rf),
            "Virtual" => Ok(Self::Virtual),
            other => Err(Error::UnknownPrefix(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_round_trip() {
        for prefix in [DevicePrefix::ZWave, DevicePrefix::Rf, DevicePrefix::Virtual] {
            assert_eq!(DevicePrefix::from_raw(prefix.raw()).unwrap(), prefix);
        }
    }

    #[test]
    fn test_unknown_raw() {
        assert!(DevicePrefix::from_raw(0x00).is_err());
        assert!(DevicePrefix::from_raw(0xff).is_err());
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("Z-Wave".parse::<DevicePrefix>().unwrap(), DevicePrefix::ZWave);
        assert_eq!("RF".parse::<DevicePrefix>().unwrap(), DevicePrefix::Rf);
        assert!("Bluetooth".parse::<DevicePrefix>().is_err());
    }

    #[test]
    fn test_ordering_follows_raw_byte() {
        let mut prefixes = [DevicePrefix::ZWave, DevicePrefix::Rf, DevicePrefix::Virtual];
        prefixes.sort();
        // 0xa1 < 0xa5 < 0xa8, not declaration order.
        assert_eq!(
            prefixes,
            [DevicePrefix::Rf, DevicePrefix::Virtual, DevicePrefix::ZWave]
        );
    }

    #[test]
    fn test_wire_name() {
        let json = serde_json::to_string(&DevicePrefix::ZWave).unwrap();
        assert_eq!(json, "\"Z-Wave\"");
        let back: DevicePrefix = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DevicePrefix::ZWave);
    }
}
