//! Peer, device, module and correlation identities.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::Error;
use crate::types::DevicePrefix;

const PREFIX_SHIFT: u32 = 8;

/// Identity of one registered device-manager peer.
///
/// A 16-bit value: the high byte is the protocol prefix, the low byte an
/// ident unique among currently registered peers of that prefix. On the
/// wire it travels as a 4-hex-digit string (for example `a800`), which is
/// also the ZeroMQ identity the peer's data socket uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceManagerId {
    prefix: DevicePrefix,
    ident: u8,
}

impl DeviceManagerId {
    /// Builds an identity from a prefix and a per-prefix ident.
    #[must_use]
    pub const fn new(prefix: DevicePrefix, ident: u8) -> Self {
        Self { prefix, ident }
    }

    /// Builds an identity from its raw 16-bit value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownPrefix`] if the high byte maps to no known
    /// protocol family.
    pub fn from_raw(raw: u16) -> Result<Self, Error> {
        let prefix = DevicePrefix::from_raw((raw >> PREFIX_SHIFT) as u8)?;
        Ok(Self {
            prefix,
            ident: (raw & 0xff) as u8,
        })
    }

    /// Raw 16-bit value.
    #[must_use]
    pub const fn value(self) -> u16 {
        ((self.prefix.raw() as u16) << PREFIX_SHIFT) | self.ident as u16
    }

    /// Per-prefix ident (low byte).
    #[must_use]
    pub const fn ident(self) -> u8 {
        self.ident
    }

    /// Protocol prefix (high byte).
    #[must_use]
    pub const fn prefix(self) -> DevicePrefix {
        self.prefix
    }
}

impl fmt::Display for DeviceManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.value())
    }
}

impl FromStr for DeviceManagerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let raw = u16::from_str_radix(digits, 16)
            .map_err(|_| Error::InvalidIdentity(format!("device manager id: {s}")))?;
        Self::from_raw(raw)
    }
}

impl Serialize for DeviceManagerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceManagerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Identity of one paired device.
///
/// A 64-bit value whose high byte is the protocol prefix; hex string with
/// a `0x` prefix on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(u64);

impl DeviceId {
    /// Builds a device identity from its raw 64-bit value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Builds a device identity from a prefix and a 56-bit device number.
    #[must_use]
    pub const fn with_prefix(prefix: DevicePrefix, ident: u64) -> Self {
        Self(((prefix.raw() as u64) << 56) | (ident & 0x00ff_ffff_ffff_ffff))
    }

    /// Raw 64-bit value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Protocol prefix encoded in the high byte.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownPrefix`] if the high byte maps to no known
    /// protocol family.
    pub fn prefix(self) -> Result<DevicePrefix, Error> {
        DevicePrefix::from_raw((self.0 >> 56) as u8)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let raw = u64::from_str_radix(digits, 16)
            .map_err(|_| Error::InvalidIdentity(format!("device id: {s}")))?;
        Ok(Self(raw))
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Identity of one module (sensor/actuator channel) within a device.
///
/// Decimal string on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(u16);

impl ModuleId {
    /// Builds a module identity.
    #[must_use]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Raw value.
    #[must_use]
    pub const fn value(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ModuleId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u16>()
            .map(Self)
            .map_err(|_| Error::InvalidIdentity(format!("module id: {s}")))
    }
}

impl Serialize for ModuleId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ModuleId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Correlation id attached to an outbound message and echoed in its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalId(Uuid);

impl GlobalId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for GlobalId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::InvalidIdentity(format!("global id: {s}")))
    }
}
