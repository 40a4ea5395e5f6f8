//! Commands dispatched between the server side and device managers.

use std::time::Duration;

use crate::types::{DeviceId, DevicePrefix, ModuleId};

/// A request routed through the [`CommandDispatcher`].
///
/// Commands are immutable after construction. The closed enum lets
/// handlers test for the kind they care about and extract its payload
/// safely in one `match`.
///
/// [`CommandDispatcher`]: crate::dispatch::CommandDispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Ask for the list of devices paired under a protocol prefix.
    ListDevices {
        /// Protocol family whose devices are requested.
        prefix: DevicePrefix,
    },
    /// Ask for the last stored value of one module of a device.
    GetLastValue {
        /// Device to query.
        device_id: DeviceId,
        /// Module within the device.
        module_id: ModuleId,
    },
    /// Set a value on one module of a device.
    SetValue {
        /// Target device.
        device_id: DeviceId,
        /// Module within the device.
        module_id: ModuleId,
        /// Raw value to set.
        value: f64,
        /// How long the gateway waits for a device-reported outcome.
        timeout: Duration,
    },
    /// Unpair a device from its device manager.
    Unpair {
        /// Device to unpair.
        device_id: DeviceId,
    },
    /// Put all device managers into listen (pairing) mode.
    Listen {
        /// How long listen mode stays active.
        duration: Duration,
    },
}

impl Command {
    /// Short name of the command kind, used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ListDevices { .. } => "list-devices",
            Self::GetLastValue { .. } => "get-last-value",
            Self::SetValue { .. } => "set-value",
            Self::Unpair { .. } => "unpair",
            Self::Listen { .. } => "listen",
        }
    }

    /// Target device, for the command kinds that address a single device.
    #[must_use]
    pub const fn device_id(&self) -> Option<DeviceId> {
        match self {
            Self::GetLastValue { device_id, .. }
            | Self::SetValue { device_id, .. }
            | Self::Unpair { device_id } => Some(*device_id),
            Self::ListDevices { .. } | Self::Listen { .. } => None,
        }
    }
}
