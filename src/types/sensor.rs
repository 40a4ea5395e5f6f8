//! Sensor measurement values reported by device managers.

use crate::types::{DeviceId, ModuleId};

/// One measured value from one module of a device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorValue {
    /// Module that produced the value.
    pub module_id: ModuleId,
    /// Measured value.
    pub value: f64,
}

impl SensorValue {
    /// Creates a new measurement value.
    #[must_use]
    pub const fn new(module_id: ModuleId, value: f64) -> Self {
        Self { module_id, value }
    }
}

/// A batch of measurements from one device, as carried by a
/// `measured_values` message.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorData {
    /// Reporting device.
    pub device_id: DeviceId,
    /// Measured values, one per module.
    pub values: Vec<SensorValue>,
}

impl SensorData {
    /// Creates a new measurement batch.
    #[must_use]
    pub const fn new(device_id: DeviceId, values: Vec<SensorValue>) -> Self {
        Self { device_id, values }
    }
}
