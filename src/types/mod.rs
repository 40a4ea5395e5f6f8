//! Identity and measurement types shared by the broker and its peers.
//!
//! This module contains the small value types used throughout the library:
//! - Protocol prefixes and peer identities
//! - Device and module identities
//! - Correlation ids
//! - Sensor measurements

pub mod id;
pub mod prefix;
pub mod sensor;

pub use id::{DeviceId, DeviceManagerId, GlobalId, ModuleId};
pub use prefix::DevicePrefix;
pub use sensor::{SensorData, SensorValue};
