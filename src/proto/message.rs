//! Message schema and parsing.
//!
//! Every message is one newline-free JSON object carrying a `message_type`
//! discriminator. Parsing is two-stage so the broker can reply with the
//! right [`ErrorCode`]: syntax errors, unknown discriminators and missing
//! attributes are reported separately.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::command::Command;
use crate::error::{Error, Result};
use crate::types::{DeviceId, DeviceManagerId, DevicePrefix, GlobalId, ModuleId};

const MESSAGE_TYPES: [&str; 13] = [
    "hello_request",
    "hello_response",
    "error",
    "measured_values",
    "listen_cmd",
    "device_unpair_cmd",
    "set_values_cmd",
    "device_list_cmd",
    "device_list_result",
    "device_last_value_cmd",
    "device_last_value_result",
    "default_result",
    "set_values_result",
];

/// Code carried by an `error` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The payload was not valid JSON.
    JsonSyntax,
    /// A required attribute was missing or had the wrong shape.
    MissingAttribute,
    /// The `message_type` is missing, unknown, or not valid here.
    UnsupportedMessage,
    /// No more device managers can register under the prefix.
    MaximumDeviceManagers,
}

impl ErrorCode {
    /// Integer carried in the `error_code` wire field.
    #[must_use]
    pub const fn as_wire(self) -> u64 {
        match self {
            Self::JsonSyntax => 0,
            Self::MissingAttribute => 1,
            Self::UnsupportedMessage => 2,
            Self::MaximumDeviceManagers => 3,
        }
    }

    /// Parses the `error_code` wire field.
    #[must_use]
    pub const fn from_wire(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::JsonSyntax),
            1 => Some(Self::MissingAttribute),
            2 => Some(Self::UnsupportedMessage),
            3 => Some(Self::MaximumDeviceManagers),
            _ => None,
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.as_wire())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = u64::deserialize(deserializer)?;
        Self::from_wire(raw).ok_or_else(|| D::Error::custom(format!("unknown error code {raw}")))
    }
}

/// One `{module_id, raw, type}` value entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueEntry {
    /// Module that the value belongs to (decimal string on the wire).
    pub module_id: ModuleId,
    /// Value rendered as a string.
    pub raw: String,
    /// Value type tag; always `double` today.
    #[serde(rename = "type")]
    pub value_type: String,
}

impl ValueEntry {
    /// Builds a `double`-typed entry from a numeric value.
    #[must_use]
    pub fn double(module_id: ModuleId, value: f64) -> Self {
        Self {
            module_id,
            raw: value.to_string(),
            value_type: "double".to_string(),
        }
    }

    /// Parses the carried value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if `raw` is not a number.
    pub fn value(&self) -> Result<f64> {
        self.raw.parse().map_err(|_| Error::Protocol {
            message: format!("non-numeric value entry: {}", self.raw),
        })
    }
}

/// The `{raw, type}` payload of a `device_last_value_result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastValue {
    /// Value rendered as a string.
    pub raw: String,
    /// Value type tag; always `double` today.
    #[serde(rename = "type")]
    pub value_type: String,
}

impl LastValue {
    /// Builds a `double`-typed payload from a numeric value.
    #[must_use]
    pub fn double(value: f64) -> Self {
        Self {
            raw: value.to_string(),
            value_type: "double".to_string(),
        }
    }

    /// Parses the carried value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if `raw` is not a number.
    pub fn value(&self) -> Result<f64> {
        self.raw.parse().map_err(|_| Error::Protocol {
            message: format!("non-numeric last value: {}", self.raw),
        })
    }
}

/// One `{device_id}` entry of a `device_list_result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// The paired device.
    pub device_id: DeviceId,
}

/// One wire message, in either direction on either endpoint.
///
/// Correlated request/result pairs share an `id`; `set_values_result`
/// deliberately carries none and is correlated by sender identity instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum Message {
    /// Peer asks the broker for an identity.
    HelloRequest {
        /// Protocol family the peer serves.
        device_manager_prefix: DevicePrefix,
    },
    /// Broker grants an identity.
    HelloResponse {
        /// The assigned identity.
        device_manager_id: DeviceManagerId,
    },
    /// Protocol-level failure report.
    Error {
        /// Machine-readable code.
        error_code: ErrorCode,
        /// Human-readable description.
        error_message: String,
    },
    /// Peer publishes measured values.
    MeasuredValues {
        /// Reporting device.
        device_id: DeviceId,
        /// One entry per module.
        values: Vec<ValueEntry>,
    },
    /// Broker puts the peer into listen (pairing) mode.
    ListenCmd {
        /// Correlation id.
        id: GlobalId,
        /// Listen duration in seconds.
        duration: u64,
    },
    /// Broker asks the peer to unpair a device.
    DeviceUnpairCmd {
        /// Correlation id.
        id: GlobalId,
        /// Device to unpair.
        device_id: DeviceId,
    },
    /// Broker asks the peer to set a value on a device module.
    SetValuesCmd {
        /// Correlation id.
        id: GlobalId,
        /// Target device.
        device_id: DeviceId,
        /// Seconds the gateway waits for a device-reported outcome.
        timeout: u64,
        /// The value to set.
        values: ValueEntry,
    },
    /// Peer asks the broker for the devices paired under a prefix.
    DeviceListCmd {
        /// Correlation id.
        id: GlobalId,
        /// Protocol family queried.
        device_manager_prefix: DevicePrefix,
    },
    /// Reply to `device_list_cmd`.
    DeviceListResult {
        /// Correlation id.
        id: GlobalId,
        /// Outcome as a wire integer.
        result_status: i64,
        /// Paired devices.
        device_list: Vec<DeviceEntry>,
    },
    /// Peer asks the broker for the last stored value of a module.
    DeviceLastValueCmd {
        /// Correlation id.
        id: GlobalId,
        /// Device queried.
        device_id: DeviceId,
        /// Module queried.
        module_id: ModuleId,
    },
    /// Reply to `device_last_value_cmd`.
    DeviceLastValueResult {
        /// Correlation id.
        id: GlobalId,
        /// Outcome as a wire integer.
        result_status: i64,
        /// The stored value.
        values: LastValue,
    },
    /// Generic reply carrying only a status.
    DefaultResult {
        /// Correlation id.
        id: GlobalId,
        /// Outcome as a wire integer.
        result_status: i64,
    },
    /// Reply to `set_values_cmd`; carries no correlation id.
    SetValuesResult {
        /// Outcome as a wire integer.
        result_status: i64,
        /// Extended six-state outcome as a wire integer.
        extended_set_status: i64,
    },
}

impl Message {
    /// Builds the wire message carrying a server-side command to a peer.
    #[must_use]
    pub fn from_command(id: GlobalId, command: &Command) -> Self {
        match command {
            Command::ListDevices { prefix } => Self::DeviceListCmd {
                id,
                device_manager_prefix: *prefix,
            },
            Command::GetLastValue {
                device_id,
                module_id,
            } => Self::DeviceLastValueCmd {
                id,
                device_id: *device_id,
                module_id: *module_id,
            },
            Command::SetValue {
                device_id,
                module_id,
                value,
                timeout,
            } => Self::SetValuesCmd {
                id,
                device_id: *device_id,
                timeout: timeout.as_secs(),
                values: ValueEntry::double(*module_id, *value),
            },
            Command::Unpair { device_id } => Self::DeviceUnpairCmd {
                id,
                device_id: *device_id,
            },
            Command::Listen { duration } => Self::ListenCmd {
                id,
                duration: duration.as_secs(),
            },
        }
    }

    /// Builds an `error` message.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            error_code: code,
            error_message: message.into(),
        }
    }

    /// Wire name of the message kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::HelloRequest { .. } => "hello_request",
            Self::HelloResponse { .. } => "hello_response",
            Self::Error { .. } => "error",
            Self::MeasuredValues { .. } => "measured_values",
            Self::ListenCmd { .. } => "listen_cmd",
            Self::DeviceUnpairCmd { .. } => "device_unpair_cmd",
            Self::SetValuesCmd { .. } => "set_values_cmd",
            Self::DeviceListCmd { .. } => "device_list_cmd",
            Self::DeviceListResult { .. } => "device_list_result",
            Self::DeviceLastValueCmd { .. } => "device_last_value_cmd",
            Self::DeviceLastValueResult { .. } => "device_last_value_result",
            Self::DefaultResult { .. } => "default_result",
            Self::SetValuesResult { .. } => "set_values_result",
        }
    }

    /// Serializes to the one-line JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Why an inbound payload could not be parsed into a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    /// Code for the `error` reply.
    pub code: ErrorCode,
    /// Description for the `error` reply.
    pub message: String,
}

impl ParseFailure {
    /// The `error` message answering this failure.
    #[must_use]
    pub fn to_message(&self) -> Message {
        Message::error(self.code, self.message.clone())
    }
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code.as_wire())
    }
}

/// Parses one wire payload.
///
/// # Errors
///
/// Distinguishes JSON syntax errors, an unknown or missing `message_type`,
/// and missing attributes, so the caller can reply with the right code.
pub fn parse(text: &str) -> std::result::Result<Message, ParseFailure> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| ParseFailure {
        code: ErrorCode::JsonSyntax,
        message: format!("invalid json: {e}"),
    })?;

    let Some(kind) = value.get("message_type").and_then(serde_json::Value::as_str) else {
        return Err(ParseFailure {
            code: ErrorCode::UnsupportedMessage,
            message: "missing message_type".to_string(),
        });
    };
    if !MESSAGE_TYPES.contains(&kind) {
        return Err(ParseFailure {
            code: ErrorCode::UnsupportedMessage,
            message: format!("unsupported message_type: {kind}"),
        });
    }
    // Owned before `value` moves into the deserializer.
    let kind = kind.to_owned();

    Message::deserialize(value).map_err(|e| ParseFailure {
        code: ErrorCode::MissingAttribute,
        message: format!("malformed {kind}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceId {
        DeviceId::with_prefix(DevicePrefix::Rf, 0xbeef)
    }

    fn representatives() -> Vec<Message> {
        let id = GlobalId::random();
        vec![
            Message::HelloRequest {
                device_manager_prefix: DevicePrefix::ZWave,
            },
            Message::HelloResponse {
                device_manager_id: DeviceManagerId::new(DevicePrefix::ZWave, 0),
            },
            Message::error(ErrorCode::JsonSyntax, "invalid json"),
            Message::MeasuredValues {
                device_id: device(),
                values: vec![
                    ValueEntry::double(ModuleId::new(0), 19.5),
                    ValueEntry::double(ModuleId::new(1), 1.0),
                ],
            },
            Message::ListenCmd { id, duration: 60 },
            Message::DeviceUnpairCmd {
                id,
                device_id: device(),
            },
            Message::SetValuesCmd {
                id,
                device_id: device(),
                timeout: 10,
                values: ValueEntry::double(ModuleId::new(2), 22.0),
            },
            Message::DeviceListCmd {
                id,
                device_manager_prefix: DevicePrefix::Rf,
            },
            Message::DeviceListResult {
                id,
                result_status: 1,
                device_list: vec![DeviceEntry {
                    device_id: device(),
                }],
            },
            Message::DeviceLastValueCmd {
                id,
                device_id: device(),
                module_id: ModuleId::new(3),
            },
            Message::DeviceLastValueResult {
                id,
                result_status: 1,
                values: LastValue::double(42.5),
            },
            Message::DefaultResult {
                id,
                result_status: 2,
            },
            Message::SetValuesResult {
                result_status: 1,
                extended_set_status: 3,
            },
        ]
    }

    #[test]
    fn test_round_trip_every_message_type() {
        let all = representatives();
        assert_eq!(all.len(), MESSAGE_TYPES.len());
        for message in all {
            let encoded = message.encode().unwrap();
            assert!(!encoded.contains('\n'));
            assert_eq!(parse(&encoded).unwrap(), message);
        }
    }

    #[test]
    fn test_wire_field_shapes() {
        let encoded = Message::SetValuesCmd {
            id: GlobalId::random(),
            device_id: device(),
            timeout: 10,
            values: ValueEntry::double(ModuleId::new(2), 22.0),
        }
        .encode()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["message_type"], "set_values_cmd");
        assert_eq!(value["timeout"], 10);
        assert_eq!(value["values"]["module_id"], "2");
        assert_eq!(value["values"]["raw"], "22");
        assert_eq!(value["values"]["type"], "double");
        assert!(value["device_id"].as_str().unwrap().starts_with("0xa1"));
    }

    #[test]
    fn test_set_values_result_has_no_id() {
        let encoded = Message::SetValuesResult {
            result_status: 1,
            extended_set_status: 3,
        }
        .encode()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert!(value.get("id").is_none());
    }

    #[test]
    fn test_parse_distinguishes_failures() {
        let syntax = parse("{not json").unwrap_err();
        assert_eq!(syntax.code, ErrorCode::JsonSyntax);

        let missing_type = parse("{\"id\": \"x\"}").unwrap_err();
        assert_eq!(missing_type.code, ErrorCode::UnsupportedMessage);

        let unknown = parse("{\"message_type\": \"reboot_cmd\"}").unwrap_err();
        assert_eq!(unknown.code, ErrorCode::UnsupportedMessage);

        let missing_field = parse("{\"message_type\": \"listen_cmd\"}").unwrap_err();
        assert_eq!(missing_field.code, ErrorCode::MissingAttribute);
        // The rejected kind is named in the report.
        assert!(missing_field.message.contains("listen_cmd"));
    }

    #[test]
    fn test_from_command() {
        let id = GlobalId::random();
        let message = Message::from_command(
            id,
            &Command::SetValue {
                device_id: device(),
                module_id: ModuleId::new(0),
                value: 1.5,
                timeout: std::time::Duration::from_secs(7),
            },
        );
        match message {
            Message::SetValuesCmd {
                id: got,
                timeout,
                values,
                ..
            } => {
                assert_eq!(got, id);
                assert_eq!(timeout, 7);
                assert_eq!(values.value().unwrap(), 1.5);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_error_code_round_trip() {
        for code in [
            ErrorCode::JsonSyntax,
            ErrorCode::MissingAttribute,
            ErrorCode::UnsupportedMessage,
            ErrorCode::MaximumDeviceManagers,
        ] {
            assert_eq!(ErrorCode::from_wire(code.as_wire()), Some(code));
        }
        assert_eq!(ErrorCode::from_wire(4), None);
    }
}
