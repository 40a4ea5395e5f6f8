//! JSON wire protocol spoken on the broker's endpoints.

mod message;

pub use message::{
    DeviceEntry, ErrorCode, LastValue, Message, ParseFailure, ValueEntry, parse,
};
