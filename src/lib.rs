//! Gateway broker between a central server and device-manager processes.
//!
//! A gateway talks to many wireless protocols through separate
//! device-manager processes, one per protocol family. This crate provides
//! both halves of the plumbing between them:
//!
//! - the **broker** ([`Broker`]): assigns identities to connecting device
//!   managers, relays server-side commands to them, correlates their
//!   asynchronous results back to awaitable [`Answer`]s, and runs a
//!   timeout-escalation state machine for value-set requests;
//! - the **client** ([`DeviceManagerClient`]): the library a
//!   device-manager process embeds to register, receive commands, report
//!   results and publish measured values.
//!
//! Both speak a newline-free JSON protocol over two ZeroMQ socket pairs
//! (ROUTER/DEALER for data, REP/REQ for registration); an in-process
//! transport ([`transport::mem`]) backs tests and single-process setups.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use devhub::{
//!     AnswerQueue, Broker, BrokerConfig, Command, CommandDispatcher, DeviceId,
//! };
//!
//! # async fn demo() -> devhub::Result<()> {
//! let config = BrokerConfig::new().data_port(8101).hello_port(8100);
//! let (broker, mut sensors) = Broker::bind(&config, CommandDispatcher::new())?;
//! let dispatcher = broker.dispatcher();
//! tokio::spawn(broker.run());
//!
//! // Dispatch a command and wait for its results.
//! let queue = AnswerQueue::new();
//! let answer = queue.answer();
//! let command = Command::Listen {
//!     duration: Duration::from_secs(60),
//! };
//! dispatcher.dispatch(&command, &answer).await;
//! let updated = queue.wait(Duration::from_secs(1)).await;
//! assert_eq!(updated.len(), 1);
//!
//! // Measured values from all peers arrive on one channel.
//! if let Some(data) = sensors.recv().await {
//!     println!("{}: {} values", data.device_id, data.values.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod answer;
pub mod broker;
pub mod client;
pub mod command;
pub mod dispatch;
pub mod error;
pub mod proto;
pub mod registry;
pub mod transport;
pub mod types;

pub use answer::{Answer, AnswerQueue, CommandResult, ResultData, ResultStatus, SetValueStatus};
pub use broker::{Broker, BrokerConfig, BrokerHandler, StopHandle};
pub use client::{ClientConfig, ClientHandle, DeviceManagerClient, PeerCommand};
pub use command::Command;
pub use dispatch::{CommandDispatcher, CommandHandler};
pub use error::{Error, Result};
pub use registry::DeviceManagerTable;
pub use types::{
    DeviceId, DeviceManagerId, DevicePrefix, GlobalId, ModuleId, SensorData, SensorValue,
};
