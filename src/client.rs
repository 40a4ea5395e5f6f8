//! Peer-side library a device-manager process embeds.
//!
//! A client registers on the hello endpoint to obtain its identity, then
//! serves the data endpoint: inbound commands are delivered to the
//! embedder through a channel, results and measured values flow back
//! through a [`ClientHandle`]. The handle can also ask the broker relay
//! questions (device list, last value) and await the correlated reply.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::answer::{ResultStatus, SetValueStatus};
use crate::broker::StopHandle;
use crate::error::{Error, Result};
use crate::proto::{self, DeviceEntry, ErrorCode, Message, ValueEntry};
use crate::transport::zmq::{ZmqPeerEndpoint, ZmqRequestEndpoint};
use crate::transport::{PeerEndpoint, RequestEndpoint};
use crate::types::{DeviceId, DeviceManagerId, DevicePrefix, GlobalId, ModuleId, SensorData};

const POLL_SLEEP: Duration = Duration::from_millis(1);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Endpoint addresses and protocol family for a ZeroMQ-backed client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    data_host: String,
    data_port: u16,
    hello_host: String,
    hello_port: u16,
    prefix: DevicePrefix,
}

impl ClientConfig {
    /// Creates a config with localhost defaults for the given prefix.
    #[must_use]
    pub fn new(prefix: DevicePrefix) -> Self {
        Self {
            data_host: "127.0.0.1".to_string(),
            data_port: 8101,
            hello_host: "127.0.0.1".to_string(),
            hello_port: 8100,
            prefix,
        }
    }

    /// Sets the data endpoint host.
    #[must_use]
    pub fn data_host(mut self, host: impl Into<String>) -> Self {
        self.data_host = host.into();
        self
    }

    /// Sets the data endpoint port.
    #[must_use]
    pub const fn data_port(mut self, port: u16) -> Self {
        self.data_port = port;
        self
    }

    /// Sets the hello endpoint host.
    #[must_use]
    pub fn hello_host(mut self, host: impl Into<String>) -> Self {
        self.hello_host = host.into();
        self
    }

    /// Sets the hello endpoint port.
    #[must_use]
    pub const fn hello_port(mut self, port: u16) -> Self {
        self.hello_port = port;
        self
    }

    /// The protocol family this client serves.
    #[must_use]
    pub const fn prefix(&self) -> DevicePrefix {
        self.prefix
    }

    /// Address of the data endpoint.
    #[must_use]
    pub fn data_address(&self) -> String {
        crate::transport::zmq::tcp_address(&self.data_host, self.data_port)
    }

    /// Address of the hello endpoint.
    #[must_use]
    pub fn hello_address(&self) -> String {
        crate::transport::zmq::tcp_address(&self.hello_host, self.hello_port)
    }
}

/// A command the broker asked this peer to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCommand {
    /// Enter listen (pairing) mode; answer with
    /// [`ClientHandle::send_default_result`].
    Listen {
        /// Correlation id to echo in the reply.
        id: GlobalId,
        /// How long listen mode stays active.
        duration: Duration,
    },
    /// Unpair a device; answer with
    /// [`ClientHandle::send_default_result`].
    Unpair {
        /// Correlation id to echo in the reply.
        id: GlobalId,
        /// Device to unpair.
        device_id: DeviceId,
    },
    /// Set a value on a device module; answer with
    /// [`ClientHandle::send_set_value_result`].
    SetValue {
        /// Target device.
        device_id: DeviceId,
        /// Module within the device.
        module_id: ModuleId,
        /// Value to set.
        value: f64,
        /// How long the broker will wait before escalating a timeout.
        timeout: Duration,
    },
}

type PendingMap = Mutex<HashMap<GlobalId, oneshot::Sender<Message>>>;

fn lock_pending(map: &PendingMap) -> MutexGuard<'_, HashMap<GlobalId, oneshot::Sender<Message>>> {
    map.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Registers with a broker over the hello endpoint.
///
/// # Errors
///
/// Returns [`Error::ManagerTableFull`] when the broker refuses for
/// capacity, [`Error::Timeout`] when no reply arrives in `timeout`, or
/// [`Error::Protocol`] on an unexpected reply.
pub async fn register<R: RequestEndpoint>(
    hello: &R,
    prefix: DevicePrefix,
    timeout: Duration,
) -> Result<DeviceManagerId> {
    let request = Message::HelloRequest {
        device_manager_prefix: prefix,
    };
    hello.send(&request.encode()?)?;

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(text) = hello.try_recv()? {
            return match proto::parse(&text) {
                Ok(Message::HelloResponse { device_manager_id }) => {
                    info!(id = %device_manager_id, "registered with broker");
                    Ok(device_manager_id)
                }
                Ok(Message::Error {
                    error_code: ErrorCode::MaximumDeviceManagers,
                    ..
                }) => Err(Error::ManagerTableFull(prefix)),
                Ok(other) => Err(Error::Protocol {
                    message: format!("unexpected hello reply: {}", other.kind()),
                }),
                Err(failure) => Err(Error::Protocol {
                    message: failure.to_string(),
                }),
            };
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        tokio::time::sleep(POLL_SLEEP).await;
    }
}

/// Embedder-facing handle of a running [`DeviceManagerClient`].
///
/// Cheap to clone; all methods queue work for the client's run loop.
#[derive(Clone)]
pub struct ClientHandle {
    id: DeviceManagerId,
    outbox: mpsc::UnboundedSender<String>,
    pending: Arc<PendingMap>,
    stop: StopHandle,
}

impl ClientHandle {
    /// The identity assigned at registration.
    #[must_use]
    pub const fn id(&self) -> DeviceManagerId {
        self.id
    }

    /// Requests the run loop to exit.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Answers a listen or unpair command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] if the run loop is gone.
    pub fn send_default_result(&self, id: GlobalId, status: ResultStatus) -> Result<()> {
        self.send(&Message::DefaultResult {
            id,
            result_status: status.as_wire(),
        })
    }

    /// Answers a set-value command with the device-observed outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] if the run loop is gone.
    pub fn send_set_value_result(
        &self,
        status: ResultStatus,
        extended: SetValueStatus,
    ) -> Result<()> {
        self.send(&Message::SetValuesResult {
            result_status: status.as_wire(),
            extended_set_status: extended.as_wire(),
        })
    }

    /// Publishes measured values to the broker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] if the run loop is gone.
    pub fn report_values(&self, data: &SensorData) -> Result<()> {
        self.send(&Message::MeasuredValues {
            device_id: data.device_id,
            values: data
                .values
                .iter()
                .map(|v| ValueEntry::double(v.module_id, v.value))
                .collect(),
        })
    }

    /// Asks the broker for the devices paired under a prefix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when no reply arrives in `timeout`, or
    /// [`Error::Protocol`] when the broker reports a failure.
    pub async fn request_device_list(
        &self,
        prefix: DevicePrefix,
        timeout: Duration,
    ) -> Result<Vec<DeviceId>> {
        let reply = self
            .request(
                |id| Message::DeviceListCmd {
                    id,
                    device_manager_prefix: prefix,
                },
                timeout,
            )
            .await?;
        match reply {
            Message::DeviceListResult {
                result_status,
                device_list,
                ..
            } if result_status == ResultStatus::Success.as_wire() => Ok(device_list
                .iter()
                .map(|DeviceEntry { device_id }| *device_id)
                .collect()),
            Message::DeviceListResult { result_status, .. } => Err(Error::Protocol {
                message: format!("device list failed with status {result_status}"),
            }),
            other => Err(Error::Protocol {
                message: format!("unexpected reply: {}", other.kind()),
            }),
        }
    }

    /// Asks the broker for the last stored value of a device module.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when no reply arrives in `timeout`, or
    /// [`Error::Protocol`] when the broker reports a failure.
    pub async fn request_last_value(
        &self,
        device_id: DeviceId,
        module_id: ModuleId,
        timeout: Duration,
    ) -> Result<f64> {
        let reply = self
            .request(
                |id| Message::DeviceLastValueCmd {
                    id,
                    device_id,
                    module_id,
                },
                timeout,
            )
            .await?;
        match reply {
            Message::DeviceLastValueResult {
                result_status,
                values,
                ..
            } if result_status == ResultStatus::Success.as_wire() => values.value(),
            Message::DeviceLastValueResult { result_status, .. } => Err(Error::Protocol {
                message: format!("last value failed with status {result_status}"),
            }),
            other => Err(Error::Protocol {
                message: format!("unexpected reply: {}", other.kind()),
            }),
        }
    }

    async fn request<F>(&self, build: F, timeout: Duration) -> Result<Message>
    where
        F: FnOnce(GlobalId) -> Message,
    {
        let id = GlobalId::random();
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);

        if let Err(e) = self.send(&build(id)) {
            lock_pending(&self.pending).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                lock_pending(&self.pending).remove(&id);
                Err(Error::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn send(&self, message: &Message) -> Result<()> {
        let text = message.encode()?;
        self.outbox.send(text).map_err(|_| Error::ChannelClosed)
    }
}

/// Peer-side protocol engine, generic over its data endpoint.
pub struct DeviceManagerClient<P: PeerEndpoint> {
    id: DeviceManagerId,
    data: P,
    commands: mpsc::UnboundedSender<PeerCommand>,
    pending: Arc<PendingMap>,
    outbox_rx: mpsc::UnboundedReceiver<String>,
    stop: StopHandle,
}

impl DeviceManagerClient<ZmqPeerEndpoint> {
    /// Registers with a broker and connects the data socket under the
    /// assigned identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Zmq`] on connection failure or any [`register`]
    /// failure.
    pub async fn connect(
        config: &ClientConfig,
    ) -> Result<(Self, ClientHandle, mpsc::UnboundedReceiver<PeerCommand>)> {
        let context = zmq::Context::new();
        let hello = ZmqRequestEndpoint::connect(&context, &config.hello_address())?;
        let id = register(&hello, config.prefix(), REGISTER_TIMEOUT).await?;
        let data = ZmqPeerEndpoint::connect(&context, &config.data_address(), &id.to_string())?;
        Ok(Self::new(id, data))
    }
}

impl<P: PeerEndpoint> DeviceManagerClient<P> {
    /// Builds a client over an already-identified data endpoint.
    ///
    /// Returns the client, its handle, and the stream of inbound commands.
    pub fn new(
        id: DeviceManagerId,
        data: P,
    ) -> (Self, ClientHandle, mpsc::UnboundedReceiver<PeerCommand>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingMap::default());
        let stop = StopHandle::default();

        let handle = ClientHandle {
            id,
            outbox: outbox_tx,
            pending: Arc::clone(&pending),
            stop: stop.clone(),
        };
        let client = Self {
            id,
            data,
            commands: commands_tx,
            pending,
            outbox_rx,
            stop,
        };
        (client, handle, commands_rx)
    }

    /// Runs the poll loop until stopped.
    pub async fn run(mut self) {
        info!(id = %self.id, "device manager client running");
        while !self.stop.is_stopped() {
            loop {
                let text = match self.data.try_recv() {
                    Ok(Some(text)) => text,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "data receive failed");
                        break;
                    }
                };
                self.handle_message(&text);
            }

            while let Ok(text) = self.outbox_rx.try_recv() {
                if let Err(e) = self.data.send(&text) {
                    warn!(error = %e, "outbound send failed");
                }
            }

            tokio::time::sleep(POLL_SLEEP).await;
        }
        info!(id = %self.id, "device manager client stopped");
    }

    fn handle_message(&self, text: &str) {
        trace!(payload = text, "broker message");
        let message = match proto::parse(text) {
            Ok(message) => message,
            Err(failure) => {
                debug!(%failure, "rejecting broker message");
                self.reply(&failure.to_message());
                return;
            }
        };

        match message {
            Message::ListenCmd { id, duration } => {
                self.deliver(PeerCommand::Listen {
                    id,
                    duration: Duration::from_secs(duration),
                });
            }
            Message::DeviceUnpairCmd { id, device_id } => {
                self.deliver(PeerCommand::Unpair { id, device_id });
            }
            Message::SetValuesCmd {
                id,
                device_id,
                timeout,
                values,
            } => match values.value() {
                Ok(value) => self.deliver(PeerCommand::SetValue {
                    device_id,
                    module_id: values.module_id,
                    value,
                    timeout: Duration::from_secs(timeout),
                }),
                Err(e) => {
                    warn!(%id, %device_id, error = %e, "malformed set-value command");
                    self.reply(&Message::error(
                        ErrorCode::MissingAttribute,
                        "non-numeric value in set_values_cmd",
                    ));
                }
            },
            Message::DeviceListResult { id, .. } | Message::DeviceLastValueResult { id, .. } => {
                match lock_pending(&self.pending).remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(message);
                    }
                    None => warn!(%id, "reply for unknown correlation id"),
                }
            }
            Message::Error {
                error_code,
                error_message,
            } => {
                warn!(code = error_code.as_wire(), message = %error_message, "broker reported error");
            }
            other => {
                debug!(kind = other.kind(), "message not valid on peer endpoint");
                self.reply(&Message::error(
                    ErrorCode::UnsupportedMessage,
                    format!("unsupported message_type: {}", other.kind()),
                ));
            }
        }
    }

    fn deliver(&self, command: PeerCommand) {
        if self.commands.send(command).is_err() {
            warn!(id = %self.id, "no command consumer, dropping");
        }
    }

    fn reply(&self, message: &Message) {
        match message.encode() {
            Ok(text) => {
                if let Err(e) = self.data.send(&text) {
                    warn!(error = %e, "reply send failed");
                }
            }
            Err(e) => warn!(error = %e, "reply encode failed"),
        }
    }
}
