//! The gateway broker: registration, routing and result correlation.
//!
//! The broker sits between the server-facing command side and any number
//! of device-manager peers. Peers register on the hello endpoint to get an
//! identity, then exchange commands and results on the data endpoint.
//! Three tables correlate traffic:
//!
//! - `pending` maps a correlation id to the answer awaiting per-peer
//!   `default_result` replies,
//! - `setting` maps a device id to an in-flight value-set request with an
//!   absolute deadline, ticked once per second by the escalation machine,
//! - `routes` remembers which peer asked a relay question (device list,
//!   last value) so its answer can be forwarded back.
//!
//! The run loop is one task: non-blocking polls of both endpoints, outbox
//! drain, a short wait on the relay answer queue, the escalation tick, a
//! tiny sleep. Handlers run on caller tasks; everything they share with
//! the loop sits behind its own lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::answer::{
    Answer, AnswerQueue, CommandResult, ResultData, ResultStatus, SetValueStatus,
};
use crate::command::Command;
use crate::dispatch::{CommandDispatcher, CommandHandler};
use crate::error::Result;
use crate::proto::{self, DeviceEntry, ErrorCode, LastValue, Message};
use crate::registry::DeviceManagerTable;
use crate::transport::zmq::{ZmqDataEndpoint, ZmqReplyEndpoint, tcp_address};
use crate::transport::{DataEndpoint, ReplyEndpoint};
use crate::types::{DeviceId, GlobalId, SensorData, SensorValue};

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const QUEUE_WAIT: Duration = Duration::from_millis(10);
const IDLE_SLEEP: Duration = Duration::from_millis(1);
const ROUTE_TTL: Duration = Duration::from_secs(60);

/// Endpoint addresses for a ZeroMQ-backed broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    data_host: String,
    data_port: u16,
    hello_host: String,
    hello_port: u16,
}

impl BrokerConfig {
    /// Creates a config with localhost defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data_host: "127.0.0.1".to_string(),
            data_port: 8101,
            hello_host: "127.0.0.1".to_string(),
            hello_port: 8100,
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

    /// Address of the data endpoint.
    #[must_use]
    pub fn data_address(&self) -> String {
        tcp_address(&self.data_host, self.data_port)
    }

    /// Address of the hello endpoint.
    #[must_use]
    pub fn hello_address(&self) -> String {
        tcp_address(&self.hello_host, self.hello_port)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Flags a running broker (or client) down.
#[derive(Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Requests the run loop to exit; in-flight requests are abandoned.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether stop was requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

struct PendingRequest {
    answer: Arc<Answer>,
    indexes: Vec<usize>,
}

struct SettingEntry {
    answer: Arc<Answer>,
    result_index: usize,
    peers: Vec<String>,
    deadline: Instant,
}

struct RouteEntry {
    id: GlobalId,
    peer: String,
    command: Command,
    answer: Arc<Answer>,
    forwarded: Vec<bool>,
    deadline: Instant,
}

/// Correlation state shared between the run loop and [`BrokerHandler`].
#[derive(Default)]
struct BrokerTables {
    pending: Mutex<HashMap<GlobalId, PendingRequest>>,
    setting: Mutex<HashMap<DeviceId, SettingEntry>>,
}

impl BrokerTables {
    fn pending(&self) -> MutexGuard<'_, HashMap<GlobalId, PendingRequest>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn setting(&self) -> MutexGuard<'_, HashMap<DeviceId, SettingEntry>> {
        self.setting
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// The broker's server-facing half: a [`CommandHandler`] that relays
/// accepted commands to registered peers.
///
/// Outbound wire messages are queued into an outbox drained by the run
/// loop, so the data socket stays owned by one task.
pub struct BrokerHandler {
    table: Arc<DeviceManagerTable>,
    tables: Arc<BrokerTables>,
    outbox: mpsc::UnboundedSender<(String, String)>,
}

impl BrokerHandler {
    fn peers_for(&self, command: &Command) -> Vec<String> {
        match command {
            Command::Listen { .. } => {
                self.table.all().iter().map(ToString::to_string).collect()
            }
            _ => match command.device_id().and_then(|d| d.prefix().ok()) {
                Some(prefix) => self
                    .table
                    .all_with_prefix(prefix)
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
                None => Vec::new(),
            },
        }
    }

    fn send_to_peers(&self, peers: &[String], text: &str) {
        for peer in peers {
            if self
                .outbox
                .send((peer.clone(), text.to_string()))
                .is_err()
            {
                warn!(peer, "broker loop gone, dropping outbound message");
            }
        }
    }
}

#[async_trait]
impl CommandHandler for BrokerHandler {
    fn name(&self) -> &str {
        "broker"
    }

    fn accept(&self, command: &Command) -> bool {
        match command {
            Command::Listen { .. } => true,
            Command::SetValue { device_id, .. } | Command::Unpair { device_id } => device_id
                .prefix()
                .map(|p| !self.table.all_with_prefix(p).is_empty())
                .unwrap_or(false),
            Command::ListDevices { .. } | Command::GetLastValue { .. } => false,
        }
    }

    async fn handle(&self, command: &Command, answer: &Arc<Answer>) {
        let peers = self.peers_for(command);
        let id = GlobalId::random();
        let message = Message::from_command(id, command);
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(command = command.name(), error = %e, "cannot encode command");
                let index = answer.add_result(CommandResult::pending());
                answer.update_result(index, |r| r.status = ResultStatus::Failed);
                answer.notify_updated();
                return;
            }
        };

        match command {
            Command::SetValue {
                device_id, timeout, ..
            } => {
                // One result per device; any listed peer may resolve it.
                let index = answer.add_result(CommandResult::pending_set_value());
                self.tables.setting().insert(
                    *device_id,
                    SettingEntry {
                        answer: Arc::clone(answer),
                        result_index: index,
                        peers: peers.clone(),
                        deadline: Instant::now() + *timeout,
                    },
                );
            }
            _ => {
                // One result per peer; default_result replies share the id
                // and consume result slots in arrival order. The dispatcher
                // counted one command for this handler; the rest of the
                // fan-out is counted here.
                let mut indexes = Vec::with_capacity(peers.len());
                for extra in 0..peers.len() {
                    if extra > 0 {
                        answer.add_command();
                    }
                    indexes.push(answer.add_result(CommandResult::pending()));
                }
                if !indexes.is_empty() {
                    self.tables.pending().insert(
                        id,
                        PendingRequest {
                            answer: Arc::clone(answer),
                            indexes,
                        },
                    );
                }
            }
        }

        debug!(command = command.name(), %id, peers = peers.len(), "relaying command");
        self.send_to_peers(&peers, &text);
    }
}

/// The broker protocol engine, generic over its two endpoints.
pub struct Broker<D: DataEndpoint, H: ReplyEndpoint> {
    data: D,
    hello: H,
    table: Arc<DeviceManagerTable>,
    dispatcher: Arc<CommandDispatcher>,
    tables: Arc<BrokerTables>,
    relay_queue: AnswerQueue,
    routes: Vec<RouteEntry>,
    sensor_tx: mpsc::UnboundedSender<SensorData>,
    outbox_rx: mpsc::UnboundedReceiver<(String, String)>,
    stop: StopHandle,
}

impl Broker<ZmqDataEndpoint, ZmqReplyEndpoint> {
    /// Binds both ZeroMQ endpoints and builds the broker around them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Zmq`] when either endpoint cannot be bound.
    ///
    /// [`Error::Zmq`]: crate::error::Error::Zmq
    pub fn bind(
        config: &BrokerConfig,
        dispatcher: CommandDispatcher,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SensorData>)> {
        let context = zmq::Context::new();
        let data = ZmqDataEndpoint::bind(&context, &config.data_address())?;
        let hello = ZmqReplyEndpoint::bind(&context, &config.hello_address())?;
        Ok(Self::new(data, hello, dispatcher))
    }
}

impl<D: DataEndpoint, H: ReplyEndpoint> Broker<D, H> {
    /// Builds a broker over arbitrary endpoints.
    ///
    /// The broker registers its own [`BrokerHandler`] with the given
    /// dispatcher, so server-side commands dispatched through it reach the
    /// peers. Measured values received from peers flow out of the returned
    /// channel.
    pub fn new(
        data: D,
        hello: H,
        mut dispatcher: CommandDispatcher,
    ) -> (Self, mpsc::UnboundedReceiver<SensorData>) {
        let table = Arc::new(DeviceManagerTable::new());
        let tables = Arc::new(BrokerTables::default());
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (sensor_tx, sensor_rx) = mpsc::unbounded_channel();

        dispatcher.register(Arc::new(BrokerHandler {
            table: Arc::clone(&table),
            tables: Arc::clone(&tables),
            outbox: outbox_tx,
        }));

        let broker = Self {
            data,
            hello,
            table,
            dispatcher: Arc::new(dispatcher),
            tables,
            relay_queue: AnswerQueue::new(),
            routes: Vec::new(),
            sensor_tx,
            outbox_rx,
            stop: StopHandle::default(),
        };
        (broker, sensor_rx)
    }

    /// The dispatcher, including the broker's own handler.
    #[must_use]
    pub fn dispatcher(&self) -> Arc<CommandDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// The peer identity registry.
    #[must_use]
    pub fn table(&self) -> Arc<DeviceManagerTable> {
        Arc::clone(&self.table)
    }

    /// Handle for stopping the run loop.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Runs the poll loop until stopped.
    ///
    /// Transport and protocol failures are recovered locally (logged, the
    /// offending message dropped or answered with an `error`); only the
    /// stop flag ends the loop.
    pub async fn run(mut self) {
        info!("broker running");
        let mut last_tick = Instant::now();
        while !self.stop.is_stopped() {
            self.poll_data().await;
            self.poll_hello();
            self.drain_outbox();

            for answer in self.relay_queue.wait(QUEUE_WAIT).await {
                self.forward_relay(&answer);
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                last_tick = Instant::now();
                self.tick_setting_table();
                self.expire_routes();
            }

            tokio::time::sleep(IDLE_SLEEP).await;
        }
        info!("broker stopped");
    }

    async fn poll_data(&mut self) {
        loop {
            let (peer, text) = match self.data.try_recv() {
                Ok(Some(received)) => received,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "data receive failed");
                    return;
                }
            };
            self.handle_data(&peer, &text).await;
        }
    }

    async fn handle_data(&mut self, peer: &str, text: &str) {
        trace!(peer, payload = text, "data message");
        let message = match proto::parse(text) {
            Ok(message) => message,
            Err(failure) => {
                debug!(peer, %failure, "rejecting data message");
                self.reply_to_peer(peer, &failure.to_message());
                return;
            }
        };

        match message {
            Message::MeasuredValues { device_id, values } => {
                self.ingest_values(peer, device_id, &values);
            }
            Message::DefaultResult { id, result_status } => {
                self.resolve_pending(peer, id, result_status);
            }
            Message::SetValuesResult {
                result_status,
                extended_set_status,
            } => {
                self.resolve_setting(peer, result_status, extended_set_status);
            }
            Message::DeviceListCmd {
                id,
                device_manager_prefix,
            } => {
                self.relay_from_peer(
                    peer,
                    id,
                    Command::ListDevices {
                        prefix: device_manager_prefix,
                    },
                )
                .await;
            }
            Message::DeviceLastValueCmd {
                id,
                device_id,
                module_id,
            } => {
                self.relay_from_peer(
                    peer,
                    id,
                    Command::GetLastValue {
                        device_id,
                        module_id,
                    },
                )
                .await;
            }
            Message::Error {
                error_code,
                error_message,
            } => {
                warn!(peer, code = error_code.as_wire(), message = %error_message, "peer reported error");
            }
            other => {
                debug!(peer, kind = other.kind(), "message not valid on data endpoint");
                self.reply_to_peer(
                    peer,
                    &Message::error(
                        ErrorCode::UnsupportedMessage,
                        format!("unsupported message_type: {}", other.kind()),
                    ),
                );
            }
        }
    }

    fn ingest_values(&self, peer: &str, device_id: DeviceId, entries: &[proto::ValueEntry]) {
        let mut values = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.value() {
                Ok(value) => values.push(SensorValue::new(entry.module_id, value)),
                Err(e) => warn!(peer, %device_id, error = %e, "skipping measured value"),
            }
        }
        if self
            .sensor_tx
            .send(SensorData::new(device_id, values))
            .is_err()
        {
            warn!(%device_id, "no measured-values consumer, dropping");
        }
    }

    fn resolve_pending(&self, peer: &str, id: GlobalId, result_status: i64) {
        let Some(status) = ResultStatus::from_wire(result_status) else {
            warn!(peer, %id, result_status, "unknown result status");
            return;
        };

        let mut pending = self.tables.pending();
        let Some(request) = pending.get_mut(&id) else {
            warn!(peer, %id, "result for unknown correlation id");
            return;
        };

        if request.indexes.is_empty() {
            pending.remove(&id);
            return;
        }
        // Replies share the id; each consumes the next result slot.
        let index = request.indexes.remove(0);
        let answer = Arc::clone(&request.answer);
        if request.indexes.is_empty() {
            pending.remove(&id);
        }
        drop(pending);

        answer.update_result(index, |r| r.status = status);
        answer.notify_updated();
        trace!(peer, %id, ?status, "resolved pending result");
    }

    fn resolve_setting(&self, peer: &str, result_status: i64, extended: i64) {
        let Some(status) = ResultStatus::from_wire(result_status) else {
            warn!(peer, result_status, "unknown result status");
            return;
        };
        let Some(extended) = SetValueStatus::from_wire(extended) else {
            warn!(peer, extended, "unknown extended set status");
            return;
        };

        // No correlation id on the wire; the sender identity picks the
        // entry instead.
        let setting = self.tables.setting();
        let Some(entry) = setting.values().find(|e| e.peers.iter().any(|p| p == peer)) else {
            warn!(peer, "set-value result from peer with no in-flight request");
            return;
        };
        let answer = Arc::clone(&entry.answer);
        let index = entry.result_index;
        drop(setting);

        answer.update_result(index, |r| {
            r.status = status;
            r.data = ResultData::SetValue {
                extended: Some(extended),
            };
        });
        answer.notify_updated();
        trace!(peer, ?extended, "recorded device-reported set status");
    }

    async fn relay_from_peer(&mut self, peer: &str, id: GlobalId, command: Command) {
        debug!(peer, %id, command = command.name(), "relaying peer request");
        let answer = self.relay_queue.answer();
        self.routes.push(RouteEntry {
            id,
            peer: peer.to_string(),
            command: command.clone(),
            answer: Arc::clone(&answer),
            forwarded: Vec::new(),
            deadline: Instant::now() + ROUTE_TTL,
        });
        self.dispatcher.dispatch(&command, &answer).await;
    }

    /// Forwards newly-terminal results of a relay answer to its peer.
    fn forward_relay(&mut self, answer: &Arc<Answer>) {
        let mut replies: Vec<(String, Message)> = Vec::new();

        self.routes.retain_mut(|route| {
            if !Arc::ptr_eq(&route.answer, answer) {
                return true;
            }

            // No handler accepted the command: answer with a failure.
            if answer.is_empty() {
                replies.push((route.peer.clone(), failure_reply(route.id, &route.command)));
                return false;
            }

            let results = answer.results();
            route.forwarded.resize(results.len(), false);
            for (index, result) in results.iter().enumerate() {
                if result.is_terminal() && !route.forwarded[index] {
                    route.forwarded[index] = true;
                    replies.push((
                        route.peer.clone(),
                        relay_reply(route.id, &route.command, result),
                    ));
                }
            }

            let complete = results.len() == answer.commands_count()
                && route.forwarded.iter().all(|f| *f);
            !complete
        });

        if !self
            .routes
            .iter()
            .any(|route| Arc::ptr_eq(&route.answer, answer))
        {
            self.relay_queue.remove(answer);
        }

        for (peer, message) in replies {
            self.reply_to_peer(&peer, &message);
        }
    }

    fn poll_hello(&mut self) {
        loop {
            let text = match self.hello.try_recv() {
                Ok(Some(text)) => text,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "hello receive failed");
                    return;
                }
            };
            let reply = self.handle_hello(&text);
            if let Err(e) = reply.encode().and_then(|t| self.hello.send(&t)) {
                warn!(error = %e, "hello reply failed");
            }
        }
    }

    fn handle_hello(&self, text: &str) -> Message {
        trace!(payload = text, "hello message");
        let message = match proto::parse(text) {
            Ok(message) => message,
            Err(failure) => {
                debug!(%failure, "rejecting hello message");
                return failure.to_message();
            }
        };

        match message {
            Message::HelloRequest {
                device_manager_prefix,
            } => match self.table.register(device_manager_prefix) {
                Ok(id) => Message::HelloResponse {
                    device_manager_id: id,
                },
                Err(e) => {
                    warn!(prefix = %device_manager_prefix, error = %e, "registration refused");
                    Message::error(ErrorCode::MaximumDeviceManagers, e.to_string())
                }
            },
            other => Message::error(
                ErrorCode::UnsupportedMessage,
                format!("unsupported message_type: {}", other.kind()),
            ),
        }
    }

    fn drain_outbox(&mut self) {
        while let Ok((peer, text)) = self.outbox_rx.try_recv() {
            if let Err(e) = self.data.send_to(&peer, &text) {
                warn!(peer, error = %e, "outbound send failed");
            }
        }
    }

    /// Escalates in-flight value-set requests; first match wins and the
    /// entry is removed, so nothing transitions twice.
    fn tick_setting_table(&self) {
        let now = Instant::now();
        self.tables.setting().retain(|device_id, entry| {
            if entry.answer.results_count() == 0 {
                return true;
            }
            let extended = entry
                .answer
                .at(entry.result_index)
                .and_then(|r| r.extended_status());

            let escalated = if now >= entry.deadline {
                Some(SetValueStatus::GwTimeout)
            } else if extended == Some(SetValueStatus::DeviceFailed) {
                Some(SetValueStatus::GwFailed)
            } else if extended == Some(SetValueStatus::DeviceSuccess) {
                Some(SetValueStatus::GwSuccess)
            } else {
                None
            };

            match escalated {
                Some(status) => {
                    debug!(%device_id, ?status, "escalating set-value request");
                    entry.answer.update_result(entry.result_index, |r| {
                        r.status = if status == SetValueStatus::GwSuccess {
                            ResultStatus::Success
                        } else {
                            ResultStatus::Failed
                        };
                        r.data = ResultData::SetValue {
                            extended: Some(status),
                        };
                    });
                    entry.answer.notify_updated();
                    false
                }
                None => true,
            }
        });
    }

    /// Fails relay routes whose handlers never completed back to the
    /// asking peer and drops their table state.
    fn expire_routes(&mut self) {
        let now = Instant::now();
        let mut replies: Vec<(String, Message)> = Vec::new();
        let mut expired: Vec<Arc<Answer>> = Vec::new();

        self.routes.retain(|route| {
            if now < route.deadline {
                return true;
            }
            warn!(
                peer = %route.peer,
                id = %route.id,
                command = route.command.name(),
                "relay request never completed, expiring"
            );
            replies.push((route.peer.clone(), failure_reply(route.id, &route.command)));
            expired.push(Arc::clone(&route.answer));
            false
        });

        for answer in expired {
            if !self
                .routes
                .iter()
                .any(|route| Arc::ptr_eq(&route.answer, &answer))
            {
                self.relay_queue.remove(&answer);
            }
        }

        for (peer, message) in replies {
            self.reply_to_peer(&peer, &message);
        }
    }

    fn reply_to_peer(&self, peer: &str, message: &Message) {
        match message.encode() {
            Ok(text) => {
                if let Err(e) = self.data.send_to(peer, &text) {
                    warn!(peer, error = %e, "reply send failed");
                }
            }
            Err(e) => warn!(peer, error = %e, "reply encode failed"),
        }
    }

    #[cfg(test)]
    fn has_setting_entry(&self, device_id: DeviceId) -> bool {
        self.tables.setting().contains_key(&device_id)
    }
}

fn relay_reply(id: GlobalId, command: &Command, result: &CommandResult) -> Message {
    let status = result.status.as_wire();
    match (command, &result.data) {
        (Command::ListDevices { .. }, ResultData::DeviceList { devices }) => {
            Message::DeviceListResult {
                id,
                result_status: status,
                device_list: devices
                    .iter()
                    .map(|d| DeviceEntry { device_id: *d })
                    .collect(),
            }
        }
        (Command::ListDevices { .. }, _) => Message::DeviceListResult {
            id,
            result_status: status,
            device_list: Vec::new(),
        },
        (Command::GetLastValue { .. }, ResultData::LastValue { value: Some(value) }) => {
            Message::DeviceLastValueResult {
                id,
                result_status: status,
                values: LastValue::double(*value),
            }
        }
        (Command::GetLastValue { .. }, _) => Message::DeviceLastValueResult {
            id,
            // A terminal result without a value cannot be a success.
            result_status: ResultStatus::Failed.as_wire(),
            values: LastValue::double(0.0),
        },
        _ => Message::DefaultResult {
            id,
            result_status: status,
        },
    }
}

fn failure_reply(id: GlobalId, command: &Command) -> Message {
    let failed = CommandResult {
        status: ResultStatus::Failed,
        data: ResultData::None,
    };
    relay_reply(id, command, &failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PeerEndpoint;
    use crate::transport::mem::{MemDataHub, MemHelloHub};
    use crate::types::{DevicePrefix, ModuleId};

    fn mem_broker() -> (
        Broker<crate::transport::mem::MemDataEndpoint, crate::transport::mem::MemReplyEndpoint>,
        MemDataHub,
        MemHelloHub,
        mpsc::UnboundedReceiver<SensorData>,
    ) {
        let data = MemDataHub::new();
        let hello = MemHelloHub::new();
        let (broker, sensors) =
            Broker::new(data.endpoint(), hello.endpoint(), CommandDispatcher::new());
        (broker, data, hello, sensors)
    }

    #[tokio::test]
    async fn test_set_value_times_out_and_entry_is_removed() {
        let (broker, _data, _hello, _sensors) = mem_broker();
        let device_id = DeviceId::with_prefix(DevicePrefix::Virtual, 1);
        broker.table.register(DevicePrefix::Virtual).unwrap();

        let queue = AnswerQueue::new();
        let answer = queue.answer();
        broker
            .dispatcher
            .dispatch(
                &Command::SetValue {
                    device_id,
                    module_id: ModuleId::new(0),
                    value: 1.0,
                    timeout: Duration::ZERO,
                },
                &answer,
            )
            .await;
        assert!(broker.has_setting_entry(device_id));

        // Deadline already passed; one tick escalates and removes.
        broker.tick_setting_table();
        assert!(!broker.has_setting_entry(device_id));

        let result = answer.at(0).unwrap();
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.extended_status(), Some(SetValueStatus::GwTimeout));

        // A later tick must not transition again.
        broker.tick_setting_table();
        assert_eq!(answer.at(0).unwrap().extended_status(), Some(SetValueStatus::GwTimeout));
    }

    #[tokio::test]
    async fn test_device_reported_status_escalates() {
        let (mut broker, _data, _hello, _sensors) = mem_broker();
        let id = broker.table.register(DevicePrefix::Rf).unwrap();
        let peer = id.to_string();
        let device_id = DeviceId::with_prefix(DevicePrefix::Rf, 2);

        let queue = AnswerQueue::new();
        let answer = queue.answer();
        broker
            .dispatcher
            .dispatch(
                &Command::SetValue {
                    device_id,
                    module_id: ModuleId::new(1),
                    value: 22.5,
                    timeout: Duration::from_secs(60),
                },
                &answer,
            )
            .await;

        let reply = Message::SetValuesResult {
            result_status: ResultStatus::Success.as_wire(),
            extended_set_status: SetValueStatus::DeviceSuccess.as_wire(),
        };
        broker.handle_data(&peer, &reply.encode().unwrap()).await;
        assert_eq!(
            answer.at(0).unwrap().extended_status(),
            Some(SetValueStatus::DeviceSuccess)
        );

        broker.tick_setting_table();
        assert!(!broker.has_setting_entry(device_id));
        let result = answer.at(0).unwrap();
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.extended_status(), Some(SetValueStatus::GwSuccess));
    }

    #[tokio::test]
    async fn test_unknown_correlation_id_dropped() {
        let (mut broker, data, _hello, _sensors) = mem_broker();
        let id = broker.table.register(DevicePrefix::Rf).unwrap();
        let peer = data.peer(&id.to_string());

        let stray = Message::DefaultResult {
            id: GlobalId::random(),
            result_status: 1,
        };
        broker
            .handle_data(&id.to_string(), &stray.encode().unwrap())
            .await;

        // Dropped: no reply, no error.
        assert_eq!(peer.try_recv().unwrap(), None);
    }

    #[tokio::test]
    async fn test_measured_values_forwarded() {
        let (mut broker, _data, _hello, mut sensors) = mem_broker();
        let device_id = DeviceId::with_prefix(DevicePrefix::ZWave, 9);
        let message = Message::MeasuredValues {
            device_id,
            values: vec![proto::ValueEntry::double(ModuleId::new(0), 21.5)],
        };

        broker.handle_data("a800", &message.encode().unwrap()).await;

        let data = sensors.try_recv().unwrap();
        assert_eq!(data.device_id, device_id);
        assert_eq!(data.values, vec![SensorValue::new(ModuleId::new(0), 21.5)]);
    }

    #[tokio::test]
    async fn test_hello_registration_and_capacity_error() {
        let (broker, _data, _hello, _sensors) = mem_broker();
        let request = Message::HelloRequest {
            device_manager_prefix: DevicePrefix::Virtual,
        };
        let reply = broker.handle_hello(&request.encode().unwrap());
        match reply {
            Message::HelloResponse { device_manager_id } => {
                assert_eq!(device_manager_id.prefix(), DevicePrefix::Virtual);
                assert!(broker.table.is_registered(device_manager_id));
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        for _ in 1..256 {
            broker.table.register(DevicePrefix::Virtual).unwrap();
        }
        let refused = broker.handle_hello(&request.encode().unwrap());
        assert!(matches!(
            refused,
            Message::Error {
                error_code: ErrorCode::MaximumDeviceManagers,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unsupported_message_on_data_endpoint() {
        let (mut broker, data, _hello, _sensors) = mem_broker();
        let id = broker.table.register(DevicePrefix::Rf).unwrap();
        let peer = data.peer(&id.to_string());

        broker
            .handle_data(&id.to_string(), "{\"message_type\":\"reboot_cmd\"}")
            .await;

        let reply = proto::parse(&peer.try_recv().unwrap().unwrap()).unwrap();
        assert!(matches!(
            reply,
            Message::Error {
                error_code: ErrorCode::UnsupportedMessage,
                ..
            }
        ));
    }

    /// Accepts device-list requests but never produces a result.
    struct StalledHandler;

    #[async_trait]
    impl CommandHandler for StalledHandler {
        fn name(&self) -> &str {
            "stalled"
        }

        fn accept(&self, command: &Command) -> bool {
            matches!(command, Command::ListDevices { .. })
        }

        async fn handle(&self, _command: &Command, _answer: &Arc<Answer>) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_relay_route_expires() {
        let data = MemDataHub::new();
        let hello = MemHelloHub::new();
        let mut dispatcher = CommandDispatcher::new();
        dispatcher.register(Arc::new(StalledHandler));
        let (mut broker, _sensors) =
            Broker::new(data.endpoint(), hello.endpoint(), dispatcher);

        let id = broker.table.register(DevicePrefix::Rf).unwrap();
        let peer = data.peer(&id.to_string());

        let request = Message::DeviceListCmd {
            id: GlobalId::random(),
            device_manager_prefix: DevicePrefix::Virtual,
        };
        broker
            .handle_data(&id.to_string(), &request.encode().unwrap())
            .await;
        assert_eq!(broker.routes.len(), 1);

        // Not yet due: the route stays.
        broker.expire_routes();
        assert_eq!(broker.routes.len(), 1);

        tokio::time::advance(ROUTE_TTL + Duration::from_secs(1)).await;
        broker.expire_routes();

        assert!(broker.routes.is_empty());
        assert!(broker.relay_queue.is_empty());

        let reply = proto::parse(&peer.try_recv().unwrap().unwrap()).unwrap();
        match reply {
            Message::DeviceListResult {
                result_status,
                device_list,
                ..
            } => {
                assert_eq!(result_status, ResultStatus::Failed.as_wire());
                assert!(device_list.is_empty());
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
