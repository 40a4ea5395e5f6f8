//! End-to-end broker/peer exchanges over the in-process transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use devhub::answer::{Answer, CommandResult, ResultData};
use devhub::client::{self, ClientHandle, PeerCommand};
use devhub::proto::{self, ErrorCode, Message};
use devhub::transport::PeerEndpoint;
use devhub::transport::mem::{MemDataHub, MemHelloHub};
use devhub::{
    AnswerQueue, Broker, Command, CommandDispatcher, CommandHandler, DeviceId,
    DeviceManagerClient, DeviceManagerTable, DevicePrefix, Error, ModuleId, ResultStatus,
    SensorData, SensorValue, SetValueStatus, StopHandle,
};

const REGISTER_TIMEOUT: Duration = Duration::from_secs(2);

/// Answers device-list requests from a fixed set, the way a storage
/// layer on the server side would.
struct DeviceStore {
    devices: Vec<DeviceId>,
}

#[async_trait]
impl CommandHandler for DeviceStore {
    fn name(&self) -> &str {
        "device-store"
    }

    fn accept(&self, command: &Command) -> bool {
        matches!(command, Command::ListDevices { .. })
    }

    async fn handle(&self, command: &Command, answer: &Arc<Answer>) {
        let Command::ListDevices { prefix } = command else {
            return;
        };
        let devices = self
            .devices
            .iter()
            .filter(|d| d.prefix().ok() == Some(*prefix))
            .copied()
            .collect();
        answer.add_result(CommandResult {
            status: ResultStatus::Success,
            data: ResultData::DeviceList { devices },
        });
        answer.notify_updated();
    }
}

struct Harness {
    data: MemDataHub,
    hello: MemHelloHub,
    dispatcher: Arc<CommandDispatcher>,
    table: Arc<DeviceManagerTable>,
    sensors: mpsc::UnboundedReceiver<SensorData>,
    stop: StopHandle,
}

impl Harness {
    fn start(setup: impl FnOnce(&mut CommandDispatcher)) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let data = MemDataHub::new();
        let hello = MemHelloHub::new();
        let mut dispatcher = CommandDispatcher::new();
        setup(&mut dispatcher);

        let (broker, sensors) = Broker::new(data.endpoint(), hello.endpoint(), dispatcher);
        let harness = Self {
            data: data.clone(),
            hello: hello.clone(),
            dispatcher: broker.dispatcher(),
            table: broker.table(),
            sensors,
            stop: broker.stop_handle(),
        };
        tokio::spawn(broker.run());
        harness
    }

    async fn spawn_peer(
        &self,
        prefix: DevicePrefix,
    ) -> (ClientHandle, mpsc::UnboundedReceiver<PeerCommand>) {
        let id = client::register(&self.hello.requester(), prefix, REGISTER_TIMEOUT)
            .await
            .expect("registration");
        let (peer, handle, commands) = DeviceManagerClient::new(id, self.data.peer(&id.to_string()));
        tokio::spawn(peer.run());
        (handle, commands)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

async fn wait_complete(queue: &AnswerQueue, answer: &Arc<Answer>, results: usize) {
    timeout(Duration::from_secs(5), async {
        while answer.results_count() < results || answer.is_pending() {
            queue.wait(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("answer did not complete in time");
}

#[tokio::test]
async fn test_listen_fans_out_with_shared_id() {
    let harness = Harness::start(|_| {});
    let (first, mut first_commands) = harness.spawn_peer(DevicePrefix::Rf).await;
    let (second, mut second_commands) = harness.spawn_peer(DevicePrefix::Rf).await;

    let queue = AnswerQueue::new();
    let answer = queue.answer();
    harness
        .dispatcher
        .dispatch(
            &Command::Listen {
                duration: Duration::from_secs(60),
            },
            &answer,
        )
        .await;

    let to_first = timeout(Duration::from_secs(2), first_commands.recv())
        .await
        .expect("first peer command")
        .expect("stream open");
    let to_second = timeout(Duration::from_secs(2), second_commands.recv())
        .await
        .expect("second peer command")
        .expect("stream open");

    let (PeerCommand::Listen { id: first_id, duration }, PeerCommand::Listen { id: second_id, .. }) =
        (to_first, to_second)
    else {
        panic!("expected listen commands");
    };
    assert_eq!(first_id, second_id);
    assert_eq!(duration, Duration::from_secs(60));

    first.send_default_result(first_id, ResultStatus::Success).unwrap();
    second.send_default_result(second_id, ResultStatus::Success).unwrap();

    wait_complete(&queue, &answer, 2).await;
    let results = answer.results();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == ResultStatus::Success));
}

#[tokio::test]
async fn test_set_value_escalates_to_gateway_timeout() {
    let harness = Harness::start(|_| {});
    // A registered peer that never answers.
    let (_handle, _commands) = harness.spawn_peer(DevicePrefix::Virtual).await;
    let device_id = DeviceId::with_prefix(DevicePrefix::Virtual, 0x42);

    let queue = AnswerQueue::new();
    let answer = queue.answer();
    harness
        .dispatcher
        .dispatch(
            &Command::SetValue {
                device_id,
                module_id: ModuleId::new(0),
                value: 23.0,
                timeout: Duration::from_millis(200),
            },
            &answer,
        )
        .await;

    timeout(Duration::from_secs(5), async {
        loop {
            queue.wait(Duration::from_millis(100)).await;
            if let Some(result) = answer.at(0) {
                if result.is_terminal() {
                    assert_eq!(result.status, ResultStatus::Failed);
                    assert_eq!(result.extended_status(), Some(SetValueStatus::GwTimeout));
                    return;
                }
            }
        }
    })
    .await
    .expect("set-value request never timed out");
}

#[tokio::test]
async fn test_device_reported_success_escalates() {
    let harness = Harness::start(|_| {});
    let (handle, mut commands) = harness.spawn_peer(DevicePrefix::Rf).await;
    let device_id = DeviceId::with_prefix(DevicePrefix::Rf, 0x99);

    let queue = AnswerQueue::new();
    let answer = queue.answer();
    harness
        .dispatcher
        .dispatch(
            &Command::SetValue {
                device_id,
                module_id: ModuleId::new(2),
                value: 19.5,
                timeout: Duration::from_secs(30),
            },
            &answer,
        )
        .await;

    let command = timeout(Duration::from_secs(2), commands.recv())
        .await
        .expect("peer command")
        .expect("stream open");
    let PeerCommand::SetValue { value, module_id, .. } = command else {
        panic!("expected set-value command");
    };
    assert_eq!(value, 19.5);
    assert_eq!(module_id, ModuleId::new(2));

    handle
        .send_set_value_result(ResultStatus::Success, SetValueStatus::DeviceSuccess)
        .unwrap();

    timeout(Duration::from_secs(5), async {
        loop {
            queue.wait(Duration::from_millis(100)).await;
            let result = answer.at(0).expect("result exists");
            if result.extended_status() == Some(SetValueStatus::GwSuccess) {
                assert_eq!(result.status, ResultStatus::Success);
                return;
            }
        }
    })
    .await
    .expect("device-reported success never escalated");
}

#[tokio::test]
async fn test_measured_values_reach_the_sensor_stream() {
    let mut harness = Harness::start(|_| {});
    let (handle, _commands) = harness.spawn_peer(DevicePrefix::ZWave).await;

    let device_id = DeviceId::with_prefix(DevicePrefix::ZWave, 0x1234);
    handle
        .report_values(&SensorData::new(
            device_id,
            vec![
                SensorValue::new(ModuleId::new(0), 21.5),
                SensorValue::new(ModuleId::new(1), 55.0),
            ],
        ))
        .unwrap();

    let data = timeout(Duration::from_secs(2), harness.sensors.recv())
        .await
        .expect("sensor data")
        .expect("stream open");
    assert_eq!(data.device_id, device_id);
    assert_eq!(data.values.len(), 2);
    assert_eq!(data.values[0].value, 21.5);
}

#[tokio::test]
async fn test_peer_queries_device_list_through_broker() {
    let paired = DeviceId::with_prefix(DevicePrefix::Rf, 0x77);
    let other = DeviceId::with_prefix(DevicePrefix::ZWave, 0x88);
    let harness = Harness::start(|dispatcher| {
        dispatcher.register(Arc::new(DeviceStore {
            devices: vec![paired, other],
        }));
    });
    let (handle, _commands) = harness.spawn_peer(DevicePrefix::Rf).await;

    let devices = handle
        .request_device_list(DevicePrefix::Rf, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(devices, vec![paired]);
}

#[tokio::test]
async fn test_relay_question_without_handler_fails() {
    let harness = Harness::start(|_| {});
    let (handle, _commands) = harness.spawn_peer(DevicePrefix::Rf).await;

    let result = handle
        .request_device_list(DevicePrefix::Rf, Duration::from_secs(2))
        .await;
    assert!(matches!(result, Err(Error::Protocol { .. })));
}

#[tokio::test]
async fn test_unknown_message_type_answered_with_error() {
    let harness = Harness::start(|_| {});
    // Talk to the data endpoint directly, bypassing the client.
    let raw = harness.data.peer("a1ff");
    raw.send("{\"message_type\":\"reboot_cmd\"}").unwrap();

    let reply = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(text) = raw.try_recv().unwrap() {
                return proto::parse(&text).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("error reply");

    assert!(matches!(
        reply,
        Message::Error {
            error_code: ErrorCode::UnsupportedMessage,
            ..
        }
    ));
}

#[tokio::test]
async fn test_registration_cap_on_the_wire() {
    let harness = Harness::start(|_| {});
    // Fill the prefix below the wire to keep the test fast.
    for _ in 0..256 {
        harness.table.register(DevicePrefix::Virtual).unwrap();
    }

    let result = client::register(
        &harness.hello.requester(),
        DevicePrefix::Virtual,
        REGISTER_TIMEOUT,
    )
    .await;
    assert!(matches!(
        result,
        Err(Error::ManagerTableFull(DevicePrefix::Virtual))
    ));

    // Another prefix still registers fine.
    let id = client::register(&harness.hello.requester(), DevicePrefix::Rf, REGISTER_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(id.prefix(), DevicePrefix::Rf);
}
