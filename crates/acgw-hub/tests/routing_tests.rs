//! Hub Routing Tests
//!
//! Backend frames reaching the right session:
//! - Registration handshake and activation
//! - Command/telemetry routing, per-device ordering
//! - Offline devices and foreign topics
//! - Error replies without error loops
//! - Kick, including devices stuck mid-write

use acgw_core::{Apdu, MqttEnvelope, TopicKind, MESSAGE_ERROR, REPLY_FLAG};
use acgw_hub::{CloseReason, DeviceSession, Hub, HubError, SessionState};
use acgw_test_utils::{
    memory_connection, test_config, test_info, wait_for, DeviceEnd, MockPublisher,
    RecordingTranslator, DATA_ID, DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT, LOGIN_ID,
};
use acgw_transport::TransportSender;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn frame(topic: &str, apdu: &Apdu) -> MqttEnvelope {
    MqttEnvelope::new(topic, 2, apdu.to_bytes())
}

/// Connect an in-memory device and bring it straight to Active
fn online(hub: &Hub, translator: &Arc<RecordingTranslator>, id: &str) -> (Arc<DeviceSession>, DeviceEnd) {
    let (tx, rx, device) = memory_connection();
    let session = hub.accept_connection(tx, rx, test_info(None), translator.clone());
    session.register(id).unwrap();
    session.activate().unwrap();
    (session, device)
}

#[tokio::test]
async fn test_registration_handshake() {
    let publisher = MockPublisher::new();
    let hub = Hub::new(test_config(), publisher.clone());
    let translator = RecordingTranslator::new();

    let (tx, rx, mut device) = memory_connection();
    let session = hub.accept_connection(tx, rx, test_info(None), translator.clone());
    assert_eq!(session.state(), SessionState::Connecting);

    device.send("LOGIN:42");
    assert!(publisher.wait_for_published(1, DEFAULT_TIMEOUT).await);

    let login = &publisher.published()[0];
    assert_eq!(login.topic, "coregw/gw-test/register/42");
    assert_eq!(login.qos, 2);
    assert_eq!(
        Apdu::from_bytes(&login.payload).unwrap(),
        Apdu::new(LOGIN_ID, b"42".to_vec())
    );

    assert_eq!(session.state(), SessionState::Registering);
    assert!(hub.registry().registering("42").is_some());
    assert_eq!(hub.registry().registering_count(), 1);
    assert!(hub.session("42").is_none());

    // commands are not delivered before activation
    hub.dispatch(frame("gw-test/command/42", &Apdu::new(0x0300, b"early".to_vec())))
        .await;

    let welcome = Apdu::new(LOGIN_ID | REPLY_FLAG, b"WELCOME".to_vec());
    hub.dispatch(frame("gw-test/core-a/register/42", &welcome)).await;

    assert_eq!(
        device.recv(DEFAULT_TIMEOUT).await,
        Some(Bytes::from("WELCOME"))
    );
    assert!(session.is_active());
    assert!(Arc::ptr_eq(&hub.session("42").unwrap(), &session));
    assert_eq!(session.backend_alias().as_deref(), Some("core-a"));
    assert_eq!(translator.downlinks().len(), 1);

    device.send("status");
    assert!(publisher.wait_for_published(2, DEFAULT_TIMEOUT).await);
    let status = &publisher.published()[1];
    assert_eq!(status.topic, "core-a/gw-test/command/42");
    assert_eq!(
        Apdu::from_bytes(&status.payload).unwrap(),
        Apdu::new(DATA_ID, b"status".to_vec())
    );
}

#[tokio::test]
async fn test_telemetry_and_ignored_uplinks() {
    let publisher = MockPublisher::new();
    let hub = Hub::new(test_config(), publisher.clone());
    let translator = RecordingTranslator::new();
    let (_session, device) = online(&hub, &translator, "7");

    device.send("SKIP");
    device.send("TELE:v=230");
    assert!(publisher.wait_for_published(1, DEFAULT_TIMEOUT).await);

    let tele = &publisher.published()[0];
    assert_eq!(tele.topic, "coregw/gw-test/telemetry/7");
    assert_eq!(tele.qos, 0);
    assert!(!tele.retained);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(publisher.count(), 1);
    assert_eq!(translator.uplinks().len(), 2);
}

#[tokio::test]
async fn test_command_order_is_preserved() {
    let publisher = MockPublisher::new();
    let hub = Hub::new(test_config(), publisher.clone());
    let translator = RecordingTranslator::new();
    let (_session, mut device) = online(&hub, &translator, "42");

    // earlier frames take longer to translate
    translator.push_delays([40, 5, 25, 0, 10].map(Duration::from_millis));

    for i in 0..5u32 {
        let apdu = Apdu::new(0x0300 + i, format!("c{}", i).into_bytes());
        hub.dispatch(frame("gw-test/command/42", &apdu)).await;
    }

    for i in 0..5 {
        assert_eq!(
            device.recv(DEFAULT_TIMEOUT).await,
            Some(Bytes::from(format!("c{}", i)))
        );
    }
}

#[tokio::test]
async fn test_telemetry_topic_reaches_command_path() {
    let publisher = MockPublisher::new();
    let hub = Hub::new(test_config(), publisher.clone());
    let translator = RecordingTranslator::new();
    let (session, mut device) = online(&hub, &translator, "SN001");

    let apdu = Apdu::new(0x0500, b"cfg".to_vec());
    hub.dispatch(frame("gw-test/SN001/telemetry", &apdu)).await;

    assert_eq!(device.recv(DEFAULT_TIMEOUT).await, Some(Bytes::from("cfg")));
    assert_eq!(translator.downlinks()[0].0, Some(TopicKind::Telemetry));
    assert_eq!(session.backend_alias(), None);
}

#[tokio::test]
async fn test_offline_and_foreign_frames_are_dropped() {
    let publisher = MockPublisher::new();
    let hub = Hub::new(test_config(), publisher.clone());
    let translator = RecordingTranslator::new();
    let (_session, mut device) = online(&hub, &translator, "42");

    let apdu = Apdu::new(0x0300, b"x".to_vec());
    hub.dispatch(frame("gw-test/command/99", &apdu)).await;
    hub.dispatch(frame("gw-other/command/42", &apdu)).await;
    hub.dispatch(frame("gw-test/status/42", &apdu)).await;
    hub.dispatch(frame("gw-test/kick/99", &apdu)).await;
    hub.dispatch(MqttEnvelope::new("gw-test/command/42", 2, Bytes::from_static(&[0xff, 0xff])))
        .await;

    assert_eq!(device.recv(Duration::from_millis(200)).await, None);
    assert!(translator.downlinks().is_empty());
    assert_eq!(publisher.count(), 0);

    match hub.send_msg_to_device("99", Bytes::from("hi")).await {
        Err(HubError::DeviceOffline(id)) => assert_eq!(id, "99"),
        other => panic!("expected DeviceOffline, got {:?}", other),
    }

    hub.send_msg_to_device("42", Bytes::from("hi")).await.unwrap();
    assert_eq!(device.recv(DEFAULT_TIMEOUT).await, Some(Bytes::from("hi")));
}

#[tokio::test]
async fn test_failed_request_gets_error_reply() {
    let publisher = MockPublisher::new();
    let hub = Hub::new(test_config(), publisher.clone());
    let translator = RecordingTranslator::new();
    let (_session, _device) = online(&hub, &translator, "42");
    translator.set_fail_downlink(true);

    let request = Apdu::new(0x0300, b"reset".to_vec());
    hub.dispatch(frame("gw-test/core-b/command/42", &request)).await;
    assert!(publisher.wait_for_published(1, DEFAULT_TIMEOUT).await);

    let reply = &publisher.published()[0];
    assert_eq!(reply.topic, "core-b/gw-test/command/42");
    let reply = Apdu::from_bytes(&reply.payload).unwrap();
    assert_eq!(reply.message_id, MESSAGE_ERROR);
    let err = reply.as_error().unwrap();
    assert_eq!(err.request_id, 0x0300);
    assert_eq!(err.code, 4);
    assert!(err.description.contains("0x00000300"));

    // replies and error frames are never answered
    let backend_reply = Apdu::new(0x0300 | REPLY_FLAG, vec![]);
    hub.dispatch(frame("gw-test/command/42", &backend_reply)).await;
    hub.dispatch(frame("gw-test/command/42", &request.error_reply(9, "nope")))
        .await;
    assert!(translator.wait_for_downlinks(3, DEFAULT_TIMEOUT).await);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(publisher.count(), 1);
}

#[tokio::test]
async fn test_error_frames_are_not_forwarded() {
    let publisher = MockPublisher::new();
    let hub = Hub::new(test_config(), publisher.clone());
    let translator = RecordingTranslator::new();
    let (_session, mut device) = online(&hub, &translator, "42");

    let err = Apdu::new(0x0300, vec![]).error_reply(1, "rejected");
    hub.dispatch(frame("gw-test/command/42", &err)).await;
    assert!(translator.wait_for_downlinks(1, DEFAULT_TIMEOUT).await);

    assert_eq!(device.recv(Duration::from_millis(150)).await, None);
    assert_eq!(publisher.count(), 0);
}

#[tokio::test]
async fn test_kick_closes_session_once() {
    let publisher = MockPublisher::new();
    let offline = Arc::new(AtomicU32::new(0));
    let counter = offline.clone();
    let hub = Hub::builder(test_config(), publisher.clone())
        .on_offline(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build();
    let translator = RecordingTranslator::new();
    let (session, device) = online(&hub, &translator, "42");

    hub.dispatch(MqttEnvelope::new("gw-test/42/kick", 2, Bytes::new()))
        .await;
    hub.dispatch(MqttEnvelope::new("gw-test/kick/42", 2, Bytes::new()))
        .await;

    assert!(device.wait_closed(DEFAULT_TIMEOUT).await);
    assert!(
        wait_for(
            || async { session.state() == SessionState::Closed },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT,
        )
        .await
    );
    assert!(hub.session("42").is_none());
    assert!(hub.registry().registering("42").is_none());
    assert_eq!(hub.registry().registering_count(), 0);
    assert_eq!(offline.load(Ordering::SeqCst), 1);
    assert_eq!(device.close_count(), 1);
}

/// Write half of a device that stopped reading
struct StalledSender {
    closes: Arc<AtomicU32>,
}

#[async_trait]
impl TransportSender for StalledSender {
    async fn send(&mut self, _data: Bytes) -> acgw_transport::Result<()> {
        std::future::pending::<acgw_transport::Result<()>>().await
    }

    async fn close(&mut self) -> acgw_transport::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_kick_does_not_wait_for_stalled_write() {
    let hub = Hub::new(test_config(), MockPublisher::new());
    let translator = RecordingTranslator::new();
    let closes = Arc::new(AtomicU32::new(0));

    let (_tx, rx, _device) = memory_connection();
    let sender = StalledSender {
        closes: closes.clone(),
    };
    let session = hub.accept_connection(sender, rx, test_info(None), translator.clone());
    session.register("42").unwrap();
    session.activate().unwrap();

    hub.send_msg_to_device("42", Bytes::from("stuck")).await.unwrap();
    // let the write pump pick the frame up
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    hub.dispatch(MqttEnvelope::new("gw-test/kick/42", 2, Bytes::new()))
        .await;
    assert!(started.elapsed() < Duration::from_millis(200));

    // well inside the 2s write deadline
    assert!(
        wait_for(
            || async { session.state() == SessionState::Closed },
            DEFAULT_CHECK_INTERVAL,
            Duration::from_secs(1),
        )
        .await
    );
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(hub.session("42").is_none());
}

#[tokio::test]
async fn test_queued_commands_dropped_after_close() {
    let publisher = MockPublisher::new();
    let hub = Hub::new(test_config(), publisher.clone());
    let translator = RecordingTranslator::new();
    let (session, _device) = online(&hub, &translator, "42");
    translator.set_fail_downlink(true);
    translator.push_delays([Duration::from_millis(200)]);

    for i in 0..3u32 {
        let request = Apdu::new(0x0300 + i, vec![]);
        hub.dispatch(frame("gw-test/command/42", &request)).await;
    }
    // first command is in the translator, the rest are queued
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.close(CloseReason::Kicked).await;

    assert!(translator.wait_for_downlinks(1, DEFAULT_TIMEOUT).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(translator.downlinks().len(), 1);

    // the command already in flight still answers on its own topic
    assert_eq!(publisher.count(), 1);
    assert_eq!(publisher.published()[0].topic, "coregw/gw-test/command/42");
}

#[tokio::test]
async fn test_close_client() {
    let publisher = MockPublisher::new();
    let hub = Hub::new(test_config(), publisher.clone());
    let translator = RecordingTranslator::new();

    let (tx, rx, device) = memory_connection();
    let session = hub.accept_connection(tx, rx, test_info(Some("/ocpp/CP-3")), translator.clone());
    assert_eq!(session.device_id().as_deref(), Some("CP-3"));
    assert!(hub.registry().registering("CP-3").is_some());

    assert!(hub.close_client("CP-3").await);
    assert!(device.wait_closed(DEFAULT_TIMEOUT).await);
    assert!(!hub.close_client("CP-3").await);
    assert!(hub.registry().registering("CP-3").is_none());
}

#[tokio::test]
async fn test_subscriptions_cover_hostname() {
    let hub = Hub::new(test_config(), MockPublisher::new());
    let filters = hub.subscriptions();
    assert_eq!(filters.len(), 16);
    assert!(filters.iter().all(|f| f.starts_with("gw-test/")));
}

#[tokio::test]
async fn test_correlators_are_shared() {
    let hub = Hub::new(test_config(), MockPublisher::new());
    let other = hub.clone();

    let waiter = hub.correlators().create("42:0x0300");
    let task = tokio::spawn(async move { waiter.listen(Duration::from_secs(2)).await });

    assert!(
        wait_for(
            || async { other.correlators().load("42:0x0300").is_some() },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT,
        )
        .await
    );
    other
        .correlators()
        .load("42:0x0300")
        .unwrap()
        .deliver(Apdu::new(0x8000_0300, vec![]))
        .unwrap();

    let reply = task.await.unwrap().unwrap();
    assert!(reply.is_reply());
}
