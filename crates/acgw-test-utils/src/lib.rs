//! Common test helpers for acgw tests
//!
//! - Condition-based waiting (no hardcoded sleeps)
//! - A recording MQTT publisher standing in for the broker
//! - An in-memory device connection
//! - A scriptable translator and a toy cipher

use acgw_core::{Apdu, Encrypt, Error as CoreError, MqttEnvelope, TopicKind, TranslateError};
use acgw_hub::{CloseReason, HubConfig, MqttPublisher, SessionConfig, TrContext, Translator};
use acgw_transport::{
    ConnectInfo, TransportError, TransportEvent, TransportReceiver, TransportSender,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Hostname used by [`test_config`]
pub const TEST_HOST: &str = "gw-test";

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout - condition-based, not time-based
pub async fn wait_for<F, Fut>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Wait for an atomic counter to reach a target value
pub async fn wait_for_count(counter: &AtomicU32, target: u32, max_wait: Duration) -> bool {
    wait_for(
        || async { counter.load(Ordering::SeqCst) >= target },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

// ============================================================================
// Hub Configuration
// ============================================================================

/// Hub config with fixed hostname and no timers
pub fn test_config() -> HubConfig {
    HubConfig {
        hostname: TEST_HOST.to_string(),
        publish_timeout_ms: 500,
        session: SessionConfig {
            read_timeout_secs: 0,
            ping_interval_secs: 0,
            write_timeout_secs: 2,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Connection info for an in-memory device
pub fn test_info(path: Option<&str>) -> ConnectInfo {
    let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    let info = ConnectInfo::new(peer);
    match path {
        Some(path) => info.with_path(path),
        None => info,
    }
}

// ============================================================================
// Mock Broker
// ============================================================================

/// Records every publish instead of talking to a broker
#[derive(Default)]
pub struct MockPublisher {
    published: Mutex<Vec<MqttEnvelope>>,
    count: AtomicU32,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl MockPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn published(&self) -> Vec<MqttEnvelope> {
        self.published.lock().clone()
    }

    /// Published frames on one topic, in publish order
    pub fn on_topic(&self, topic: &str) -> Vec<MqttEnvelope> {
        self.published
            .lock()
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub async fn wait_for_published(&self, target: u32, max_wait: Duration) -> bool {
        wait_for_count(&self.count, target, max_wait).await
    }

    /// Make every publish fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every publish
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }
}

#[async_trait]
impl MqttPublisher for MockPublisher {
    async fn publish(&self, envelope: MqttEnvelope) -> acgw_hub::Result<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(acgw_hub::HubError::Publish("broker unavailable".into()));
        }
        self.published.lock().push(envelope);
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// In-Memory Device Connection
// ============================================================================

/// Gateway-side write half of an in-memory connection
pub struct MemorySender {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    pings: Arc<AtomicU32>,
    closes: Arc<AtomicU32>,
}

#[async_trait]
impl TransportSender for MemorySender {
    async fn send(&mut self, data: Bytes) -> acgw_transport::Result<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(data).map_err(|_| TransportError::ConnectionClosed)
    }

    async fn ping(&mut self) -> acgw_transport::Result<()> {
        if self.tx.is_none() {
            return Err(TransportError::ConnectionClosed);
        }
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> acgw_transport::Result<()> {
        if self.tx.take().is_some() {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Gateway-side read half of an in-memory connection
pub struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl TransportReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

/// The device's end of an in-memory connection
pub struct DeviceEnd {
    tx: Option<mpsc::UnboundedSender<TransportEvent>>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    pings: Arc<AtomicU32>,
    closes: Arc<AtomicU32>,
}

impl DeviceEnd {
    /// Send a frame to the gateway
    pub fn send(&self, data: impl Into<Bytes>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(TransportEvent::Data(data.into()));
        }
    }

    /// Next frame from the gateway, `None` on timeout or once closed
    pub async fn recv(&mut self, max_wait: Duration) -> Option<Bytes> {
        tokio::time::timeout(max_wait, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Hang up from the device side
    pub fn disconnect(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(TransportEvent::Disconnected { reason: None });
        }
    }

    pub fn ping_count(&self) -> u32 {
        self.pings.load(Ordering::SeqCst)
    }

    /// How many times the gateway closed the connection
    pub fn close_count(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    pub async fn wait_closed(&self, max_wait: Duration) -> bool {
        wait_for_count(&self.closes, 1, max_wait).await
    }
}

/// Create an in-memory connection: the gateway halves plus the device end
pub fn memory_connection() -> (MemorySender, MemoryReceiver, DeviceEnd) {
    let (to_device, from_gateway) = mpsc::unbounded_channel();
    let (to_gateway, from_device) = mpsc::unbounded_channel();
    let pings = Arc::new(AtomicU32::new(0));
    let closes = Arc::new(AtomicU32::new(0));

    (
        MemorySender {
            tx: Some(to_device),
            pings: pings.clone(),
            closes: closes.clone(),
        },
        MemoryReceiver { rx: from_device },
        DeviceEnd {
            tx: Some(to_gateway),
            rx: from_gateway,
            pings,
            closes,
        },
    )
}

// ============================================================================
// Scriptable Translator
// ============================================================================

/// Message id of login uplinks
pub const LOGIN_ID: u32 = 0x0000_0001;
/// Message id of ordinary uplinks
pub const DATA_ID: u32 = 0x0000_0200;

/// Translator driven by frame prefixes, recording everything it sees.
///
/// Device frames:
/// - `LOGIN:<id>` registers the session as `<id>` and publishes a login
/// - `TELE:<data>` publishes telemetry
/// - `BAD` fails translation
/// - `SKIP` is ignored
/// - `QUIT` closes the session
/// - anything else is published as a [`DATA_ID`] frame
///
/// Backend frames are forwarded as their payload. A reply on the
/// registration path activates the session. Error frames are dropped.
#[derive(Default)]
pub struct RecordingTranslator {
    uplinks: Mutex<Vec<Bytes>>,
    downlinks: Mutex<Vec<(Option<TopicKind>, Apdu)>>,
    downlink_count: AtomicU32,
    fail_downlink: AtomicBool,
    delays: Mutex<VecDeque<Duration>>,
    error_reply: Mutex<Option<Bytes>>,
}

impl RecordingTranslator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn uplinks(&self) -> Vec<Bytes> {
        self.uplinks.lock().clone()
    }

    pub fn downlinks(&self) -> Vec<(Option<TopicKind>, Apdu)> {
        self.downlinks.lock().clone()
    }

    pub async fn wait_for_downlinks(&self, target: u32, max_wait: Duration) -> bool {
        wait_for_count(&self.downlink_count, target, max_wait).await
    }

    /// Make every backend frame fail translation
    pub fn set_fail_downlink(&self, fail: bool) {
        self.fail_downlink.store(fail, Ordering::SeqCst);
    }

    /// Delays applied to the next backend frames, one per frame
    pub fn push_delays(&self, delays: impl IntoIterator<Item = Duration>) {
        self.delays.lock().extend(delays);
    }

    /// Device reply sent for device frames that fail translation
    pub fn set_error_reply(&self, reply: Option<Bytes>) {
        *self.error_reply.lock() = reply;
    }
}

#[async_trait]
impl Translator for RecordingTranslator {
    async fn to_apdu(
        &self,
        ctx: &mut TrContext,
        frame: Bytes,
    ) -> Result<Option<Apdu>, TranslateError> {
        self.uplinks.lock().push(frame.clone());

        if let Some(id) = frame.strip_prefix(b"LOGIN:") {
            let id = String::from_utf8_lossy(id).to_string();
            ctx.session
                .register(id.clone())
                .map_err(|e| TranslateError::Other(e.to_string()))?;
            ctx.tr.action_name = "login".into();
            return Ok(Some(Apdu::new(LOGIN_ID, id.into_bytes())));
        }
        if let Some(data) = frame.strip_prefix(b"TELE:") {
            ctx.tr.is_telemetry = true;
            return Ok(Some(Apdu::new(DATA_ID, data.to_vec())));
        }
        if &frame[..] == b"BAD" {
            return Err(TranslateError::Decode("bad frame".into()));
        }
        if &frame[..] == b"QUIT" {
            ctx.session
                .close(CloseReason::Translator("device quit".into()))
                .await;
            return Ok(None);
        }
        if &frame[..] == b"SKIP" {
            ctx.tr.ignore = true;
            return Ok(None);
        }

        Ok(Some(Apdu::new(DATA_ID, frame.to_vec())))
    }

    async fn from_apdu(
        &self,
        ctx: &mut TrContext,
        apdu: &Apdu,
    ) -> Result<Option<Bytes>, TranslateError> {
        let delay = self.delays.lock().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.downlinks.lock().push((ctx.kind, apdu.clone()));
        self.downlink_count.fetch_add(1, Ordering::SeqCst);

        if self.fail_downlink.load(Ordering::SeqCst) {
            return Err(TranslateError::Unsupported(apdu.message_id));
        }
        if ctx.tr.is_error {
            ctx.tr.ignore = true;
            return Ok(None);
        }
        if ctx.kind == Some(TopicKind::Register) && apdu.is_reply() {
            ctx.session
                .activate()
                .map_err(|e| TranslateError::Other(e.to_string()))?;
        }

        Ok(Some(Bytes::from(apdu.payload.clone())))
    }

    fn error_reply(&self, _ctx: &TrContext, _error: &TranslateError) -> Option<Bytes> {
        self.error_reply.lock().clone()
    }
}

// ============================================================================
// Toy Cipher
// ============================================================================

/// Repeating-key XOR. Only for tests.
pub struct XorCipher;

impl XorCipher {
    fn apply(data: &[u8], key: &[u8]) -> acgw_core::Result<Vec<u8>> {
        if key.is_empty() {
            return Err(CoreError::Cipher("empty key".into()));
        }
        Ok(data
            .iter()
            .zip(key.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect())
    }
}

impl Encrypt for XorCipher {
    fn encode(&self, data: &[u8], key: &[u8]) -> acgw_core::Result<Vec<u8>> {
        Self::apply(data, key)
    }

    fn decode(&self, data: &[u8], key: &[u8]) -> acgw_core::Result<Vec<u8>> {
        Self::apply(data, key)
    }
}

/// XOR a frame the way a keyed device would
pub fn xor(data: &[u8], key: &[u8]) -> Vec<u8> {
    data.iter().zip(key.iter().cycle()).map(|(b, k)| b ^ k).collect()
}
