//! Device sessions
//!
//! One [`DeviceSession`] per connected device. It owns the connection and
//! runs four tasks:
//! - read pump: device frames → translator → outbound publish queue
//! - write pump: send queue and keep-alive pings → device
//! - registration consumer: backend frames on `register` topics
//! - command consumer: backend frames on `command` / `telemetry` topics,
//!   translated one at a time on a single-worker pool
//!
//! Lifecycle: `Connecting → Registering → Active → Closing → Closed`.
//! `Closing` is entered by exactly one caller, which then tears the session
//! down; every later close is a no-op.

use acgw_core::{
    topic, Apdu, DeviceId, MqttEnvelope, TopicKind, TrData, TranslateError, UplinkOrdering,
    WorkerPool,
};
use acgw_transport::{ConnectInfo, TransportEvent, TransportReceiver, TransportSender};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval_at, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{HubError, Result};
use crate::hub::Hub;
use crate::translator::{SharedTranslator, TrContext};

/// Called once when a session goes offline
pub type OfflineCallback = Box<dyn FnOnce(&DeviceSession, &CloseReason) + Send>;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Registering = 1,
    Active = 2,
    Closing = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Connecting,
            1 => SessionState::Registering,
            2 => SessionState::Active,
            3 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Why a session went offline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Backend kick or an explicit close
    Kicked,
    /// Nothing read within the read deadline
    ReadTimeout,
    /// A write or ping missed its deadline
    WriteTimeout,
    /// Device closed the connection
    PeerClosed(Option<String>),
    /// Connection failed
    Transport(String),
    /// Translator hit a condition the session cannot recover from
    Translator(String),
    /// Hub shutdown
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Kicked => f.write_str("kicked"),
            CloseReason::ReadTimeout => f.write_str("read timeout"),
            CloseReason::WriteTimeout => f.write_str("write timeout"),
            CloseReason::PeerClosed(None) => f.write_str("closed by device"),
            CloseReason::PeerClosed(Some(r)) => write!(f, "closed by device: {}", r),
            CloseReason::Transport(e) => write!(f, "transport error: {}", e),
            CloseReason::Translator(e) => write!(f, "translator: {}", e),
            CloseReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// A backend frame routed to a session
#[derive(Debug, Clone)]
pub struct Downlink {
    pub kind: TopicKind,
    pub envelope: MqttEnvelope,
}

/// Halves and queue receivers handed to the tasks by `start`
struct Pumps {
    receiver: Box<dyn TransportReceiver>,
    send_rx: mpsc::Receiver<Bytes>,
    reg_rx: mpsc::Receiver<Downlink>,
    cmd_rx: mpsc::Receiver<Downlink>,
}

pub struct DeviceSession {
    id: String,
    info: ConnectInfo,
    hub: Hub,
    translator: SharedTranslator,
    config: SessionConfig,
    state: AtomicU8,
    device_id: RwLock<Option<DeviceId>>,
    backend_alias: RwLock<Option<String>>,
    cipher_key: RwLock<Option<Bytes>>,
    transport: tokio::sync::Mutex<Option<Box<dyn TransportSender>>>,
    send_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    reg_tx: Mutex<Option<mpsc::Sender<Downlink>>>,
    cmd_tx: Mutex<Option<mpsc::Sender<Downlink>>>,
    pumps: Mutex<Option<Pumps>>,
    ping: Notify,
    cancel: CancellationToken,
    on_offline: Mutex<Option<OfflineCallback>>,
    advisory: tokio::sync::Mutex<()>,
    created_at: Instant,
}

impl DeviceSession {
    /// Wrap an accepted connection. Nothing runs until [`start`](Self::start).
    pub fn new<S, R>(
        hub: Hub,
        sender: S,
        receiver: R,
        info: ConnectInfo,
        translator: SharedTranslator,
    ) -> Arc<Self>
    where
        S: TransportSender + 'static,
        R: TransportReceiver + 'static,
    {
        let config = hub.config().session.clone();
        let (send_tx, send_rx) = mpsc::channel(config.send_queue.max(1));
        let (reg_tx, reg_rx) = mpsc::channel(config.registration_queue.max(1));
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_queue.max(1));
        let cancel = hub.child_token();

        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            info,
            translator,
            config,
            state: AtomicU8::new(SessionState::Connecting as u8),
            device_id: RwLock::new(None),
            backend_alias: RwLock::new(None),
            cipher_key: RwLock::new(None),
            transport: tokio::sync::Mutex::new(Some(Box::new(sender))),
            send_tx: Mutex::new(Some(send_tx)),
            reg_tx: Mutex::new(Some(reg_tx)),
            cmd_tx: Mutex::new(Some(cmd_tx)),
            pumps: Mutex::new(Some(Pumps {
                receiver: Box::new(receiver),
                send_rx,
                reg_rx,
                cmd_rx,
            })),
            ping: Notify::new(),
            cancel,
            on_offline: Mutex::new(None),
            advisory: tokio::sync::Mutex::new(()),
            created_at: Instant::now(),
            hub,
        })
    }

    /// Spawn the pumps and consumers. Later calls do nothing.
    pub fn start(self: &Arc<Self>) {
        let Some(pumps) = self.pumps.lock().take() else {
            return;
        };

        tokio::spawn(Arc::clone(self).read_pump(pumps.receiver));
        tokio::spawn(Arc::clone(self).write_pump(pumps.send_rx));
        tokio::spawn(Arc::clone(self).registration_loop(pumps.reg_rx));
        tokio::spawn(Arc::clone(self).command_loop(pumps.cmd_rx));
    }

    /// Internal session id, unique per connection
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connect_info(&self) -> &ConnectInfo {
        &self.info
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn device_id(&self) -> Option<DeviceId> {
        self.device_id.read().clone()
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state() >= SessionState::Closing
    }

    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Backend instance that last addressed this device
    pub fn backend_alias(&self) -> Option<String> {
        self.backend_alias.read().clone()
    }

    pub fn set_backend_alias(&self, alias: impl Into<String>) {
        *self.backend_alias.write() = Some(alias.into());
    }

    /// Set or clear the key for the hub's cipher. Applies to every frame
    /// received or sent after the call. An empty key counts as no key.
    pub fn set_cipher_key(&self, key: Option<Bytes>) {
        *self.cipher_key.write() = key;
    }

    pub fn cipher_key(&self) -> Option<Bytes> {
        self.cipher_key.read().clone()
    }

    /// Install the callback run when the session goes offline
    pub fn on_offline<F>(&self, callback: F)
    where
        F: FnOnce(&DeviceSession, &CloseReason) + Send + 'static,
    {
        *self.on_offline.lock() = Some(Box::new(callback));
    }

    /// Advisory lock for translators that need to serialize their own work
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.advisory.lock().await
    }

    /// Ask the write pump for an immediate keep-alive ping
    pub fn ping(&self) {
        self.ping.notify_one();
    }

    /// Record the device id and make the session reachable on `register`
    /// topics
    pub fn register(self: &Arc<Self>, device_id: impl Into<DeviceId>) -> Result<()> {
        let device_id = device_id.into();
        if self.is_closed() {
            return Err(HubError::SessionClosed);
        }

        let previous = self.device_id.write().replace(device_id.clone());
        if let Some(previous) = previous.filter(|p| *p != device_id) {
            self.hub.registry().remove(&previous, self);
        }
        let _ = self.state.compare_exchange(
            SessionState::Connecting as u8,
            SessionState::Registering as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        if let Some(replaced) = self.hub.registry().register(device_id.clone(), Arc::clone(self)) {
            if !Arc::ptr_eq(&replaced, self) {
                debug!("Session {} replaced {} for device {}", self.id, replaced.id, device_id);
            }
        }

        // a close that raced the insert has already run its removal
        if self.is_closed() {
            self.hub.registry().remove(&device_id, self);
            return Err(HubError::SessionClosed);
        }

        debug!("Session {} registering as device {}", self.id, device_id);
        Ok(())
    }

    /// Make the session reachable on `command`, `telemetry` and `kick` topics
    pub fn activate(self: &Arc<Self>) -> Result<()> {
        let device_id = self.device_id().ok_or(HubError::NotRegistered)?;

        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match SessionState::from_u8(current) {
                SessionState::Active => break,
                SessionState::Closing | SessionState::Closed => {
                    return Err(HubError::SessionClosed)
                }
                _ => {}
            }
            match self.state.compare_exchange(
                current,
                SessionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.hub.registry().activate(device_id.clone(), Arc::clone(self));

        if self.is_closed() {
            self.hub.registry().remove(&device_id, self);
            return Err(HubError::SessionClosed);
        }

        info!("Device {} online ({})", device_id, self.info.peer);
        Ok(())
    }

    /// Queue a frame for the device, encrypting it when a key is set
    pub async fn send(&self, data: Bytes) -> Result<()> {
        let data = self.encrypt(data)?;
        let tx = self
            .send_tx
            .lock()
            .clone()
            .ok_or(HubError::SessionClosed)?;
        tx.send(data).await.map_err(|_| HubError::SessionClosed)
    }

    pub(crate) async fn push_registration(&self, downlink: Downlink) -> Result<()> {
        let tx = self.reg_tx.lock().clone().ok_or(HubError::SessionClosed)?;
        tx.send(downlink).await.map_err(|_| HubError::SessionClosed)
    }

    pub(crate) async fn push_command(&self, downlink: Downlink) -> Result<()> {
        let tx = self.cmd_tx.lock().clone().ok_or(HubError::SessionClosed)?;
        tx.send(downlink).await.map_err(|_| HubError::SessionClosed)
    }

    /// Take the session offline. Only the first call does anything.
    pub async fn close(&self, reason: CloseReason) {
        if !self.begin_close() {
            return;
        }

        let device_id = self.device_id();
        match &device_id {
            Some(id) => info!("Device {} offline: {}", id, reason),
            None => info!("Session {} ({}) closed: {}", self.id, self.info.peer, reason),
        }

        if let Some(id) = &device_id {
            self.hub.registry().remove(id, self);
        }
        self.cancel.cancel();

        let sender = self.transport.lock().await.take();
        if let Some(mut sender) = sender {
            match tokio::time::timeout(self.config.write_timeout(), sender.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Session {} close error: {}", self.id, e),
                Err(_) => debug!("Session {} close timed out", self.id),
            }
        }

        self.send_tx.lock().take();
        self.reg_tx.lock().take();
        self.cmd_tx.lock().take();

        let callback = self.on_offline.lock().take();
        if let Some(callback) = callback {
            callback(self, &reason);
        }

        self.state.store(SessionState::Closed as u8, Ordering::Release);
    }

    fn begin_close(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= SessionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn encrypt(&self, data: Bytes) -> Result<Bytes> {
        let Some(key) = self.cipher_key().filter(|k| !k.is_empty()) else {
            return Ok(data);
        };
        let cipher = self
            .hub
            .cipher()
            .ok_or_else(|| HubError::Config("cipher key set but no cipher installed".into()))?;
        Ok(Bytes::from(cipher.encode(&data, &key)?))
    }

    fn decrypt(&self, data: Bytes) -> Result<Bytes> {
        let Some(key) = self.cipher_key().filter(|k| !k.is_empty()) else {
            return Ok(data);
        };
        let cipher = self
            .hub
            .cipher()
            .ok_or_else(|| HubError::Config("cipher key set but no cipher installed".into()))?;
        Ok(Bytes::from(cipher.decode(&data, &key)?))
    }

    /// Topic for an uplink, `None` while the device is unidentified
    fn uplink_topic(&self, tr: &TrData) -> Option<String> {
        if let Some(topic) = &tr.topic {
            return Some(topic.clone());
        }
        let kind = if tr.is_telemetry {
            TopicKind::Telemetry
        } else if self.is_active() {
            TopicKind::Command
        } else {
            TopicKind::Register
        };
        self.backend_topic(kind)
    }

    /// `{alias}/{host}/{kind}/{device}` for the backend that last spoke
    fn backend_topic(&self, kind: TopicKind) -> Option<String> {
        let device_id = self.device_id()?;
        let alias = self.backend_alias();
        let alias = alias.as_deref().unwrap_or(&self.hub.config().backend_alias);
        Some(topic::uplink_topic(
            Some(alias),
            &self.hub.config().hostname,
            kind,
            &device_id,
        ))
    }

    // =========================================================================
    // Pumps
    // =========================================================================

    async fn read_pump(self: Arc<Self>, mut receiver: Box<dyn TransportReceiver>) {
        let uplink_pool = match self.config.uplink {
            UplinkOrdering::Serialized => Some(WorkerPool::new(
                format!("uplink-{}", self.id),
                1,
                self.config.send_queue,
            )),
            UplinkOrdering::Concurrent => None,
        };
        let read_timeout = self.config.read_timeout();

        let reason = loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break Some(CloseReason::Shutdown),
                event = with_deadline(read_timeout, receiver.recv()) => event,
            };

            let frame = match event {
                Some(Some(TransportEvent::Data(frame))) => frame,
                Some(Some(TransportEvent::Disconnected { reason })) => {
                    break Some(CloseReason::PeerClosed(reason))
                }
                Some(Some(TransportEvent::Error(e))) => break Some(CloseReason::Transport(e)),
                Some(None) => break Some(CloseReason::PeerClosed(None)),
                None => break Some(CloseReason::ReadTimeout),
            };

            let frame = match self.decrypt(frame) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Session {} dropping undecryptable frame: {}", self.id, e);
                    continue;
                }
            };

            let session = Arc::clone(&self);
            match &uplink_pool {
                Some(pool) => {
                    if pool.submit(session.handle_uplink(frame)).await.is_err() {
                        break None;
                    }
                }
                None => {
                    tokio::spawn(session.handle_uplink(frame));
                }
            }
        };

        if let Some(pool) = uplink_pool {
            pool.shutdown();
        }
        if let Some(reason) = reason {
            self.close(reason).await;
        }
    }

    async fn write_pump(self: Arc<Self>, mut send_rx: mpsc::Receiver<Bytes>) {
        let write_timeout = self.config.write_timeout();
        let mut ticker = self.config.ping_interval().map(|period| {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        let reason = loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break None,
                frame = send_rx.recv() => match frame {
                    Some(frame) => Some(frame),
                    None => break None,
                },
                _ = tick(&mut ticker) => None,
                _ = self.ping.notified() => None,
            };

            let mut transport = self.transport.lock().await;
            let Some(sender) = transport.as_mut() else {
                break None;
            };
            // close() waits on this lock, so a cancel must abandon the write
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break None,
                result = tokio::time::timeout(write_timeout, async {
                    match frame {
                        Some(frame) => sender.send(frame).await,
                        None => sender.ping().await,
                    }
                }) => result,
            };
            drop(transport);

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => break Some(CloseReason::Transport(e.to_string())),
                Err(_) => break Some(CloseReason::WriteTimeout),
            }
        };

        if let Some(reason) = reason {
            self.close(reason).await;
        }
    }

    async fn registration_loop(self: Arc<Self>, mut reg_rx: mpsc::Receiver<Downlink>) {
        loop {
            let downlink = tokio::select! {
                _ = self.cancel.cancelled() => break,
                downlink = reg_rx.recv() => match downlink {
                    Some(downlink) => downlink,
                    None => break,
                },
            };
            Arc::clone(&self).handle_downlink(downlink).await;
        }
    }

    async fn command_loop(self: Arc<Self>, mut cmd_rx: mpsc::Receiver<Downlink>) {
        let pool = WorkerPool::new(format!("command-{}", self.id), 1, self.config.command_queue);

        loop {
            let downlink = tokio::select! {
                _ = self.cancel.cancelled() => break,
                downlink = cmd_rx.recv() => match downlink {
                    Some(downlink) => downlink,
                    None => break,
                },
            };
            if pool
                .submit(Arc::clone(&self).handle_downlink(downlink))
                .await
                .is_err()
            {
                break;
            }
        }

        pool.shutdown();
    }

    // =========================================================================
    // Translation
    // =========================================================================

    async fn handle_uplink(self: Arc<Self>, frame: Bytes) {
        let translator = Arc::clone(&self.translator);
        let mut ctx = TrContext::uplink(Arc::clone(&self));

        match translator.to_apdu(&mut ctx, frame).await {
            Ok(Some(apdu)) if !ctx.tr.ignore => {
                let Some(topic) = self.uplink_topic(&ctx.tr) else {
                    warn!(
                        "Session {} ({}) has no device id, dropping uplink 0x{:08x}",
                        self.id, self.info.peer, apdu.message_id
                    );
                    return;
                };
                let qos = if ctx.tr.is_telemetry {
                    self.hub.config().telemetry_qos
                } else {
                    self.hub.config().command_qos
                };
                debug!(
                    "Uplink 0x{:08x} {} -> {}",
                    apdu.message_id, ctx.tr.action_name, topic
                );
                let envelope =
                    MqttEnvelope::new(topic, qos, apdu.to_bytes()).retained(ctx.tr.retained);
                if let Err(e) = self.hub.publish(envelope).await {
                    warn!("Session {} uplink not queued: {}", self.id, e);
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Session {} cannot translate device frame: {}", self.id, e);
                if ctx.tr.ignore {
                    return;
                }
                if let Some(reply) = translator.error_reply(&ctx, &e) {
                    if let Err(e) = self.send(reply).await {
                        debug!("Session {} error reply not sent: {}", self.id, e);
                    }
                }
            }
        }
    }

    async fn handle_downlink(self: Arc<Self>, downlink: Downlink) {
        let Downlink { kind, envelope } = downlink;
        if self.is_closed() {
            debug!("Session {} closed, dropping frame on {}", self.id, envelope.topic);
            return;
        }
        let apdu = match Apdu::from_bytes(&envelope.payload) {
            Ok(apdu) => apdu,
            Err(e) => {
                warn!("Dropping undecodable frame on {}: {}", envelope.topic, e);
                return;
            }
        };

        let translator = Arc::clone(&self.translator);
        let mut ctx = TrContext::downlink(Arc::clone(&self), kind, &apdu);

        match translator.from_apdu(&mut ctx, &apdu).await {
            Ok(Some(frame)) if !ctx.tr.ignore => {
                if let Err(e) = self.send(frame).await {
                    debug!("Session {} downlink not sent: {}", self.id, e);
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    "Session {} cannot translate 0x{:08x} from {}: {}",
                    self.id, apdu.message_id, envelope.topic, e
                );
                // never answer a reply or an error frame, or two peers
                // could bounce errors forever
                if kind != TopicKind::Register && apdu.is_request() && !apdu.is_error() {
                    self.publish_error(&apdu, kind, &e).await;
                }
            }
        }
    }

    async fn publish_error(&self, apdu: &Apdu, kind: TopicKind, error: &TranslateError) {
        let reply = apdu.error_reply(error.code(), error.to_string());
        let Some(topic) = self.backend_topic(kind) else {
            return;
        };
        let envelope = MqttEnvelope::new(topic, self.hub.config().command_qos, reply.to_bytes());
        if let Err(e) = self.hub.publish(envelope).await {
            warn!("Session {} error reply not queued: {}", self.id, e);
        }
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.id)
            .field("peer", &self.info.peer)
            .field("device_id", &self.device_id())
            .field("state", &self.state())
            .finish()
    }
}

/// `Some(output)`, or `None` when the deadline passed first
async fn with_deadline<F: Future>(deadline: Option<Duration>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
