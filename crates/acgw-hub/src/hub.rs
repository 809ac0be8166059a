//! The gateway hub
//!
//! Owns the device registry and the outbound publish pipeline, routes
//! inbound MQTT frames to sessions, and accepts device connections.
//!
//! # Example
//!
//! ```no_run
//! use acgw_hub::{Hub, HubConfig, MqttLink, MqttConfig, PassthroughTranslator};
//! use acgw_transport::TcpServer;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let link = MqttLink::new(&MqttConfig::default());
//!     let hub = Hub::new(HubConfig::default().with_hostname("gw01"), link.publisher());
//!     link.spawn(hub.clone());
//!
//!     let server = TcpServer::bind("0.0.0.0:9000").await?;
//!     hub.serve_on(server, Arc::new(PassthroughTranslator::default())).await?;
//!     Ok(())
//! }
//! ```

use acgw_core::{
    topic, Apdu, Correlators, DeviceId, MqttEnvelope, SharedEncrypt, TopicInfo, TopicKind,
    WorkerPool,
};
use acgw_transport::{ConnectInfo, TransportReceiver, TransportSender, TransportServer};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::mqtt::SharedPublisher;
use crate::registry::Registry;
use crate::session::{CloseReason, DeviceSession, Downlink};
use crate::translator::SharedTranslator;

/// Hub-wide offline hook, run for every session that goes offline
pub type OfflineHook = Arc<dyn Fn(&DeviceSession, &CloseReason) + Send + Sync>;

struct HubInner {
    config: HubConfig,
    registry: Registry,
    outbound: Mutex<Option<mpsc::Sender<MqttEnvelope>>>,
    pipeline: Mutex<Option<JoinHandle<()>>>,
    correlators: Correlators<Apdu>,
    cipher: Option<SharedEncrypt>,
    on_offline: Option<OfflineHook>,
    cancel: CancellationToken,
    /// Cancelled once shutdown has emptied the publish queue
    drained: CancellationToken,
}

/// Cheap to clone; clones share all state
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

/// Builder for a [`Hub`] with optional hooks
pub struct HubBuilder {
    config: HubConfig,
    publisher: SharedPublisher,
    cipher: Option<SharedEncrypt>,
    on_offline: Option<OfflineHook>,
}

impl HubBuilder {
    /// Cipher applied to sessions that have a key set
    pub fn cipher(mut self, cipher: SharedEncrypt) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn on_offline<F>(mut self, hook: F) -> Self
    where
        F: Fn(&DeviceSession, &CloseReason) + Send + Sync + 'static,
    {
        self.on_offline = Some(Arc::new(hook));
        self
    }

    /// Build the hub and start its publish pipeline. Must run inside a
    /// Tokio runtime.
    pub fn build(self) -> Hub {
        let (tx, rx) = mpsc::channel(self.config.outbound_queue.max(1));
        let pipeline = spawn_pipeline(&self.config, self.publisher, rx);

        info!(
            "Hub {} started (outbound queue {}, {} publish workers)",
            self.config.hostname, self.config.outbound_queue, self.config.publish_workers
        );

        Hub {
            inner: Arc::new(HubInner {
                config: self.config,
                registry: Registry::new(),
                outbound: Mutex::new(Some(tx)),
                pipeline: Mutex::new(Some(pipeline)),
                correlators: Correlators::new(),
                cipher: self.cipher,
                on_offline: self.on_offline,
                cancel: CancellationToken::new(),
                drained: CancellationToken::new(),
            }),
        }
    }
}

/// Drain the outbound queue into a pool of publish workers
fn spawn_pipeline(
    config: &HubConfig,
    publisher: SharedPublisher,
    mut rx: mpsc::Receiver<MqttEnvelope>,
) -> JoinHandle<()> {
    let workers = config.publish_workers.max(1);
    let publish_timeout = config.publish_timeout();

    tokio::spawn(async move {
        let pool = WorkerPool::new("mqtt-publish", workers, workers * 3);

        while let Some(envelope) = rx.recv().await {
            let publisher = Arc::clone(&publisher);
            let job = async move {
                let topic = envelope.topic.clone();
                match tokio::time::timeout(publish_timeout, publisher.publish(envelope)).await {
                    Ok(Ok(())) => debug!("Published to {}", topic),
                    Ok(Err(e)) => warn!("Publish to {} failed: {}", topic, e),
                    Err(_) => warn!("Publish to {} timed out", topic),
                }
            };
            if pool.submit(job).await.is_err() {
                break;
            }
        }

        pool.shutdown();
        pool.join().await;
        debug!("Publish pipeline stopped");
    })
}

impl Hub {
    pub fn new(config: HubConfig, publisher: SharedPublisher) -> Self {
        Self::builder(config, publisher).build()
    }

    pub fn builder(config: HubConfig, publisher: SharedPublisher) -> HubBuilder {
        HubBuilder {
            config,
            publisher,
            cipher: None,
            on_offline: None,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn cipher(&self) -> Option<&SharedEncrypt> {
        self.inner.cipher.as_ref()
    }

    /// Reply rendezvous points shared by every session's translator
    pub fn correlators(&self) -> &Correlators<Apdu> {
        &self.inner.correlators
    }

    pub(crate) fn child_token(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once [`shutdown`](Self::shutdown) has handed every queued
    /// frame to the publisher. The broker link keeps running until then.
    pub async fn drained(&self) {
        self.inner.drained.cancelled().await
    }

    /// Topic filters the broker link must subscribe to
    pub fn subscriptions(&self) -> Vec<String> {
        topic::subscription_filters(&self.inner.config.hostname)
    }

    /// Queue a frame for the broker, waiting while the queue is full
    pub async fn publish(&self, envelope: MqttEnvelope) -> Result<()> {
        let tx = self
            .inner
            .outbound
            .lock()
            .clone()
            .ok_or(HubError::PipelineClosed)?;
        tx.send(envelope)
            .await
            .map_err(|_| HubError::PipelineClosed)
    }

    /// Route one inbound MQTT frame
    pub async fn dispatch(&self, envelope: MqttEnvelope) {
        let info = match TopicInfo::parse(&envelope.topic, &self.inner.config.hostname) {
            Ok(info) => info,
            Err(e) => {
                debug!("Ignoring MQTT frame: {}", e);
                return;
            }
        };
        let TopicInfo {
            kind,
            device_id,
            backend_alias,
        } = info;

        match kind {
            TopicKind::Register => {
                let Some(session) = self.inner.registry.registering(&device_id) else {
                    debug!("No registering session for device {}", device_id);
                    return;
                };
                if let Some(alias) = backend_alias {
                    session.set_backend_alias(alias);
                }
                if let Err(e) = session.push_registration(Downlink { kind, envelope }).await {
                    debug!("Registration frame for {} dropped: {}", device_id, e);
                }
            }
            TopicKind::Command | TopicKind::Telemetry => {
                let Some(session) = self.inner.registry.lookup(&device_id) else {
                    debug!("Device {} is offline, dropping {} frame", device_id, kind);
                    return;
                };
                if let Some(alias) = backend_alias {
                    session.set_backend_alias(alias);
                }
                if let Err(e) = session.push_command(Downlink { kind, envelope }).await {
                    debug!("{} frame for {} dropped: {}", kind, device_id, e);
                }
            }
            TopicKind::Kick => {
                if let Some(session) = self.inner.registry.lookup(&device_id) {
                    info!("Backend kicked device {}", device_id);
                    // closing the transport may take up to the write deadline
                    tokio::spawn(async move { session.close(CloseReason::Kicked).await });
                }
            }
        }
    }

    /// Active session for a device
    pub fn session(&self, device_id: &str) -> Option<Arc<DeviceSession>> {
        self.inner.registry.lookup(device_id)
    }

    pub fn session_count(&self) -> usize {
        self.inner.registry.active_count()
    }

    /// Close whichever session holds the device id. Returns whether one did.
    pub async fn close_client(&self, device_id: &str) -> bool {
        let session = self
            .inner
            .registry
            .lookup(device_id)
            .or_else(|| self.inner.registry.registering(device_id));
        match session {
            Some(session) => {
                session.close(CloseReason::Kicked).await;
                true
            }
            None => false,
        }
    }

    /// Queue a device-protocol frame for an active device
    pub async fn send_msg_to_device(&self, device_id: &str, data: Bytes) -> Result<()> {
        let session = self
            .inner
            .registry
            .lookup(device_id)
            .ok_or_else(|| HubError::DeviceOffline(DeviceId::from(device_id)))?;
        session.send(data).await
    }

    /// Create and start a session for an accepted connection.
    ///
    /// A device id in the connection path registers the session straight
    /// away.
    pub fn accept_connection<S, R>(
        &self,
        sender: S,
        receiver: R,
        info: ConnectInfo,
        translator: SharedTranslator,
    ) -> Arc<DeviceSession>
    where
        S: TransportSender + 'static,
        R: TransportReceiver + 'static,
    {
        let path_id = info.path_device_id();
        let session = DeviceSession::new(self.clone(), sender, receiver, info, translator);

        if let Some(hook) = &self.inner.on_offline {
            let hook = Arc::clone(hook);
            session.on_offline(move |s, reason| hook(s, reason));
        }
        if let Some(device_id) = path_id {
            if let Err(e) = session.register(device_id) {
                warn!("Session {} not registered: {}", session.id(), e);
            }
        }

        session.start();
        session
    }

    /// Accept connections until the hub shuts down
    pub async fn serve_on<S>(&self, mut server: S, translator: SharedTranslator) -> Result<()>
    where
        S: TransportServer + 'static,
        S::Sender: 'static,
        S::Receiver: 'static,
    {
        match server.local_addr() {
            Ok(addr) => info!("Hub accepting connections on {}", addr),
            Err(_) => info!("Hub accepting connections"),
        }

        loop {
            let accepted = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                accepted = server.accept() => accepted,
            };

            match accepted {
                Ok((sender, receiver, info)) => {
                    debug!("New connection from {}", info.peer);
                    self.accept_connection(sender, receiver, info, Arc::clone(&translator));
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }

        Ok(())
    }

    /// Stop accepting, close every session and drain the publish queue
    pub async fn shutdown(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        info!("Hub {} shutting down", self.inner.config.hostname);
        self.inner.cancel.cancel();

        for session in self.inner.registry.sessions() {
            session.close(CloseReason::Shutdown).await;
        }

        self.inner.outbound.lock().take();
        let pipeline = self.inner.pipeline.lock().take();
        if let Some(pipeline) = pipeline {
            if let Err(e) = pipeline.await {
                error!("Publish pipeline task failed: {}", e);
            }
        }
        self.inner.drained.cancel();
        debug!("Hub {} publish queue drained", self.inner.config.hostname);
    }
}
