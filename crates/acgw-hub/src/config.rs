//! Hub configuration
//!
//! Every field has a default so a config file only needs the values it
//! changes.

use acgw_core::{
    UplinkOrdering, DEFAULT_BACKEND_ALIAS, OUTBOUND_QUEUE_DEPTH, PUBLISH_WORKERS,
    QOS_AT_MOST_ONCE, QOS_EXACTLY_ONCE, SESSION_QUEUE_DEPTH,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-session limits and deadlines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Frames waiting for the write pump
    pub send_queue: usize,
    /// Registration-path backend frames waiting for translation
    pub registration_queue: usize,
    /// Command-path backend frames waiting for translation
    pub command_queue: usize,
    /// Close the session when nothing is read for this long (0 = never)
    pub read_timeout_secs: u64,
    /// Deadline for a single write or ping
    pub write_timeout_secs: u64,
    /// Keep-alive ping period (0 = disabled)
    pub ping_interval_secs: u64,
    pub uplink: UplinkOrdering,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_queue: SESSION_QUEUE_DEPTH,
            registration_queue: SESSION_QUEUE_DEPTH,
            command_queue: SESSION_QUEUE_DEPTH,
            read_timeout_secs: 180,
            write_timeout_secs: 10,
            ping_interval_secs: 30,
            uplink: UplinkOrdering::Concurrent,
        }
    }
}

impl SessionConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_secs > 0).then(|| Duration::from_secs(self.read_timeout_secs))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs.max(1))
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }
}

/// Hub-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// First topic segment of every inbound topic, second of every uplink
    pub hostname: String,
    /// Alias used for uplinks when the backend never named itself
    pub backend_alias: String,
    pub outbound_queue: usize,
    pub publish_workers: usize,
    /// Deadline for a single broker publish
    pub publish_timeout_ms: u64,
    /// QoS for registration and command uplinks
    pub command_qos: u8,
    /// QoS for telemetry uplinks
    pub telemetry_qos: u8,
    pub session: SessionConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            backend_alias: DEFAULT_BACKEND_ALIAS.to_string(),
            outbound_queue: OUTBOUND_QUEUE_DEPTH,
            publish_workers: PUBLISH_WORKERS,
            publish_timeout_ms: 5000,
            command_qos: QOS_EXACTLY_ONCE,
            telemetry_qos: QOS_AT_MOST_ONCE,
            session: SessionConfig::default(),
        }
    }
}

impl HubConfig {
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms.max(1))
    }
}

/// Machine hostname, the default topic namespace
pub fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "acgw".to_string())
}

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// Request channel capacity of the MQTT client
    pub capacity: usize,
    /// Pause after a connection error before polling again
    pub reconnect_delay_secs: u64,
    pub subscribe_qos: u8,
    /// How long shutdown waits for queued publishes to reach the broker
    pub shutdown_timeout_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: format!("acgw-{}", &suffix[..8]),
            username: None,
            password: None,
            keep_alive_secs: 60,
            capacity: 100,
            reconnect_delay_secs: 5,
            subscribe_qos: QOS_EXACTLY_ONCE,
            shutdown_timeout_secs: 5,
        }
    }
}

impl MqttConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs.max(1))
    }
}
