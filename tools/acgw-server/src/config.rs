//! Gateway configuration file
//!
//! ```toml
//! [hub]
//! hostname = "gw01"
//!
//! [mqtt]
//! broker_host = "broker.local"
//!
//! [[listeners]]
//! kind = "websocket"
//! addr = "0.0.0.0:8080"
//!
//! [[listeners]]
//! kind = "tcp"
//! addr = "0.0.0.0:9000"
//! framing = "length_prefixed"
//! ```

use acgw_hub::{HubConfig, MqttConfig, PassthroughTranslator};
use acgw_transport::{TcpConfig, TcpFraming, WebSocketConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ListenerConfig {
    Tcp {
        addr: String,
        #[serde(default)]
        framing: TcpFraming,
        #[serde(default = "default_keepalive")]
        keepalive_secs: u64,
    },
    Websocket {
        addr: String,
        #[serde(default = "default_true")]
        text_frames: bool,
        /// Seconds a new connection gets to finish the upgrade
        #[serde(default = "default_handshake_timeout")]
        handshake_timeout_secs: u64,
    },
}

pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

fn default_keepalive() -> u64 {
    30
}

fn default_handshake_timeout() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

impl ListenerConfig {
    pub fn addr(&self) -> &str {
        match self {
            ListenerConfig::Tcp { addr, .. } | ListenerConfig::Websocket { addr, .. } => addr,
        }
    }

    pub fn tcp_config(framing: TcpFraming, keepalive_secs: u64) -> TcpConfig {
        TcpConfig {
            framing,
            keepalive_secs,
            ..Default::default()
        }
    }

    pub fn websocket_config(text_frames: bool, handshake_timeout_secs: u64) -> WebSocketConfig {
        WebSocketConfig {
            text_frames,
            handshake_timeout: Duration::from_secs(handshake_timeout_secs.max(1)),
            ..Default::default()
        }
    }
}

/// Message ids used by the built-in passthrough translator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    pub register_id: u32,
    pub message_id: u32,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        let passthrough = PassthroughTranslator::default();
        Self {
            register_id: passthrough.register_id,
            message_id: passthrough.message_id,
        }
    }
}

impl From<TranslatorConfig> for PassthroughTranslator {
    fn from(config: TranslatorConfig) -> Self {
        PassthroughTranslator {
            register_id: config.register_id,
            message_id: config.message_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub hub: HubConfig,
    pub mqtt: MqttConfig,
    pub translator: TranslatorConfig,
    pub listeners: Vec<ListenerConfig>,
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}
