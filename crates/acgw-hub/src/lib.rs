//! acgw Hub
//!
//! The hub sits between device connections and the MQTT backend:
//! - Tracks device sessions in a two-stage registry
//! - Runs each session's read/write pumps and backend-frame consumers
//! - Routes inbound MQTT frames by topic to the right session
//! - Funnels every uplink through one bounded publish pipeline
//!
//! Device protocols plug in through the [`Translator`] trait; the broker
//! plugs in through [`MqttPublisher`].
//!
//! # Transport Support
//!
//! The hub is transport-agnostic and accepts connections from any
//! [`acgw_transport::TransportServer`]:
//! - **TCP**: raw or length-prefixed frames
//! - **WebSocket**: device id taken from the request path

pub mod config;
pub mod error;
pub mod hub;
pub mod mqtt;
pub mod registry;
pub mod session;
pub mod translator;

pub use config::{HubConfig, MqttConfig, SessionConfig};
pub use error::{HubError, Result};
pub use hub::{Hub, HubBuilder, OfflineHook};
pub use mqtt::{parse_qos, MqttLink, MqttPublisher, RumqttPublisher, SharedPublisher};
pub use registry::Registry;
pub use session::{CloseReason, DeviceSession, Downlink, SessionState};
pub use translator::{PassthroughTranslator, SharedTranslator, TrContext, Translator};
