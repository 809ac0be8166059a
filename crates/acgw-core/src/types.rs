//! Gateway message types

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::apdu::Apdu;

/// Registry key of a physical device (numeric core id or serial number)
pub type DeviceId = String;

/// QoS 0
pub const QOS_AT_MOST_ONCE: u8 = 0;
/// QoS 2
pub const QOS_EXACTLY_ONCE: u8 = 2;

/// Transport-neutral MQTT message exchanged between the hub and the broker link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttEnvelope {
    pub topic: String,
    pub qos: u8,
    pub retained: bool,
    pub payload: Bytes,
}

impl MqttEnvelope {
    pub fn new(topic: impl Into<String>, qos: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            qos,
            retained: false,
            payload: payload.into(),
        }
    }

    pub fn retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }
}

/// Per-call translation state.
///
/// Created fresh for every frame and mutated by the translator to steer what
/// the session does with the result.
#[derive(Debug, Clone, Default)]
pub struct TrData {
    /// Suppress any reply or publish for this frame
    pub ignore: bool,
    /// Publish the uplink with the retain flag
    pub retained: bool,
    /// Full topic override for the uplink publish
    pub topic: Option<String>,
    /// Uplink is telemetry: published on the telemetry topic, no reply expected
    pub is_telemetry: bool,
    /// Backend frame being translated (downlink only)
    pub apdu: Option<Apdu>,
    /// Protocol action name, for logging
    pub action_name: String,
    /// The backend frame is a `MessageError`
    pub is_error: bool,
}

impl TrData {
    /// State for translating a backend frame towards the device
    pub fn for_apdu(apdu: &Apdu) -> Self {
        Self {
            is_error: apdu.is_error(),
            apdu: Some(apdu.clone()),
            ..Default::default()
        }
    }
}

/// Which way device-to-backend frames are processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UplinkOrdering {
    /// One task per received frame; publish order may differ from receive order
    #[default]
    Concurrent,
    /// Frames are translated and published one at a time in receive order
    Serialized,
}
