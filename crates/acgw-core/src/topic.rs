//! MQTT topic grammar
//!
//! Topics the gateway subscribes to:
//! ```text
//! {host}/{kind}/{device}
//! {host}/{alias}/{kind}/{device}
//! {host}/{device}/{kind}
//! {host}/{alias}/{device}/{kind}
//! ```
//!
//! `kind` is one of `register`, `command`, `telemetry`, `kick`. The optional
//! `alias` names the backend instance that sent the frame so that replies can
//! be routed back to it. Uplink topics put the backend alias first:
//! ```text
//! {alias}/{host}/{kind}/{device}
//! ```

use std::fmt;

use crate::types::DeviceId;
use crate::{Error, Result};

/// Generic backend alias used when no instance alias was recorded
pub const DEFAULT_BACKEND_ALIAS: &str = "coregw";

/// Topic literal naming the traffic class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Register,
    Command,
    Telemetry,
    Kick,
}

impl TopicKind {
    pub const ALL: [TopicKind; 4] = [
        TopicKind::Register,
        TopicKind::Command,
        TopicKind::Telemetry,
        TopicKind::Kick,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::Register => "register",
            TopicKind::Command => "command",
            TopicKind::Telemetry => "telemetry",
            TopicKind::Kick => "kick",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "register" => Some(TopicKind::Register),
            "command" => Some(TopicKind::Command),
            "telemetry" => Some(TopicKind::Telemetry),
            "kick" => Some(TopicKind::Kick),
            _ => None,
        }
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound topic broken into its routing parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub kind: TopicKind,
    pub device_id: DeviceId,
    pub backend_alias: Option<String>,
}

impl TopicInfo {
    /// Parse an inbound topic addressed to `hostname`
    pub fn parse(topic: &str, hostname: &str) -> Result<Self> {
        let segments: Vec<&str> = topic.split('/').collect();
        let n = segments.len();

        if n < 3 || n > 4 {
            return Err(Error::InvalidTopic(topic.to_string()));
        }
        if segments[0] != hostname {
            return Err(Error::InvalidTopic(format!(
                "{} is not addressed to {}",
                topic, hostname
            )));
        }

        let (kind, device_id) = if let Some(kind) = TopicKind::parse(segments[n - 2]) {
            (kind, segments[n - 1])
        } else if let Some(kind) = TopicKind::parse(segments[n - 1]) {
            (kind, segments[n - 2])
        } else {
            return Err(Error::InvalidTopic(format!("no kind segment in {}", topic)));
        };

        if device_id.is_empty() {
            return Err(Error::InvalidTopic(format!("empty device id in {}", topic)));
        }

        let backend_alias = if n == 4 && !segments[1].is_empty() && segments[1] != hostname {
            Some(segments[1].to_string())
        } else {
            None
        };

        Ok(Self {
            kind,
            device_id: device_id.to_string(),
            backend_alias,
        })
    }
}

/// Topic filters covering every inbound shape for `hostname`
pub fn subscription_filters(hostname: &str) -> Vec<String> {
    let mut filters = Vec::with_capacity(TopicKind::ALL.len() * 4);
    for kind in TopicKind::ALL {
        filters.push(format!("{}/{}/+", hostname, kind));
        filters.push(format!("{}/+/{}/+", hostname, kind));
        filters.push(format!("{}/+/{}", hostname, kind));
        filters.push(format!("{}/+/+/{}", hostname, kind));
    }
    filters
}

/// Topic for a frame travelling from the gateway to the backend
pub fn uplink_topic(
    backend_alias: Option<&str>,
    hostname: &str,
    kind: TopicKind,
    device_id: &str,
) -> String {
    format!(
        "{}/{}/{}/{}",
        backend_alias.unwrap_or(DEFAULT_BACKEND_ALIAS),
        hostname,
        kind,
        device_id
    )
}
