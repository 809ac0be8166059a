//! Hub error types

use acgw_core::DeviceId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HubError>;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("device {0} is offline")]
    DeviceOffline(DeviceId),

    #[error("session is closed")]
    SessionClosed,

    #[error("session has no device id")]
    NotRegistered,

    #[error("outbound publish pipeline is closed")]
    PipelineClosed,

    #[error("MQTT publish failed: {0}")]
    Publish(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] acgw_transport::TransportError),

    #[error("core error: {0}")]
    Core(#[from] acgw_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
