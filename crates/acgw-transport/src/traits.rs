//! Transport trait definitions
//!
//! A device connection is split into a sender half, owned by the session's
//! write pump, and a receiver half, owned by its read pump. Deadlines are
//! applied by the caller around each call.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;

use crate::error::Result;

/// Events that can occur on a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A complete device frame
    Data(Bytes),
    /// Connection closed (clean or error)
    Disconnected { reason: Option<String> },
    /// Error occurred
    Error(String),
}

/// Write half of a device connection
#[async_trait]
pub trait TransportSender: Send {
    /// Write one frame
    async fn send(&mut self, data: Bytes) -> Result<()>;

    /// Send a keep-alive ping. Transports without one do nothing.
    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the connection. Closing twice is not an error.
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a device connection
#[async_trait]
pub trait TransportReceiver: Send {
    /// Receive the next event; `None` once the connection is gone
    async fn recv(&mut self) -> Option<TransportEvent>;
}

/// Where an accepted connection came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    pub peer: SocketAddr,
    /// Request path for transports that carry one (WebSocket upgrade)
    pub path: Option<String>,
}

impl ConnectInfo {
    pub fn new(peer: SocketAddr) -> Self {
        Self { peer, path: None }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Device id carried in the last path segment, e.g. `/ocpp/SN001` → `SN001`
    pub fn path_device_id(&self) -> Option<String> {
        let path = self.path.as_deref()?;
        let path = path.split('?').next().unwrap_or(path);
        path.rsplit('/')
            .find(|s| !s.is_empty())
            .map(|s| s.to_string())
    }
}

/// Trait for transport servers (listeners)
#[async_trait]
pub trait TransportServer: Send + Sync {
    /// The sender type for accepted connections
    type Sender: TransportSender;
    /// The receiver type for accepted connections
    type Receiver: TransportReceiver;

    /// Accept a new connection
    async fn accept(&mut self) -> Result<(Self::Sender, Self::Receiver, ConnectInfo)>;

    /// Get the local address
    fn local_addr(&self) -> Result<SocketAddr>;
}
