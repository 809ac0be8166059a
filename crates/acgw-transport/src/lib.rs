//! acgw Transport Layer
//!
//! Device-facing transports for the gateway:
//! - TCP (raw or length-prefixed frames)
//! - WebSocket (text or binary frames, keep-alive pings)
//!
//! Every transport splits into a [`TransportSender`] and a
//! [`TransportReceiver`], so session pumps are written once.

pub mod error;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "tcp")]
pub mod tcp;

pub use error::{Result, TransportError};
pub use traits::{ConnectInfo, TransportEvent, TransportReceiver, TransportSender, TransportServer};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketReceiver, WebSocketSender, WebSocketServer};

#[cfg(feature = "tcp")]
pub use tcp::{TcpConfig, TcpFraming, TcpReceiver, TcpSender, TcpServer};
