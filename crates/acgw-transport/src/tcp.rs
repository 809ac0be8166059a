//! TCP transport implementation
//!
//! Devices speaking raw TCP either delimit their own frames (`raw`: every
//! read is handed up as it arrives and the translator reassembles) or use a
//! 4-byte big-endian length prefix (`length_prefixed`).

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{
    ConnectInfo, TransportEvent, TransportReceiver, TransportSender, TransportServer,
};

/// Maximum message size (64KB)
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// How frames are delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TcpFraming {
    #[default]
    Raw,
    LengthPrefixed,
}

/// TCP configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Maximum message size in bytes
    pub max_message_size: usize,
    /// Read buffer size
    pub read_buffer_size: usize,
    /// Keep-alive interval in seconds (0 = disabled)
    pub keepalive_secs: u64,
    pub framing: TcpFraming,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            read_buffer_size: 4096,
            keepalive_secs: 30,
            framing: TcpFraming::Raw,
        }
    }
}

/// Split an accepted stream into transport halves
pub fn split_stream(stream: TcpStream, config: &TcpConfig) -> (TcpSender, TcpReceiver) {
    if config.keepalive_secs > 0 {
        let socket = socket2::SockRef::from(&stream);
        let keepalive =
            socket2::TcpKeepalive::new().with_time(Duration::from_secs(config.keepalive_secs));
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            warn!("Failed to enable TCP keepalive: {}", e);
        }
    }
    let _ = stream.set_nodelay(true);

    let (reader, writer) = stream.into_split();
    (
        TcpSender {
            writer,
            framing: config.framing,
            closed: false,
        },
        TcpReceiver {
            reader,
            buf: BytesMut::with_capacity(config.read_buffer_size),
            framing: config.framing,
            max_size: config.max_message_size,
            done: false,
        },
    )
}

/// TCP sender for writing frames
pub struct TcpSender {
    writer: OwnedWriteHalf,
    framing: TcpFraming,
    closed: bool,
}

#[async_trait]
impl TransportSender for TcpSender {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }

        match self.framing {
            TcpFraming::Raw => self.writer.write_all(&data).await?,
            TcpFraming::LengthPrefixed => {
                let mut frame = BytesMut::with_capacity(4 + data.len());
                frame.put_u32(data.len() as u32);
                frame.extend_from_slice(&data);
                self.writer.write_all(&frame).await?
            }
        }
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match self.writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// TCP receiver for reading frames
pub struct TcpReceiver {
    reader: OwnedReadHalf,
    buf: BytesMut,
    framing: TcpFraming,
    max_size: usize,
    done: bool,
}

impl TcpReceiver {
    fn next_frame(&mut self) -> Result<Option<Bytes>> {
        match self.framing {
            TcpFraming::Raw => {
                if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(self.buf.split().freeze()))
                }
            }
            TcpFraming::LengthPrefixed => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                let len = (&self.buf[..4]).get_u32() as usize;
                if len > self.max_size {
                    return Err(TransportError::MessageTooLarge {
                        size: len,
                        max: self.max_size,
                    });
                }
                if self.buf.len() < 4 + len {
                    return Ok(None);
                }
                self.buf.advance(4);
                Ok(Some(self.buf.split_to(len).freeze()))
            }
        }
    }
}

#[async_trait]
impl TransportReceiver for TcpReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        if self.done {
            return None;
        }

        loop {
            match self.next_frame() {
                Ok(Some(frame)) => return Some(TransportEvent::Data(frame)),
                Ok(None) => {}
                Err(e) => {
                    self.done = true;
                    return Some(TransportEvent::Disconnected {
                        reason: Some(e.to_string()),
                    });
                }
            }

            match self.reader.read_buf(&mut self.buf).await {
                Ok(0) => {
                    debug!("TCP connection closed by peer");
                    self.done = true;
                    return Some(TransportEvent::Disconnected { reason: None });
                }
                Ok(_) => {}
                Err(e) => {
                    self.done = true;
                    return Some(TransportEvent::Error(e.to_string()));
                }
            }
        }
    }
}

/// TCP server for accepting device connections
pub struct TcpServer {
    listener: TcpListener,
    config: TcpConfig,
}

impl TcpServer {
    /// Bind to an address and create a new TCP server
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_config(addr, TcpConfig::default()).await
    }

    /// Bind with custom configuration
    pub async fn bind_with_config(addr: &str, config: TcpConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        info!("TCP server listening on {}", addr);

        Ok(Self { listener, config })
    }
}

#[async_trait]
impl TransportServer for TcpServer {
    type Sender = TcpSender;
    type Receiver = TcpReceiver;

    async fn accept(&mut self) -> Result<(Self::Sender, Self::Receiver, ConnectInfo)> {
        let (stream, peer_addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::AcceptFailed(e.to_string()))?;

        info!("TCP connection accepted from {}", peer_addr);

        let (sender, receiver) = split_stream(stream, &self.config);
        Ok((sender, receiver, ConnectInfo::new(peer_addr)))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_config_default() {
        let config = TcpConfig::default();
        assert_eq!(config.max_message_size, 64 * 1024);
        assert_eq!(config.keepalive_secs, 30);
        assert_eq!(config.framing, TcpFraming::Raw);
    }

    #[tokio::test]
    async fn test_length_prefixed_echo() {
        let config = TcpConfig {
            framing: TcpFraming::LengthPrefixed,
            ..Default::default()
        };
        let mut server = TcpServer::bind_with_config("127.0.0.1:0", config.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let accept_handle = tokio::spawn(async move {
            let (mut sender, mut receiver, _) = server.accept().await.unwrap();
            if let Some(TransportEvent::Data(data)) = receiver.recv().await {
                sender.send(data).await.unwrap();
            }
            sender.close().await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut client_tx, mut client_rx) = split_stream(stream, &config);

        client_tx.send(Bytes::from("hello tcp")).await.unwrap();
        assert_eq!(
            client_rx.recv().await,
            Some(TransportEvent::Data(Bytes::from("hello tcp")))
        );
        assert_eq!(
            client_rx.recv().await,
            Some(TransportEvent::Disconnected { reason: None })
        );
        assert_eq!(client_rx.recv().await, None);

        accept_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_disconnects() {
        let config = TcpConfig {
            framing: TcpFraming::LengthPrefixed,
            max_message_size: 8,
            ..Default::default()
        };
        let mut server = TcpServer::bind_with_config("127.0.0.1:0", config)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (_sender, mut receiver, _) = server.accept().await.unwrap();

        client.write_all(&[0, 0, 0, 64]).await.unwrap();
        assert!(matches!(
            receiver.recv().await,
            Some(TransportEvent::Disconnected { reason: Some(_) })
        ));
    }

    #[tokio::test]
    async fn test_double_close() {
        let mut server = TcpServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (mut sender, _receiver, _) = server.accept().await.unwrap();

        sender.close().await.unwrap();
        sender.close().await.unwrap();
        assert!(sender.send(Bytes::from_static(b"x")).await.is_err());
    }
}
