//! WebSocket transport implementation
//!
//! Chargers connect with `ws://host:port/{prefix}/{device-id}` and usually
//! speak text frames (OCPP-J). The request path is kept so the gateway can
//! register the session before the first frame arrives. Upgrades run off
//! the accept path, so one slow client never delays the others.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HsRequest, Response as HsResponse,
};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::{
    Message as WsMessage, WebSocketConfig as WsProtocolConfig,
};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{
    ConnectInfo, TransportEvent, TransportReceiver, TransportSender, TransportServer,
};

/// WebSocket configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Subprotocols accepted during the upgrade, in preference order
    pub subprotocols: Vec<String>,
    /// Maximum message size
    pub max_message_size: usize,
    /// Send frames as text when they are valid UTF-8
    pub text_frames: bool,
    /// Deadline for a new connection to finish the HTTP upgrade
    pub handshake_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            subprotocols: vec!["ocpp1.6".to_string(), "ocpp2.0.1".to_string()],
            max_message_size: 64 * 1024, // 64KB
            text_frames: true,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Pick the first server-supported subprotocol the client offered
fn negotiate_subprotocol(offered: &str, supported: &[String]) -> Option<String> {
    let requested: Vec<&str> = offered.split(',').map(|s| s.trim()).collect();
    supported
        .iter()
        .find(|p| requested.contains(&p.as_str()))
        .cloned()
}

type WsStream = WebSocketStream<TcpStream>;

/// WebSocket sender
pub struct WebSocketSender {
    sink: SplitSink<WsStream, WsMessage>,
    text_frames: bool,
    closed: bool,
}

#[async_trait]
impl TransportSender for WebSocketSender {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }

        let msg = if self.text_frames {
            match String::from_utf8(data.to_vec()) {
                Ok(text) => WsMessage::Text(text),
                Err(e) => WsMessage::Binary(e.into_bytes()),
            }
        } else {
            WsMessage::Binary(data.to_vec())
        };

        self.sink.send(msg).await?;
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        self.sink.send(WsMessage::Ping(Vec::new())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let _ = self.sink.send(WsMessage::Close(None)).await;
        match self.sink.close().await {
            Ok(()) => Ok(()),
            Err(e) => match TransportError::from(e) {
                TransportError::ConnectionClosed => Ok(()),
                other => Err(other),
            },
        }
    }
}

/// WebSocket receiver
pub struct WebSocketReceiver {
    stream: SplitStream<WsStream>,
    done: bool,
}

#[async_trait]
impl TransportReceiver for WebSocketReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        if self.done {
            return None;
        }

        while let Some(result) = self.stream.next().await {
            match result {
                Ok(WsMessage::Binary(data)) => return Some(TransportEvent::Data(Bytes::from(data))),
                Ok(WsMessage::Text(text)) => return Some(TransportEvent::Data(Bytes::from(text))),
                Ok(WsMessage::Ping(_)) => debug!("Received ping"),
                Ok(WsMessage::Pong(_)) => debug!("Received pong"),
                Ok(WsMessage::Close(frame)) => {
                    self.done = true;
                    let reason = frame.map(|f| f.reason.to_string());
                    return Some(TransportEvent::Disconnected { reason });
                }
                Ok(WsMessage::Frame(_)) => {}
                Err(e) => {
                    self.done = true;
                    return Some(TransportEvent::Error(e.to_string()));
                }
            }
        }

        self.done = true;
        Some(TransportEvent::Disconnected { reason: None })
    }
}

/// Split an upgraded stream into transport halves
pub fn split_stream(ws: WsStream, config: &WebSocketConfig) -> (WebSocketSender, WebSocketReceiver) {
    let (sink, stream) = ws.split();
    (
        WebSocketSender {
            sink,
            text_frames: config.text_frames,
            closed: false,
        },
        WebSocketReceiver {
            stream,
            done: false,
        },
    )
}

type Accepted = (WebSocketSender, WebSocketReceiver, ConnectInfo);

/// Finished upgrades waiting for `accept`
const PENDING_UPGRADES: usize = 64;

/// Pause after a failed TCP accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// WebSocket server
///
/// TCP accepts run in a background task and every upgrade in a task of its
/// own, bounded by `handshake_timeout`, so a client that stalls its upgrade
/// only holds up itself. The background task starts on the first
/// [`accept`](TransportServer::accept) and stops when the server is dropped.
pub struct WebSocketServer {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    config: WebSocketConfig,
    upgraded: Option<mpsc::Receiver<Result<Accepted>>>,
    acceptor: Option<JoinHandle<()>>,
}

impl WebSocketServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let local_addr = listener.local_addr()?;

        info!("WebSocket server listening on {}", addr);

        Ok(Self {
            listener: Some(listener),
            local_addr,
            config: WebSocketConfig::default(),
            upgraded: None,
            acceptor: None,
        })
    }

    /// Replace the configuration. Must be called before the first accept.
    pub fn with_config(mut self, config: WebSocketConfig) -> Self {
        self.config = config;
        self
    }

    fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let (tx, rx) = mpsc::channel(PENDING_UPGRADES);
        let config = Arc::new(self.config.clone());
        self.acceptor = Some(tokio::spawn(accept_loop(listener, config, tx)));
        self.upgraded = Some(rx);
    }
}

impl Drop for WebSocketServer {
    fn drop(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<WebSocketConfig>,
    tx: mpsc::Sender<Result<Accepted>>,
) {
    loop {
        let accepted = tokio::select! {
            _ = tx.closed() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                debug!("Accepted TCP connection from {}", addr);
                let config = Arc::clone(&config);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let handshake = upgrade(stream, addr, &config);
                    match tokio::time::timeout(config.handshake_timeout, handshake).await {
                        Ok(Ok(accepted)) => {
                            let _ = tx.send(Ok(accepted)).await;
                        }
                        Ok(Err(e)) => debug!("WebSocket upgrade from {} failed: {}", addr, e),
                        Err(_) => warn!("WebSocket upgrade from {} timed out", addr),
                    }
                });
            }
            Err(e) => {
                let err = TransportError::AcceptFailed(e.to_string());
                if tx.send(Err(err)).await.is_err() {
                    break;
                }
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Run the HTTP upgrade, recording the request path and the subprotocol
async fn upgrade(stream: TcpStream, addr: SocketAddr, config: &WebSocketConfig) -> Result<Accepted> {
    let path = Arc::new(Mutex::new(None::<String>));
    let path_slot = path.clone();
    let supported = config.subprotocols.clone();

    let callback = move |req: &HsRequest,
                         mut response: HsResponse|
          -> std::result::Result<HsResponse, ErrorResponse> {
        *path_slot.lock() = Some(req.uri().path().to_string());

        let offered = req
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok());
        if let Some(chosen) = offered.and_then(|o| negotiate_subprotocol(o, &supported)) {
            if let Ok(value) = HeaderValue::from_str(&chosen) {
                response.headers_mut().insert("Sec-WebSocket-Protocol", value);
            }
        }
        Ok(response)
    };

    let ws_config = WsProtocolConfig {
        max_message_size: Some(config.max_message_size),
        max_frame_size: Some(config.max_message_size),
        ..Default::default()
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config))
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    let mut info = ConnectInfo::new(addr);
    if let Some(p) = path.lock().take() {
        info = info.with_path(p);
    }
    info!("WebSocket device connected from {} ({:?})", addr, info.path);

    let (sender, receiver) = split_stream(ws_stream, config);
    Ok((sender, receiver, info))
}

#[async_trait]
impl TransportServer for WebSocketServer {
    type Sender = WebSocketSender;
    type Receiver = WebSocketReceiver;

    async fn accept(&mut self) -> Result<(Self::Sender, Self::Receiver, ConnectInfo)> {
        self.start();
        let upgraded = self
            .upgraded
            .as_mut()
            .ok_or(TransportError::ConnectionClosed)?;
        upgraded
            .recv()
            .await
            .unwrap_or(Err(TransportError::ConnectionClosed))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_config() {
        let config = WebSocketConfig::default();
        assert!(config.text_frames);
        assert_eq!(config.subprotocols[0], "ocpp1.6");
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_negotiate_subprotocol() {
        let supported = vec!["ocpp1.6".to_string(), "ocpp2.0.1".to_string()];
        assert_eq!(
            negotiate_subprotocol("ocpp2.0.1, ocpp1.6", &supported).as_deref(),
            Some("ocpp1.6")
        );
        assert_eq!(negotiate_subprotocol("mqtt", &supported), None);
    }
}
