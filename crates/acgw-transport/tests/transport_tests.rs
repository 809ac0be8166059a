//! Transport Layer Tests
//!
//! Accept-side behaviour of the device transports:
//! - WebSocket path capture and subprotocol negotiation
//! - Stalled upgrades not holding up other clients
//! - Text vs binary frame selection
//! - Keep-alive pings reaching the client
//! - Clean disconnect reporting

use acgw_transport::{
    TcpConfig, TcpFraming, TcpServer, TransportEvent, TransportReceiver, TransportSender,
    TransportServer, WebSocketConfig, WebSocketServer,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_websocket_path_and_subprotocol() {
    let mut server = WebSocketServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();

    let accept = tokio::spawn(async move { server.accept().await.unwrap() });

    let mut request = format!("ws://{}/ocpp/CP-0042", addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", "ocpp1.6".parse().unwrap());
    let (mut client, response) = tokio_tungstenite::connect_async(request).await.unwrap();

    assert_eq!(
        response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok()),
        Some("ocpp1.6")
    );

    let (mut sender, mut receiver, info) = timeout(WAIT, accept).await.unwrap().unwrap();
    assert_eq!(info.path.as_deref(), Some("/ocpp/CP-0042"));
    assert_eq!(info.path_device_id().as_deref(), Some("CP-0042"));

    client
        .send(WsMessage::Text("[2,\"1\",\"Heartbeat\",{}]".into()))
        .await
        .unwrap();
    assert_eq!(
        timeout(WAIT, receiver.recv()).await.unwrap(),
        Some(TransportEvent::Data(Bytes::from("[2,\"1\",\"Heartbeat\",{}]")))
    );

    sender.send(Bytes::from("[3,\"1\",{}]")).await.unwrap();
    let msg = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(msg, WsMessage::Text("[3,\"1\",{}]".into()));

    // non-UTF-8 payloads fall back to binary frames
    sender.send(Bytes::from_static(&[0xff, 0x00])).await.unwrap();
    let msg = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(msg, WsMessage::Binary(vec![0xff, 0x00]));

    sender.ping().await.unwrap();
    let msg = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
    assert!(matches!(msg, WsMessage::Ping(_)));

    client.close(None).await.unwrap();
    assert!(matches!(
        timeout(WAIT, receiver.recv()).await.unwrap(),
        Some(TransportEvent::Disconnected { .. })
    ));
    assert_eq!(receiver.recv().await, None);
}

#[tokio::test]
async fn test_websocket_binary_mode() {
    let mut server = WebSocketServer::bind("127.0.0.1:0")
        .await
        .unwrap()
        .with_config(WebSocketConfig {
            text_frames: false,
            ..Default::default()
        });
    let addr = server.local_addr().unwrap();
    let accept = tokio::spawn(async move { server.accept().await.unwrap() });

    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}/dev/7", addr))
        .await
        .unwrap();
    let (mut sender, _receiver, _) = timeout(WAIT, accept).await.unwrap().unwrap();

    sender.send(Bytes::from("abc")).await.unwrap();
    let msg = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(msg, WsMessage::Binary(b"abc".to_vec()));

    sender.close().await.unwrap();
    sender.close().await.unwrap();
}

#[tokio::test]
async fn test_silent_client_does_not_block_upgrades() {
    let mut server = WebSocketServer::bind("127.0.0.1:0")
        .await
        .unwrap()
        .with_config(WebSocketConfig {
            handshake_timeout: Duration::from_millis(300),
            ..Default::default()
        });
    let addr = server.local_addr().unwrap();

    // connects first and never sends the upgrade request
    let mut silent = TcpStream::connect(addr).await.unwrap();

    let accept = tokio::spawn(async move {
        let accepted = server.accept().await;
        (server, accepted)
    });

    let (_client, _) = timeout(
        WAIT,
        tokio_tungstenite::connect_async(format!("ws://{}/ocpp/CP1", addr)),
    )
    .await
    .unwrap()
    .unwrap();
    let (_server, accepted) = timeout(WAIT, accept).await.unwrap().unwrap();
    let (_sender, _receiver, info) = accepted.unwrap();
    assert_eq!(info.path_device_id().as_deref(), Some("CP1"));

    // the stalled connection is dropped at its upgrade deadline
    let mut buf = [0u8; 1];
    let read = timeout(WAIT, silent.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_tcp_raw_frames() {
    let mut server = TcpServer::bind_with_config(
        "127.0.0.1:0",
        TcpConfig {
            framing: TcpFraming::Raw,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let (mut sender, mut receiver, info) = server.accept().await.unwrap();
    assert_eq!(info.path, None);

    client.write_all(b"\x68\x04\x01\x02").await.unwrap();
    match timeout(WAIT, receiver.recv()).await.unwrap() {
        Some(TransportEvent::Data(data)) => assert_eq!(&data[..], b"\x68\x04\x01\x02"),
        other => panic!("expected data, got {:?}", other),
    }

    sender.send(Bytes::from_static(b"\x68\x01")).await.unwrap();
    let mut buf = [0u8; 2];
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"\x68\x01");

    drop(client);
    assert_eq!(
        timeout(WAIT, receiver.recv()).await.unwrap(),
        Some(TransportEvent::Disconnected { reason: None })
    );
}
