//! End-to-end scenarios over in-process WebSocket pairs.
//!
//! Both peers run in the test process: the initiator as a `TunnelClient`,
//! the egress as a `SessionRegistry` session, joined by a WebSocket built
//! over `tokio::io::duplex`. Where a test needs to observe or inject raw
//! frames, one side stays a bare socket instead.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, UdpSocket};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use muxtun::codec::ConnectTarget;
use muxtun::codec::HttpRequestMeta;
use muxtun::protocol::{Frame, MessageType};
use muxtun::transport::{Link, SessionRegistry};
use muxtun::{MuxError, TunnelClient, TunnelConfig};

type RawWs = WebSocketStream<DuplexStream>;

/// An in-process WebSocket pair (client role, server role).
async fn ws_pair() -> (RawWs, RawWs) {
    let (a, b) = tokio::io::duplex(1 << 20);
    let client = WebSocketStream::from_raw_socket(a, Role::Client, None);
    let server = WebSocketStream::from_raw_socket(b, Role::Server, None);
    futures::join!(client, server)
}

async fn send_frame(ws: &mut RawWs, frame: Frame) {
    ws.send(Message::Binary(frame.encode().to_vec()))
        .await
        .expect("send frame");
}

/// Read frames until one of the wanted type arrives, skipping heartbeats,
/// text replies, and unrelated frames.
async fn expect_frame(ws: &mut RawWs, msg_type: MessageType) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await.expect("socket open").expect("read ok") {
                Message::Binary(data) => {
                    let frame = Frame::decode(Bytes::from(data)).expect("decodable frame");
                    if frame.msg_type == msg_type {
                        return frame;
                    }
                }
                _ => continue,
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {msg_type:?} frame within deadline"))
}

async fn expect_text(ws: &mut RawWs) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await.expect("socket open").expect("read ok") {
                Message::Text(text) => return text,
                _ => continue,
            }
        }
    })
    .await
    .expect("no text frame within deadline")
}

/// A loopback TCP echo server; the returned receiver fires on peer EOF.
async fn spawn_tcp_echo() -> (u16, tokio::sync::oneshot::Receiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (eof_tx, eof_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = eof_tx.send(());
    });
    (port, eof_rx)
}

/// Wire a full client/egress pair over one in-process socket.
async fn full_stack(config: TunnelConfig) -> (TunnelClient, Arc<SessionRegistry>) {
    let (client_ws, server_ws) = ws_pair().await;
    let registry = SessionRegistry::new(config.clone(), 8);
    registry.attach_socket(None, server_ws).await.unwrap();
    let client = TunnelClient::from_socket(client_ws, config).unwrap();
    (client, registry)
}

/// S1: TCP echo through the whole stack.
#[tokio::test]
async fn tcp_echo_end_to_end() {
    let (port, _eof) = spawn_tcp_echo().await;
    let (client, _registry) = full_stack(TunnelConfig::default()).await;

    let mut tunnel = client.connect_tcp("127.0.0.1", port).await.unwrap();
    tunnel.send(Bytes::from_static(b"hello")).await.unwrap();

    let echoed = tunnel.recv().await.expect("stream open").unwrap();
    assert_eq!(&echoed[..], b"hello");

    tunnel.close();
    client.close();
}

/// S1 wire shape: the initiator emits connect/data/close frames in order
/// with the documented payloads.
#[tokio::test]
async fn tcp_initiator_frame_sequence() {
    let (client_ws, mut egress) = ws_pair().await;
    let client = TunnelClient::from_socket(client_ws, TunnelConfig::default()).unwrap();

    let (tunnel, ()) = futures::join!(client.connect_tcp("127.0.0.1", 9), async {
        let connect = expect_frame(&mut egress, MessageType::TcpConnect).await;
        let target = ConnectTarget::decode(&connect.payload).unwrap();
        assert_eq!(target, ConnectTarget::new("127.0.0.1", 9));
        assert_eq!(connect.resource_id, 1);
        send_frame(&mut egress, Frame::empty(MessageType::TcpConnectAck, 1)).await;
    });
    let tunnel = tunnel.unwrap();

    tunnel.send(Bytes::from_static(b"hello")).await.unwrap();
    let data = expect_frame(&mut egress, MessageType::TcpData).await;
    assert_eq!(&data.payload[..], b"hello");

    tunnel.close();
    let close = expect_frame(&mut egress, MessageType::TcpClose).await;
    assert_eq!(close.resource_id, 1);
    assert!(close.payload.is_empty());
}

/// Property 6: a non-terminal frame for an unknown stream produces the
/// matching terminal frame back and never kills the transport.
#[tokio::test]
async fn late_frame_robustness() {
    let (mut raw, server_ws) = ws_pair().await;
    let registry = SessionRegistry::new(TunnelConfig::default(), 8);
    registry.attach_socket(None, server_ws).await.unwrap();

    send_frame(&mut raw, Frame::new(MessageType::TcpData, 42, Bytes::from_static(b"late"))).await;
    let close = expect_frame(&mut raw, MessageType::TcpClose).await;
    assert_eq!(close.resource_id, 42);

    send_frame(&mut raw, Frame::new(MessageType::UdpData, 43, Bytes::from_static(b"\0\0\0\0"))).await;
    let close = expect_frame(&mut raw, MessageType::UdpClose).await;
    assert_eq!(close.resource_id, 43);

    send_frame(&mut raw, Frame::new(MessageType::HttpBodyChunk, 44, Bytes::from_static(b"x"))).await;
    let end = expect_frame(&mut raw, MessageType::HttpBodyEnd).await;
    assert_eq!(end.resource_id, 44);

    // A reserved type octet is dropped, not fatal: the session still answers.
    raw.send(Message::Binary(vec![0x7F, 0, 0, 0, 9]))
        .await
        .unwrap();
    raw.send(Message::Text("PING".into())).await.unwrap();
    let reply: serde_json::Value = serde_json::from_str(&expect_text(&mut raw).await).unwrap();
    assert_eq!(reply["message"], "PONG");
}

/// Property 7: heartbeats are never echoed.
#[tokio::test]
async fn heartbeat_non_amplification() {
    let (mut raw, server_ws) = ws_pair().await;
    let registry = SessionRegistry::new(TunnelConfig::default(), 8);
    registry.attach_socket(None, server_ws).await.unwrap();

    send_frame(&mut raw, Frame::heartbeat()).await;
    send_frame(&mut raw, Frame::heartbeat()).await;

    // Nothing (heartbeat or otherwise) may come back in response.
    let quiet = tokio::time::timeout(Duration::from_millis(300), raw.next()).await;
    assert!(quiet.is_err(), "peer replied to a heartbeat: {quiet:?}");
}

/// S6: text PING over the control channel.
#[tokio::test]
async fn command_ping_replies_json_pong() {
    let (mut raw, server_ws) = ws_pair().await;
    let registry = SessionRegistry::new(TunnelConfig::default(), 8);
    registry.attach_socket(None, server_ws).await.unwrap();

    raw.send(Message::Text("PING".into())).await.unwrap();
    let reply: serde_json::Value = serde_json::from_str(&expect_text(&mut raw).await).unwrap();
    assert_eq!(reply["success"], true);
    assert_eq!(reply["message"], "PONG");
    assert!(reply["data"]["timestamp"].is_u64());
}

/// S5 / property 8: a fresh socket carrying the session uuid re-binds the
/// session inside the grace window; streams keep working and the
/// reconnect counter increments.
#[tokio::test]
async fn reconnect_preserves_session_and_streams() {
    let (echo_port, _eof) = spawn_tcp_echo().await;
    let registry = SessionRegistry::new(TunnelConfig::default(), 8);

    let (mut raw1, server_ws1) = ws_pair().await;
    let session = registry.attach_socket(None, server_ws1).await.unwrap();
    raw1.send(Message::Text("SET UUID u-reconnect".into()))
        .await
        .unwrap();
    let _ = expect_text(&mut raw1).await; // SET UUID ack

    // Open a TCP stream and prove it relays.
    send_frame(
        &mut raw1,
        Frame::new(
            MessageType::TcpConnect,
            7,
            ConnectTarget::new("127.0.0.1", echo_port).encode(),
        ),
    )
    .await;
    expect_frame(&mut raw1, MessageType::TcpConnectAck).await;

    // Drop the socket; the session enters its grace window.
    drop(raw1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.reconnect_count(), 0);

    // Reattach with the published id.
    let (mut raw2, server_ws2) = ws_pair().await;
    let rebound = registry
        .attach_socket(Some("u-reconnect"), server_ws2)
        .await
        .unwrap();
    assert_eq!(rebound.reconnect_count(), 1);
    assert!(Arc::ptr_eq(&session, &rebound));

    // The old stream is still addressable: data flows end to end.
    send_frame(
        &mut raw2,
        Frame::new(MessageType::TcpData, 7, Bytes::from_static(b"still here")),
    )
    .await;
    let echoed = expect_frame(&mut raw2, MessageType::TcpData).await;
    assert_eq!(&echoed.payload[..], b"still here");
    assert_eq!(echoed.resource_id, 7);
}

/// Reattaching with an unknown id is rejected without disturbing anything.
#[tokio::test]
async fn reconnect_unknown_session_rejected() {
    let registry = SessionRegistry::new(TunnelConfig::default(), 8);
    let (_raw, server_ws) = ws_pair().await;
    let result = registry.attach_socket(Some("never-seen"), server_ws).await;
    assert!(matches!(result, Err(MuxError::UnknownSession(_))));
}

/// Property 9: grace expiry destroys the session, its streams, and its
/// native sockets.
#[tokio::test]
async fn grace_expiry_releases_streams() {
    let (echo_port, eof_rx) = spawn_tcp_echo().await;
    let config = TunnelConfig {
        reconnect_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let registry = SessionRegistry::new(config, 8);

    let (mut raw, server_ws) = ws_pair().await;
    registry.attach_socket(None, server_ws).await.unwrap();
    assert_eq!(registry.active_sessions(), 1);

    raw.send(Message::Text("SET UUID u-grace".into())).await.unwrap();
    let _ = expect_text(&mut raw).await;

    send_frame(
        &mut raw,
        Frame::new(
            MessageType::TcpConnect,
            1,
            ConnectTarget::new("127.0.0.1", echo_port).encode(),
        ),
    )
    .await;
    expect_frame(&mut raw, MessageType::TcpConnectAck).await;

    drop(raw);

    // Session gone, native socket released.
    tokio::time::timeout(Duration::from_secs(2), eof_rx)
        .await
        .expect("echo peer should see EOF")
        .unwrap();
    for _ in 0..100 {
        if registry.get("u-grace").is_none() && registry.active_sessions() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session survived the grace window");
}

/// Property 10: the send queue keeps exactly the bound, dropping the
/// overflow and preserving order.
#[tokio::test]
async fn queue_bound_holds_under_overflow() {
    let link = Link::new(TunnelConfig {
        max_queue_size: 10,
        ..Default::default()
    });
    for i in 0..10u32 {
        link.send(MessageType::TcpData, i + 1, Bytes::new()).unwrap();
    }
    for i in 0..5u32 {
        let result = link.send(MessageType::TcpData, 100 + i, Bytes::new());
        assert!(matches!(result, Err(MuxError::QueueFull)));
    }
    assert_eq!(link.queued_len(), 10);
}

/// S4: transport loss rejects the pending table; the consumer stream
/// terminates with an error.
#[tokio::test]
async fn disconnect_rejects_pending_streams() {
    let (client_ws, mut egress) = ws_pair().await;
    let client = TunnelClient::from_socket(client_ws, TunnelConfig::default()).unwrap();

    let (tunnel, ()) = futures::join!(client.connect_tcp("10.0.0.1", 80), async {
        let connect = expect_frame(&mut egress, MessageType::TcpConnect).await;
        send_frame(
            &mut egress,
            Frame::empty(MessageType::TcpConnectAck, connect.resource_id),
        )
        .await;
    });
    let mut tunnel = tunnel.unwrap();
    assert_eq!(client.pending_len(), 1);

    drop(egress);

    let outcome = tokio::time::timeout(Duration::from_secs(5), tunnel.recv())
        .await
        .expect("recv should settle after disconnect");
    match outcome {
        Some(Err(MuxError::ConnectionClosed)) => {}
        other => panic!("expected connection-closed error, got {other:?}"),
    }
    assert_eq!(client.pending_len(), 0);
}

/// Upstream connect failures surface as an error on the awaiter, not a
/// transport failure.
#[tokio::test]
async fn tcp_connect_refused_propagates_upstream_error() {
    // Grab a port that nothing listens on.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = probe.local_addr().unwrap().port();
    drop(probe);

    let (client, _registry) = full_stack(TunnelConfig::default()).await;
    let result = client.connect_tcp("127.0.0.1", dead_port).await;
    assert!(matches!(result, Err(MuxError::Upstream(_))));
    // The transport is unharmed.
    assert!(client.link().is_connected());
    client.close();
}

/// UDP relay end to end against a loopback echo peer.
#[tokio::test]
async fn udp_relay_end_to_end() {
    let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let echo_port = echo.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        let (n, from) = echo.recv_from(&mut buf).await.unwrap();
        echo.send_to(&buf[..n], from).await.unwrap();
    });

    let (client, _registry) = full_stack(TunnelConfig::default()).await;
    let mut tunnel = client.bind_udp().await.unwrap();
    assert_ne!(tunnel.local_endpoint().port, 0);

    tunnel
        .send_to(Bytes::from_static(b"ping"), "127.0.0.1", echo_port)
        .await
        .unwrap();
    let packet = tokio::time::timeout(Duration::from_secs(5), tunnel.recv())
        .await
        .expect("datagram expected")
        .expect("socket open");
    assert_eq!(&packet.data[..], b"ping");
    assert_eq!(packet.endpoint.port, echo_port);

    tunnel.close();
    client.close();
}

/// S3 (reduced size): streamed HTTP response arrives in order and intact.
#[tokio::test]
async fn http_streaming_end_to_end() {
    const BODY_LEN: usize = 300_000;
    let body: Vec<u8> = (0..BODY_LEN).map(|i| (i % 251) as u8).collect();

    // Canned loopback HTTP server.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let served = body.clone();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let mut head = Vec::new();
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            head.extend_from_slice(&buf[..n]);
            if head.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let header = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
            served.len()
        );
        socket.write_all(header.as_bytes()).await.unwrap();
        for chunk in served.chunks(64 * 1024) {
            socket.write_all(chunk).await.unwrap();
        }
    });

    let (client, _registry) = full_stack(TunnelConfig::default()).await;
    let request = HttpRequestMeta::new("GET", format!("http://127.0.0.1:{port}/x"));
    let fetch = client.fetch_http(request, None).await.unwrap();

    assert_eq!(fetch.meta.status, 200);
    assert!(fetch.meta.has_body);
    assert!(muxtun::codec::header_get(&fetch.meta.headers, "transfer-encoding").is_none());

    let received = fetch.read_to_end().await.unwrap();
    assert_eq!(received.len(), BODY_LEN);
    assert_eq!(&received[..], &body[..]);
    client.close();
}

/// HTTP upload: the request body crosses the tunnel as chunk frames and
/// reaches the origin intact.
#[tokio::test]
async fn http_upload_end_to_end() {
    let payload = b"field=value&other=thing".to_vec();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let expected = payload.clone();
    let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        // Read until headers + full body are in.
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            data.extend_from_slice(&buf[..n]);
            if let Some(split) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                if data.len() >= split + 4 + expected.len() {
                    break;
                }
            }
        }
        let body_start = data.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let _ = seen_tx.send(data[body_start..].to_vec());
        socket
            .write_all(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
    });

    let (client, _registry) = full_stack(TunnelConfig::default()).await;
    let request = HttpRequestMeta::new("POST", format!("http://127.0.0.1:{port}/submit"))
        .header("content-length", payload.len().to_string())
        .header("content-type", "application/x-www-form-urlencoded");
    let fetch = client
        .fetch_http(request, Some(Bytes::from(payload.clone())))
        .await
        .unwrap();

    assert_eq!(fetch.meta.status, 204);
    assert!(!fetch.meta.has_body);
    let seen = tokio::time::timeout(Duration::from_secs(5), seen_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen, payload);
    client.close();
}

/// The real server path: dial over loopback, publish the identity, relay
/// a TCP echo.
#[tokio::test]
async fn connect_via_real_server() {
    let server = muxtun::TunnelServer::bind(muxtun::ServerConfig {
        listen_addr: ([127, 0, 0, 1], 0).into(),
        ..Default::default()
    })
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    let client = TunnelClient::connect(&format!("ws://{addr}/"), TunnelConfig::default())
        .await
        .unwrap();

    // SET UUID reaches the registry.
    let mut indexed = false;
    for _ in 0..200 {
        if registry.get(client.uuid()).is_some() {
            indexed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(indexed, "session identity never reached the registry");

    let (echo_port, _eof) = spawn_tcp_echo().await;
    let mut tunnel = client.connect_tcp("127.0.0.1", echo_port).await.unwrap();
    tunnel.send(Bytes::from_static(b"over the wire")).await.unwrap();
    let echoed = tunnel.recv().await.expect("stream open").unwrap();
    assert_eq!(&echoed[..], b"over the wire");

    tunnel.close();
    client.close();
}

/// Upgrades on the wrong path are refused during the handshake.
#[tokio::test]
async fn wrong_connect_path_rejected() {
    let server = muxtun::TunnelServer::bind(muxtun::ServerConfig {
        listen_addr: ([127, 0, 0, 1], 0).into(),
        connect_path: "/tunnel".into(),
        ..Default::default()
    })
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    let result = TunnelClient::connect(&format!("ws://{addr}/other"), TunnelConfig::default()).await;
    assert!(result.is_err());

    let ok = TunnelClient::connect(&format!("ws://{addr}/tunnel"), TunnelConfig::default()).await;
    assert!(ok.is_ok());
    ok.unwrap().close();
}

/// The initiator announces its identity right after connecting.
#[tokio::test]
async fn client_announces_uuid() {
    let (client_ws, mut egress) = ws_pair().await;
    let client = TunnelClient::from_socket(client_ws, TunnelConfig::default()).unwrap();

    let line = expect_text(&mut egress).await;
    assert_eq!(line, format!("SET UUID {}", client.uuid()));
    assert_eq!(client.uuid().len(), 32);
}
