//! End-to-end protocol scenarios over real sockets.
//!
//! Each test starts a server on an ephemeral port with a simulated display
//! and drives the RFB wire format byte-for-byte from a raw TCP client.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use rfbserver::{Display, EventKind, RfbServer, ServerConfig, SimulatedDisplay};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const VERSION: &[u8] = b"RFB 003.008\n";

fn scratch_user_file(tag: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let unique: u64 = rand::random();
    path.push(format!("rfbserver-e2e-{tag}-{unique}.txt"));
    let _ = std::fs::remove_file(&path);
    path
}

async fn start_server(
    tag: &str,
    auth_required: bool,
    width: u16,
    height: u16,
    max_connections: usize,
) -> (RfbServer, SocketAddr) {
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        auth_required,
        max_connections,
        frame_rate: 60,
        screen_width: width,
        screen_height: height,
        user_file: scratch_user_file(tag),
        ..ServerConfig::default()
    };
    let display = Arc::new(Display::Simulated(SimulatedDisplay::frozen(width, height)));
    let server = RfbServer::new(config, display).unwrap();
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

async fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

/// Drives the handshake up to and including ServerInit; returns the
/// ServerInit bytes (width, height, pixel format, name).
async fn handshake_no_auth(stream: &mut TcpStream) -> (u16, u16, Vec<u8>, String) {
    assert_eq!(read_n(stream, 12).await, VERSION);
    stream.write_all(VERSION).await.unwrap();

    // One security type: None
    assert_eq!(read_n(stream, 2).await, vec![1, 1]);
    stream.write_all(&[1]).await.unwrap();

    // SecurityResult OK
    assert_eq!(read_n(stream, 4).await, vec![0, 0, 0, 0]);

    // ClientInit: shared
    stream.write_all(&[1]).await.unwrap();

    // ServerInit
    let head = read_n(stream, 24).await;
    let width = u16::from_be_bytes([head[0], head[1]]);
    let height = u16::from_be_bytes([head[2], head[3]]);
    let pixel_format = head[4..20].to_vec();
    let name_len = u32::from_be_bytes([head[20], head[21], head[22], head[23]]) as usize;
    let name = String::from_utf8(read_n(stream, name_len).await).unwrap();
    (width, height, pixel_format, name)
}

#[tokio::test]
async fn handshake_without_auth_is_byte_exact() {
    let (server, addr) = start_server("handshake", false, 320, 200, 5).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let (width, height, pixel_format, name) = handshake_no_auth(&mut stream).await;
    assert_eq!((width, height), (320, 200));
    assert_eq!(pixel_format[0], 32); // bits-per-pixel
    assert_eq!(pixel_format[1], 24); // depth
    assert_eq!(pixel_format[3], 1); // true-colour
    assert_eq!(name, "RFB Server");

    server.stop();
}

#[tokio::test]
async fn wrong_password_fails_and_counts() {
    let (server, addr) = start_server("badpw", true, 320, 200, 5).await;
    server.add_user("admin", "secret").unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert_eq!(read_n(&mut stream, 12).await, VERSION);
    stream.write_all(VERSION).await.unwrap();

    // One security type: VNC authentication
    assert_eq!(read_n(&mut stream, 2).await, vec![1, 2]);
    stream.write_all(&[2]).await.unwrap();

    let challenge = read_n(&mut stream, 16).await;
    assert_eq!(challenge.len(), 16);
    stream.write_all(&[0u8; 16]).await.unwrap();

    // SecurityResult: failed, with a 3.8 reason string
    assert_eq!(read_n(&mut stream, 4).await, vec![0, 0, 0, 1]);
    let reason_len =
        u32::from_be_bytes(read_n(&mut stream, 4).await.try_into().unwrap()) as usize;
    assert!(reason_len > 0);
    let _reason = read_n(&mut stream, reason_len).await;

    // The connection is closed and the failure counted.
    assert_eq!(stream.read(&mut [0u8; 1]).await.unwrap(), 0);
    assert_eq!(server.list_users()["admin"].failure_count, 1);

    let failures: Vec<_> = server
        .recent_events(100)
        .into_iter()
        .filter(|e| e.kind == EventKind::AuthFailure)
        .collect();
    assert_eq!(failures.len(), 1);

    server.stop();
}

#[tokio::test]
async fn three_failures_lock_the_user() {
    let (server, addr) = start_server("lockout", true, 64, 48, 5).await;
    server.add_user("admin", "secret").unwrap();

    for _ in 0..3 {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let _ = read_n(&mut stream, 12).await;
        stream.write_all(VERSION).await.unwrap();
        let _ = read_n(&mut stream, 2).await;
        stream.write_all(&[2]).await.unwrap();
        let _ = read_n(&mut stream, 16).await;
        stream.write_all(&[0u8; 16]).await.unwrap();
        assert_eq!(read_n(&mut stream, 4).await, vec![0, 0, 0, 1]);
        let reason_len =
            u32::from_be_bytes(read_n(&mut stream, 4).await.try_into().unwrap()) as usize;
        let _ = read_n(&mut stream, reason_len).await;
    }
    assert_eq!(server.list_users()["admin"].failure_count, 3);

    // Locked: even the correct password is rejected by the store.
    assert_eq!(
        server.auth_store().authenticate("admin", "secret"),
        rfbserver::AuthOutcome::Locked
    );

    server.stop();
}

#[tokio::test]
async fn first_update_is_one_raw_rectangle() {
    let (server, addr) = start_server("update", false, 320, 200, 5).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    handshake_no_auth(&mut stream).await;

    // SetEncodings [Raw]
    stream
        .write_all(&[2, 0, 0, 1, 0, 0, 0, 0])
        .await
        .unwrap();

    // FramebufferUpdateRequest incremental=0, 0,0,320,200
    let mut req = vec![3u8, 0];
    req.extend_from_slice(&0u16.to_be_bytes());
    req.extend_from_slice(&0u16.to_be_bytes());
    req.extend_from_slice(&320u16.to_be_bytes());
    req.extend_from_slice(&200u16.to_be_bytes());
    stream.write_all(&req).await.unwrap();

    // FramebufferUpdate with exactly one Raw rectangle covering the screen
    let head = read_n(&mut stream, 4).await;
    assert_eq!(head, vec![0, 0, 0, 1]);

    let rect = read_n(&mut stream, 12).await;
    assert_eq!(u16::from_be_bytes([rect[0], rect[1]]), 0);
    assert_eq!(u16::from_be_bytes([rect[2], rect[3]]), 0);
    assert_eq!(u16::from_be_bytes([rect[4], rect[5]]), 320);
    assert_eq!(u16::from_be_bytes([rect[6], rect[7]]), 200);
    assert_eq!(
        i32::from_be_bytes([rect[8], rect[9], rect[10], rect[11]]),
        0
    );

    let payload = read_n(&mut stream, 320 * 200 * 4).await;
    assert_eq!(payload.len(), 320 * 200 * 4);

    server.stop();
}

#[tokio::test]
async fn incremental_update_with_no_change_has_zero_rects() {
    let (server, addr) = start_server("incremental", false, 64, 48, 5).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    handshake_no_auth(&mut stream).await;

    // Full update first.
    let mut req = vec![3u8, 0];
    req.extend_from_slice(&0u16.to_be_bytes());
    req.extend_from_slice(&0u16.to_be_bytes());
    req.extend_from_slice(&64u16.to_be_bytes());
    req.extend_from_slice(&48u16.to_be_bytes());
    stream.write_all(&req).await.unwrap();

    let head = read_n(&mut stream, 4).await;
    assert_eq!(head[3], 1);
    let _ = read_n(&mut stream, 12 + 64 * 48 * 4).await;

    // Incremental over the same region: the display is frozen, so the
    // next sample tick produces an empty update.
    let mut req = vec![3u8, 1];
    req.extend_from_slice(&0u16.to_be_bytes());
    req.extend_from_slice(&0u16.to_be_bytes());
    req.extend_from_slice(&64u16.to_be_bytes());
    req.extend_from_slice(&48u16.to_be_bytes());
    stream.write_all(&req).await.unwrap();

    assert_eq!(read_n(&mut stream, 4).await, vec![0, 0, 0, 0]);

    server.stop();
}

#[tokio::test]
async fn excess_connection_is_closed_without_bytes() {
    let (server, addr) = start_server("maxconn", false, 64, 48, 1).await;

    // First client occupies the only slot.
    let mut first = TcpStream::connect(addr).await.unwrap();
    handshake_no_auth(&mut first).await;

    // Second client is accepted then closed with zero bytes sent.
    let mut second = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(second.read(&mut buf).await.unwrap(), 0);

    let rejections: Vec<_> = server
        .recent_events(100)
        .into_iter()
        .filter(|e| {
            e.kind == EventKind::ClientDisconnect
                && e.detail.get("reason").map(String::as_str) == Some("max-connections")
        })
        .collect();
    assert_eq!(rejections.len(), 1);

    server.stop();
}

#[tokio::test]
async fn status_and_kick() {
    let (server, addr) = start_server("admin", false, 64, 48, 5).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    handshake_no_auth(&mut stream).await;

    // Wait for the table to reflect the running connection.
    let mut peer = None;
    for _ in 0..50 {
        let status = server.status();
        if let Some(conn) = status.connections.first() {
            if conn.state == "running" {
                peer = Some(conn.address);
                break;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let peer = peer.expect("connection never reached running state");

    let status = server.status();
    assert!(status.running);
    assert_eq!(status.screen_size, (64, 48));
    assert_eq!(status.active_connections, 1);
    assert!(!status.connections[0].authenticated);

    server.kick(&peer).unwrap();
    assert!(server.kick(&peer).is_err());

    // The kicked client observes the close.
    let mut buf = [0u8; 1];
    let outcome = stream.read(&mut buf).await;
    assert!(matches!(outcome, Ok(0) | Err(_)));

    let forced: Vec<_> = server
        .recent_events(100)
        .into_iter()
        .filter(|e| e.kind == EventKind::ClientForcedDisconnect)
        .collect();
    assert_eq!(forced.len(), 1);

    server.stop();
    server.stop(); // idempotent
}

#[tokio::test]
async fn stop_closes_running_connections() {
    let (server, addr) = start_server("stop", false, 64, 48, 5).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    handshake_no_auth(&mut stream).await;

    server.stop();

    let mut buf = [0u8; 1];
    let outcome = stream.read(&mut buf).await;
    assert!(matches!(outcome, Ok(0) | Err(_)));
    assert!(!server.status().running);

    let kinds: Vec<_> = server.recent_events(100).into_iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&EventKind::ServerStop));
}
