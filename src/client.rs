//! Per-connection RFB state machine.
//!
//! Each accepted socket runs one connection task which drives the
//! handshake (version exchange, security negotiation, initialization) and
//! then the normal-operation message loop. After the handshake the socket
//! splits: a reader task parses client messages while the update
//! dispatcher owns the write half, so exactly one writer touches the
//! socket.
//!
//! Negotiated state (pixel format, encoding preferences, the pending
//! update request) flows from reader to dispatcher through watch channels;
//! a newer update request replaces an unserved one, so a client has at
//! most one outstanding request. The dispatcher serves a request once a
//! sample newer than the connection's last-sent version is available (or
//! immediately for non-incremental requests), then retains the sample it
//! sent for the next delta.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::auth::{AuthStore, CHALLENGE_LEN};
use crate::display::Display;
use crate::encoding::{self, Encoding, RawEncoding};
use crate::error::{Result, RfbError};
use crate::events::{EventKind, EventLog};
use crate::framebuffer::{dirty_rects, sample_rect, DirtyRect, FramebufferSample};
use crate::protocol::{
    self, ClientMessage, PixelFormat, Rectangle, ServerInit, ENCODING_DESKTOP_SIZE, ENCODING_RAW,
    PROTOCOL_VERSION, SECURITY_RESULT_FAILED, SECURITY_RESULT_OK, SECURITY_TYPE_NONE,
    SECURITY_TYPE_VNC_AUTH,
};

/// A read that sees no bytes for this long is a liveness failure.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Cap on rectangles per FramebufferUpdate; beyond it the update collapses
/// into one full-region rectangle.
const MAX_RECTS_PER_UPDATE: usize = 50;

/// Connection lifecycle states, as shown by the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Exchanging protocol versions.
    Version,
    /// Negotiating the security type.
    Security,
    /// VNC challenge/response in progress.
    Auth,
    /// ClientInit/ServerInit exchange.
    Init,
    /// Normal operation message loop.
    Running,
    /// The connection has ended.
    Closed,
}

impl ConnState {
    /// Lowercase state name for status output.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnState::Version => "version",
            ConnState::Security => "security",
            ConnState::Auth => "auth",
            ConnState::Init => "init",
            ConnState::Running => "running",
            ConnState::Closed => "closed",
        }
    }
}

/// Connection state shared with the server core for the admin surface.
#[derive(Debug)]
pub struct ConnectionInfo {
    /// Remote peer address.
    pub address: SocketAddr,
    authenticated: AtomicBool,
    state: Mutex<ConnState>,
}

impl ConnectionInfo {
    pub(crate) fn new(address: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            address,
            authenticated: AtomicBool::new(false),
            state: Mutex::new(ConnState::Version),
        })
    }

    /// Whether the peer has passed authentication.
    pub fn authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        *self.state.lock().expect("conn state lock poisoned")
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        *self.state.lock().expect("conn state lock poisoned") = state;
    }

    fn set_authenticated(&self) {
        self.authenticated.store(true, Ordering::Relaxed);
    }
}

/// Everything a connection task borrows from the server core.
pub(crate) struct ConnectionContext {
    pub desktop_name: String,
    pub auth_required: bool,
    pub auth: Arc<AuthStore>,
    pub display: Arc<Display>,
    pub frames: watch::Receiver<Arc<FramebufferSample>>,
    pub events: Arc<EventLog>,
}

/// An outstanding FramebufferUpdateRequest. `seq` orders requests so the
/// dispatcher can tell a fresh request from one it already served.
#[derive(Debug, Clone, Copy)]
struct UpdateRequest {
    seq: u64,
    incremental: bool,
    x: u16,
    y: u16,
    width: u16,
    height: u16,
}

/// Client encoding preferences, first entry most preferred.
#[derive(Debug, Clone, Default)]
struct EncodingPrefs {
    list: Vec<i32>,
    desktop_size: bool,
}

/// Runs one client connection to completion.
///
/// Returns `Ok(())` on orderly shutdown (peer close), an error for
/// protocol violations, authentication failure, or I/O trouble. The caller
/// owns table bookkeeping and event logging for the disconnect itself.
pub(crate) async fn run_connection(
    stream: TcpStream,
    conn: Arc<ConnectionInfo>,
    ctx: ConnectionContext,
) -> Result<()> {
    let result = drive_connection(stream, &conn, &ctx).await;
    conn.set_state(ConnState::Closed);
    result
}

async fn drive_connection(
    mut stream: TcpStream,
    conn: &Arc<ConnectionInfo>,
    ctx: &ConnectionContext,
) -> Result<()> {
    stream.set_nodelay(true)?;

    let minor = exchange_versions(&mut stream).await?;
    debug!("{} negotiated RFB 3.{minor}", conn.address);

    conn.set_state(ConnState::Security);
    security_handshake(&mut stream, minor, conn, ctx).await?;

    conn.set_state(ConnState::Init);
    initialize(&mut stream, ctx).await?;
    info!("{} handshake complete", conn.address);

    conn.set_state(ConnState::Running);
    run_message_loop(stream, conn, ctx).await
}

/// VERSION: write the server version, read and validate the client's.
async fn exchange_versions(stream: &mut TcpStream) -> Result<u16> {
    stream.write_all(PROTOCOL_VERSION.as_bytes()).await?;

    let mut version_buf = [0u8; 12];
    read_with_idle_timeout(stream, &mut version_buf).await?;

    protocol::parse_version(&version_buf).ok_or_else(|| {
        RfbError::Protocol(format!(
            "unsupported client version {:?}",
            String::from_utf8_lossy(&version_buf)
        ))
    })
}

/// SECURITY: offer one type, read the choice where the version has one,
/// then run VNC authentication when required.
async fn security_handshake(
    stream: &mut TcpStream,
    minor: u16,
    conn: &Arc<ConnectionInfo>,
    ctx: &ConnectionContext,
) -> Result<()> {
    let offered = if ctx.auth_required {
        SECURITY_TYPE_VNC_AUTH
    } else {
        SECURITY_TYPE_NONE
    };

    if minor == 3 {
        // RFB 3.3: the server dictates the type as a u32; no client choice.
        stream.write_all(&u32::from(offered).to_be_bytes()).await?;
    } else {
        stream.write_all(&[1, offered]).await?;

        let mut choice = [0u8; 1];
        read_with_idle_timeout(stream, &mut choice).await?;
        if choice[0] != offered {
            send_security_failure(stream, minor, "security type not offered").await?;
            return Err(RfbError::Protocol(format!(
                "client chose unoffered security type {}",
                choice[0]
            )));
        }
    }

    if offered == SECURITY_TYPE_VNC_AUTH {
        conn.set_state(ConnState::Auth);
        vnc_authenticate(stream, minor, conn, ctx).await?;
    } else if minor >= 8 {
        // 3.8 acknowledges the None type; earlier versions proceed directly.
        stream.write_all(&SECURITY_RESULT_OK.to_be_bytes()).await?;
    }

    Ok(())
}

/// AUTH: 16-byte challenge, 16-byte response, store verification.
async fn vnc_authenticate(
    stream: &mut TcpStream,
    minor: u16,
    conn: &Arc<ConnectionInfo>,
    ctx: &ConnectionContext,
) -> Result<()> {
    let challenge = AuthStore::generate_challenge();
    stream.write_all(&challenge).await?;

    let mut response = [0u8; CHALLENGE_LEN];
    read_with_idle_timeout(stream, &mut response).await?;

    match ctx.auth.verify_challenge_any(&challenge, &response) {
        Some(username) => {
            info!("{} authenticated as {username}", conn.address);
            conn.set_authenticated();
            stream.write_all(&SECURITY_RESULT_OK.to_be_bytes()).await?;
            Ok(())
        }
        None => {
            warn!("{} failed VNC authentication", conn.address);
            ctx.events
                .record(EventKind::AuthFailure, Some(conn.address), Default::default());
            // One generic reason; the store never reveals which users exist.
            send_security_failure(stream, minor, "authentication failed").await?;
            Err(RfbError::AuthenticationFailed)
        }
    }
}

/// Sends SecurityResult=failed; 3.8 appends the UTF-8 reason string.
async fn send_security_failure(stream: &mut TcpStream, minor: u16, reason: &str) -> Result<()> {
    stream.write_all(&SECURITY_RESULT_FAILED.to_be_bytes()).await?;
    if minor >= 8 {
        stream
            .write_all(&(reason.len() as u32).to_be_bytes())
            .await?;
        stream.write_all(reason.as_bytes()).await?;
    }
    Ok(())
}

/// INIT: read the shared flag (this server always shares), write ServerInit.
async fn initialize(stream: &mut TcpStream, ctx: &ConnectionContext) -> Result<()> {
    let mut shared = [0u8; 1];
    read_with_idle_timeout(stream, &mut shared).await?;

    let sample = ctx.frames.borrow().clone();
    let server_init = ServerInit {
        framebuffer_width: sample.width,
        framebuffer_height: sample.height,
        pixel_format: PixelFormat::bgrx32(),
        name: ctx.desktop_name.clone(),
    };

    let mut init_buf = BytesMut::new();
    server_init.write_to(&mut init_buf);
    stream.write_all(&init_buf).await?;
    Ok(())
}

/// RUNNING: split the socket and race the reader against the dispatcher.
async fn run_message_loop(
    stream: TcpStream,
    conn: &Arc<ConnectionInfo>,
    ctx: &ConnectionContext,
) -> Result<()> {
    let (reader, writer) = stream.into_split();

    let (pf_tx, pf_rx) = watch::channel(PixelFormat::bgrx32());
    let (enc_tx, enc_rx) = watch::channel(EncodingPrefs::default());
    let (req_tx, req_rx) = watch::channel(None::<UpdateRequest>);

    let display = ctx.display.clone();
    let address = conn.address;
    let mut reader_task = tokio::spawn(async move {
        let result = read_loop(reader, &display, &pf_tx, &enc_tx, &req_tx).await;
        if let Err(e) = &result {
            debug!("{address} reader ended: {e}");
        }
        result
    });

    let frames = ctx.frames.clone();
    let dispatch = update_dispatch(writer, frames, pf_rx, enc_rx, req_rx);

    tokio::select! {
        result = dispatch => {
            // The dispatcher returns Ok when the reader's channels close;
            // surface the reader's own error in that case.
            reader_task.abort();
            match reader_task.await {
                Ok(Err(e)) => Err(e),
                _ => result,
            }
        }
        joined = &mut reader_task => {
            match joined {
                Ok(result) => result,
                Err(e) => Err(RfbError::Protocol(format!("reader task failed: {e}"))),
            }
        }
    }
}

/// Reads client messages until the peer closes or errs, forwarding state
/// changes to the dispatcher and input to the display.
async fn read_loop(
    mut reader: OwnedReadHalf,
    display: &Display,
    pf_tx: &watch::Sender<PixelFormat>,
    enc_tx: &watch::Sender<EncodingPrefs>,
    req_tx: &watch::Sender<Option<UpdateRequest>>,
) -> Result<()> {
    let mut seq = 0u64;

    loop {
        let message = match tokio::time::timeout(READ_IDLE_TIMEOUT, ClientMessage::read(&mut reader))
            .await
        {
            Ok(result) => result,
            Err(_) => return Err(RfbError::Protocol("no data received for 5 minutes".into())),
        };

        match message {
            Ok(ClientMessage::SetPixelFormat(format)) => {
                if !format.is_valid() {
                    return Err(RfbError::InvalidPixelFormat);
                }
                debug!(
                    "Client set pixel format: {}bpp depth {} shifts R{} G{} B{}",
                    format.bits_per_pixel,
                    format.depth,
                    format.red_shift,
                    format.green_shift,
                    format.blue_shift
                );
                let _ = pf_tx.send(format);
            }
            Ok(ClientMessage::SetEncodings(list)) => {
                debug!("Client set {} encodings: {list:?}", list.len());
                let _ = enc_tx.send(EncodingPrefs {
                    desktop_size: list.contains(&ENCODING_DESKTOP_SIZE),
                    list,
                });
            }
            Ok(ClientMessage::FramebufferUpdateRequest {
                incremental,
                x,
                y,
                width,
                height,
            }) => {
                seq += 1;
                // A newer request replaces an unserved one.
                let _ = req_tx.send(Some(UpdateRequest {
                    seq,
                    incremental,
                    x,
                    y,
                    width,
                    height,
                }));
            }
            Ok(ClientMessage::KeyEvent { down, key }) => {
                display.inject_key(key, down);
            }
            Ok(ClientMessage::PointerEvent { button_mask, x, y }) => {
                let (width, height) = display.size();
                let x = x.min(width.saturating_sub(1));
                let y = y.min(height.saturating_sub(1));
                display.inject_pointer(x, y, button_mask);
            }
            Ok(ClientMessage::ClientCutText(text)) => {
                // Best-effort pass-through only; nothing consumes it here.
                debug!("Discarding {} bytes of client cut text", text.len());
            }
            Err(RfbError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Serves update requests: waits until the pending request is due, builds
/// the FramebufferUpdate, writes it, and retains the sample it sent.
async fn update_dispatch(
    writer: OwnedWriteHalf,
    mut frames: watch::Receiver<Arc<FramebufferSample>>,
    mut pf_rx: watch::Receiver<PixelFormat>,
    enc_rx: watch::Receiver<EncodingPrefs>,
    mut req_rx: watch::Receiver<Option<UpdateRequest>>,
) -> Result<()> {
    let mut writer = BufWriter::with_capacity(64 * 1024, writer);
    let mut pixel_format = pf_rx.borrow_and_update().clone();
    let mut last_sent: Option<Arc<FramebufferSample>> = None;
    let mut served_seq = 0u64;

    loop {
        // Wait for an unserved pending request.
        let request = loop {
            match *req_rx.borrow_and_update() {
                Some(request) if request.seq > served_seq => break request,
                _ => {}
            }
            if req_rx.changed().await.is_err() {
                return Ok(()); // reader gone
            }
        };

        // A pixel format change takes effect now and forces a full refresh.
        if pf_rx.has_changed().unwrap_or(false) {
            pixel_format = pf_rx.borrow_and_update().clone();
            last_sent = None;
        }

        // Incremental requests wait for a sample the client has not seen.
        let sample = if request.incremental && last_sent.is_some() {
            loop {
                let candidate = frames.borrow_and_update().clone();
                let last_version = last_sent.as_ref().map_or(0, |s| s.version);
                if candidate.version > last_version {
                    break candidate;
                }
                if frames.changed().await.is_err() {
                    return Ok(()); // engine stopped
                }
            }
        } else {
            frames.borrow_and_update().clone()
        };

        let prefs = enc_rx.borrow().clone();
        let message = build_update(&sample, last_sent.as_deref(), &request, &pixel_format, &prefs);
        writer.write_all(&message).await?;
        writer.flush().await?;

        last_sent = Some(sample);
        served_seq = request.seq;
    }
}

/// Builds one FramebufferUpdate message for a served request.
#[allow(clippy::cast_possible_truncation)] // rect count capped at MAX_RECTS_PER_UPDATE
fn build_update(
    sample: &FramebufferSample,
    last_sent: Option<&FramebufferSample>,
    request: &UpdateRequest,
    pixel_format: &PixelFormat,
    prefs: &EncodingPrefs,
) -> BytesMut {
    let screen = DirtyRect {
        x: 0,
        y: 0,
        width: sample.width,
        height: sample.height,
    };
    let requested = DirtyRect {
        x: request.x,
        y: request.y,
        width: request.width,
        height: request.height,
    };

    // Zero-area or fully off-screen requests yield an empty update.
    let Some(region) = requested.intersect(&screen) else {
        return protocol::framebuffer_update_header(0);
    };

    let mut rects: Vec<(Rectangle, BytesMut)> = Vec::new();

    let size_changed =
        last_sent.is_some_and(|l| l.width != sample.width || l.height != sample.height);
    if size_changed && prefs.desktop_size {
        rects.push((
            Rectangle {
                x: 0,
                y: 0,
                width: sample.width,
                height: sample.height,
                encoding: ENCODING_DESKTOP_SIZE,
            },
            BytesMut::new(),
        ));
    }

    if !request.incremental || last_sent.is_none() || size_changed {
        // Full refresh of the requested region, always Raw.
        let pixels = sample_rect(sample, &region);
        let payload = RawEncoding
            .encode(&pixels, region.width, region.height, pixel_format)
            .expect("raw encoding always applies");
        rects.push((
            Rectangle {
                x: region.x,
                y: region.y,
                width: region.width,
                height: region.height,
                encoding: ENCODING_RAW,
            },
            payload,
        ));
    } else if let Some(last) = last_sent {
        let mut dirty: Vec<DirtyRect> = dirty_rects(last, sample)
            .into_iter()
            .filter_map(|r| r.intersect(&region))
            .collect();

        // Degenerate change sets collapse into one full-region rectangle.
        if dirty.len() > MAX_RECTS_PER_UPDATE {
            dirty = vec![region];
        }

        for rect in dirty {
            let pixels = sample_rect(sample, &rect);
            let (chosen, payload) = encoding::select_encoding(
                &prefs.list,
                &pixels,
                rect.width,
                rect.height,
                pixel_format,
            );
            rects.push((
                Rectangle {
                    x: rect.x,
                    y: rect.y,
                    width: rect.width,
                    height: rect.height,
                    encoding: chosen,
                },
                payload,
            ));
        }
    }

    let mut message = protocol::framebuffer_update_header(rects.len() as u16);
    for (rect, payload) in rects {
        rect.write_header(&mut message);
        message.extend_from_slice(&payload);
    }
    message
}

/// Reads exactly `buf.len()` bytes with the idle timeout applied.
async fn read_with_idle_timeout(stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
    match tokio::time::timeout(READ_IDLE_TIMEOUT, stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(RfbError::ConnectionClosed)
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(RfbError::Protocol("no data received for 5 minutes".into())),
    }
}
