// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Remote Framebuffer (RFB) protocol constants and wire structures.
//!
//! This module provides the byte-exact framing for every message the server
//! reads or writes: protocol version negotiation, the security handshake,
//! initialization, and the normal-operation client/server messages. All
//! integers are network byte order (RFC 6143).
//!
//! # Protocol Overview
//!
//! The RFB protocol operates in the following phases:
//! 1. **Protocol Version** - Server and client agree on protocol version
//! 2. **Security Handshake** - Authentication method selection and execution
//! 3. **Initialization** - Exchange of framebuffer parameters and capabilities
//! 4. **Normal Operation** - Ongoing message exchange for input events and screen updates

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, RfbError};

/// The RFB protocol version string advertised by the server.
///
/// Exactly 12 bytes including the newline, as required by the protocol.
pub const PROTOCOL_VERSION: &str = "RFB 003.008\n";

/// Upper bound on a ClientCutText payload; larger lengths are a protocol error.
pub const MAX_CUT_TEXT_LEN: usize = 1024 * 1024;

// Client-to-Server Message Types

/// Message type: Client requests to change the pixel format.
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;

/// Message type: Client specifies supported encodings, ordered by preference.
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;

/// Message type: Client requests a framebuffer update (incremental or full).
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;

/// Message type: Client sends a keyboard event.
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;

/// Message type: Client sends a pointer (mouse) event.
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;

/// Message type: Client sends cut text (clipboard data).
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;

// Server-to-Client Message Types

/// Message type: Server sends a framebuffer update.
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;

/// Message type: Server sets colour map entries.
///
/// Only meaningful for colour-mapped formats; unused by this true-colour
/// server but part of the protocol's numbering.
#[allow(dead_code)]
pub const SERVER_MSG_SET_COLOUR_MAP_ENTRIES: u8 = 1;

/// Message type: Server sends a bell (beep) notification.
pub const SERVER_MSG_BELL: u8 = 2;

/// Message type: Server sends cut text (clipboard data).
pub const SERVER_MSG_SERVER_CUT_TEXT: u8 = 3;

// Encoding Types

/// Encoding type: Raw pixel data. Universally supported.
pub const ENCODING_RAW: i32 = 0;

/// Encoding type: Copy Rectangle.
///
/// Instructs the client to copy a region it already has. This server never
/// emits it (no scroll hints are available); the id is kept for protocol
/// completeness when parsing client preference lists.
pub const ENCODING_COPYRECT: i32 = 1;

/// Encoding type: Rise-and-Run-length Encoding.
pub const ENCODING_RRE: i32 = 2;

/// Encoding type: Hextile. Recognized but not produced.
#[allow(dead_code)]
pub const ENCODING_HEXTILE: i32 = 5;

/// Encoding type: Zlib-compressed TRLE. Recognized but not produced.
#[allow(dead_code)]
pub const ENCODING_ZRLE: i32 = 16;

/// Pseudo-encoding: Rich Cursor.
#[allow(dead_code)]
pub const ENCODING_CURSOR: i32 = -239;

/// Pseudo-encoding: Desktop Size.
///
/// Advertises that the client can handle framebuffer dimension changes.
pub const ENCODING_DESKTOP_SIZE: i32 = -223;

// Security Types

/// Security type: Invalid/Unknown.
#[allow(dead_code)]
pub const SECURITY_TYPE_INVALID: u8 = 0;

/// Security type: None (no authentication).
pub const SECURITY_TYPE_NONE: u8 = 1;

/// Security type: VNC Authentication (DES challenge-response).
pub const SECURITY_TYPE_VNC_AUTH: u8 = 2;

// Security Results

/// Security result: Authentication successful.
pub const SECURITY_RESULT_OK: u32 = 0;

/// Security result: Authentication failed.
pub const SECURITY_RESULT_FAILED: u32 = 1;

/// Parses a 12-byte client version string and returns the accepted minor.
///
/// The server speaks 3.8 but downgrades to 3.3 and 3.7; any other version
/// (or malformed bytes) fails the handshake before the security list.
pub fn parse_version(buf: &[u8; 12]) -> Option<u16> {
    let s = std::str::from_utf8(buf).ok()?;
    if !s.starts_with("RFB 003.") || !s.ends_with('\n') {
        return None;
    }
    match s.get(8..11)?.parse::<u16>().ok()? {
        minor @ (3 | 7 | 8) => Some(minor),
        _ => None,
    }
}

/// Represents the pixel format of the framebuffer.
///
/// Defines how pixel data is laid out on the wire: color depth, endianness,
/// and per-channel maxima and shifts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    /// Number of bits per pixel.
    pub bits_per_pixel: u8,
    /// Depth of the pixel in bits.
    pub depth: u8,
    /// Flag indicating if the pixel data is big-endian (1) or little-endian (0).
    pub big_endian_flag: u8,
    /// Flag indicating if the pixel format is true-colour (1) or colormapped (0).
    pub true_colour_flag: u8,
    /// Maximum red color value.
    pub red_max: u16,
    /// Maximum green color value.
    pub green_max: u16,
    /// Maximum blue color value.
    pub blue_max: u16,
    /// Number of shifts to apply to get the red color component.
    pub red_shift: u8,
    /// Number of shifts to apply to get the green color component.
    pub green_shift: u8,
    /// Number of shifts to apply to get the blue color component.
    pub blue_shift: u8,
}

impl PixelFormat {
    /// The server's canonical format: 32bpp little-endian true-colour with
    /// red at bits 16-23, green at 8-15, blue at 0-7 — BGRX byte order in
    /// memory, matching the internal framebuffer samples.
    #[must_use]
    pub fn bgrx32() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    /// Checks whether this format is byte-identical to the canonical BGRX
    /// layout, in which case Raw encoding is a straight copy.
    #[must_use]
    pub fn is_canonical(&self) -> bool {
        *self == Self::bgrx32()
    }

    /// Bytes occupied by one pixel in this format.
    #[must_use]
    pub fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel / 8) as usize
    }

    /// Validates that this pixel format is supported by the server.
    ///
    /// Requires bpp in {8, 16, 32}; for true-colour formats, each channel
    /// max must be one less than a power of two and the shifted channel
    /// ranges must fit in the pixel without overlapping.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if !matches!(self.bits_per_pixel, 8 | 16 | 32) {
            return false;
        }
        if self.depth == 0 || self.depth > self.bits_per_pixel {
            return false;
        }

        if self.true_colour_flag != 0 {
            let channels = [
                (self.red_max, self.red_shift),
                (self.green_max, self.green_shift),
                (self.blue_max, self.blue_shift),
            ];

            let mut occupied: u64 = 0;
            for (max, shift) in channels {
                // (max + 1) must be a power of two
                let span = u32::from(max) + 1;
                if max == 0 || !span.is_power_of_two() {
                    return false;
                }
                let bits = span.trailing_zeros();
                if u32::from(shift) + bits > u32::from(self.bits_per_pixel) {
                    return false;
                }
                let mask = ((1u64 << bits) - 1) << shift;
                if occupied & mask != 0 {
                    return false;
                }
                occupied |= mask;
            }
        }

        true
    }

    /// Serializes the 16-byte pixel format block.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(self.big_endian_flag);
        buf.put_u8(self.true_colour_flag);
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3); // padding
    }

    /// Deserializes a 16-byte pixel format block.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if fewer than 16 bytes are available.
    pub fn from_bytes(buf: &mut BytesMut) -> Result<Self> {
        if buf.len() < 16 {
            return Err(RfbError::Protocol("short PixelFormat block".into()));
        }

        let pf = Self {
            bits_per_pixel: buf.get_u8(),
            depth: buf.get_u8(),
            big_endian_flag: buf.get_u8(),
            true_colour_flag: buf.get_u8(),
            red_max: buf.get_u16(),
            green_max: buf.get_u16(),
            blue_max: buf.get_u16(),
            red_shift: buf.get_u8(),
            green_shift: buf.get_u8(),
            blue_shift: buf.get_u8(),
        };
        buf.advance(3);
        Ok(pf)
    }
}

/// The ServerInit message sent after security negotiation completes.
#[derive(Debug, Clone)]
pub struct ServerInit {
    /// The width of the framebuffer in pixels.
    pub framebuffer_width: u16,
    /// The height of the framebuffer in pixels.
    pub framebuffer_height: u16,
    /// The pixel format used by the framebuffer.
    pub pixel_format: PixelFormat,
    /// The desktop name.
    pub name: String,
}

impl ServerInit {
    /// Serializes the message: width, height, 16-byte pixel format, name
    /// length, UTF-8 name.
    #[allow(clippy::cast_possible_truncation)] // Desktop name length limited to u32 per the protocol
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.framebuffer_width);
        buf.put_u16(self.framebuffer_height);
        self.pixel_format.write_to(buf);

        let name_bytes = self.name.as_bytes();
        buf.put_u32(name_bytes.len() as u32);
        buf.put_slice(name_bytes);
    }
}

/// A rectangle header in a framebuffer update message.
///
/// Each update carries one or more rectangles, each with its own encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rectangle {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width of the rectangle in pixels.
    pub width: u16,
    /// Height of the rectangle in pixels.
    pub height: u16,
    /// The encoding type used for this rectangle's pixel data.
    pub encoding: i32,
}

impl Rectangle {
    /// Writes the 12-byte rectangle header.
    pub fn write_header(&self, buf: &mut BytesMut) {
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_i32(self.encoding);
    }

    /// Reads a 12-byte rectangle header.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if fewer than 12 bytes are available.
    pub fn read_header(buf: &mut BytesMut) -> Result<Self> {
        if buf.len() < 12 {
            return Err(RfbError::Protocol("short rectangle header".into()));
        }
        Ok(Self {
            x: buf.get_u16(),
            y: buf.get_u16(),
            width: buf.get_u16(),
            height: buf.get_u16(),
            encoding: buf.get_i32(),
        })
    }
}

/// All message types a client can send during normal operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Client requests a specific pixel format for framebuffer updates.
    SetPixelFormat(PixelFormat),

    /// Client specifies the list of encodings it supports.
    SetEncodings(Vec<i32>),

    /// Client requests a framebuffer update for a specific region.
    FramebufferUpdateRequest {
        /// If true, only send changes since the last update; if false, send full refresh.
        incremental: bool,
        /// X coordinate of the requested region.
        x: u16,
        /// Y coordinate of the requested region.
        y: u16,
        /// Width of the requested region.
        width: u16,
        /// Height of the requested region.
        height: u16,
    },

    /// Client sends a keyboard key event.
    KeyEvent {
        /// True if the key is pressed, false if released.
        down: bool,
        /// The X Window System keysym value of the key.
        key: u32,
    },

    /// Client sends a pointer (mouse) event.
    PointerEvent {
        /// Bitmask of currently pressed mouse buttons.
        button_mask: u8,
        /// X coordinate of the pointer.
        x: u16,
        /// Y coordinate of the pointer.
        y: u16,
    },

    /// Client sends clipboard (cut text) data.
    ClientCutText(String),
}

impl ClientMessage {
    /// Reads exactly one client message from the stream.
    ///
    /// Blocks until the message's full byte count has arrived. End of
    /// stream on the type byte is the distinguished `ConnectionClosed`
    /// value; a stream that ends mid-message is a protocol error, as is an
    /// unknown message type or an oversized cut-text payload.
    pub async fn read<S>(stream: &mut S) -> Result<ClientMessage>
    where
        S: AsyncRead + Unpin,
    {
        let mut msg_type = [0u8; 1];
        match stream.read_exact(&mut msg_type).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(RfbError::ConnectionClosed);
            }
            Err(e) => return Err(e.into()),
        }

        match msg_type[0] {
            CLIENT_MSG_SET_PIXEL_FORMAT => {
                let mut body = [0u8; 19]; // 3 padding + 16 pixel format
                read_body(stream, &mut body, "SetPixelFormat").await?;
                let mut buf = BytesMut::from(&body[3..]);
                Ok(ClientMessage::SetPixelFormat(PixelFormat::from_bytes(&mut buf)?))
            }
            CLIENT_MSG_SET_ENCODINGS => {
                let mut header = [0u8; 3]; // 1 padding + 2 count
                read_body(stream, &mut header, "SetEncodings").await?;
                let count = u16::from_be_bytes([header[1], header[2]]) as usize;

                let mut body = vec![0u8; count * 4];
                read_body(stream, &mut body, "SetEncodings body").await?;
                let encodings = body
                    .chunks_exact(4)
                    .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                Ok(ClientMessage::SetEncodings(encodings))
            }
            CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST => {
                let mut body = [0u8; 9];
                read_body(stream, &mut body, "FramebufferUpdateRequest").await?;
                Ok(ClientMessage::FramebufferUpdateRequest {
                    incremental: body[0] != 0,
                    x: u16::from_be_bytes([body[1], body[2]]),
                    y: u16::from_be_bytes([body[3], body[4]]),
                    width: u16::from_be_bytes([body[5], body[6]]),
                    height: u16::from_be_bytes([body[7], body[8]]),
                })
            }
            CLIENT_MSG_KEY_EVENT => {
                let mut body = [0u8; 7]; // 1 down + 2 padding + 4 keysym
                read_body(stream, &mut body, "KeyEvent").await?;
                Ok(ClientMessage::KeyEvent {
                    down: body[0] != 0,
                    key: u32::from_be_bytes([body[3], body[4], body[5], body[6]]),
                })
            }
            CLIENT_MSG_POINTER_EVENT => {
                let mut body = [0u8; 5]; // 1 mask + 2 x + 2 y
                read_body(stream, &mut body, "PointerEvent").await?;
                Ok(ClientMessage::PointerEvent {
                    button_mask: body[0],
                    x: u16::from_be_bytes([body[1], body[2]]),
                    y: u16::from_be_bytes([body[3], body[4]]),
                })
            }
            CLIENT_MSG_CLIENT_CUT_TEXT => {
                let mut header = [0u8; 7]; // 3 padding + 4 length
                read_body(stream, &mut header, "ClientCutText").await?;
                let length =
                    u32::from_be_bytes([header[3], header[4], header[5], header[6]]) as usize;
                if length > MAX_CUT_TEXT_LEN {
                    return Err(RfbError::Protocol(format!(
                        "cut text length {length} exceeds limit"
                    )));
                }
                let mut body = vec![0u8; length];
                read_body(stream, &mut body, "ClientCutText body").await?;
                Ok(ClientMessage::ClientCutText(
                    String::from_utf8_lossy(&body).into_owned(),
                ))
            }
            other => Err(RfbError::Protocol(format!(
                "unknown client message type {other}"
            ))),
        }
    }
}

/// Reads the remainder of a message whose type byte has been consumed.
async fn read_body<S>(stream: &mut S, buf: &mut [u8], what: &str) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    stream
        .read_exact(buf)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                RfbError::Protocol(format!("stream ended inside {what}"))
            }
            _ => RfbError::Io(e),
        })?;
    Ok(())
}

/// Builds the 4-byte FramebufferUpdate message header.
pub fn framebuffer_update_header(rect_count: u16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
    buf.put_u8(0); // padding
    buf.put_u16(rect_count);
    buf
}

/// Builds a Bell message.
#[allow(dead_code)]
pub fn bell() -> BytesMut {
    let mut buf = BytesMut::with_capacity(1);
    buf.put_u8(SERVER_MSG_BELL);
    buf
}

/// Builds a ServerCutText message.
#[allow(clippy::cast_possible_truncation)] // Cut text length limited to u32 per the protocol
pub fn server_cut_text(text: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(8 + text.len());
    buf.put_u8(SERVER_MSG_SERVER_CUT_TEXT);
    buf.put_bytes(0, 3); // padding
    buf.put_u32(text.len() as u32);
    buf.put_slice(text.as_bytes());
    buf
}
