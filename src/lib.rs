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

//! # rfbserver
//!
//! A pure Rust implementation of a Remote Framebuffer (VNC) server.
//!
//! The server samples a display at a fixed rate, detects changed regions,
//! and streams incremental framebuffer updates to concurrent RFB clients
//! (protocol versions 3.3, 3.7 and 3.8, RFC 6143 wire format). Client
//! keyboard and pointer events are injected back into the display.
//!
//! ## Features
//!
//! - **Raw and RRE encodings** with per-rectangle selection against the
//!   client's preference list, plus the DesktopSize pseudo-encoding
//! - **Any true-colour pixel format** at 8/16/32 bits per pixel
//! - **VNC authentication** backed by a persistent user store with
//!   PBKDF2 password hashing and lockout after repeated failures
//! - **Async I/O**: built on Tokio, one task per connection
//! - **Admin surface**: status snapshot, kick, user management, and a
//!   bounded event log
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use rfbserver::{Display, RfbServer, ServerConfig, SimulatedDisplay};
//!
//! #[tokio::main]
//! async fn main() -> rfbserver::Result<()> {
//!     let config = ServerConfig {
//!         auth_required: false,
//!         ..ServerConfig::default()
//!     };
//!     let display = Arc::new(Display::Simulated(SimulatedDisplay::new(1024, 768)));
//!
//!     let server = RfbServer::new(config, display)?;
//!     server.start().await?;
//!
//!     // ... run until the embedder decides to shut down ...
//!     server.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             Your Application             │
//! │                                          │
//! │  • Supply a Display (real or simulated)  │
//! │  • Drive the admin surface               │
//! │  • Control server lifecycle              │
//! └───────────────────┬──────────────────────┘
//!                     │
//!                     ▼
//! ┌──────────────────────────────────────────┐
//! │            RfbServer (Public)            │
//! │                                          │
//! │  • TCP listener + connection table       │
//! │  • Auth store + event log                │
//! └───────────────────┬──────────────────────┘
//!                     │
//!         ┌───────────┼───────────┐
//!         ▼           ▼           ▼
//!    ┌────────┐  ┌────────┐  ┌────────┐
//!    │ Conn 1 │  │ Conn 2 │  │ Conn N │
//!    └────────┘  └────────┘  └────────┘
//!         │           │           │
//!         └───────────┴───────────┘
//!                     │
//!                     ▼
//! ┌──────────────────────────────────────────┐
//! │      FramebufferEngine (capture task)    │
//! │                                          │
//! │  • Versioned immutable BGRX samples      │
//! │  • 32x32 dirty-block detection           │
//! └──────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod config;
pub mod display;
pub mod encoding;
pub mod error;
pub mod events;
pub mod framebuffer;
pub mod keysym;
pub mod protocol;
pub mod server;

// Internal modules
mod client;
mod translate;

// Re-exports
pub use auth::{AuthError, AuthOutcome, AuthStore, UserSummary};
pub use config::ServerConfig;
pub use display::{Display, ScreenBackend, SimulatedDisplay};
pub use error::{Result, RfbError};
pub use events::{EventKind, EventLogEntry};
pub use framebuffer::{FramebufferEngine, FramebufferSample};
pub use protocol::PixelFormat;
pub use server::{ConnectionStatus, RfbServer, ServerStatus};

/// RFB protocol version advertised by the server.
pub const PROTOCOL_VERSION: &str = protocol::PROTOCOL_VERSION;

/// Default RFB port.
pub const DEFAULT_PORT: u16 = config::DEFAULT_PORT;
