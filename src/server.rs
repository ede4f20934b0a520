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

//! RFB server core: listener, connection table, and admin surface.
//!
//! The server owns the framebuffer engine, the auth store, and one task
//! per connection. The accept loop enforces `max_connections` by closing
//! excess peers before any bytes are written. Connection tasks are
//! double-spawned so a panic inside one is confined to that connection:
//! the outer wrapper observes the panic, logs it, and cleans up the table
//! entry while the server keeps running.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{AbortHandle, JoinHandle};

use crate::auth::{AuthError, AuthStore, UserSummary};
use crate::client::{self, ConnState, ConnectionContext, ConnectionInfo};
use crate::config::ServerConfig;
use crate::display::Display;
use crate::error::{Result, RfbError};
use crate::events::{EventKind, EventLog, EventLogEntry};
use crate::framebuffer::FramebufferEngine;

/// Point-in-time server status for the admin surface.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    /// Whether the server is accepting connections.
    pub running: bool,
    /// Configured bind address.
    pub host: String,
    /// Configured port.
    pub port: u16,
    /// Number of live connections.
    pub active_connections: usize,
    /// Configured connection limit.
    pub max_connections: usize,
    /// Whether VNC authentication is required.
    pub auth_required: bool,
    /// Current framebuffer dimensions.
    pub screen_size: (u16, u16),
    /// One row per live connection.
    pub connections: Vec<ConnectionStatus>,
}

/// Status row for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    /// Remote peer address.
    pub address: SocketAddr,
    /// Whether the peer has authenticated.
    pub authenticated: bool,
    /// Lifecycle state name.
    pub state: &'static str,
}

struct ClientHandle {
    info: Arc<ConnectionInfo>,
    abort: AbortHandle,
}

struct ServerInner {
    config: ServerConfig,
    auth: Arc<AuthStore>,
    display: Arc<Display>,
    engine: Mutex<Option<FramebufferEngine>>,
    connections: Mutex<HashMap<SocketAddr, ClientHandle>>,
    events: Arc<EventLog>,
    running: AtomicBool,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    bound_addr: Mutex<Option<SocketAddr>>,
}

/// An RFB server instance. Cheaply cloneable; clones share state.
#[derive(Clone)]
pub struct RfbServer {
    inner: Arc<ServerInner>,
}

impl RfbServer {
    /// Creates a server from a validated configuration and a display.
    ///
    /// The user table loads from `config.user_file` immediately; start the
    /// server with [`RfbServer::start`].
    pub fn new(config: ServerConfig, display: Arc<Display>) -> Result<Self> {
        config.validate()?;
        let auth = Arc::new(AuthStore::open(&config.user_file));

        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                auth,
                display,
                engine: Mutex::new(None),
                connections: Mutex::new(HashMap::new()),
                events: Arc::new(EventLog::new()),
                running: AtomicBool::new(false),
                accept_task: Mutex::new(None),
                bound_addr: Mutex::new(None),
            }),
        })
    }

    /// Binds the listener, starts the framebuffer engine, and begins
    /// accepting connections.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(RfbError::InvalidOperation("server already running".into()));
        }

        let bind_addr = format!("{}:{}", inner.config.host, inner.config.port);
        let listener = match TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                inner.running.store(false, Ordering::SeqCst);
                return Err(RfbError::Config(format!("failed to bind {bind_addr}: {e}")));
            }
        };
        let bound = listener.local_addr()?;
        *inner.bound_addr.lock().expect("addr lock poisoned") = Some(bound);

        let engine = FramebufferEngine::start(inner.display.clone(), inner.config.frame_rate);
        *inner.engine.lock().expect("engine lock poisoned") = Some(engine);

        info!("RFB server listening on {bound}");
        inner.events.record(
            EventKind::ServerStart,
            None,
            HashMap::from([("port".to_string(), bound.port().to_string())]),
        );

        let accept_inner = inner.clone();
        let task = tokio::spawn(async move {
            accept_loop(accept_inner, listener).await;
        });
        *inner.accept_task.lock().expect("accept lock poisoned") = Some(task);

        Ok(())
    }

    /// Stops the server: refuses new accepts, closes every connection,
    /// and stops the framebuffer engine. Idempotent.
    pub fn stop(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping RFB server");

        if let Some(task) = inner.accept_task.lock().expect("accept lock poisoned").take() {
            task.abort();
        }

        let handles: Vec<(SocketAddr, ClientHandle)> = inner
            .connections
            .lock()
            .expect("connection table lock poisoned")
            .drain()
            .collect();
        for (address, handle) in handles {
            handle.info.set_state(ConnState::Closed);
            handle.abort.abort();
            inner
                .events
                .record(EventKind::ClientDisconnect, Some(address), HashMap::new());
        }

        if let Some(engine) = inner.engine.lock().expect("engine lock poisoned").take() {
            engine.stop();
        }
        *inner.bound_addr.lock().expect("addr lock poisoned") = None;

        inner.events.record(EventKind::ServerStop, None, HashMap::new());
    }

    /// The actual bound address while running (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.bound_addr.lock().expect("addr lock poisoned")
    }

    /// Snapshot of server and per-connection state.
    pub fn status(&self) -> ServerStatus {
        let inner = &self.inner;
        let connections: Vec<ConnectionStatus> = inner
            .connections
            .lock()
            .expect("connection table lock poisoned")
            .values()
            .map(|handle| ConnectionStatus {
                address: handle.info.address,
                authenticated: handle.info.authenticated(),
                state: handle.info.state().as_str(),
            })
            .collect();

        let screen_size = inner
            .engine
            .lock()
            .expect("engine lock poisoned")
            .as_ref()
            .map_or_else(
                || inner.display.size(),
                |engine| {
                    let sample = engine.latest();
                    (sample.width, sample.height)
                },
            );

        ServerStatus {
            running: inner.running.load(Ordering::SeqCst),
            host: inner.config.host.clone(),
            port: inner.config.port,
            active_connections: connections.len(),
            max_connections: inner.config.max_connections,
            auth_required: inner.config.auth_required,
            screen_size,
            connections,
        }
    }

    /// Forcibly disconnects the client at `address`.
    pub fn kick(&self, address: &SocketAddr) -> Result<()> {
        let handle = self
            .inner
            .connections
            .lock()
            .expect("connection table lock poisoned")
            .remove(address)
            .ok_or_else(|| RfbError::InvalidOperation(format!("no client at {address}")))?;

        handle.info.set_state(ConnState::Closed);
        handle.abort.abort();
        self.inner.events.record(
            EventKind::ClientForcedDisconnect,
            Some(*address),
            HashMap::new(),
        );
        info!("Kicked client {address}");
        Ok(())
    }

    /// Adds a user account.
    pub fn add_user(&self, username: &str, password: &str) -> std::result::Result<(), AuthError> {
        self.inner.auth.add(username, password)
    }

    /// Removes a user account.
    pub fn remove_user(&self, username: &str) -> std::result::Result<(), AuthError> {
        self.inner.auth.remove(username)
    }

    /// Changes a user's password after verifying the old one.
    pub fn change_password(
        &self,
        username: &str,
        old: &str,
        new: &str,
    ) -> std::result::Result<(), AuthError> {
        self.inner.auth.change(username, old, new)
    }

    /// Lists users with their non-secret metadata.
    pub fn list_users(&self) -> std::collections::BTreeMap<String, UserSummary> {
        self.inner.auth.list()
    }

    /// Returns up to `limit` most recent event-log entries, oldest first.
    pub fn recent_events(&self, limit: usize) -> Vec<EventLogEntry> {
        self.inner.events.recent(limit)
    }

    /// Direct access to the auth store, for embedders wiring their own
    /// management channel.
    pub fn auth_store(&self) -> &AuthStore {
        &self.inner.auth
    }

    /// The display this server samples and injects into.
    pub fn display(&self) -> &Arc<Display> {
        &self.inner.display
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => handle_accept(&inner, stream, peer),
            Err(e) => {
                if !inner.running.load(Ordering::SeqCst) {
                    break;
                }
                warn!("Accept failed: {e}");
            }
        }
    }
}

fn handle_accept(inner: &Arc<ServerInner>, stream: TcpStream, peer: SocketAddr) {
    let mut table = inner
        .connections
        .lock()
        .expect("connection table lock poisoned");

    if table.len() >= inner.config.max_connections {
        // Close without writing a single byte.
        drop(stream);
        warn!("Rejecting {peer}: connection limit {} reached", inner.config.max_connections);
        inner.events.record(
            EventKind::ClientDisconnect,
            Some(peer),
            HashMap::from([("reason".to_string(), "max-connections".to_string())]),
        );
        return;
    }

    let Some(frames) = inner
        .engine
        .lock()
        .expect("engine lock poisoned")
        .as_ref()
        .map(FramebufferEngine::subscribe)
    else {
        // Stopped between accept and here.
        drop(stream);
        return;
    };

    info!("Client connected: {peer}");
    let info = ConnectionInfo::new(peer);
    let ctx = ConnectionContext {
        desktop_name: inner.config.desktop_name.clone(),
        auth_required: inner.config.auth_required,
        auth: inner.auth.clone(),
        display: inner.display.clone(),
        frames,
        events: inner.events.clone(),
    };

    let conn_task = tokio::spawn(client::run_connection(stream, info.clone(), ctx));
    let abort = conn_task.abort_handle();

    // The wrapper confines panics to this connection and owns cleanup.
    let wrapper_inner = inner.clone();
    tokio::spawn(async move {
        match conn_task.await {
            Ok(Ok(())) => info!("Client disconnected: {peer}"),
            Ok(Err(e)) => warn!("Client {peer} closed: {e}"),
            Err(e) if e.is_cancelled() => {}
            Err(e) => error!("Connection task for {peer} panicked: {e}"),
        }
        finish_connection(&wrapper_inner, peer);
    });

    table.insert(peer, ClientHandle { info, abort });
    inner
        .events
        .record(EventKind::ClientConnect, Some(peer), HashMap::new());
}

/// Removes a finished connection from the table, unless a kick or stop
/// already did (those log their own event kind).
fn finish_connection(inner: &Arc<ServerInner>, peer: SocketAddr) {
    let removed = inner
        .connections
        .lock()
        .expect("connection table lock poisoned")
        .remove(&peer);
    if let Some(handle) = removed {
        handle.info.set_state(ConnState::Closed);
        inner
            .events
            .record(EventKind::ClientDisconnect, Some(peer), HashMap::new());
    }
}
