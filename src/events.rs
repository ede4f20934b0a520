//! Bounded server event log exposed through the admin surface.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::SystemTime;

/// Maximum number of retained entries; older entries are dropped.
const EVENT_LOG_CAPACITY: usize = 1000;

/// Kinds of events recorded by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The server started listening.
    ServerStart,
    /// The server stopped.
    ServerStop,
    /// A client connection was accepted.
    ClientConnect,
    /// A client connection ended.
    ClientDisconnect,
    /// A client connection was terminated by the admin surface.
    ClientForcedDisconnect,
    /// A client failed authentication.
    AuthFailure,
}

/// One recorded server event.
#[derive(Debug, Clone)]
pub struct EventLogEntry {
    /// When the event happened.
    pub timestamp: SystemTime,
    /// What happened.
    pub kind: EventKind,
    /// Remote address, where one applies.
    pub address: Option<SocketAddr>,
    /// Free-form detail fields (e.g. a rejection reason).
    pub detail: HashMap<String, String>,
}

/// Thread-safe, bounded log of recent server events.
#[derive(Debug, Default)]
pub struct EventLog {
    entries: Mutex<VecDeque<EventLogEntry>>,
}

impl EventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry, dropping the oldest once the capacity is reached.
    pub fn record(
        &self,
        kind: EventKind,
        address: Option<SocketAddr>,
        detail: HashMap<String, String>,
    ) {
        let mut entries = self.entries.lock().expect("event log lock poisoned");
        if entries.len() == EVENT_LOG_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(EventLogEntry {
            timestamp: SystemTime::now(),
            kind,
            address,
            detail,
        });
    }

    /// Returns up to `limit` most recent entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<EventLogEntry> {
        let entries = self.entries.lock().expect("event log lock poisoned");
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }
}
