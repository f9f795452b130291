//! Server counters reported by the application's monitoring loop.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lock-free counters shared by the session core and connection tasks.
#[derive(Debug)]
pub struct ServerStats {
    started: Instant,
    connections_accepted: AtomicU64,
    connections_refused: AtomicU64,
    sessions_admitted: AtomicU64,
    sessions_closed: AtomicU64,
    auth_rejections: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
    dropped_messages: AtomicU64,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    pings_relayed: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub connections_accepted: u64,
    pub connections_refused: u64,
    pub sessions_admitted: u64,
    pub sessions_closed: u64,
    pub auth_rejections: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
    pub dropped_messages: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub pings_relayed: u64,
}

macro_rules! counter {
    ($($record:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $record(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            connections_accepted: AtomicU64::new(0),
            connections_refused: AtomicU64::new(0),
            sessions_admitted: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            auth_rejections: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            pings_relayed: AtomicU64::new(0),
        }
    }

    counter! {
        record_connection_accepted => connections_accepted,
        record_connection_refused => connections_refused,
        record_session_admitted => sessions_admitted,
        record_session_closed => sessions_closed,
        record_auth_rejection => auth_rejections,
        record_delivery => deliveries,
        record_delivery_failure => delivery_failures,
        record_dropped_message => dropped_messages,
        record_ping_relayed => pings_relayed,
    }

    /// Counts one WebSocket frame written to a client.
    pub fn record_frame_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Sessions admitted and not yet closed.
    pub fn active_sessions(&self) -> u64 {
        let admitted = self.sessions_admitted.load(Ordering::Relaxed);
        admitted.saturating_sub(self.sessions_closed.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_refused: self.connections_refused.load(Ordering::Relaxed),
            sessions_admitted: self.sessions_admitted.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            auth_rejections: self.auth_rejections.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            pings_relayed: self.pings_relayed.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}
