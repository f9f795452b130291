//! Server-side session records and the registry that owns them.
//!
//! A session's subscription edges and acknowledged avatar version are only
//! mutated while holding that session's [`SessionLinks`] lock. Operations
//! that touch two sessions take both locks in [`SessionId`] order.

mod lifecycle;
mod registry;

pub use lifecycle::{CloseReason, ConnectionState, Lifecycle};
pub use registry::{Admission, LinkOutcome, SessionRegistry};

use crate::cache::AvatarLease;
use crate::protocol::ServerMessage;
use crate::types::{current_timestamp, AvatarVersion, PlayerIdentity, SessionId};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};

/// Item on a connection's outbound queue. The writer task turns each item
/// into one or more WebSocket frames.
#[derive(Debug)]
pub enum Outbound {
    Message(ServerMessage),
    /// An avatar to stream as chunk frames followed by a completion frame.
    Avatar(AvatarLease),
}

pub type OutboundSender = mpsc::Sender<Outbound>;
pub type OutboundReceiver = mpsc::Receiver<Outbound>;

/// Why an item could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    Full,
    Closed,
}

/// Subscription edges and outbound handle of one session, guarded by the
/// session's lock.
#[derive(Debug)]
pub struct SessionLinks {
    /// Sessions subscribed to this session's avatar.
    pub viewers: HashSet<SessionId>,
    /// Sessions whose avatar this session receives.
    pub watching: HashSet<SessionId>,
    /// Last version queued to this session, per watched target.
    pub delivered: HashMap<SessionId, AvatarVersion>,
    outbound: Option<OutboundSender>,
}

impl SessionLinks {
    fn new(outbound: OutboundSender) -> Self {
        Self {
            viewers: HashSet::new(),
            watching: HashSet::new(),
            delivered: HashMap::new(),
            outbound: Some(outbound),
        }
    }

    /// True once the session has been removed from the registry.
    pub fn is_released(&self) -> bool {
        self.outbound.is_none()
    }

    /// Queues an item without waiting.
    pub fn push(&self, item: Outbound) -> Result<(), PushError> {
        let Some(outbound) = &self.outbound else {
            return Err(PushError::Closed);
        };
        outbound.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => PushError::Full,
            TrySendError::Closed(_) => PushError::Closed,
        })
    }

    /// Drops the outbound sender and every edge, returning the peers that
    /// were linked. No item can be queued afterwards.
    fn release(&mut self) -> (HashSet<SessionId>, HashSet<SessionId>) {
        self.outbound = None;
        self.delivered.clear();
        (
            std::mem::take(&mut self.viewers),
            std::mem::take(&mut self.watching),
        )
    }
}

/// Record of one connected, authenticated client.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    identity: PlayerIdentity,
    connected_at: u64,
    /// Acknowledged avatar version; written only under `links`.
    version: watch::Sender<Option<AvatarVersion>>,
    links: Mutex<SessionLinks>,
    closed: watch::Sender<Option<CloseReason>>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        identity: PlayerIdentity,
        version: Option<AvatarVersion>,
        outbound: OutboundSender,
    ) -> Self {
        let (closed, _) = watch::channel(None);
        Self {
            id,
            identity,
            connected_at: current_timestamp(),
            version: watch::channel(version).0,
            links: Mutex::new(SessionLinks::new(outbound)),
            closed,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn identity(&self) -> &PlayerIdentity {
        &self.identity
    }

    pub fn connected_at(&self) -> u64 {
        self.connected_at
    }

    /// Currently acknowledged avatar version; `None` means nothing equipped.
    pub fn version(&self) -> Option<AvatarVersion> {
        *self.version.borrow()
    }

    /// Updates the acknowledged version. Callers hold the links lock, which
    /// the guard parameter enforces.
    pub fn set_version(&self, _links: &mut SessionLinks, version: Option<AvatarVersion>) {
        self.version.send_replace(version);
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionLinks> {
        self.links.lock().await
    }

    /// Records the close reason. Only the first reason sticks.
    ///
    /// Returns true if this call started the close.
    pub fn begin_close(&self, reason: CloseReason) -> bool {
        self.closed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed.borrow().clone()
    }

    pub fn is_closing(&self) -> bool {
        self.closed.borrow().is_some()
    }

    /// Resolves once a close has begun.
    pub async fn closed(&self) {
        close_requested(&mut self.closed.subscribe()).await
    }

    /// Watch handle for the writer task.
    pub fn subscribe_close(&self) -> watch::Receiver<Option<CloseReason>> {
        self.closed.subscribe()
    }
}

/// Resolves once a close reason is set, or the session itself is gone.
pub async fn close_requested(closed: &mut watch::Receiver<Option<CloseReason>>) {
    while closed.borrow_and_update().is_none() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}
