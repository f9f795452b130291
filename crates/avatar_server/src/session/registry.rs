//! Session registry: admission, lookup, removal and subscription edges.

use super::{OutboundSender, Session, SessionLinks};
use crate::config::DuplicatePolicy;
use crate::error::SessionError;
use crate::types::{AvatarVersion, PlayerIdentity, SessionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Result of admitting a session.
#[derive(Debug)]
pub struct Admission {
    pub session: Arc<Session>,
    /// Previous session of the same identity, displaced under
    /// [`DuplicatePolicy::EvictOld`]. The caller closes and removes it.
    pub evicted: Option<Arc<Session>>,
}

/// Which directions a `link` call newly created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkOutcome {
    pub a_views_b: bool,
    pub b_views_a: bool,
}

/// Tracks every active session, indexed by id and by identity.
///
/// Lookups are lock-free reads on sharded maps and never wait on session locks.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    identities: DashMap<PlayerIdentity, SessionId>,
    next_id: AtomicU64,
    policy: DuplicatePolicy,
}

impl SessionRegistry {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            sessions: DashMap::new(),
            identities: DashMap::new(),
            next_id: AtomicU64::new(1),
            policy,
        }
    }

    /// Admits an authenticated identity.
    ///
    /// # Arguments
    ///
    /// * `identity` - Verified identity from the authentication plugin
    /// * `version` - Avatar version the identity has equipped, if any
    /// * `outbound` - Sender half of the connection's outbound queue
    ///
    /// # Returns
    ///
    /// The admitted session plus any session it displaced, or
    /// `DuplicateSession` when the policy rejects newcomers.
    pub fn admit(
        &self,
        identity: PlayerIdentity,
        version: Option<AvatarVersion>,
        outbound: OutboundSender,
    ) -> Result<Admission, SessionError> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(Session::new(id, identity.clone(), version, outbound));

        // Published by id first so the identity index never points at a
        // session that cannot be looked up.
        self.sessions.insert(id, Arc::clone(&session));

        let evicted = match self.identities.entry(identity.clone()) {
            Entry::Occupied(mut existing) => match self.policy {
                DuplicatePolicy::RejectNew => {
                    drop(existing);
                    self.sessions.remove(&id);
                    return Err(SessionError::DuplicateSession(identity));
                }
                DuplicatePolicy::EvictOld => {
                    let previous = existing.insert(id);
                    self.sessions.get(&previous).map(|s| Arc::clone(s.value()))
                }
            },
            Entry::Vacant(slot) => {
                slot.insert(id);
                None
            }
        };

        if let Some(old) = &evicted {
            info!("🔁 {} replaces session {} of {}", id, old.id(), identity);
        }

        Ok(Admission { session, evicted })
    }

    /// Removes a session. See [`Self::remove_with`].
    pub async fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.remove_with(id, |_, _, _| {}).await
    }

    /// Removes a session, releasing its outbound handle and tearing down
    /// every edge that touches it.
    ///
    /// `on_viewer` runs for each former viewer while that viewer's lock is
    /// held, so a discard queued there is ordered after any delivery of the
    /// removed session's avatar.
    ///
    /// Idempotent: removing an unknown or already removed id returns `None`.
    pub async fn remove_with<F>(&self, id: SessionId, mut on_viewer: F) -> Option<Arc<Session>>
    where
        F: FnMut(&Session, &mut SessionLinks, &Session),
    {
        let (_, session) = self.sessions.remove(&id)?;
        self.identities
            .remove_if(session.identity(), |_, current| *current == id);

        let (viewers, watching) = session.lock().await.release();

        // One peer lock at a time. Any concurrent link sees the released
        // session and backs off.
        let peers: HashSet<SessionId> = viewers.union(&watching).copied().collect();
        for peer_id in peers {
            let Some(peer) = self.lookup(peer_id) else {
                continue;
            };
            let mut links = peer.lock().await;
            links.viewers.remove(&id);
            links.delivered.remove(&id);
            if links.watching.remove(&id) {
                on_viewer(&peer, &mut *links, &session);
            }
        }

        debug!("Session {} removed from registry", id);
        Some(session)
    }

    pub fn lookup(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| Arc::clone(s.value()))
    }

    pub fn lookup_identity(&self, identity: &PlayerIdentity) -> Option<Arc<Session>> {
        let id = *self.identities.get(identity)?.value();
        self.lookup(id)
    }

    /// Creates the symmetric edges `a → b` and `b → a`.
    ///
    /// Returns `None` if either session is gone or `a == b`.
    pub async fn link(&self, a: SessionId, b: SessionId) -> Option<LinkOutcome> {
        if a == b {
            return None;
        }
        let (sa, sb) = (self.lookup(a)?, self.lookup(b)?);

        let (first, second) = if a < b { (&sa, &sb) } else { (&sb, &sa) };
        let mut first_links = first.lock().await;
        let mut second_links = second.lock().await;
        if first_links.is_released() || second_links.is_released() {
            return None;
        }

        let (la, lb) = if a < b {
            (&mut *first_links, &mut *second_links)
        } else {
            (&mut *second_links, &mut *first_links)
        };

        let a_views_b = la.watching.insert(b);
        lb.viewers.insert(a);
        let b_views_a = lb.watching.insert(a);
        la.viewers.insert(b);

        Some(LinkOutcome {
            a_views_b,
            b_views_a,
        })
    }

    /// Removes both edges between `a` and `b`.
    ///
    /// `on_unlinked(viewer, viewer_links, target)` runs under both locks for
    /// each direction that existed. Returns the number of edges removed.
    pub async fn unlink<F>(&self, a: SessionId, b: SessionId, mut on_unlinked: F) -> usize
    where
        F: FnMut(&Session, &mut SessionLinks, &Session),
    {
        if a == b {
            return 0;
        }
        let (Some(sa), Some(sb)) = (self.lookup(a), self.lookup(b)) else {
            return 0;
        };

        let (first, second) = if a < b { (&sa, &sb) } else { (&sb, &sa) };
        let mut first_links = first.lock().await;
        let mut second_links = second.lock().await;

        let (la, lb) = if a < b {
            (&mut *first_links, &mut *second_links)
        } else {
            (&mut *second_links, &mut *first_links)
        };

        let mut removed = 0;
        if la.watching.remove(&b) {
            lb.viewers.remove(&a);
            la.delivered.remove(&b);
            on_unlinked(&sa, &mut *la, &sb);
            removed += 1;
        }
        if lb.watching.remove(&a) {
            la.viewers.remove(&b);
            lb.delivered.remove(&a);
            on_unlinked(&sb, &mut *lb, &sa);
            removed += 1;
        }
        removed
    }

    /// Snapshot of every directed edge as `(viewer, target)`.
    pub async fn edges(&self) -> HashSet<(SessionId, SessionId)> {
        let mut edges = HashSet::new();
        for session in self.sessions() {
            let links = session.lock().await;
            edges.extend(links.watching.iter().map(|target| (session.id(), *target)));
        }
        edges
    }

    /// Current viewers of `id`.
    pub async fn viewers_of(&self, id: SessionId) -> Vec<SessionId> {
        match self.lookup(id) {
            Some(session) => session.lock().await.viewers.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Snapshot of every registered session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|s| Arc::clone(s.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::OutboundReceiver;
    use tokio::sync::mpsc;

    fn admit(registry: &SessionRegistry, name: &str) -> (Arc<Session>, OutboundReceiver) {
        let (tx, rx) = mpsc::channel(16);
        let admission = registry.admit(name.into(), None, tx).unwrap();
        (admission.session, rx)
    }

    #[tokio::test]
    async fn reject_new_policy_keeps_first_session() {
        let registry = SessionRegistry::new(DuplicatePolicy::RejectNew);
        let (alice, _rx) = admit(&registry, "alice");

        let (tx, _rx2) = mpsc::channel(1);
        let err = registry.admit("alice".into(), None, tx).unwrap_err();
        assert_eq!(err, SessionError::DuplicateSession("alice".into()));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.lookup_identity(&"alice".into()).map(|s| s.id()),
            Some(alice.id())
        );
    }

    #[tokio::test]
    async fn evict_old_policy_hands_back_previous_session() {
        let registry = SessionRegistry::new(DuplicatePolicy::EvictOld);
        let (old, _rx) = admit(&registry, "alice");

        let (tx, _rx2) = mpsc::channel(1);
        let admission = registry.admit("alice".into(), None, tx).unwrap();
        assert_eq!(admission.evicted.map(|s| s.id()), Some(old.id()));
        assert_ne!(admission.session.id(), old.id());

        // Removing the displaced session leaves the new identity mapping alone.
        registry.remove(old.id()).await;
        assert_eq!(
            registry.lookup_identity(&"alice".into()).map(|s| s.id()),
            Some(admission.session.id())
        );
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_clears_edges() {
        let registry = SessionRegistry::new(DuplicatePolicy::EvictOld);
        let (alice, _ra) = admit(&registry, "alice");
        let (bob, _rb) = admit(&registry, "bob");
        let (carol, _rc) = admit(&registry, "carol");

        registry.link(alice.id(), bob.id()).await.unwrap();
        registry.link(carol.id(), alice.id()).await.unwrap();
        registry.link(bob.id(), carol.id()).await.unwrap();

        let mut discards = Vec::new();
        let removed = registry
            .remove_with(alice.id(), |viewer, _, target| {
                discards.push((viewer.id(), target.id()))
            })
            .await;
        assert!(removed.is_some());
        discards.sort();
        assert_eq!(discards, vec![(bob.id(), alice.id()), (carol.id(), alice.id())]);

        let edges = registry.edges().await;
        assert!(edges.iter().all(|(v, t)| *v != alice.id() && *t != alice.id()));
        assert_eq!(edges.len(), 2);

        assert!(registry.remove(alice.id()).await.is_none());
        assert!(registry.lookup(alice.id()).is_none());
        assert!(registry.lookup_identity(&"alice".into()).is_none());
        assert!(alice.lock().await.is_released());
    }

    #[tokio::test]
    async fn link_reports_new_directions_and_refuses_self_edges() {
        let registry = SessionRegistry::new(DuplicatePolicy::EvictOld);
        let (alice, _ra) = admit(&registry, "alice");
        let (bob, _rb) = admit(&registry, "bob");

        assert_eq!(registry.link(alice.id(), alice.id()).await, None);
        assert_eq!(
            registry.link(bob.id(), alice.id()).await,
            Some(LinkOutcome {
                a_views_b: true,
                b_views_a: true
            })
        );
        assert_eq!(
            registry.link(alice.id(), bob.id()).await,
            Some(LinkOutcome {
                a_views_b: false,
                b_views_a: false
            })
        );
        assert_eq!(registry.viewers_of(alice.id()).await, vec![bob.id()]);

        let mut unlinked = 0;
        assert_eq!(registry.unlink(alice.id(), bob.id(), |_, _, _| unlinked += 1).await, 2);
        assert_eq!(unlinked, 2);
        assert_eq!(registry.unlink(alice.id(), bob.id(), |_, _, _| {}).await, 0);
        assert!(registry.edges().await.is_empty());
    }

    #[tokio::test]
    async fn link_with_removed_session_is_refused() {
        let registry = SessionRegistry::new(DuplicatePolicy::EvictOld);
        let (alice, _ra) = admit(&registry, "alice");
        let (bob, _rb) = admit(&registry, "bob");

        registry.remove(bob.id()).await;
        assert_eq!(registry.link(alice.id(), bob.id()).await, None);
        assert!(registry.edges().await.is_empty());
    }
}
