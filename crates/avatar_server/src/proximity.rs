//! # Proximity Router
//!
//! Turns game-world enter/leave events into symmetric subscription edges.
//! An `Enter` triggers first delivery in each newly created direction, a
//! `Leave` removes both edges and has both clients discard the other's avatar.
//!
//! Events naming an identity without an active session are expected (the
//! player has not connected yet or already left) and dropped quietly.

use crate::distribution::{DeliveryOutcome, DistributionEngine};
use crate::error::DeliveryError;
use crate::session::SessionRegistry;
use crate::types::{PlayerIdentity, SessionId};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Transient visibility change reported by the game world.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProximityEvent {
    Enter(PlayerIdentity, PlayerIdentity),
    Leave(PlayerIdentity, PlayerIdentity),
}

pub type DeliveryTask = JoinHandle<Result<DeliveryOutcome, DeliveryError>>;

/// What applying one event did.
#[derive(Debug)]
pub enum RouteOutcome {
    /// Edges were created; one spawned delivery per new direction.
    Linked(Vec<DeliveryTask>),
    /// Number of edges removed.
    Unlinked(usize),
    /// The event referenced an inactive identity or a player and themself.
    Ignored,
}

pub struct ProximityRouter {
    registry: Arc<SessionRegistry>,
    engine: Arc<DistributionEngine>,
}

impl ProximityRouter {
    pub fn new(registry: Arc<SessionRegistry>, engine: Arc<DistributionEngine>) -> Self {
        Self { registry, engine }
    }

    /// Consumes events until the stream ends. The stream starts at "now";
    /// events missed while the router was not running are not replayed.
    pub async fn run<S>(&self, events: S)
    where
        S: Stream<Item = ProximityEvent>,
    {
        futures::pin_mut!(events);
        info!("🧭 Proximity router started");
        while let Some(event) = events.next().await {
            self.apply(event).await;
        }
        info!("🧭 Proximity router stopped: event stream ended");
    }

    /// Applies a single event.
    pub async fn apply(&self, event: ProximityEvent) -> RouteOutcome {
        trace!("Proximity event {:?}", event);
        match event {
            ProximityEvent::Enter(a, b) => self.enter(&a, &b).await,
            ProximityEvent::Leave(a, b) => self.leave(&a, &b).await,
        }
    }

    fn resolve(
        &self,
        a: &PlayerIdentity,
        b: &PlayerIdentity,
    ) -> Option<(SessionId, SessionId)> {
        if a == b {
            return None;
        }
        let Some(sa) = self.registry.lookup_identity(a) else {
            debug!("Dropping proximity event: {} has no active session", a);
            return None;
        };
        let Some(sb) = self.registry.lookup_identity(b) else {
            debug!("Dropping proximity event: {} has no active session", b);
            return None;
        };
        Some((sa.id(), sb.id()))
    }

    async fn enter(&self, a: &PlayerIdentity, b: &PlayerIdentity) -> RouteOutcome {
        let Some((sa, sb)) = self.resolve(a, b) else {
            return RouteOutcome::Ignored;
        };
        let Some(outcome) = self.registry.link(sa, sb).await else {
            return RouteOutcome::Ignored;
        };

        let mut deliveries = Vec::with_capacity(2);
        if outcome.a_views_b {
            deliveries.push(self.spawn_delivery(sa, sb));
        }
        if outcome.b_views_a {
            deliveries.push(self.spawn_delivery(sb, sa));
        }
        if !deliveries.is_empty() {
            debug!("👀 {} and {} can now see each other", a, b);
        }
        RouteOutcome::Linked(deliveries)
    }

    async fn leave(&self, a: &PlayerIdentity, b: &PlayerIdentity) -> RouteOutcome {
        let Some((sa, sb)) = self.resolve(a, b) else {
            return RouteOutcome::Ignored;
        };
        let engine = &self.engine;
        let removed = self
            .registry
            .unlink(sa, sb, |viewer, links, target| {
                engine.enqueue_discard(viewer, links, target)
            })
            .await;
        if removed > 0 {
            debug!("🙈 {} and {} are out of range", a, b);
        }
        RouteOutcome::Unlinked(removed)
    }

    fn spawn_delivery(&self, viewer: SessionId, target: SessionId) -> DeliveryTask {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move { engine.deliver(viewer, target).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::AvatarCache;
    use crate::config::{CacheConfig, DistributionConfig, DuplicatePolicy};
    use crate::plugins::storage::MemoryStore;
    use crate::stats::ServerStats;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    fn router() -> (ProximityRouter, Arc<SessionRegistry>) {
        let registry = Arc::new(SessionRegistry::new(DuplicatePolicy::EvictOld));
        let cache = AvatarCache::new(Arc::new(MemoryStore::new()), &CacheConfig::default());
        let (health, _) = mpsc::unbounded_channel();
        let engine = Arc::new(DistributionEngine::new(
            registry.clone(),
            cache,
            DistributionConfig::default(),
            health,
            Arc::new(ServerStats::new()),
        ));
        (ProximityRouter::new(registry.clone(), engine), registry)
    }

    fn enter(a: &str, b: &str) -> ProximityEvent {
        ProximityEvent::Enter(a.into(), b.into())
    }

    fn leave(a: &str, b: &str) -> ProximityEvent {
        ProximityEvent::Leave(a.into(), b.into())
    }

    #[tokio::test]
    async fn edge_set_follows_event_order() {
        let (router, registry) = router();
        let mut receivers = Vec::new();
        let mut ids = std::collections::HashMap::new();
        for name in ["a", "b", "c"] {
            let (tx, rx) = mpsc::channel(64);
            let session = registry.admit(name.into(), None, tx).unwrap().session;
            ids.insert(name, session.id());
            receivers.push(rx);
        }

        let events = [
            enter("a", "b"),
            enter("b", "c"),
            leave("a", "b"),
            enter("a", "b"),
            enter("a", "b"),
            leave("c", "b"),
            enter("c", "a"),
            leave("a", "c"),
            leave("a", "c"),
        ];

        // Reference model: apply enter/leave to a set of unordered pairs.
        let mut expected_pairs: HashSet<(&str, &str)> = HashSet::new();
        for event in &events {
            let (a, b, add) = match event {
                ProximityEvent::Enter(a, b) => (a.as_str(), b.as_str(), true),
                ProximityEvent::Leave(a, b) => (a.as_str(), b.as_str(), false),
            };
            let key = if a < b { (a, b) } else { (b, a) };
            if add {
                expected_pairs.insert(key);
            } else {
                expected_pairs.remove(&key);
            }
        }
        let expected: HashSet<_> = expected_pairs
            .iter()
            .flat_map(|(a, b)| [(ids[a], ids[b]), (ids[b], ids[a])])
            .collect();

        router.run(futures::stream::iter(events)).await;
        assert_eq!(registry.edges().await, expected);
    }

    #[tokio::test]
    async fn unknown_identities_and_self_pairs_are_ignored() {
        let (router, registry) = router();
        let (tx, _rx) = mpsc::channel(8);
        registry.admit("alice".into(), None, tx).unwrap();

        assert!(matches!(
            router.apply(enter("alice", "nobody")).await,
            RouteOutcome::Ignored
        ));
        assert!(matches!(
            router.apply(enter("alice", "alice")).await,
            RouteOutcome::Ignored
        ));
        assert!(matches!(
            router.apply(leave("nobody", "alice")).await,
            RouteOutcome::Ignored
        ));
        assert!(registry.edges().await.is_empty());
    }

    #[tokio::test]
    async fn repeated_enter_spawns_no_new_deliveries() {
        let (router, registry) = router();
        for name in ["alice", "bob"] {
            let (tx, _rx) = mpsc::channel(8);
            registry.admit(name.into(), None, tx).unwrap();
        }

        match router.apply(enter("alice", "bob")).await {
            RouteOutcome::Linked(deliveries) => {
                assert_eq!(deliveries.len(), 2);
                for delivery in deliveries {
                    assert_eq!(
                        delivery.await.unwrap(),
                        Ok(DeliveryOutcome::NothingEquipped)
                    );
                }
            }
            other => panic!("expected link, got {other:?}"),
        }
        assert!(matches!(
            router.apply(enter("bob", "alice")).await,
            RouteOutcome::Linked(deliveries) if deliveries.is_empty()
        ));
    }
}
