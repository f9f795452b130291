//! # Distribution Engine
//!
//! Delivers avatar payloads to viewers and keeps them current.
//!
//! Every push goes onto the viewer's bounded outbound queue without waiting,
//! so a slow or broken connection only ever affects itself. Queue failures
//! are reported to the session core as [`HealthSignal`]s.
//!
//! Deliveries are re-validated under the viewer's lock right before the
//! push: the edge must still exist, the target's version must still be the
//! one that was fetched, and the avatar must not have been invalidated.
//! Discards are queued under the same lock, so a discard is never overtaken
//! by a stale delivery.
//!
//! A delivery that fails because the avatar store is unavailable is retried
//! in the background with exponential backoff until it lands, the retry
//! budget runs out, or either session closes.

mod frames;

pub use frames::avatar_frames;

use crate::cache::AvatarCache;
use crate::config::{DistributionConfig, OverflowPolicy};
use crate::error::{AvatarError, DeliveryError, SessionError};
use crate::protocol::ServerMessage;
use crate::session::{Outbound, PushError, Session, SessionLinks, SessionRegistry};
use crate::stats::ServerStats;
use crate::types::{AvatarKey, AvatarVersion, PlayerIdentity, SessionId};
use bytes::Bytes;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Upper bound for the backoff between re-delivery attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Per-connection health report, consumed by the session core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthSignal {
    /// The outbound queue overflowed under [`OverflowPolicy::Disconnect`].
    SlowConsumer(SessionId),
    /// The connection's writer is gone while the session is still registered.
    SendFailed { session: SessionId, reason: String },
}

/// What a delivery attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The avatar was queued for the viewer.
    Queued { version: AvatarVersion, size: usize },
    /// The target changed version while the payload was being fetched; the
    /// newer delivery takes over.
    Superseded,
    /// The edge disappeared while the payload was being fetched.
    Unsubscribed,
    /// The viewer already has this version queued or delivered.
    AlreadyDelivered,
    /// The target has no avatar equipped.
    NothingEquipped,
}

pub struct DistributionEngine {
    registry: Arc<SessionRegistry>,
    cache: AvatarCache,
    config: DistributionConfig,
    health: mpsc::UnboundedSender<HealthSignal>,
    stats: Arc<ServerStats>,
}

impl DistributionEngine {
    pub fn new(
        registry: Arc<SessionRegistry>,
        cache: AvatarCache,
        config: DistributionConfig,
        health: mpsc::UnboundedSender<HealthSignal>,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            registry,
            cache,
            config,
            health,
            stats,
        }
    }

    pub fn cache(&self) -> &AvatarCache {
        &self.cache
    }

    pub fn config(&self) -> &DistributionConfig {
        &self.config
    }

    /// Delivers `target`'s current avatar to `viewer`.
    ///
    /// # Arguments
    ///
    /// * `viewer` - Session that should receive the avatar
    /// * `target` - Session whose avatar is delivered
    ///
    /// # Returns
    ///
    /// The delivery outcome, or an error confined to this viewer. The fetch
    /// is abandoned with `Cancelled` as soon as either session starts closing.
    /// A `StorageUnavailable` failure is returned as is and also schedules a
    /// background retry.
    pub async fn deliver(
        self: &Arc<Self>,
        viewer: SessionId,
        target: SessionId,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let result = self.attempt(viewer, target).await;
        if is_transient(&result) {
            self.spawn_retry(viewer, target);
        }
        result
    }

    /// Re-runs a delivery that hit a storage outage. Each attempt goes
    /// through the same checks as the first, so a retry that races a leave,
    /// a version change or a successful delivery is harmless.
    fn spawn_retry(self: &Arc<Self>, viewer: SessionId, target: SessionId) {
        let attempts = self.config.retry_attempts;
        if attempts == 0 {
            return;
        }
        let engine = Arc::clone(self);
        let mut delay = self.config.retry_base_delay();

        tokio::spawn(async move {
            for attempt in 1..=attempts {
                let (Some(v), Some(t)) =
                    (engine.registry.lookup(viewer), engine.registry.lookup(target))
                else {
                    return;
                };
                tokio::select! {
                    biased;
                    _ = v.closed() => return,
                    _ = t.closed() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                drop((v, t));

                let result = engine.attempt(viewer, target).await;
                if !is_transient(&result) {
                    if let Ok(outcome) = result {
                        info!(
                            "🔁 Delivery to {} of {}'s avatar recovered on attempt {}: {:?}",
                            viewer, target, attempt, outcome
                        );
                    }
                    return;
                }
                delay = (delay * 2).min(MAX_RETRY_DELAY);
            }
            warn!(
                "❌ Giving up delivering {}'s avatar to {} after {} retries",
                target, viewer, attempts
            );
        });
    }

    async fn attempt(
        &self,
        viewer: SessionId,
        target: SessionId,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let (Some(viewer), Some(target)) = (self.registry.lookup(viewer), self.registry.lookup(target))
        else {
            return Err(DeliveryError::Cancelled);
        };
        let Some(version) = target.version() else {
            return Ok(DeliveryOutcome::NothingEquipped);
        };

        let lease = tokio::select! {
            biased;
            _ = viewer.closed() => return Err(DeliveryError::Cancelled),
            _ = target.closed() => return Err(DeliveryError::Cancelled),
            lease = self.cache.get(target.identity(), version) => lease,
        };
        let lease = match lease {
            Ok(lease) => lease,
            Err(e) => {
                self.stats.record_delivery_failure();
                match &e {
                    AvatarError::NotFound(key) => {
                        debug!("Avatar {} unavailable for {}", key, viewer.id())
                    }
                    AvatarError::StorageUnavailable(reason) => warn!(
                        "⚠️ Could not deliver {}@{} to {}: {}",
                        target.identity(),
                        version,
                        viewer.id(),
                        reason
                    ),
                }
                return Err(e.into());
            }
        };

        let mut links = viewer.lock().await;
        if links.is_released() {
            return Err(DeliveryError::Cancelled);
        }
        if !links.watching.contains(&target.id()) {
            return Ok(DeliveryOutcome::Unsubscribed);
        }
        if target.version() != Some(version) {
            return Ok(DeliveryOutcome::Superseded);
        }
        if self.cache.is_invalidated(target.identity(), version) {
            self.stats.record_delivery_failure();
            return Err(AvatarError::NotFound(AvatarKey::new(target.identity().clone(), version)).into());
        }
        if links.delivered.get(&target.id()) == Some(&version) {
            return Ok(DeliveryOutcome::AlreadyDelivered);
        }

        let size = lease.size();
        self.queue(&viewer, &links, Outbound::Avatar(lease))?;
        links.delivered.insert(target.id(), version);
        self.stats.record_delivery();
        trace!(
            "📤 Queued {}@{} ({} bytes) for {}",
            target.identity(),
            version,
            size,
            viewer.id()
        );
        Ok(DeliveryOutcome::Queued { version, size })
    }

    /// Acknowledges a new version for `target` and re-delivers it to every
    /// current viewer concurrently. Each viewer's result is independent.
    pub async fn on_version_change(
        self: &Arc<Self>,
        target: SessionId,
        version: AvatarVersion,
    ) -> Vec<(SessionId, Result<DeliveryOutcome, DeliveryError>)> {
        let Some(session) = self.registry.lookup(target) else {
            return Vec::new();
        };

        let viewers: Vec<SessionId> = {
            let mut links = session.lock().await;
            if links.is_released() {
                return Vec::new();
            }
            session.set_version(&mut links, Some(version));
            links.viewers.iter().copied().collect()
        };

        debug!(
            "🔄 {} moved to {}, refreshing {} viewer(s)",
            session.identity(),
            version,
            viewers.len()
        );

        join_all(viewers.into_iter().map(|viewer| async move {
            (viewer, self.deliver(viewer, target).await)
        }))
        .await
    }

    /// Invalidates a removed avatar and tells every viewer that holds it to
    /// drop it. Returns the number of discards queued.
    pub async fn on_invalidate(&self, owner: &PlayerIdentity, version: AvatarVersion) -> usize {
        self.cache.invalidate(owner, version);

        let Some(target) = self.registry.lookup_identity(owner) else {
            return 0;
        };
        let was_current = target.version() == Some(version);
        let viewers = self.registry.viewers_of(target.id()).await;

        let mut discarded = 0;
        for viewer_id in viewers {
            let Some(viewer) = self.registry.lookup(viewer_id) else {
                continue;
            };
            let mut links = viewer.lock().await;
            if !links.watching.contains(&target.id()) {
                continue;
            }
            let holds_version = links.delivered.get(&target.id()) == Some(&version);
            if was_current || holds_version {
                links.delivered.remove(&target.id());
                if self.discard(&viewer, &links, owner).is_ok() {
                    discarded += 1;
                }
            }
        }

        debug!(
            "🗑️ Avatar {}@{} removed, {} viewer(s) told to discard",
            owner, version, discarded
        );
        discarded
    }

    /// Queues a discard of `owner`'s avatar for `viewer`. Must be called
    /// with the viewer's lock held, as the registry callbacks are.
    pub fn enqueue_discard(&self, viewer: &Session, links: &mut SessionLinks, owner: &Session) {
        links.delivered.remove(&owner.id());
        let _ = self.discard(viewer, links, owner.identity());
    }

    fn discard(
        &self,
        viewer: &Session,
        links: &SessionLinks,
        owner: &PlayerIdentity,
    ) -> Result<(), DeliveryError> {
        self.queue(
            viewer,
            links,
            Outbound::Message(ServerMessage::Discard {
                owner: owner.clone(),
            }),
        )
    }

    /// Relays a client ping to every session currently viewing the sender.
    /// Returns the number of viewers reached.
    pub async fn relay_ping(&self, sender: &Session, id: u32, sync: bool, data: Bytes) -> usize {
        let viewers: Vec<SessionId> = sender.lock().await.viewers.iter().copied().collect();
        let message = ServerMessage::Ping {
            owner: sender.identity().clone(),
            id,
            sync,
            data,
        };

        let mut reached = 0;
        for viewer_id in viewers {
            let Some(viewer) = self.registry.lookup(viewer_id) else {
                continue;
            };
            let links = viewer.lock().await;
            if links.watching.contains(&sender.id())
                && self
                    .queue(&viewer, &links, Outbound::Message(message.clone()))
                    .is_ok()
            {
                reached += 1;
            }
        }
        self.stats.record_ping_relayed();
        reached
    }

    /// Queues a single message for one session.
    pub async fn notify(&self, session: &Session, message: ServerMessage) -> Result<(), DeliveryError> {
        let links = session.lock().await;
        self.queue(session, &links, Outbound::Message(message))
    }

    fn queue(
        &self,
        session: &Session,
        links: &SessionLinks,
        item: Outbound,
    ) -> Result<(), DeliveryError> {
        match links.push(item) {
            Ok(()) => Ok(()),
            Err(PushError::Full) => {
                self.stats.record_dropped_message();
                match self.config.overflow_policy {
                    OverflowPolicy::Disconnect => {
                        warn!("🐌 Outbound queue of {} is full, disconnecting", session.id());
                        self.report(HealthSignal::SlowConsumer(session.id()));
                    }
                    OverflowPolicy::DropNewest => {
                        warn!("🐌 Outbound queue of {} is full, dropping message", session.id());
                    }
                }
                Err(DeliveryError::QueueFull(session.id()))
            }
            Err(PushError::Closed) if links.is_released() => Err(DeliveryError::Cancelled),
            Err(PushError::Closed) => {
                let reason = "outbound queue closed".to_string();
                self.report(HealthSignal::SendFailed {
                    session: session.id(),
                    reason: reason.clone(),
                });
                Err(SessionError::ConnectionFailure {
                    session: session.id(),
                    reason,
                }
                .into())
            }
        }
    }

    fn report(&self, signal: HealthSignal) {
        if self.health.send(signal).is_err() {
            debug!("Health signal dropped: session core is gone");
        }
    }
}

fn is_transient(result: &Result<DeliveryOutcome, DeliveryError>) -> bool {
    matches!(
        result,
        Err(DeliveryError::Avatar(AvatarError::StorageUnavailable(_)))
    )
}
