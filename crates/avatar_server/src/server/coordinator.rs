//! The session core: wires authentication, the registry, the cache, the
//! distribution engine and the proximity router together, and owns every
//! session's transition into `Closing`.

use crate::cache::AvatarCache;
use crate::config::ServerConfig;
use crate::distribution::{DeliveryOutcome, DistributionEngine, HealthSignal};
use crate::error::{DeliveryError, SessionError};
use crate::plugins::auth::{AuthError, Authenticator};
use crate::plugins::storage::{AvatarStore, StorageEvent};
use crate::protocol::{ClientMessage, ServerMessage, ToastKind, MAX_STRING_LEN};
use crate::proximity::{ProximityEvent, ProximityRouter};
use crate::security::{SecurityError, SecurityManager};
use crate::server::feed::FeedMessage;
use crate::session::{CloseReason, OutboundSender, Session, SessionRegistry};
use crate::shutdown::ShutdownState;
use crate::stats::ServerStats;
use crate::types::{PlayerIdentity, SessionId};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct CoreReceivers {
    health: mpsc::UnboundedReceiver<HealthSignal>,
    proximity: mpsc::UnboundedReceiver<ProximityEvent>,
    storage: mpsc::UnboundedReceiver<StorageEvent>,
}

/// Coordinator shared by every connection task.
///
/// No per-session failure propagates out of the core: each one ends in
/// [`SessionCore::close_session`] for the affected session only.
pub struct SessionCore {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    engine: Arc<DistributionEngine>,
    router: Arc<ProximityRouter>,
    authenticator: Arc<dyn Authenticator>,
    store: Arc<dyn AvatarStore>,
    security: Arc<SecurityManager>,
    stats: Arc<ServerStats>,
    proximity_tx: mpsc::UnboundedSender<ProximityEvent>,
    storage_tx: mpsc::UnboundedSender<StorageEvent>,
    receivers: Mutex<Option<CoreReceivers>>,
}

impl SessionCore {
    /// Builds the core and all of its components.
    ///
    /// # Arguments
    ///
    /// * `config` - Server configuration
    /// * `authenticator` - Verifies handshake tokens
    /// * `store` - Source of avatar payloads and equipped versions
    pub fn new(
        config: ServerConfig,
        authenticator: Arc<dyn Authenticator>,
        store: Arc<dyn AvatarStore>,
    ) -> Arc<Self> {
        let stats = Arc::new(ServerStats::new());
        let registry = Arc::new(SessionRegistry::new(config.duplicate_policy));
        let cache = AvatarCache::new(Arc::clone(&store), &config.cache);
        let (health_tx, health) = mpsc::unbounded_channel();
        let (proximity_tx, proximity) = mpsc::unbounded_channel();
        let (storage_tx, storage) = mpsc::unbounded_channel();

        let engine = Arc::new(DistributionEngine::new(
            Arc::clone(&registry),
            cache,
            config.distribution.clone(),
            health_tx,
            Arc::clone(&stats),
        ));
        let router = Arc::new(ProximityRouter::new(
            Arc::clone(&registry),
            Arc::clone(&engine),
        ));
        let security = Arc::new(SecurityManager::new(config.security.clone()));

        Arc::new(Self {
            config,
            registry,
            engine,
            router,
            authenticator,
            store,
            security,
            stats,
            proximity_tx,
            storage_tx,
            receivers: Mutex::new(Some(CoreReceivers {
                health,
                proximity,
                storage,
            })),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<DistributionEngine> {
        &self.engine
    }

    pub fn router(&self) -> &Arc<ProximityRouter> {
        &self.router
    }

    pub fn cache(&self) -> &AvatarCache {
        self.engine.cache()
    }

    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Sender for the game-world proximity stream.
    pub fn proximity_sender(&self) -> mpsc::UnboundedSender<ProximityEvent> {
        self.proximity_tx.clone()
    }

    /// Sender for storage plugin notifications.
    pub fn storage_sender(&self) -> mpsc::UnboundedSender<StorageEvent> {
        self.storage_tx.clone()
    }

    /// Verifies a handshake token and applies the ban list.
    pub async fn authenticate(&self, token: &str) -> Result<PlayerIdentity, SessionError> {
        let identity = match self.authenticator.verify(token).await {
            Ok(identity) => identity,
            Err(e) => {
                self.stats.record_auth_rejection();
                if let AuthError::Unavailable(reason) = &e {
                    warn!("⚠️ Authentication backend unavailable: {}", reason);
                }
                return Err(SessionError::AuthRejected(e.to_string()));
            }
        };

        // Identities are written into every avatar frame.
        if identity.as_str().len() > MAX_STRING_LEN {
            self.stats.record_auth_rejection();
            warn!(
                "⚠️ Authenticator returned a {}-byte identity, refusing it",
                identity.as_str().len()
            );
            return Err(SessionError::AuthRejected("identity too long".to_string()));
        }

        if self.security.is_banned(&identity).await {
            self.stats.record_auth_rejection();
            return Err(SessionError::Banned(identity));
        }
        Ok(identity)
    }

    /// Admits an authenticated identity as a new session. A displaced
    /// session of the same identity is closed as replaced.
    pub async fn open_session(
        &self,
        identity: PlayerIdentity,
        outbound: OutboundSender,
    ) -> Result<Arc<Session>, SessionError> {
        let version = match self.store.current_version(&identity).await {
            Ok(version) => version,
            Err(e) => {
                warn!("⚠️ Could not resolve equipped avatar of {}: {}", identity, e);
                None
            }
        };

        let admission = self.registry.admit(identity, version, outbound)?;
        self.stats.record_session_admitted();
        let session = admission.session;
        info!(
            "👋 {} authenticated as session {} (avatar: {})",
            session.identity(),
            session.id(),
            version.map_or_else(|| "none".to_string(), |v| v.to_string())
        );

        if let Some(evicted) = admission.evicted {
            self.close_session(evicted.id(), CloseReason::Replaced).await;
        }
        Ok(session)
    }

    /// Moves a session to `Closing` and removes it, tearing down its edges.
    ///
    /// In-flight deliveries sourced from or targeting the session are
    /// cancelled by the close signal. Returns false if the session was
    /// already gone.
    pub async fn close_session(&self, id: SessionId, reason: CloseReason) -> bool {
        let Some(session) = self.registry.lookup(id) else {
            return false;
        };
        session.begin_close(reason);

        let engine = &self.engine;
        let removed = self
            .registry
            .remove_with(id, |viewer, links, owner| {
                engine.enqueue_discard(viewer, links, owner)
            })
            .await;
        let Some(session) = removed else {
            return false;
        };

        self.security.on_session_closed(id).await;
        self.stats.record_session_closed();
        info!(
            "👋 Session {} ({}) closed: {}",
            id,
            session.identity(),
            session.close_reason().unwrap_or(CloseReason::ClientClosed)
        );
        true
    }

    /// Handles one decoded client message of an active session.
    ///
    /// Returns the reason to close the session, if the message ends it.
    pub async fn handle_client_message(
        &self,
        session: &Session,
        message: ClientMessage,
    ) -> Option<CloseReason> {
        match message {
            ClientMessage::Handshake { .. } => Some(CloseReason::ProtocolViolation(
                "handshake on an active session".to_string(),
            )),
            ClientMessage::Ping { id, sync, data } => {
                match self.security.validate_ping(session.id(), data.len()).await {
                    Ok(()) => {
                        self.engine.relay_ping(session, id, sync, data).await;
                    }
                    Err(e @ SecurityError::RateLimitExceeded(_)) => {
                        debug!("Dropping ping from {}: {}", session.id(), e);
                    }
                    Err(e) => {
                        warn!("⚠️ Dropping ping from {}: {}", session.id(), e);
                    }
                }
                None
            }
            ClientMessage::Logout => Some(CloseReason::Logout),
        }
    }

    /// Routes a storage notification into the cache and distribution engine.
    pub async fn handle_storage_event(&self, event: StorageEvent) {
        match event {
            StorageEvent::AvatarChanged { owner, version } => {
                self.cache().retire_older(&owner, version);
                let Some(session) = self.registry.lookup_identity(&owner) else {
                    debug!("Avatar of offline player {} changed to {}", owner, version);
                    return;
                };

                let results = self.engine.on_version_change(session.id(), version).await;
                let failed = results
                    .iter()
                    .filter(|(_, result)| result.is_err())
                    .count();
                info!(
                    "🎭 {} equipped {}, refreshed {} viewer(s), {} failed",
                    owner,
                    version,
                    results.len() - failed,
                    failed
                );

                let notice = ServerMessage::AvatarUpdated {
                    owner: owner.clone(),
                };
                if let Err(e) = self.engine.notify(&session, notice).await {
                    debug!("Could not notify {} of its own update: {}", owner, e);
                }
            }
            StorageEvent::AvatarRemoved { owner, version } => {
                let discarded = self.engine.on_invalidate(&owner, version).await;
                info!(
                    "🗑️ Avatar {}@{} removed, {} discard(s) queued",
                    owner, version, discarded
                );
            }
        }
    }

    /// Turns a connection health report into that session's close.
    pub async fn handle_health_signal(&self, signal: HealthSignal) {
        match signal {
            HealthSignal::SlowConsumer(session) => {
                self.close_session(session, CloseReason::SlowConsumer).await;
            }
            HealthSignal::SendFailed { session, reason } => {
                self.close_session(session, CloseReason::ConnectionFailure(reason))
                    .await;
            }
        }
    }

    /// Applies one message received on the collaborator feed.
    pub async fn handle_feed_message(&self, message: FeedMessage) {
        match message {
            FeedMessage::Enter { a, b } => self.forward_proximity(ProximityEvent::Enter(a, b)),
            FeedMessage::Leave { a, b } => self.forward_proximity(ProximityEvent::Leave(a, b)),
            FeedMessage::AvatarChanged { owner, version } => {
                self.forward_storage(StorageEvent::AvatarChanged { owner, version })
            }
            FeedMessage::AvatarRemoved { owner, version } => {
                self.forward_storage(StorageEvent::AvatarRemoved { owner, version })
            }
            FeedMessage::Kick { identity, reason } => {
                let reason = reason.unwrap_or_else(|| "kicked".to_string());
                self.kick(&identity, CloseReason::Kicked(reason)).await;
            }
            FeedMessage::Ban { identity } => {
                self.ban(identity).await;
            }
            FeedMessage::Unban { identity } => {
                if self.security.unban(&identity).await {
                    info!("🔓 {} unbanned", identity);
                }
            }
            FeedMessage::Toast {
                identity,
                kind,
                title,
                body,
            } => {
                if let Err(e) = self.toast(&identity, kind, title, body).await {
                    debug!("Toast for {} not delivered: {}", identity, e);
                }
            }
        }
    }

    fn forward_proximity(&self, event: ProximityEvent) {
        if self.proximity_tx.send(event).is_err() {
            error!("Proximity router is not running");
        }
    }

    fn forward_storage(&self, event: StorageEvent) {
        if self.storage_tx.send(event).is_err() {
            error!("Storage event loop is not running");
        }
    }

    /// Closes the active session of `identity`, if there is one.
    pub async fn kick(&self, identity: &PlayerIdentity, reason: CloseReason) -> bool {
        match self.registry.lookup_identity(identity) {
            Some(session) => self.close_session(session.id(), reason).await,
            None => false,
        }
    }

    /// Bans an identity and closes its active session.
    pub async fn ban(&self, identity: PlayerIdentity) -> bool {
        let newly_banned = self.security.ban(identity.clone()).await;
        if newly_banned {
            info!("🔨 {} banned", identity);
        }
        self.kick(&identity, CloseReason::Banned).await;
        newly_banned
    }

    /// Shows a notice to the active session of `identity`.
    pub async fn toast(
        &self,
        identity: &PlayerIdentity,
        kind: ToastKind,
        title: String,
        body: Option<String>,
    ) -> Result<(), DeliveryError> {
        let session = self
            .registry
            .lookup_identity(identity)
            .ok_or(DeliveryError::Cancelled)?;
        self.engine
            .notify(&session, ServerMessage::Toast { kind, title, body })
            .await
    }

    /// Delivers `target`'s avatar to `viewer`, for callers outside the router.
    pub async fn deliver(
        &self,
        viewer: SessionId,
        target: SessionId,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        self.engine.deliver(viewer, target).await
    }

    /// Closes every session, used during shutdown.
    pub async fn shutdown_sessions(&self) -> usize {
        let sessions = self.registry.sessions();
        let mut closed = 0;
        for session in sessions {
            if self
                .close_session(session.id(), CloseReason::ServerShutdown)
                .await
            {
                closed += 1;
            }
        }
        closed
    }

    /// Starts the health, storage and proximity loops. They run until
    /// shutdown is initiated. Calling this twice starts nothing the second time.
    pub fn spawn_background(self: &Arc<Self>, shutdown: ShutdownState) -> Vec<JoinHandle<()>> {
        let receivers = match self.receivers.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(CoreReceivers {
            mut health,
            mut proximity,
            mut storage,
        }) = receivers
        else {
            warn!("Session core background tasks already started");
            return Vec::new();
        };

        let health_task = {
            let core = Arc::clone(self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        signal = health.recv() => match signal {
                            Some(signal) => core.handle_health_signal(signal).await,
                            None => break,
                        },
                    }
                }
            })
        };

        let storage_task = {
            let core = Arc::clone(self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        event = storage.recv() => match event {
                            Some(event) => core.handle_storage_event(event).await,
                            None => break,
                        },
                    }
                }
            })
        };

        let proximity_task = {
            let router = Arc::clone(&self.router);
            tokio::spawn(async move {
                let events = futures::stream::poll_fn(move |cx| proximity.poll_recv(cx));
                tokio::select! {
                    _ = shutdown.wait() => {}
                    _ = router.run(events) => {}
                }
            })
        };

        vec![health_task, storage_task, proximity_task]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::auth::StaticTokenAuthenticator;
    use crate::plugins::storage::MemoryStore;
    use crate::config::DuplicatePolicy;
    use crate::session::{Outbound, OutboundReceiver};
    use crate::types::AvatarVersion;

    fn core_with(store: Arc<MemoryStore>, config: ServerConfig) -> Arc<SessionCore> {
        let auth = StaticTokenAuthenticator::with_tokens([("tok-A", "alice"), ("tok-B", "bob")]);
        SessionCore::new(config, Arc::new(auth), store)
    }

    async fn login(core: &SessionCore, token: &str) -> (Arc<Session>, OutboundReceiver) {
        let identity = core.authenticate(token).await.unwrap();
        let (tx, rx) = mpsc::channel(32);
        (core.open_session(identity, tx).await.unwrap(), rx)
    }

    fn drain(rx: &mut OutboundReceiver) -> Vec<Outbound> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn authentication_rejects_unknown_and_banned() {
        let core = core_with(Arc::new(MemoryStore::new()), ServerConfig::default());

        assert!(matches!(
            core.authenticate("nope").await,
            Err(SessionError::AuthRejected(_))
        ));
        core.ban("alice".into()).await;
        assert_eq!(
            core.authenticate("tok-A").await,
            Err(SessionError::Banned("alice".into()))
        );
        assert_eq!(core.stats().snapshot().auth_rejections, 2);
    }

    #[tokio::test]
    async fn unencodable_identity_is_rejected() {
        let auth = StaticTokenAuthenticator::with_tokens([
            ("tok-long", "x".repeat(MAX_STRING_LEN + 1)),
            ("tok-edge", "y".repeat(MAX_STRING_LEN)),
        ]);
        let core = SessionCore::new(
            ServerConfig::default(),
            Arc::new(auth),
            Arc::new(MemoryStore::new()),
        );

        assert!(matches!(
            core.authenticate("tok-long").await,
            Err(SessionError::AuthRejected(_))
        ));
        assert!(core.authenticate("tok-edge").await.is_ok());
        assert_eq!(core.stats().snapshot().auth_rejections, 1);
    }

    #[tokio::test]
    async fn relogin_replaces_old_session() {
        let core = core_with(Arc::new(MemoryStore::new()), ServerConfig::default());
        let (old, _old_rx) = login(&core, "tok-A").await;
        let (new, _new_rx) = login(&core, "tok-A").await;

        assert_eq!(old.close_reason(), Some(CloseReason::Replaced));
        assert!(core.registry().lookup(old.id()).is_none());
        assert_eq!(
            core.registry().lookup_identity(&"alice".into()).map(|s| s.id()),
            Some(new.id())
        );
    }

    #[tokio::test]
    async fn reject_new_policy_refuses_second_login() {
        let config = ServerConfig {
            duplicate_policy: DuplicatePolicy::RejectNew,
            ..ServerConfig::default()
        };
        let core = core_with(Arc::new(MemoryStore::new()), config);
        let (_first, _rx) = login(&core, "tok-A").await;

        let (tx, _rx2) = mpsc::channel(1);
        assert_eq!(
            core.open_session("alice".into(), tx).await.unwrap_err(),
            SessionError::DuplicateSession("alice".into())
        );
    }

    #[tokio::test]
    async fn avatar_change_refreshes_viewers_and_notifies_owner() {
        let store = Arc::new(MemoryStore::new());
        store.put("bob", AvatarVersion(1), &b"bob-1"[..]);
        let core = core_with(store.clone(), ServerConfig::default());
        let (alice, mut alice_rx) = login(&core, "tok-A").await;
        let (bob, mut bob_rx) = login(&core, "tok-B").await;
        core.registry().link(alice.id(), bob.id()).await.unwrap();
        core.deliver(alice.id(), bob.id()).await.unwrap();
        // Dropping the queued lease unpins v1 so it can be retired.
        assert_eq!(drain(&mut alice_rx).len(), 1);

        store.put("bob", AvatarVersion(2), &b"bob-2"[..]);
        core.handle_storage_event(StorageEvent::AvatarChanged {
            owner: "bob".into(),
            version: AvatarVersion(2),
        })
        .await;

        let versions: Vec<_> = drain(&mut alice_rx)
            .into_iter()
            .filter_map(|item| match item {
                Outbound::Avatar(lease) => Some(lease.key.version),
                _ => None,
            })
            .collect();
        assert_eq!(versions, vec![AvatarVersion(2)]);
        assert!(matches!(
            drain(&mut bob_rx).as_slice(),
            [Outbound::Message(ServerMessage::AvatarUpdated { .. })]
        ));
        assert!(!core.cache().contains(&"bob".into(), AvatarVersion(1)));
    }

    #[tokio::test]
    async fn close_session_is_idempotent_and_discards_at_viewers() {
        let core = core_with(Arc::new(MemoryStore::new()), ServerConfig::default());
        let (alice, mut alice_rx) = login(&core, "tok-A").await;
        let (bob, _bob_rx) = login(&core, "tok-B").await;
        core.registry().link(alice.id(), bob.id()).await.unwrap();

        assert!(core.close_session(bob.id(), CloseReason::Logout).await);
        assert!(!core.close_session(bob.id(), CloseReason::Logout).await);
        assert!(core.registry().edges().await.is_empty());
        assert!(matches!(
            drain(&mut alice_rx).as_slice(),
            [Outbound::Message(ServerMessage::Discard { owner })] if owner.as_str() == "bob"
        ));
        assert_eq!(core.stats().snapshot().sessions_closed, 1);
    }

    #[tokio::test]
    async fn logout_and_repeated_handshake_end_the_session() {
        let core = core_with(Arc::new(MemoryStore::new()), ServerConfig::default());
        let (alice, _rx) = login(&core, "tok-A").await;

        assert_eq!(
            core.handle_client_message(&alice, ClientMessage::Logout).await,
            Some(CloseReason::Logout)
        );
        assert!(matches!(
            core.handle_client_message(
                &alice,
                ClientMessage::Handshake {
                    token: "tok-A".to_string()
                }
            )
            .await,
            Some(CloseReason::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn health_signal_closes_only_that_session() {
        let core = core_with(Arc::new(MemoryStore::new()), ServerConfig::default());
        let (alice, _ra) = login(&core, "tok-A").await;
        let (bob, _rb) = login(&core, "tok-B").await;

        core.handle_health_signal(HealthSignal::SlowConsumer(alice.id()))
            .await;
        assert_eq!(alice.close_reason(), Some(CloseReason::SlowConsumer));
        assert!(core.registry().lookup(alice.id()).is_none());
        assert!(core.registry().lookup(bob.id()).is_some());
    }

    #[tokio::test]
    async fn feed_messages_drive_background_loops() {
        let store = Arc::new(MemoryStore::new());
        store.put("bob", AvatarVersion(1), &b"bob"[..]);
        let core = core_with(store, ServerConfig::default());
        let shutdown = ShutdownState::new();
        let tasks = core.spawn_background(shutdown.clone());
        assert!(core.spawn_background(shutdown.clone()).is_empty());

        let (alice, mut alice_rx) = login(&core, "tok-A").await;
        let (bob, _rb) = login(&core, "tok-B").await;
        core.handle_feed_message(FeedMessage::Enter {
            a: "alice".into(),
            b: "bob".into(),
        })
        .await;

        let item = tokio::time::timeout(std::time::Duration::from_secs(2), alice_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(item, Outbound::Avatar(lease) if lease.key.owner.as_str() == "bob"));
        assert!(core
            .registry()
            .edges()
            .await
            .contains(&(alice.id(), bob.id())));

        shutdown.initiate_shutdown();
        for task in tasks {
            task.await.unwrap();
        }
    }
}
