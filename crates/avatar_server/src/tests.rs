// End-to-end tests over real WebSocket connections
#[cfg(test)]
mod tests {
    use crate::plugins::auth::StaticTokenAuthenticator;
    use crate::plugins::storage::{MemoryStore, StorageEvent};
    use crate::protocol::{ClientMessage, ServerMessage};
    use crate::proximity::ProximityEvent;
    use crate::*;
    use bytes::{Bytes, BytesMut};
    use futures::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        addr: SocketAddr,
        core: Arc<SessionCore>,
        store: Arc<MemoryStore>,
        shutdown: ShutdownState,
    }

    async fn start(config: ServerConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let auth = StaticTokenAuthenticator::with_tokens([
            ("tok-alice", "alice"),
            ("tok-bob", "bob"),
            ("tok-carol", "carol"),
        ]);
        let server = AvatarServer::new(config, Arc::new(auth), store.clone());
        let core = server.core().clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = ShutdownState::new();

        let server_shutdown = shutdown.clone();
        tokio::spawn(async move { server.serve(listener, None, server_shutdown).await });

        Harness {
            addr,
            core,
            store,
            shutdown,
        }
    }

    fn small_frames() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.distribution.max_frame_size = 16;
        config
    }

    async fn connect(addr: SocketAddr, token: &str) -> Client {
        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let hello = ClientMessage::Handshake {
            token: token.to_string(),
        };
        ws.send(Message::Binary(hello.encode().unwrap())).await.unwrap();
        ws
    }

    async fn login(harness: &Harness, token: &str) -> Client {
        let mut ws = connect(harness.addr, token).await;
        assert_eq!(next_message(&mut ws).await, ServerMessage::Auth);
        ws
    }

    /// Next application message, skipping control frames.
    async fn next_message(ws: &mut Client) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(WAIT, ws.next())
                .await
                .expect("timed out waiting for a message")
                .expect("connection ended")
                .expect("websocket error");
            match frame {
                Message::Binary(data) => return ServerMessage::decode(data).unwrap(),
                Message::Close(frame) => panic!("connection closed: {frame:?}"),
                _ => continue,
            }
        }
    }

    /// Reads one streamed avatar and returns `(owner, version, payload)`
    /// after checking the integrity marker.
    async fn next_avatar(ws: &mut Client) -> (String, u64, Bytes) {
        let mut payload = BytesMut::new();
        let mut expected_seq = 0;
        loop {
            match next_message(ws).await {
                ServerMessage::AvatarChunk {
                    seq, total, data, ..
                } => {
                    assert_eq!(seq, expected_seq);
                    assert!(seq < total);
                    expected_seq += 1;
                    payload.extend_from_slice(&data);
                }
                ServerMessage::AvatarComplete {
                    owner,
                    version,
                    hash,
                    size,
                } => {
                    assert_eq!(size as usize, payload.len());
                    assert_eq!(ContentHash::of(&payload), hash);
                    return (owner.to_string(), version.0, payload.freeze());
                }
                other => panic!("expected avatar frames, got {other:?}"),
            }
        }
    }

    /// Reads until the server's close frame and returns its code.
    async fn close_code(ws: &mut Client) -> u16 {
        loop {
            let frame = tokio::time::timeout(WAIT, ws.next())
                .await
                .expect("timed out waiting for close")
                .expect("connection ended without a close frame")
                .expect("websocket error");
            if let Message::Close(frame) = frame {
                return frame.map(|f| u16::from(f.code)).unwrap_or(1005);
            }
        }
    }

    fn enter(harness: &Harness, a: &str, b: &str) {
        harness
            .core
            .proximity_sender()
            .send(ProximityEvent::Enter(a.into(), b.into()))
            .unwrap();
    }

    async fn wait_for_sessions(harness: &Harness, count: usize) {
        tokio::time::timeout(WAIT, async {
            while harness.core.registry().len() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session count never settled");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn nearby_players_receive_each_others_avatars() {
        let harness = start(small_frames()).await;
        harness.store.put("alice", AvatarVersion(1), &b"alice's avatar, quite a few bytes long"[..]);
        harness.store.put("bob", AvatarVersion(3), &b"bob"[..]);

        let mut alice = login(&harness, "tok-alice").await;
        let mut bob = login(&harness, "tok-bob").await;
        enter(&harness, "alice", "bob");

        let (owner, version, payload) = next_avatar(&mut alice).await;
        assert_eq!((owner.as_str(), version), ("bob", 3));
        assert_eq!(&payload[..], b"bob");

        let (owner, version, payload) = next_avatar(&mut bob).await;
        assert_eq!((owner.as_str(), version), ("alice", 1));
        assert_eq!(&payload[..], b"alice's avatar, quite a few bytes long");

        harness.shutdown.initiate_shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn equipped_change_reaches_viewers_and_owner() {
        let harness = start(small_frames()).await;
        harness.store.put("bob", AvatarVersion(1), &b"old look"[..]);

        let mut alice = login(&harness, "tok-alice").await;
        let mut bob = login(&harness, "tok-bob").await;
        enter(&harness, "alice", "bob");
        assert_eq!(next_avatar(&mut alice).await.1, 1);

        harness.store.put("bob", AvatarVersion(2), &b"a brand new look for bob"[..]);
        harness
            .core
            .storage_sender()
            .send(StorageEvent::AvatarChanged {
                owner: "bob".into(),
                version: AvatarVersion(2),
            })
            .unwrap();

        let (_, version, payload) = next_avatar(&mut alice).await;
        assert_eq!(version, 2);
        assert_eq!(&payload[..], b"a brand new look for bob");
        assert_eq!(
            next_message(&mut bob).await,
            ServerMessage::AvatarUpdated {
                owner: "bob".into()
            }
        );

        harness.shutdown.initiate_shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn leaving_range_discards_and_pings_follow_edges() {
        let harness = start(ServerConfig::default()).await;
        let mut alice = login(&harness, "tok-alice").await;
        let mut bob = login(&harness, "tok-bob").await;
        enter(&harness, "alice", "bob");

        tokio::time::timeout(WAIT, async {
            while harness.core.registry().edges().await.len() != 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let ping = ClientMessage::Ping {
            id: 9,
            sync: true,
            data: Bytes::from_static(b"wave"),
        };
        alice
            .send(Message::Binary(ping.encode().unwrap()))
            .await
            .unwrap();
        assert_eq!(
            next_message(&mut bob).await,
            ServerMessage::Ping {
                owner: "alice".into(),
                id: 9,
                sync: true,
                data: Bytes::from_static(b"wave"),
            }
        );

        harness
            .core
            .proximity_sender()
            .send(ProximityEvent::Leave("bob".into(), "alice".into()))
            .unwrap();
        assert_eq!(
            next_message(&mut alice).await,
            ServerMessage::Discard {
                owner: "bob".into()
            }
        );
        assert_eq!(
            next_message(&mut bob).await,
            ServerMessage::Discard {
                owner: "alice".into()
            }
        );

        harness.shutdown.initiate_shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_login_replaces_first() {
        let harness = start(ServerConfig::default()).await;
        let mut first = login(&harness, "tok-alice").await;
        let _second = login(&harness, "tok-alice").await;

        assert_eq!(close_code(&mut first).await, protocol::close_codes::REPLACED);
        wait_for_sessions(&harness, 1).await;
        harness.shutdown.initiate_shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_token_is_rejected() {
        let harness = start(ServerConfig::default()).await;
        let mut ws = connect(harness.addr, "not-a-token").await;

        assert_eq!(close_code(&mut ws).await, protocol::close_codes::RE_AUTH);
        assert!(harness.core.registry().is_empty());
        harness.shutdown.initiate_shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn logout_removes_session_and_its_edges() {
        let harness = start(ServerConfig::default()).await;
        let mut alice = login(&harness, "tok-alice").await;
        let _bob = login(&harness, "tok-bob").await;
        enter(&harness, "alice", "bob");

        alice
            .send(Message::Binary(ClientMessage::Logout.encode().unwrap()))
            .await
            .unwrap();
        wait_for_sessions(&harness, 1).await;
        assert!(harness.core.registry().edges().await.is_empty());
        harness.shutdown.initiate_shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn kicked_player_gets_close_frame() {
        let harness = start(ServerConfig::default()).await;
        let mut carol = login(&harness, "tok-carol").await;

        assert!(harness.core.ban("carol".into()).await);
        assert_eq!(close_code(&mut carol).await, protocol::close_codes::BANNED);

        let mut again = connect(harness.addr, "tok-carol").await;
        assert_eq!(close_code(&mut again).await, protocol::close_codes::BANNED);
        harness.shutdown.initiate_shutdown();
    }
}
