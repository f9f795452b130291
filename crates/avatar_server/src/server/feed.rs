//! Collaborator feed: newline-delimited JSON over TCP.
//!
//! The game world and the storage plugin report proximity changes and avatar
//! updates here; moderation tooling issues kicks, bans and toasts. Every line
//! is one [`FeedMessage`]:
//!
//! ```json
//! {"type":"enter","a":"alice","b":"bob"}
//! {"type":"avatar_changed","owner":"bob","version":7}
//! {"type":"toast","identity":"alice","title":"Maintenance in 5 minutes","kind":"warning"}
//! ```
//!
//! Malformed lines are logged and skipped; they never close the feed.

use crate::error::ServerError;
use crate::protocol::ToastKind;
use crate::server::coordinator::SessionCore;
use crate::shutdown::ShutdownState;
use crate::types::{AvatarVersion, PlayerIdentity};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// One message on the collaborator feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    Enter {
        a: PlayerIdentity,
        b: PlayerIdentity,
    },
    Leave {
        a: PlayerIdentity,
        b: PlayerIdentity,
    },
    AvatarChanged {
        owner: PlayerIdentity,
        version: AvatarVersion,
    },
    AvatarRemoved {
        owner: PlayerIdentity,
        version: AvatarVersion,
    },
    Kick {
        identity: PlayerIdentity,
        #[serde(default)]
        reason: Option<String>,
    },
    Ban {
        identity: PlayerIdentity,
    },
    Unban {
        identity: PlayerIdentity,
    },
    Toast {
        identity: PlayerIdentity,
        title: String,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        kind: ToastKind,
    },
}

/// Accepts feed connections until shutdown. Each connection is read on its
/// own task.
pub async fn serve_feed(
    listener: TcpListener,
    core: Arc<SessionCore>,
    shutdown: ShutdownState,
) -> Result<(), ServerError> {
    let local = listener
        .local_addr()
        .map_err(|e| ServerError::Network(format!("feed listener has no address: {e}")))?;
    info!("📡 Collaborator feed listening on {}", local);

    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                info!("📡 Feed client connected from {}", addr);
                let core = Arc::clone(&core);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.wait() => {}
                        lines = read_feed(stream, &core) => {
                            debug!("📡 Feed client {} disconnected after {} message(s)", addr, lines);
                        }
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept feed connection: {}", e);
            }
        }
    }

    info!("📡 Collaborator feed stopped");
    Ok(())
}

/// Applies every well-formed line of `reader` in order. Returns the number of
/// messages applied.
pub async fn read_feed<R>(reader: R, core: &SessionCore) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut applied = 0;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("⚠️ Feed read error: {}", e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<FeedMessage>(line) {
            Ok(message) => {
                core.handle_feed_message(message).await;
                applied += 1;
            }
            Err(e) => warn!("⚠️ Skipping malformed feed line: {}", e),
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_messages() {
        let enter: FeedMessage = serde_json::from_str(r#"{"type":"enter","a":"alice","b":"bob"}"#).unwrap();
        assert_eq!(
            enter,
            FeedMessage::Enter {
                a: "alice".into(),
                b: "bob".into()
            }
        );

        let toast: FeedMessage =
            serde_json::from_str(r#"{"type":"toast","identity":"alice","title":"hi"}"#).unwrap();
        assert_eq!(
            toast,
            FeedMessage::Toast {
                identity: "alice".into(),
                title: "hi".to_string(),
                body: None,
                kind: ToastKind::Default,
            }
        );

        let kick: FeedMessage =
            serde_json::from_str(r#"{"type":"kick","identity":"bob","reason":"afk"}"#).unwrap();
        assert!(matches!(kick, FeedMessage::Kick { reason: Some(r), .. } if r == "afk"));
    }

    #[test]
    fn rejects_unknown_types() {
        assert!(serde_json::from_str::<FeedMessage>(r#"{"type":"teleport","who":"x"}"#).is_err());
    }
}
