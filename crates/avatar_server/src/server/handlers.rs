//! Connection handling logic for WebSocket clients.
//!
//! Each accepted TCP stream runs [`handle_connection`], which performs the
//! WebSocket upgrade, waits for the handshake, admits the session through the
//! core and then splits into two halves:
//!
//! * **Reader** (this task): decodes client frames and hands them to the core
//! * **Writer** (spawned): drains the session's outbound queue onto the socket
//!
//! Whichever half notices the end of the connection first begins the close;
//! the other observes it through the session's close signal.

use crate::distribution::avatar_frames;
use crate::error::{ServerError, SessionError};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::server::coordinator::SessionCore;
use crate::session::{
    close_requested, CloseReason, ConnectionState, Lifecycle, Outbound, OutboundReceiver, Session,
};
use crate::stats::ServerStats;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, trace, warn};

/// Time the writer gets to flush its close frame after the reader is done.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Time a closing writer waits for the peer to take the close frame.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Handles a single client connection from establishment to cleanup.
///
/// # Connection Flow
///
/// 1. Enforce the per-IP connection limit
/// 2. Perform the WebSocket upgrade
/// 3. Wait for the handshake and authenticate its token
/// 4. Admit the session and queue the `Auth` acknowledgement
/// 5. Run the reader loop while the writer task drains the outbound queue
/// 6. Close the session through the core and wait for the writer
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    core: Arc<SessionCore>,
) -> Result<(), ServerError> {
    if let Err(e) = core.security().validate_connection(addr.ip()).await {
        core.stats().record_connection_refused();
        debug!("🚫 Refusing {}: {}", addr, e);
        return Ok(());
    }
    core.stats().record_connection_accepted();

    let result = serve_connection(stream, addr, &core).await;
    core.security().on_disconnect(addr.ip()).await;
    result
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    core: &Arc<SessionCore>,
) -> Result<(), ServerError> {
    let mut lifecycle = Lifecycle::new();
    let handshake_timeout = Duration::from_secs(core.config().handshake_timeout);

    let ws_stream = match timeout(handshake_timeout, accept_async(stream)).await {
        Ok(Ok(ws_stream)) => ws_stream,
        Ok(Err(e)) => {
            return Err(ServerError::Network(format!(
                "WebSocket handshake failed: {e}"
            )))
        }
        Err(_) => {
            return Err(ServerError::Network(format!(
                "WebSocket upgrade from {addr} timed out"
            )))
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    advance(&mut lifecycle, ConnectionState::Authenticating)?;

    let token = match timeout(handshake_timeout, read_handshake(&mut ws_receiver)).await {
        Ok(Ok(token)) => token,
        Ok(Err(reason)) => return reject(&mut ws_sender, &mut lifecycle, addr, reason).await,
        Err(_) => {
            let reason = CloseReason::HandshakeTimeout;
            return reject(&mut ws_sender, &mut lifecycle, addr, reason).await;
        }
    };

    let identity = match core.authenticate(&token).await {
        Ok(identity) => identity,
        Err(SessionError::Banned(_)) => {
            return reject(&mut ws_sender, &mut lifecycle, addr, CloseReason::Banned).await
        }
        Err(e) => {
            debug!("🔐 Handshake from {} rejected: {}", addr, e);
            let reason = CloseReason::AuthRejected;
            return reject(&mut ws_sender, &mut lifecycle, addr, reason).await;
        }
    };

    // The acknowledgement is queued before admission so that it precedes
    // anything the core routes to the new session.
    let capacity = core.config().distribution.outbound_queue_capacity.max(1);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    if outbound_tx
        .try_send(Outbound::Message(ServerMessage::Auth))
        .is_err()
    {
        return Err(ServerError::Internal("outbound queue rejected auth".into()));
    }

    let session = match core.open_session(identity, outbound_tx).await {
        Ok(session) => session,
        Err(e) => {
            debug!("🔐 Admission for {} refused: {}", addr, e);
            let reason = CloseReason::Kicked(e.to_string());
            return reject(&mut ws_sender, &mut lifecycle, addr, reason).await;
        }
    };
    advance(&mut lifecycle, ConnectionState::Active)?;

    let mut writer = tokio::spawn(write_outbound(
        ws_sender,
        outbound_rx,
        Arc::clone(&session),
        core.config().distribution.max_frame_size,
        Arc::clone(core.stats()),
    ));

    let reason = read_loop(&mut ws_receiver, &session, core).await;
    advance(&mut lifecycle, ConnectionState::Closing)?;
    core.close_session(session.id(), reason).await;

    match timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Writer task of session {} failed: {}", session.id(), e),
        Err(_) => {
            warn!("⏳ Writer of session {} did not finish in time, aborting it", session.id());
            writer.abort();
        }
    }
    advance(&mut lifecycle, ConnectionState::Closed)?;
    trace!("Connection {} for session {} closed", addr, session.id());
    Ok(())
}

fn advance(lifecycle: &mut Lifecycle, next: ConnectionState) -> Result<(), ServerError> {
    lifecycle
        .advance(next)
        .map_err(|e| ServerError::Internal(e.to_string()))
}

/// Closes a connection that never became a session.
async fn reject<S>(
    sink: &mut S,
    lifecycle: &mut Lifecycle,
    addr: SocketAddr,
    reason: CloseReason,
) -> Result<(), ServerError>
where
    S: Sink<Message> + Unpin,
{
    debug!("🔌 Closing {} before admission: {}", addr, reason);
    lifecycle.begin_close();
    if reason != CloseReason::ClientClosed {
        let _ = sink.send(close_message(&reason)).await;
    }
    let _ = sink.close().await;
    advance(lifecycle, ConnectionState::Closed)
}

/// Waits for the first application frame, which must be a handshake.
async fn read_handshake<S>(stream: &mut S) -> Result<String, CloseReason>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(data)) => {
                return match ClientMessage::decode(data) {
                    Ok(ClientMessage::Handshake { token }) => Ok(token),
                    Ok(other) => Err(CloseReason::ProtocolViolation(format!(
                        "expected handshake, got {}",
                        other.kind()
                    ))),
                    Err(e) => Err(CloseReason::ProtocolViolation(e.to_string())),
                };
            }
            Ok(Message::Text(_)) => {
                return Err(CloseReason::ProtocolViolation(
                    "text frames are not supported".into(),
                ))
            }
            Ok(Message::Close(_)) => return Err(CloseReason::ClientClosed),
            Ok(_) => continue,
            Err(e) => return Err(CloseReason::ConnectionFailure(e.to_string())),
        }
    }
    Err(CloseReason::ClientClosed)
}

/// Reads client frames until the connection ends or the session is closed
/// from elsewhere. Returns the reason the reader saw.
async fn read_loop<S>(stream: &mut S, session: &Session, core: &SessionCore) -> CloseReason
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let idle = Duration::from_secs(core.config().connection_timeout);
    loop {
        let next = tokio::select! {
            biased;
            _ = session.closed() => return session.close_reason().unwrap_or(CloseReason::ClientClosed),
            next = timeout(idle, stream.next()) => next,
        };

        let message = match next {
            Err(_) => return CloseReason::IdleTimeout,
            Ok(None) => return CloseReason::ClientClosed,
            Ok(Some(Err(e))) => return CloseReason::ConnectionFailure(e.to_string()),
            Ok(Some(Ok(message))) => message,
        };

        let data = match message {
            Message::Binary(data) => data,
            Message::Text(_) => {
                return CloseReason::ProtocolViolation("text frames are not supported".into())
            }
            Message::Close(_) => return CloseReason::ClientClosed,
            // Control frames still count as activity for the idle timer.
            _ => continue,
        };

        if let Err(e) = core.security().validate_message_size(data.len()) {
            return CloseReason::ProtocolViolation(e.to_string());
        }
        let decoded = match ClientMessage::decode(data) {
            Ok(decoded) => decoded,
            Err(e) => return CloseReason::ProtocolViolation(e.to_string()),
        };
        trace!("📨 {} from session {}", decoded.kind(), session.id());
        if let Some(reason) = core.handle_client_message(session, decoded).await {
            return reason;
        }
    }
}

/// Drains a session's outbound queue onto a WebSocket sink.
///
/// Stops when the session starts closing or its queue is released, then
/// sends the close frame for the recorded reason. Every write races the
/// close signal, so a peer that stopped reading cannot hold the writer past
/// the close. A failed write closes the session with
/// [`CloseReason::ConnectionFailure`].
pub async fn write_outbound<S>(
    mut sink: S,
    mut outbound: OutboundReceiver,
    session: Arc<Session>,
    max_frame_size: usize,
    stats: Arc<ServerStats>,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut closed = session.subscribe_close();
    loop {
        let item = tokio::select! {
            biased;
            _ = close_requested(&mut closed) => break,
            item = outbound.recv() => item,
        };
        let Some(item) = item else {
            break;
        };
        match write_item(&mut sink, &mut closed, item, max_frame_size, &stats).await {
            Ok(()) => {}
            Err(WriteStop::Closing) => break,
            Err(WriteStop::Failed(e)) => {
                debug!("Write to session {} failed: {}", session.id(), e);
                session.begin_close(CloseReason::ConnectionFailure(e));
                break;
            }
        }
    }
    // Queued leases go back to the cache before the close handshake.
    drop(outbound);

    let reason = session.close_reason().unwrap_or(CloseReason::ClientClosed);
    let farewell = async {
        if !matches!(
            reason,
            CloseReason::ClientClosed | CloseReason::ConnectionFailure(_)
        ) {
            let _ = sink.send(close_message(&reason)).await;
        }
        let _ = sink.close().await;
    };
    if timeout(CLOSE_FRAME_TIMEOUT, farewell).await.is_err() {
        debug!("Peer of session {} did not take the close frame", session.id());
    }
}

/// Why writing an item stopped short.
enum WriteStop {
    Closing,
    Failed(String),
}

async fn write_item<S>(
    sink: &mut S,
    closed: &mut watch::Receiver<Option<CloseReason>>,
    item: Outbound,
    max_frame_size: usize,
    stats: &ServerStats,
) -> Result<(), WriteStop>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let messages = match item {
        Outbound::Message(message) => vec![message],
        Outbound::Avatar(lease) => avatar_frames(&lease, max_frame_size),
    };

    for message in messages {
        let frame: Bytes = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("⚠️ Skipping unencodable {} message: {}", message.kind(), e);
                continue;
            }
        };
        let len = frame.len();
        tokio::select! {
            biased;
            _ = close_requested(closed) => return Err(WriteStop::Closing),
            sent = sink.feed(Message::Binary(frame)) => {
                sent.map_err(|e| WriteStop::Failed(e.to_string()))?
            }
        }
        stats.record_frame_sent(len);
    }

    tokio::select! {
        biased;
        _ = close_requested(closed) => Err(WriteStop::Closing),
        flushed = sink.flush() => flushed.map_err(|e| WriteStop::Failed(e.to_string())),
    }
}

/// Close frame reasons are limited to 123 bytes on the wire.
const MAX_CLOSE_REASON: usize = 123;

fn close_message(reason: &CloseReason) -> Message {
    let (code, mut text) = reason.close_frame();
    if text.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: text.into(),
    }))
}
