//! Socket Session
//!
//! One physical WebSocket. Opening a session performs the upgrade and the
//! protocol handshake; afterwards two tasks own the socket halves:
//!
//! - **Writer**: drains an unbounded queue, so sends from any number of
//!   callers are serialized and every frame goes out whole.
//! - **Reader**: decodes inbound frames in arrival order and forwards them
//!   to the client's event queue, answering pings and feeding keep-alive.
//!
//! Closing a session enqueues a close marker behind every frame already
//! queued. Frames queued after that are rejected with `SessionClosed`.

use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use super::codec::FrameCodec;
use super::connection::TransportEvent;
use super::handshake::Handshake;
use super::keepalive::{KeepAliveConfig, KeepAliveEvent, KeepAliveMonitor, Liveness};
use super::messages::{ClientFrame, SUBPROTOCOL, ServerFrame};
use crate::domain::connection::{SessionId, TransportError};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint (`ws://` or `wss://`).
    pub url: String,
    /// Payload of `connection_init`.
    pub connection_params: Option<Value>,
    /// Keep-alive timing.
    pub keepalive: KeepAliveConfig,
}

// =============================================================================
// Outbound Queue
// =============================================================================

/// Item queued for the writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A protocol frame.
    Frame(ClientFrame),
    /// A WebSocket ping.
    Ping,
    /// A WebSocket pong echoing the ping payload.
    Pong(Vec<u8>),
    /// Send a normal close frame and stop.
    Close,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Closed by this client.
    Graceful,
    /// Lost without the client asking for it.
    Lost(TransportError),
}

struct HandleShared {
    open: Mutex<bool>,
    failure: Mutex<Option<TransportError>>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

/// Cheap, cloneable sending side of a session.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    shared: Arc<HandleShared>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl SessionHandle {
    fn new(id: SessionId, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id,
            shared: Arc::new(HandleShared {
                open: Mutex::new(true),
                failure: Mutex::new(None),
                outbound,
            }),
        }
    }

    /// Create a handle whose queue is read by the caller instead of a socket.
    #[cfg(test)]
    pub(crate) fn detached(id: SessionId) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(id, tx), rx)
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Check if frames are still accepted.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.shared.open.lock()
    }

    /// Queue a protocol frame.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::SessionClosed` if the session was closed or
    /// its writer is gone.
    pub fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        self.enqueue(Outbound::Frame(frame))
    }

    /// Queue the close marker behind every frame already queued.
    ///
    /// Returns `false` if the session was already closed.
    pub fn close(&self) -> bool {
        let mut open = self.shared.open.lock();
        if !*open {
            return false;
        }
        *open = false;
        self.shared.outbound.send(Outbound::Close).is_ok()
    }

    fn enqueue(&self, item: Outbound) -> Result<(), TransportError> {
        let open = self.shared.open.lock();
        if !*open {
            return Err(TransportError::SessionClosed);
        }
        self.shared
            .outbound
            .send(item)
            .map_err(|_| TransportError::SessionClosed)
    }

    fn shut(&self) {
        *self.shared.open.lock() = false;
    }

    fn fail(&self, error: TransportError) {
        *self.shared.open.lock() = false;
        self.shared.failure.lock().get_or_insert(error);
    }

    fn take_failure(&self) -> Option<TransportError> {
        self.shared.failure.lock().take()
    }
}

/// Receiving side of a session's termination.
#[derive(Debug)]
pub struct SessionMonitor {
    ended: oneshot::Receiver<SessionEnd>,
}

impl SessionMonitor {
    /// Wait until the session ends.
    pub async fn ended(self) -> SessionEnd {
        self.ended.await.unwrap_or_else(|_| {
            SessionEnd::Lost(TransportError::Io("session reader stopped".to_string()))
        })
    }
}

// =============================================================================
// Opening
// =============================================================================

/// Open a socket, complete the handshake and start the session tasks.
///
/// Inbound operation frames are forwarded to `events` tagged with `id`.
///
/// # Errors
///
/// Returns a `TransportError` if the endpoint is unreachable, the upgrade
/// fails, the server rejects `connection_init` or closes during the
/// handshake. No timeout is applied here.
pub async fn open(
    id: SessionId,
    config: &SessionConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> Result<(SessionHandle, SessionMonitor), TransportError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

    tracing::debug!(session_id = id, url = %config.url, "Opening WebSocket");

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    let (mut write, mut read) = ws_stream.split();
    let codec = FrameCodec::new();

    perform_handshake(
        &codec,
        Handshake::new(config.connection_params.clone()),
        &mut write,
        &mut read,
    )
    .await?;

    tracing::debug!(session_id = id, "Handshake acknowledged");

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let handle = SessionHandle::new(id, outbound_tx);
    let cancel = CancellationToken::new();

    // Keep-alive
    let liveness = Arc::new(Liveness::new());
    let (keepalive_tx, keepalive_rx) = mpsc::channel(4);
    tokio::spawn(
        KeepAliveMonitor::new(
            config.keepalive,
            Arc::clone(&liveness),
            keepalive_tx,
            cancel.clone(),
        )
        .run(),
    );

    // Writer
    tokio::spawn(write_loop(
        write,
        outbound_rx,
        handle.clone(),
        cancel.clone(),
    ));

    // Reader
    let (ended_tx, ended_rx) = oneshot::channel();
    let reader = Reader {
        handle: handle.clone(),
        liveness,
        events,
        codec,
    };
    tokio::spawn(async move {
        let end = reader.run(read, keepalive_rx, cancel.clone()).await;
        reader.handle.shut();
        cancel.cancel();
        let _ = ended_tx.send(end);
    });

    Ok((handle, SessionMonitor { ended: ended_rx }))
}

/// Send `connection_init` and wait for the server's answer.
async fn perform_handshake<W, R>(
    codec: &FrameCodec,
    mut handshake: Handshake,
    write: &mut W,
    read: &mut R,
) -> Result<(), TransportError>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let init = handshake.init_frame();
    let text = codec
        .encode(&init)
        .map_err(|e| TransportError::Protocol(e.to_string()))?;
    write
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    metrics::record_frame_sent(init.kind());

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame = codec
                    .decode(&text)
                    .map_err(|e| TransportError::Protocol(e.to_string()))?;
                metrics::record_frame_received(frame.kind());

                if handshake.on_frame(&frame)? {
                    return Ok(());
                }
            }
            Some(Ok(Message::Ping(data))) => {
                write
                    .send(Message::Pong(data))
                    .await
                    .map_err(|e| TransportError::Io(e.to_string()))?;
            }
            Some(Ok(Message::Close(frame))) => return Err(closed_error(frame)),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
            None => {
                return Err(TransportError::ConnectionFailed(
                    "socket closed during handshake".to_string(),
                ));
            }
        }
    }
}

// =============================================================================
// Writer
// =============================================================================

async fn write_loop<W>(
    mut write: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    handle: SessionHandle,
    cancel: CancellationToken,
) where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let codec = FrameCodec::new();

    loop {
        let item = tokio::select! {
            () = cancel.cancelled() => break,
            item = outbound.recv() => item,
        };
        let Some(item) = item else { break };

        let message = match item {
            Outbound::Frame(frame) => match codec.encode(&frame) {
                Ok(text) => {
                    tracing::trace!(
                        session_id = handle.id(),
                        frame = frame.kind(),
                        operation_id = frame.operation_id().unwrap_or_default(),
                        "Sending frame"
                    );
                    metrics::record_frame_sent(frame.kind());
                    Message::Text(text.into())
                }
                Err(e) => {
                    tracing::warn!(error = %e, frame = frame.kind(), "Failed to encode frame");
                    continue;
                }
            },
            Outbound::Ping => Message::Ping(Vec::new().into()),
            Outbound::Pong(data) => Message::Pong(data.into()),
            Outbound::Close => {
                let close = Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                }));
                if let Err(e) = write.send(close).await {
                    tracing::debug!(session_id = handle.id(), error = %e, "Close frame not sent");
                }
                tracing::debug!(session_id = handle.id(), "Session closed by client");
                cancel.cancel();
                break;
            }
        };

        if let Err(e) = write.send(message).await {
            tracing::debug!(session_id = handle.id(), error = %e, "Socket write failed");
            handle.fail(TransportError::Io(e.to_string()));
            cancel.cancel();
            break;
        }
    }
}

// =============================================================================
// Reader
// =============================================================================

struct Reader {
    handle: SessionHandle,
    liveness: Arc<Liveness>,
    events: mpsc::UnboundedSender<TransportEvent>,
    codec: FrameCodec,
}

impl Reader {
    async fn run<R>(
        &self,
        mut read: R,
        mut keepalive: mpsc::Receiver<KeepAliveEvent>,
        cancel: CancellationToken,
    ) -> SessionEnd
    where
        R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    return self
                        .handle
                        .take_failure()
                        .map_or(SessionEnd::Graceful, SessionEnd::Lost);
                }
                Some(event) = keepalive.recv() => match event {
                    KeepAliveEvent::SendPing => {
                        let _ = self.handle.enqueue(Outbound::Ping);
                    }
                    KeepAliveEvent::Timeout(silence) => {
                        return SessionEnd::Lost(TransportError::KeepAliveTimeout(silence));
                    }
                },
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        self.liveness.record_activity();
                        self.dispatch(&text);
                    }
                    Some(Ok(Message::Pong(_))) => self.liveness.record_activity(),
                    Some(Ok(Message::Ping(data))) => {
                        self.liveness.record_activity();
                        let _ = self.handle.enqueue(Outbound::Pong(data.to_vec()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return self.end_with(closed_error(frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return self.end_with(TransportError::Io(e.to_string())),
                    None => {
                        return self.end_with(TransportError::Closed {
                            code: 1006,
                            reason: "connection dropped".to_string(),
                        });
                    }
                },
            }
        }
    }

    /// A read-side termination is only a loss if the client did not close.
    fn end_with(&self, error: TransportError) -> SessionEnd {
        if self.handle.is_open() {
            SessionEnd::Lost(error)
        } else {
            self.handle
                .take_failure()
                .map_or(SessionEnd::Graceful, SessionEnd::Lost)
        }
    }

    fn dispatch(&self, text: &str) {
        let frame = match self.codec.decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(session_id = self.handle.id(), error = %e, "Dropping undecodable frame");
                metrics::record_frame_dropped("undecodable");
                return;
            }
        };

        metrics::record_frame_received(frame.kind());

        if frame == ServerFrame::KeepAlive {
            tracing::trace!(session_id = self.handle.id(), "Server keep-alive");
            return;
        }

        tracing::trace!(
            session_id = self.handle.id(),
            frame = frame.kind(),
            operation_id = frame.operation_id().unwrap_or_default(),
            "Received frame"
        );

        let _ = self.events.send(TransportEvent::Frame {
            session: self.handle.id(),
            frame,
        });
    }
}

fn closed_error(frame: Option<CloseFrame>) -> TransportError {
    frame.map_or_else(
        || TransportError::Closed {
            code: 1005,
            reason: String::new(),
        },
        |frame| TransportError::Closed {
            code: u16::from(frame.code),
            reason: frame.reason.to_string(),
        },
    )
}
