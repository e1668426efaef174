//! Connection Manager
//!
//! Single owner of "is there a usable socket right now". Drives the
//! connection state machine, opens sessions on demand, supervises the live
//! session and reconnects with backoff after abnormal loss.
//!
//! # Events
//!
//! The manager reports to the client through one unbounded queue:
//!
//! - `Established`: a session completed its handshake (initial or resumed)
//! - `Frame`: an operation frame read from a session
//! - `ConnectFailed`: an on-demand attempt failed or timed out
//! - `Faulted`: reconnection after a loss was exhausted
//!
//! Nothing is reported for a graceful shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::keepalive::KeepAliveConfig;
use super::messages::{ClientFrame, ServerFrame};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::session::{self, SessionConfig, SessionEnd, SessionHandle, SessionMonitor};
use crate::application::ports::SessionProvider;
use crate::domain::connection::{ConnectionState, SessionId, TransportError};
use crate::infrastructure::config::ClientConfig;
use crate::infrastructure::metrics;

// =============================================================================
// Events
// =============================================================================

/// Event reported by the transport to the client's router task.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A session is ready for `start` frames.
    Established(SessionHandle),
    /// An operation frame arrived on a session.
    Frame {
        /// Session the frame was read from.
        session: SessionId,
        /// The decoded frame.
        frame: ServerFrame,
    },
    /// An on-demand connection attempt failed.
    ConnectFailed(TransportError),
    /// The connection was lost and could not be recovered.
    Faulted(TransportError),
}

// =============================================================================
// Connection Manager
// =============================================================================

/// What `ensure_connected` does once the state lock is released.
enum Pending {
    /// This caller moved the state to `Connecting` and owns the attempt.
    Connect,
    /// Wait until the attempt in flight settles.
    Settled(watch::Receiver<ConnectionState>),
    /// Connected but the session is not installed yet; wait for the next change.
    Changed(watch::Receiver<ConnectionState>),
}

struct Inner {
    state: ConnectionState,
    session: Option<SessionHandle>,
    last_error: Option<TransportError>,
}

struct Shared {
    session_config: SessionConfig,
    connect_timeout: Duration,
    reconnect: ReconnectConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
    next_session: AtomicU64,
}

/// Connection state machine and session supervisor.
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state.
    ///
    /// No socket is opened until the first `ensure_connected` call.
    #[must_use]
    pub fn new(config: &ClientConfig, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            shared: Arc::new(Shared {
                session_config: SessionConfig {
                    url: config.url().to_string(),
                    connection_params: config.connection_params.clone(),
                    keepalive: KeepAliveConfig::from_settings(&config.transport),
                },
                connect_timeout: config.transport.connect_timeout,
                reconnect: ReconnectConfig::from_settings(&config.transport),
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    session: None,
                    last_error: None,
                }),
                state_tx,
                events,
                cancel: CancellationToken::new(),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// The live session, if connected.
    #[must_use]
    pub fn current_session(&self) -> Option<SessionHandle> {
        let inner = self.shared.inner.lock();
        if inner.state.is_connected() {
            inner.session.clone()
        } else {
            None
        }
    }

    /// Return the live session, connecting first if needed.
    ///
    /// Callers arriving while an attempt is in flight share its outcome.
    ///
    /// # Errors
    ///
    /// Returns the failure of the attempt this call started or waited for,
    /// or `TransportError::Disposed` after `shutdown`.
    pub async fn ensure_connected(&self) -> Result<SessionHandle, TransportError> {
        loop {
            let next = {
                let mut inner = self.shared.inner.lock();
                match inner.state {
                    ConnectionState::Connected => match &inner.session {
                        Some(session) => return Ok(session.clone()),
                        None => Pending::Changed(self.shared.state_tx.subscribe()),
                    },
                    ConnectionState::Disposed => return Err(TransportError::Disposed),
                    ConnectionState::Disconnected | ConnectionState::Faulted => {
                        self.transition(&mut inner, ConnectionState::Connecting);
                        Pending::Connect
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting => {
                        Pending::Settled(self.shared.state_tx.subscribe())
                    }
                }
            };

            // Share the outcome of the attempt in flight
            let observed = match next {
                Pending::Connect => return self.connect().await,
                Pending::Settled(mut state_rx) => state_rx
                    .wait_for(|state| !state.is_pending())
                    .await
                    .is_ok(),
                Pending::Changed(mut state_rx) => state_rx.changed().await.is_ok(),
            };
            if !observed {
                return Err(TransportError::Disposed);
            }

            let inner = self.shared.inner.lock();
            match inner.state {
                ConnectionState::Connected => {
                    if let Some(session) = &inner.session {
                        return Ok(session.clone());
                    }
                }
                ConnectionState::Faulted => {
                    return Err(inner.last_error.clone().unwrap_or_else(|| {
                        TransportError::ConnectionFailed("connection attempt failed".to_string())
                    }));
                }
                ConnectionState::Disposed => return Err(TransportError::Disposed),
                _ => {}
            }
        }
    }

    /// Move to `Disposed`, stop reconnection and return the live session.
    ///
    /// The caller is expected to queue any final frames and then pass the
    /// session to `terminate`. Returns `None` if there was no session or the
    /// manager was already disposed.
    pub fn shutdown(&self) -> Option<SessionHandle> {
        let session = {
            let mut inner = self.shared.inner.lock();
            if inner.state.is_terminal() {
                return None;
            }
            self.transition(&mut inner, ConnectionState::Disposed);
            inner.session.take()
        };

        self.shared.cancel.cancel();
        session
    }

    /// Send `connection_terminate` and close the socket with code 1000.
    pub fn terminate(session: &SessionHandle) {
        if session.send(ClientFrame::ConnectionTerminate).is_err() {
            tracing::debug!(session_id = session.id(), "Session already closed");
        }
        session.close();
    }

    /// Dispose the manager: `shutdown` followed by `terminate`.
    pub fn dispose(&self) {
        if let Some(session) = self.shutdown() {
            Self::terminate(&session);
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn transition(&self, inner: &mut Inner, next: ConnectionState) -> bool {
        let from = inner.state;
        if !from.can_transition_to(next) {
            tracing::warn!(from = %from, to = %next, "Rejected illegal connection state transition");
            return false;
        }

        tracing::info!(from = %from, to = %next, "Connection state changed");
        inner.state = next;
        self.shared.state_tx.send_replace(next);
        metrics::set_connection_state(next);
        true
    }

    /// One bounded attempt: upgrade plus handshake.
    async fn open_session(&self) -> Result<(SessionHandle, SessionMonitor), TransportError> {
        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        let timeout = self.shared.connect_timeout;

        let attempt = tokio::time::timeout(
            timeout,
            session::open(
                id,
                &self.shared.session_config,
                self.shared.events.clone(),
            ),
        );

        tokio::select! {
            () = self.shared.cancel.cancelled() => Err(TransportError::Disposed),
            result = attempt => result.unwrap_or(Err(TransportError::Timeout(timeout))),
        }
    }

    /// Initial attempt started from `Connecting`.
    async fn connect(&self) -> Result<SessionHandle, TransportError> {
        match self.open_session().await {
            Ok((session, monitor)) => {
                self.adopt(session.clone(), monitor)?;
                Ok(session)
            }
            Err(error) => {
                let mut inner = self.shared.inner.lock();
                if inner.state.is_terminal() {
                    return Err(TransportError::Disposed);
                }
                tracing::warn!(error = %error, "Connection attempt failed");
                inner.last_error = Some(error.clone());
                self.transition(&mut inner, ConnectionState::Faulted);
                drop(inner);

                metrics::record_connect_failure();
                let _ = self
                    .shared
                    .events
                    .send(TransportEvent::ConnectFailed(error.clone()));
                Err(error)
            }
        }
    }

    /// Install a freshly opened session and start supervising it.
    fn adopt(&self, session: SessionHandle, monitor: SessionMonitor) -> Result<(), TransportError> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state.is_terminal() {
                drop(inner);
                Self::terminate(&session);
                return Err(TransportError::Disposed);
            }
            inner.session = Some(session.clone());
            inner.last_error = None;
            self.transition(&mut inner, ConnectionState::Connected);
        }

        tracing::info!(session_id = session.id(), "Session established");
        let _ = self
            .shared
            .events
            .send(TransportEvent::Established(session.clone()));

        tokio::spawn(self.clone().supervise(session.id(), monitor));
        Ok(())
    }

    /// Wait for the session to end and recover from abnormal loss.
    async fn supervise(self, session_id: SessionId, monitor: SessionMonitor) {
        let SessionEnd::Lost(cause) = monitor.ended().await else {
            tracing::debug!(session_id, "Session ended gracefully");
            return;
        };

        {
            let mut inner = self.shared.inner.lock();
            let current = inner.session.as_ref().map(SessionHandle::id);
            if !inner.state.is_connected() || current != Some(session_id) {
                return;
            }
            tracing::warn!(session_id, error = %cause, "Connection lost");
            inner.session = None;
            inner.last_error = Some(cause.clone());
            self.transition(&mut inner, ConnectionState::Reconnecting);
        }

        match self.reconnect(cause).await {
            Ok((session, monitor)) => {
                if self.adopt(session, monitor).is_err() {
                    tracing::debug!("Disposed while reconnecting");
                }
            }
            Err(TransportError::Disposed) => {
                tracing::debug!("Reconnection cancelled by dispose");
            }
            Err(error) => {
                {
                    let mut inner = self.shared.inner.lock();
                    if inner.state.is_terminal() {
                        return;
                    }
                    inner.last_error = Some(error.clone());
                    self.transition(&mut inner, ConnectionState::Faulted);
                }
                tracing::warn!(error = %error, "Connection faulted");
                let _ = self.shared.events.send(TransportEvent::Faulted(error));
            }
        }
    }

    async fn reconnect(
        &self,
        cause: TransportError,
    ) -> Result<(SessionHandle, SessionMonitor), TransportError> {
        let mut policy = ReconnectPolicy::new(self.shared.reconnect.clone());
        let mut last = cause;

        loop {
            let Ok(delay) = policy.next_delay() else {
                return Err(TransportError::ReconnectExhausted {
                    attempts: policy.attempt_count(),
                    last: Box::new(last),
                });
            };

            let attempt = policy.attempt_count();
            tracing::info!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting"
            );

            tokio::select! {
                () = self.shared.cancel.cancelled() => return Err(TransportError::Disposed),
                () = tokio::time::sleep(delay) => {}
            }

            metrics::record_reconnect();
            match self.open_session().await {
                Ok(opened) => return Ok(opened),
                Err(TransportError::Disposed) => return Err(TransportError::Disposed),
                Err(error) => {
                    tracing::warn!(attempt, error = %error, "Reconnection attempt failed");
                    last = error;
                }
            }
        }
    }
}

#[async_trait]
impl SessionProvider for ConnectionManager {
    async fn ensure_connected(&self) -> Result<SessionHandle, TransportError> {
        Self::ensure_connected(self).await
    }

    fn current_session(&self) -> Option<SessionHandle> {
        Self::current_session(self)
    }
}
