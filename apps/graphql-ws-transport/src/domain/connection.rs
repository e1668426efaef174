//! Connection Lifecycle Types
//!
//! The connection state machine shared by every stream of one client, and
//! the transport error reported through the side error channel.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ──► Reconnecting ──► Connected
//!                      │  ▲                          │
//!                      ▼  │                          ▼
//!                     Faulted ◄──────────────────────┘
//!
//! (any) ──► Disposed   (terminal)
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of the shared WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No socket has been opened yet.
    #[default]
    Disconnected,
    /// An initial connection attempt is in flight.
    Connecting,
    /// A socket is open and the handshake was acknowledged.
    Connected,
    /// The socket was lost and the manager is retrying.
    Reconnecting,
    /// The last attempt failed; the next demand starts a fresh attempt.
    Faulted,
    /// The client was disposed. Terminal.
    Disposed,
}

impl ConnectionState {
    /// Check whether moving to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{
            Connected, Connecting, Disconnected, Disposed, Faulted, Reconnecting,
        };

        match (self, next) {
            (Disposed, _) => false,
            (_, Disposed)
            | (Disconnected | Faulted, Connecting)
            | (Connecting | Reconnecting, Connected | Faulted)
            | (Connected, Reconnecting) => true,
            _ => false,
        }
    }

    /// Check if a usable socket exists.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if a connection attempt is currently in flight.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }

    /// Check if the client was disposed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Disposed)
    }

    /// Numeric code used for the connection state gauge.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
            Self::Reconnecting => 3.0,
            Self::Faulted => 4.0,
            Self::Disposed => 5.0,
        }
    }

    /// Get the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Faulted => "faulted",
            Self::Disposed => "disposed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Session Identity
// =============================================================================

/// Identifier of one physical socket session, unique per client.
pub type SessionId = u64;

// =============================================================================
// Transport Errors
// =============================================================================

/// Transport-level failure of the shared connection.
///
/// Cloneable so a single failure can be handed to every stream handler and
/// every waiter of the attempt that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The endpoint could not be reached or the upgrade failed.
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    /// A connection attempt exceeded the configured timeout.
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered `connection_init` with `connection_error`.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The server closed the socket.
    #[error("connection closed by server (code {code}): {reason}")]
    Closed {
        /// WebSocket close code.
        code: u16,
        /// Close reason sent by the server.
        reason: String,
    },

    /// The socket failed while reading or writing.
    #[error("WebSocket error: {0}")]
    Io(String),

    /// No traffic arrived within the keep-alive window.
    #[error("keep-alive timeout after {0:?}")]
    KeepAliveTimeout(Duration),

    /// The server sent something the protocol does not allow.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Reconnection gave up.
    #[error("reconnection failed after {attempts} attempts: {last}")]
    ReconnectExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Failure of the final attempt.
        last: Box<Self>,
    },

    /// The session the frame was queued on has already closed.
    #[error("session closed")]
    SessionClosed,

    /// The client was disposed.
    #[error("client disposed")]
    Disposed,
}

impl TransportError {
    /// Check if this error stems from a graceful client shutdown.
    #[must_use]
    pub const fn is_disposed(&self) -> bool {
        matches!(self, Self::Disposed)
    }
}

// =============================================================================
// Tests
// =============================================================================
