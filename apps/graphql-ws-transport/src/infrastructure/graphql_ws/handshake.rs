//! Protocol Handshake
//!
//! Tracks the `connection_init` / `connection_ack` exchange that must
//! complete before any operation may be started on a socket.
//!
//! # Handshake Flow
//!
//! 1. Upgrade the socket with subprotocol `graphql-ws`
//! 2. Send `{"type":"connection_init","payload":{...}}`
//! 3. Server may send `{"type":"ka"}` at any time; it is ignored here
//! 4. Receive `{"type":"connection_ack"}` or `{"type":"connection_error"}`
//!
//! The whole exchange is bounded by the connect timeout of the caller.

use serde_json::Value;
use thiserror::Error;

use super::messages::{ClientFrame, ServerFrame};
use crate::domain::connection::TransportError;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The server answered with `connection_error`.
    #[error("server rejected connection_init: {0}")]
    Rejected(String),

    /// A frame arrived that is not allowed in the current state.
    #[error("unexpected {frame} frame while {state}")]
    Unexpected {
        /// Frame type received.
        frame: &'static str,
        /// Handshake state at the time.
        state: &'static str,
    },
}

impl From<HandshakeError> for TransportError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Rejected(reason) => Self::HandshakeRejected(reason),
            unexpected @ HandshakeError::Unexpected { .. } => Self::Protocol(unexpected.to_string()),
        }
    }
}

// =============================================================================
// Handshake State
// =============================================================================

/// Current state of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// Socket open, `connection_init` not yet sent.
    #[default]
    Opened,

    /// `connection_init` sent, awaiting the answer.
    Initiated,

    /// `connection_ack` received.
    Acknowledged,

    /// `connection_error` received.
    Rejected,
}

impl HandshakeState {
    /// Check if operations may be started.
    #[must_use]
    pub const fn is_acknowledged(&self) -> bool {
        matches!(self, Self::Acknowledged)
    }

    /// Check if the server's answer is pending.
    #[must_use]
    pub const fn is_awaiting_ack(&self) -> bool {
        matches!(self, Self::Initiated)
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Initiated => "initiated",
            Self::Acknowledged => "acknowledged",
            Self::Rejected => "rejected",
        }
    }
}

// =============================================================================
// Handshake
// =============================================================================

/// Handshake state machine for one socket.
///
/// # Example
///
/// ```rust
/// use graphql_ws_transport::infrastructure::graphql_ws::handshake::Handshake;
/// use graphql_ws_transport::infrastructure::graphql_ws::messages::ServerFrame;
///
/// let mut handshake = Handshake::new(None);
/// let _init = handshake.init_frame();
///
/// assert!(!handshake.on_frame(&ServerFrame::KeepAlive).unwrap());
/// assert!(handshake.on_frame(&ServerFrame::ConnectionAck { payload: None }).unwrap());
/// assert!(handshake.state().is_acknowledged());
/// ```
#[derive(Debug, Clone)]
pub struct Handshake {
    connection_params: Option<Value>,
    state: HandshakeState,
}

impl Handshake {
    /// Create a handshake carrying optional connection parameters.
    #[must_use]
    pub const fn new(connection_params: Option<Value>) -> Self {
        Self {
            connection_params,
            state: HandshakeState::Opened,
        }
    }

    /// Get the current state.
    #[must_use]
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// Create the `connection_init` frame and move to `Initiated`.
    #[must_use]
    pub fn init_frame(&mut self) -> ClientFrame {
        self.state = HandshakeState::Initiated;
        ClientFrame::ConnectionInit {
            payload: self.connection_params.clone(),
        }
    }

    /// Process a frame received while the handshake is incomplete.
    ///
    /// Returns `Ok(true)` once the server acknowledged, `Ok(false)` for
    /// frames that do not change the outcome.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::Rejected` on `connection_error` and
    /// `HandshakeError::Unexpected` for operation frames before the ack.
    pub fn on_frame(&mut self, frame: &ServerFrame) -> Result<bool, HandshakeError> {
        match frame {
            ServerFrame::KeepAlive => Ok(false),
            ServerFrame::ConnectionAck { .. } if self.state.is_awaiting_ack() => {
                self.state = HandshakeState::Acknowledged;
                Ok(true)
            }
            ServerFrame::ConnectionError { payload } => {
                self.state = HandshakeState::Rejected;
                Err(HandshakeError::Rejected(describe(payload.as_ref())))
            }
            other => Err(HandshakeError::Unexpected {
                frame: other.kind(),
                state: self.state.as_str(),
            }),
        }
    }
}

/// Render a rejection payload as a readable reason.
fn describe(payload: Option<&Value>) -> String {
    match payload {
        None | Some(Value::Null) => "no reason given".to_string(),
        Some(Value::String(reason)) => reason.clone(),
        Some(value) => value
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| value.to_string(), str::to_string),
    }
}
