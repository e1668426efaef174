//! graphql-ws Protocol Messages
//!
//! Frame types of the `graphql-ws` subprotocol (subscriptions-transport-ws).
//! Every frame is a JSON object with a `type` discriminator, an optional
//! operation `id` and an optional `payload`.
//!
//! # Client → Server
//!
//! | type                   | id  | payload            |
//! |------------------------|-----|--------------------|
//! | `connection_init`      |     | connection params  |
//! | `start`                | yes | `GraphQLRequest`   |
//! | `stop`                 | yes |                    |
//! | `connection_terminate` |     |                    |
//!
//! # Server → Client
//!
//! | type               | id  | payload            |
//! |--------------------|-----|--------------------|
//! | `connection_ack`   |     |                    |
//! | `connection_error` |     | error              |
//! | `ka`               |     |                    |
//! | `data`             | yes | `GraphQLResponse`  |
//! | `error`            | yes | error              |
//! | `complete`         | yes |                    |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::graphql::{GraphQLRequest, GraphQLResponse};

/// WebSocket subprotocol negotiated on upgrade.
pub const SUBPROTOCOL: &str = "graphql-ws";

// =============================================================================
// Client Frames
// =============================================================================

/// Frame sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Opens the protocol session.
    ConnectionInit {
        /// Connection parameters, typically authentication.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },

    /// Starts an operation.
    Start {
        /// Operation id.
        id: String,
        /// The subscription to run.
        payload: GraphQLRequest,
    },

    /// Stops an operation.
    Stop {
        /// Operation id.
        id: String,
    },

    /// Ends the protocol session.
    ConnectionTerminate,
}

impl ClientFrame {
    /// Create a `start` frame.
    #[must_use]
    pub fn start(id: impl Into<String>, request: GraphQLRequest) -> Self {
        Self::Start {
            id: id.into(),
            payload: request,
        }
    }

    /// Create a `stop` frame.
    #[must_use]
    pub fn stop(id: impl Into<String>) -> Self {
        Self::Stop { id: id.into() }
    }

    /// Frame type name, as it appears on the wire.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionInit { .. } => "connection_init",
            Self::Start { .. } => "start",
            Self::Stop { .. } => "stop",
            Self::ConnectionTerminate => "connection_terminate",
        }
    }

    /// Operation id, for frames scoped to one operation.
    #[must_use]
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            Self::Start { id, .. } | Self::Stop { id } => Some(id),
            Self::ConnectionInit { .. } | Self::ConnectionTerminate => None,
        }
    }
}

// =============================================================================
// Server Frames
// =============================================================================

/// Frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Accepts `connection_init`.
    ConnectionAck {
        /// Optional server payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },

    /// Rejects `connection_init`.
    ConnectionError {
        /// Rejection details.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },

    /// Server keep-alive.
    #[serde(rename = "ka")]
    KeepAlive,

    /// A result of an operation.
    Data {
        /// Operation id.
        id: String,
        /// The result.
        payload: GraphQLResponse,
    },

    /// The operation failed before or during execution.
    Error {
        /// Operation id.
        id: String,
        /// Error details.
        #[serde(default)]
        payload: Value,
    },

    /// The operation finished.
    Complete {
        /// Operation id.
        id: String,
    },
}

impl ServerFrame {
    /// Frame type name, as it appears on the wire.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionAck { .. } => "connection_ack",
            Self::ConnectionError { .. } => "connection_error",
            Self::KeepAlive => "ka",
            Self::Data { .. } => "data",
            Self::Error { .. } => "error",
            Self::Complete { .. } => "complete",
        }
    }

    /// Operation id, for frames scoped to one operation.
    #[must_use]
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            Self::Data { id, .. } | Self::Error { id, .. } | Self::Complete { id } => Some(id),
            Self::ConnectionAck { .. } | Self::ConnectionError { .. } | Self::KeepAlive => None,
        }
    }

    /// Frame type names the client understands.
    pub const KNOWN_TYPES: [&'static str; 6] = [
        "connection_ack",
        "connection_error",
        "ka",
        "data",
        "error",
        "complete",
    ];
}
