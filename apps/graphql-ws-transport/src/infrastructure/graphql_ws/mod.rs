//! graphql-ws Transport Adapter
//!
//! WebSocket client for the `graphql-ws` (subscriptions-transport-ws)
//! protocol: frame types and codec, the connection handshake, keep-alive,
//! reconnection backoff, socket sessions and the connection manager that
//! ties them together.

pub mod codec;
pub mod connection;
pub mod handshake;
pub mod keepalive;
pub mod messages;
pub mod reconnect;
pub mod session;

pub use codec::{CodecError, FrameCodec};
pub use connection::{ConnectionManager, TransportEvent};
pub use handshake::HandshakeError;
pub use messages::{ClientFrame, SUBPROTOCOL, ServerFrame};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
pub use session::{SessionHandle, SessionMonitor};
