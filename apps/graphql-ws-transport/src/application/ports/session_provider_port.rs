//! Session Provider Port (Driven Port)
//!
//! Access to the live protocol session. Implemented by the connection
//! manager; mocked in registry tests.

use async_trait::async_trait;

use crate::domain::connection::TransportError;
use crate::infrastructure::graphql_ws::SessionHandle;

/// Source of the shared, handshaken session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Return the live session, connecting or waiting for a connection in
    /// flight if needed.
    async fn ensure_connected(&self) -> Result<SessionHandle, TransportError>;

    /// The live session, without connecting.
    fn current_session(&self) -> Option<SessionHandle>;
}
