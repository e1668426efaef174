//! Domain Layer - Connection lifecycle, GraphQL payloads and subscription tracking.
//!
//! Pure state and rules: no sockets, no tasks. The only runtime type used
//! here is the unbounded sender that carries events to a listener.

/// Connection state machine and transport errors.
pub mod connection;

/// GraphQL request and response payloads.
pub mod graphql;

/// Ref-counted subscription table.
pub mod subscription;
