//! Application Layer - Use cases and port definitions.
//!
//! Services that turn the shared socket into independent subscription
//! streams, and the port through which they reach the socket.

/// Port interfaces for external systems.
pub mod ports;

/// Registry, stream and client services.
pub mod services;
