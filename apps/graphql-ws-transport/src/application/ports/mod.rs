//! Application Ports
//!
//! Interfaces the application services depend on.
//! - **Driven Ports** (Secondary/Outbound): how the registry reaches the
//!   shared socket without owning the connection lifecycle

mod session_provider_port;

pub use session_provider_port::SessionProvider;

#[cfg(test)]
pub use session_provider_port::MockSessionProvider;
