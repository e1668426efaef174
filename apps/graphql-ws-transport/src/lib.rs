#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! GraphQL WS Transport - Subscription Multiplexer
//!
//! A client-side transport that runs GraphQL subscriptions over one shared
//! WebSocket speaking the `graphql-ws` protocol. Each subscription is an
//! independent multicast stream: listeners attach and detach freely, the
//! upstream operation exists exactly while at least one listener is
//! attached, and a drained stream can be started again.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `connection`: Connection state machine and transport errors
//!   - `graphql`: Request and response payloads
//!   - `subscription`: Ref-counted activation table
//!
//! - **Application**: Services and port definitions
//!   - `ports`: `SessionProvider`, how services reach the socket
//!   - `services`: Registry, streams, client facade
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `graphql_ws`: Codec, socket session, handshake, keep-alive, reconnection
//!   - `config`: Client configuration
//!   - `metrics`: Prometheus metrics
//!   - `telemetry`: Tracing setup
//!
//! # Data Flow
//!
//! ```text
//!                   ┌──────────────┐  start/stop  ┌─────────────┐
//! Listener 1 ──┐    │              │─────────────►│   Session   │
//! Listener 2 ──┼───►│   Registry   │              │ writer task │──► WebSocket
//! Listener N ──┘    │              │◄──┐          └─────────────┘
//!                   └──────────────┘   │          ┌─────────────┐
//!                                      └──router──│ reader task │◄── WebSocket
//!                                                 └─────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no external I/O.
pub mod domain;

/// Application layer - Services and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::{ConnectionState, TransportError};
pub use domain::graphql::{GraphQLError, GraphQLRequest, GraphQLResponse};
pub use domain::subscription::{SubscriptionError, SubscriptionStats};

// Client API
pub use application::services::{DetachHandle, GraphQLWsClient, Listener, SubscriptionStream};

// Configuration
pub use infrastructure::config::{ClientConfig, ConfigError, TransportSettings};

// Metrics
pub use infrastructure::metrics::{get_metrics_handle, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
