//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations behind the application ports: the `graphql-ws`
//! socket adapter, configuration, metrics and tracing setup.

/// `graphql-ws` protocol adapter (codec, socket session, connection manager).
pub mod graphql_ws;

/// Client configuration.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
