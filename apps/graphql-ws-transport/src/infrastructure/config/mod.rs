//! Configuration Module
//!
//! Endpoint and transport settings for the subscription client.

mod settings;

pub use settings::{ClientConfig, ConfigError, TransportSettings};
