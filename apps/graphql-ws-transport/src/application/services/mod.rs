//! Application Services
//!
//! - `SubscriptionRegistry`: ref-counts listeners and routes inbound frames
//! - `SubscriptionStream` / `Listener`: the multicast stream handed to callers
//! - `GraphQLWsClient`: public facade owning the connection and the router task

pub mod client;
pub mod registry;
pub mod stream;

pub use client::GraphQLWsClient;
pub use registry::SubscriptionRegistry;
pub use stream::{DetachHandle, Listener, SubscriptionStream};
