//! Subscription Tracking Types
//!
//! Domain types for tracking which logical streams have listeners and which
//! upstream operations must exist on the shared socket.
//!
//! # Design
//!
//! The subscription table tracks:
//! - One activation per stream that currently has listeners
//! - The listener sinks of each activation (the reference count)
//! - The operation id routing inbound frames back to an activation
//! - The session each operation was started on
//!
//! Activation is edge-triggered: the 0→1 listener transition creates an
//! activation with a fresh operation id, the 1→0 transition removes it. A
//! removed activation leaves no trace, so the same stream can be activated
//! again later.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use super::connection::{SessionId, TransportError};
use super::graphql::GraphQLRequest;
use super::graphql::GraphQLResponse;

// =============================================================================
// Types
// =============================================================================

/// Identifier of a subscription stream created by the client.
pub type StreamId = u64;

/// Identifier of one listener attached to a stream.
pub type ListenerId = u64;

/// Wire identifier scoping one active operation on a socket.
pub type OperationId = String;

/// Side-channel callback receiving transport failures.
pub type TransportErrorHandler = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Allocate a fresh operation id.
#[must_use]
pub fn new_operation_id() -> OperationId {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Terminal error delivered to the listeners of a stream.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubscriptionError {
    /// The shared connection failed and could not be recovered.
    #[error("transport failure: {0}")]
    Transport(TransportError),

    /// The server rejected or aborted this operation.
    #[error("operation error: {0}")]
    Operation(serde_json::Value),
}

/// Event pushed to a listener sink.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    /// A result of the subscription.
    Data(GraphQLResponse),
    /// The run ended with an error.
    Error(SubscriptionError),
    /// The run ended gracefully.
    Complete,
}

/// Sending half of a listener's event queue.
pub type Sink = mpsc::UnboundedSender<ListenerEvent>;

// =============================================================================
// Stream Spec
// =============================================================================

/// Immutable description of a stream, copied into its activations.
#[derive(Clone)]
pub struct StreamSpec {
    /// Stream identifier.
    pub id: StreamId,
    /// The subscription to start upstream.
    pub request: Arc<GraphQLRequest>,
    /// Per-stream transport error callback.
    pub on_error: Option<TransportErrorHandler>,
}

impl fmt::Debug for StreamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSpec")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Result of attaching a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    /// First listener: a new activation needs a `start`.
    Activated {
        /// Operation id of the new activation.
        operation_id: OperationId,
    },
    /// Joined an existing activation.
    Joined {
        /// Operation id of the shared activation.
        operation_id: OperationId,
    },
    /// The table is closed; the listener was not attached.
    Closed,
}

/// Result of detaching a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetachOutcome {
    /// The listener was not attached (already detached or run ended).
    NotAttached,
    /// Other listeners remain.
    Left,
    /// Last listener left: the activation was removed.
    Deactivated {
        /// Operation id of the removed activation.
        operation_id: OperationId,
        /// Session a `start` was sent on, if any.
        started_on: Option<SessionId>,
    },
}

/// Result of routing an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to this many listeners.
    Delivered(usize),
    /// No activation uses this operation id.
    Unknown,
    /// The activation was not started on the session the frame came from.
    StaleSession,
}

/// A `start` that needs to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingStart {
    /// Operation id to start.
    pub operation_id: OperationId,
    /// Request to send.
    pub request: Arc<GraphQLRequest>,
}

/// An activation removed by a bulk teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    /// Operation id of the removed activation.
    pub operation_id: OperationId,
    /// Session a `start` was sent on, if any.
    pub started_on: Option<SessionId>,
    /// Number of listeners that were signalled.
    pub listeners: usize,
}

// =============================================================================
// Activation
// =============================================================================

/// Live state of a stream that has at least one listener.
struct Activation {
    operation_id: OperationId,
    spec: StreamSpec,
    listeners: HashMap<ListenerId, Sink>,
    started_on: Option<SessionId>,
}

impl Activation {
    fn broadcast(&self, event: &ListenerEvent) -> usize {
        self.listeners
            .values()
            .filter(|sink| sink.send(event.clone()).is_ok())
            .count()
    }
}

// =============================================================================
// Subscription Table
// =============================================================================

/// Ref-counted activation arena plus the operation id routing index.
///
/// Not synchronized on its own: the registry owns it behind one mutex so no
/// caller can observe a route whose activation has no listeners.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use graphql_ws_transport::domain::graphql::GraphQLRequest;
/// use graphql_ws_transport::domain::subscription::{
///     AttachOutcome, DetachOutcome, StreamSpec, SubscriptionTable,
/// };
///
/// let mut table = SubscriptionTable::new();
/// let spec = StreamSpec {
///     id: 1,
///     request: Arc::new(GraphQLRequest::new("subscription { tick }")),
///     on_error: None,
/// };
///
/// // First listener activates the stream
/// let (tx1, _rx1) = tokio::sync::mpsc::unbounded_channel();
/// assert!(matches!(table.attach(&spec, 10, tx1), AttachOutcome::Activated { .. }));
///
/// // Second listener joins the same operation
/// let (tx2, _rx2) = tokio::sync::mpsc::unbounded_channel();
/// assert!(matches!(table.attach(&spec, 11, tx2), AttachOutcome::Joined { .. }));
///
/// // Still active while one listener remains
/// assert_eq!(table.detach(1, 10), DetachOutcome::Left);
///
/// // Last listener deactivates
/// assert!(matches!(table.detach(1, 11), DetachOutcome::Deactivated { .. }));
/// ```
#[derive(Default)]
pub struct SubscriptionTable {
    activations: HashMap<StreamId, Activation>,
    routes: HashMap<OperationId, StreamId>,
    closed: bool,
}

impl SubscriptionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a listener to a stream.
    pub fn attach(&mut self, spec: &StreamSpec, listener: ListenerId, sink: Sink) -> AttachOutcome {
        if self.closed {
            return AttachOutcome::Closed;
        }

        if let Some(activation) = self.activations.get_mut(&spec.id) {
            activation.listeners.insert(listener, sink);
            return AttachOutcome::Joined {
                operation_id: activation.operation_id.clone(),
            };
        }

        let operation_id = new_operation_id();
        let mut listeners = HashMap::new();
        listeners.insert(listener, sink);

        self.routes.insert(operation_id.clone(), spec.id);
        self.activations.insert(
            spec.id,
            Activation {
                operation_id: operation_id.clone(),
                spec: spec.clone(),
                listeners,
                started_on: None,
            },
        );

        AttachOutcome::Activated { operation_id }
    }

    /// Detach a listener from a stream.
    pub fn detach(&mut self, stream: StreamId, listener: ListenerId) -> DetachOutcome {
        let Some(activation) = self.activations.get_mut(&stream) else {
            return DetachOutcome::NotAttached;
        };

        if activation.listeners.remove(&listener).is_none() {
            return DetachOutcome::NotAttached;
        }

        if !activation.listeners.is_empty() {
            return DetachOutcome::Left;
        }

        // Last listener removed - tear the activation down
        let Some(activation) = self.activations.remove(&stream) else {
            return DetachOutcome::NotAttached;
        };
        self.routes.remove(&activation.operation_id);

        DetachOutcome::Deactivated {
            operation_id: activation.operation_id,
            started_on: activation.started_on,
        }
    }

    /// Claim the initial `start` of an activation on a session.
    ///
    /// Returns the request to send, or `None` if the activation is gone, was
    /// replaced, or was already started. Restarts on a new session go
    /// through `claim_all_starts`.
    pub fn claim_start(
        &mut self,
        stream: StreamId,
        operation_id: &str,
        session: SessionId,
    ) -> Option<PendingStart> {
        let activation = self.activations.get_mut(&stream)?;

        if activation.operation_id != operation_id || activation.started_on.is_some() {
            return None;
        }

        activation.started_on = Some(session);
        Some(PendingStart {
            operation_id: activation.operation_id.clone(),
            request: Arc::clone(&activation.spec.request),
        })
    }

    /// Claim every activation not yet started on `session`.
    pub fn claim_all_starts(&mut self, session: SessionId) -> Vec<PendingStart> {
        self.activations
            .values_mut()
            .filter(|a| a.started_on != Some(session))
            .map(|activation| {
                activation.started_on = Some(session);
                PendingStart {
                    operation_id: activation.operation_id.clone(),
                    request: Arc::clone(&activation.spec.request),
                }
            })
            .collect()
    }

    /// Fan a result out to every listener of an operation.
    pub fn route_data(
        &self,
        session: SessionId,
        operation_id: &str,
        response: GraphQLResponse,
    ) -> RouteOutcome {
        let Some(activation) = self.lookup(operation_id) else {
            return RouteOutcome::Unknown;
        };

        if activation.started_on != Some(session) {
            return RouteOutcome::StaleSession;
        }

        RouteOutcome::Delivered(activation.broadcast(&ListenerEvent::Data(response)))
    }

    /// End the run of an operation.
    ///
    /// Listeners receive `error` if given, completion otherwise. The
    /// activation and its route are removed.
    pub fn finish(
        &mut self,
        session: SessionId,
        operation_id: &str,
        error: Option<SubscriptionError>,
    ) -> RouteOutcome {
        let Some(activation) = self.lookup(operation_id) else {
            return RouteOutcome::Unknown;
        };

        if activation.started_on != Some(session) {
            return RouteOutcome::StaleSession;
        }

        let Some(stream) = self.routes.remove(operation_id) else {
            return RouteOutcome::Unknown;
        };
        let Some(activation) = self.activations.remove(&stream) else {
            return RouteOutcome::Unknown;
        };

        let event = error.map_or(ListenerEvent::Complete, ListenerEvent::Error);
        RouteOutcome::Delivered(activation.broadcast(&event))
    }

    /// Deliver a transport error to every listener and clear the table.
    ///
    /// Returns the error handlers of the removed activations.
    pub fn fail_all(&mut self, error: &TransportError) -> Vec<TransportErrorHandler> {
        let event = ListenerEvent::Error(SubscriptionError::Transport(error.clone()));
        self.routes.clear();

        self.activations
            .drain()
            .filter_map(|(_, activation)| {
                activation.broadcast(&event);
                activation.spec.on_error
            })
            .collect()
    }

    /// Complete every listener, clear the table and refuse further attaches.
    pub fn close(&mut self) -> Vec<Released> {
        self.closed = true;
        self.routes.clear();

        self.activations
            .drain()
            .map(|(_, activation)| Released {
                listeners: activation.broadcast(&ListenerEvent::Complete),
                operation_id: activation.operation_id,
                started_on: activation.started_on,
            })
            .collect()
    }

    /// Error handlers of activations that have not been started anywhere.
    #[must_use]
    pub fn unstarted_handlers(&self) -> Vec<TransportErrorHandler> {
        self.activations
            .values()
            .filter(|a| a.started_on.is_none())
            .filter_map(|a| a.spec.on_error.clone())
            .collect()
    }

    /// Check if the table was closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of listeners attached to a stream.
    #[must_use]
    pub fn listener_count(&self, stream: StreamId) -> usize {
        self.activations
            .get(&stream)
            .map_or(0, |a| a.listeners.len())
    }

    /// Operation id currently used by a stream.
    #[must_use]
    pub fn operation_id(&self, stream: StreamId) -> Option<OperationId> {
        self.activations
            .get(&stream)
            .map(|a| a.operation_id.clone())
    }

    /// Check if a stream's activation has sent its `start` on some session.
    #[must_use]
    pub fn is_started(&self, stream: StreamId) -> bool {
        self.activations
            .get(&stream)
            .is_some_and(|a| a.started_on.is_some())
    }

    /// Check if an operation id is routable.
    #[must_use]
    pub fn is_routable(&self, operation_id: &str) -> bool {
        self.routes.contains_key(operation_id)
    }

    /// Get statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            active_operations: self.activations.len(),
            listeners: self.activations.values().map(|a| a.listeners.len()).sum(),
            started: self
                .activations
                .values()
                .filter(|a| a.started_on.is_some())
                .count(),
        }
    }

    fn lookup(&self, operation_id: &str) -> Option<&Activation> {
        self.routes
            .get(operation_id)
            .and_then(|stream| self.activations.get(stream))
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Subscription table statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Number of live operations.
    pub active_operations: usize,
    /// Number of attached listeners across all operations.
    pub listeners: usize,
    /// Number of operations with a `start` sent on some session.
    pub started: usize,
}

// =============================================================================
// Tests
// =============================================================================
