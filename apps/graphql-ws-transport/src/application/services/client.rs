//! GraphQL WS Client
//!
//! Public entry point. Owns the connection manager, the subscription
//! registry and the router task that drains transport events into the
//! registry in arrival order.
//!
//! # Error channels
//!
//! - Operation errors reach only the listeners of that operation.
//! - Connection failures reach the side callbacks registered with
//!   [`GraphQLWsClient::on_transport_error`] and per stream.
//! - Unrecovered connection loss additionally ends every listener with
//!   `SubscriptionError::Transport`.
//! - `dispose` completes every listener and invokes no callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::registry::{SubscriptionRegistry, notify};
use super::stream::SubscriptionStream;
use crate::domain::connection::{ConnectionState, TransportError};
use crate::domain::graphql::GraphQLRequest;
use crate::domain::subscription::{SubscriptionStats, TransportErrorHandler};
use crate::infrastructure::config::ClientConfig;
use crate::infrastructure::graphql_ws::{ConnectionManager, TransportEvent};

type Handlers = Arc<RwLock<Vec<TransportErrorHandler>>>;

struct ClientInner {
    config: ClientConfig,
    manager: ConnectionManager,
    registry: Arc<SubscriptionRegistry>,
    handlers: Handlers,
    router_cancel: CancellationToken,
    router: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ClientInner {
    /// Stop everything without waiting. Returns `false` if already done.
    fn teardown(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let session = self.manager.shutdown();
        let released = self.registry.complete_all(session.as_ref());
        if let Some(session) = &session {
            ConnectionManager::terminate(session);
        }
        self.router_cancel.cancel();

        tracing::info!(operations = released, "Client disposed");
        true
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Client running GraphQL subscriptions over one shared `graphql-ws` socket.
///
/// Cloning yields another handle to the same client. The connection is
/// opened lazily by the first listener and torn down by [`dispose`], or
/// when the last handle is dropped.
///
/// [`dispose`]: GraphQLWsClient::dispose
///
/// # Example
///
/// ```rust,no_run
/// use futures::StreamExt;
/// use graphql_ws_transport::{ClientConfig, GraphQLRequest, GraphQLWsClient};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let client = GraphQLWsClient::new(ClientConfig::new("ws://localhost:4000/graphql")?);
/// let stream = client.create_subscription_stream(GraphQLRequest::new(
///     "subscription { messageAdded { content } }",
/// ));
///
/// let mut listener = stream.listen();
/// while let Some(result) = listener.next().await {
///     println!("{:?}", result?.data);
/// }
///
/// client.dispose().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct GraphQLWsClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for GraphQLWsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphQLWsClient")
            .field("url", &self.inner.config.url())
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

impl GraphQLWsClient {
    /// Create a client. No socket is opened until a listener attaches.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(&config, events_tx);
        let registry = Arc::new(SubscriptionRegistry::new(Arc::new(manager.clone())));
        let handlers: Handlers = Arc::default();
        let router_cancel = CancellationToken::new();

        let router = tokio::spawn(route_events(
            events_rx,
            Arc::clone(&registry),
            Arc::clone(&handlers),
            router_cancel.clone(),
        ));

        tracing::debug!(url = config.url(), "Client created");

        Self {
            inner: Arc::new(ClientInner {
                config,
                manager,
                registry,
                handlers,
                router_cancel,
                router: Mutex::new(Some(router)),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a stream for a subscription. Nothing is sent until a listener
    /// attaches.
    #[must_use]
    pub fn create_subscription_stream(&self, request: GraphQLRequest) -> SubscriptionStream {
        self.stream(request, None)
    }

    /// Create a stream whose connection failures are also reported to
    /// `on_transport_error`.
    #[must_use]
    pub fn create_subscription_stream_with_handler<F>(
        &self,
        request: GraphQLRequest,
        on_transport_error: F,
    ) -> SubscriptionStream
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        self.stream(request, Some(Arc::new(on_transport_error)))
    }

    fn stream(
        &self,
        request: GraphQLRequest,
        on_error: Option<TransportErrorHandler>,
    ) -> SubscriptionStream {
        let spec = self.inner.registry.new_stream(request, on_error);
        tracing::debug!(stream_id = spec.id, "Subscription stream created");
        SubscriptionStream::new(spec, Arc::clone(&self.inner.registry))
    }

    /// Register a client-wide callback for connection failures.
    ///
    /// Invoked for failed connection attempts and for unrecovered connection
    /// loss, never for graceful shutdown.
    pub fn on_transport_error<F>(&self, handler: F)
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        self.inner.handlers.write().push(Arc::new(handler));
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.manager.state()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.manager.state_changes()
    }

    /// Client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Subscription statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        self.inner.registry.stats()
    }

    /// Check if the client was disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Shut the client down gracefully.
    ///
    /// Every listener completes, `stop` and `connection_terminate` are queued
    /// ahead of a normal close, and no error callback is invoked. Later
    /// listeners complete immediately. Calling it again does nothing.
    pub async fn dispose(&self) {
        if !self.inner.teardown() {
            return;
        }

        let router = self.inner.router.lock().take();
        if let Some(router) = router
            && let Err(e) = router.await
        {
            tracing::warn!(error = %e, "Router task failed");
        }
    }
}

/// Drain transport events into the registry, one at a time.
async fn route_events(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    registry: Arc<SubscriptionRegistry>,
    handlers: Handlers,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            TransportEvent::Established(session) => registry.on_established(&session),
            TransportEvent::Frame { session, frame } => registry.route(session, frame),
            TransportEvent::ConnectFailed(error) => {
                registry.connect_failed(&error);
                notify_client(&handlers, &error);
            }
            TransportEvent::Faulted(error) => {
                registry.fail_all(&error);
                notify_client(&handlers, &error);
            }
        }
    }

    tracing::debug!("Router stopped");
}

fn notify_client(handlers: &Handlers, error: &TransportError) {
    // Snapshot so a handler may register another handler
    let snapshot = handlers.read().clone();
    notify(&snapshot, error);
}
