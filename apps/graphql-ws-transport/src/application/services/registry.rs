//! Subscription Registry
//!
//! Multiplexes logical subscription streams onto the shared session.
//!
//! The registry owns the [`SubscriptionTable`] behind a single mutex and
//! turns its edge-triggered outcomes into protocol frames: the 0→1 listener
//! transition sends `start`, the 1→0 transition sends `stop`. Inbound
//! `data`, `error` and `complete` frames are routed back to listener sinks.
//!
//! # Locking
//!
//! Frames for an operation are queued on the session while the table lock
//! is held, so a `stop` can never overtake the `start` of the same
//! operation. The registry may call into the session provider under its
//! lock; the provider never calls back into the registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::application::ports::SessionProvider;
use crate::domain::connection::{SessionId, TransportError};
use crate::domain::graphql::GraphQLRequest;
use crate::domain::subscription::{
    AttachOutcome, DetachOutcome, ListenerEvent, ListenerId, OperationId, PendingStart,
    RouteOutcome, StreamId, StreamSpec, SubscriptionError, SubscriptionStats, SubscriptionTable,
    TransportErrorHandler,
};
use crate::infrastructure::graphql_ws::{ClientFrame, ServerFrame, SessionHandle};
use crate::infrastructure::metrics;

/// Routing table between logical streams and upstream operations.
pub struct SubscriptionRegistry {
    table: Mutex<SubscriptionTable>,
    provider: Arc<dyn SessionProvider>,
    next_stream: AtomicU64,
    next_listener: AtomicU64,
}

impl SubscriptionRegistry {
    /// Create an empty registry on top of a session provider.
    #[must_use]
    pub fn new(provider: Arc<dyn SessionProvider>) -> Self {
        Self {
            table: Mutex::new(SubscriptionTable::new()),
            provider,
            next_stream: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Describe a new stream. Nothing is sent until a listener attaches.
    #[must_use]
    pub fn new_stream(
        &self,
        request: GraphQLRequest,
        on_error: Option<TransportErrorHandler>,
    ) -> StreamSpec {
        StreamSpec {
            id: self.next_stream.fetch_add(1, Ordering::Relaxed),
            request: Arc::new(request),
            on_error,
        }
    }

    // =========================================================================
    // Listener Lifecycle
    // =========================================================================

    /// Attach a listener to a stream and return its event queue.
    ///
    /// The first listener activates the stream: `start` is sent immediately
    /// when a session is live, otherwise a task connects first. After
    /// `complete_all` the returned queue yields completion right away.
    ///
    /// Must be called within a Tokio runtime.
    pub fn attach(
        self: &Arc<Self>,
        spec: &StreamSpec,
    ) -> (ListenerId, mpsc::UnboundedReceiver<ListenerEvent>) {
        let listener = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let (sink, events) = mpsc::unbounded_channel();

        let mut table = self.table.lock();
        let outcome = table.attach(spec, listener, sink.clone());
        match outcome {
            AttachOutcome::Closed => {
                drop(table);
                tracing::debug!(stream_id = spec.id, listener, "Attach after dispose");
                let _ = sink.send(ListenerEvent::Complete);
            }
            AttachOutcome::Joined { operation_id } => {
                tracing::debug!(
                    stream_id = spec.id,
                    listener,
                    operation_id = %operation_id,
                    listeners = table.listener_count(spec.id),
                    "Listener joined"
                );

                // Still waiting on a failed connect: this attach retries it
                if !table.is_started(spec.id) {
                    self.start_or_connect(table, spec.id, operation_id);
                }
            }
            AttachOutcome::Activated { operation_id } => {
                tracing::debug!(
                    stream_id = spec.id,
                    listener,
                    operation_id = %operation_id,
                    "Stream activated"
                );
                metrics::set_active_subscriptions(table.stats().active_operations);
                self.start_or_connect(table, spec.id, operation_id);
            }
        }

        (listener, events)
    }

    /// Send `start` on the live session, or connect first in a task.
    fn start_or_connect(
        self: &Arc<Self>,
        mut table: MutexGuard<'_, SubscriptionTable>,
        stream: StreamId,
        operation_id: OperationId,
    ) {
        let live = self.provider.current_session().filter(SessionHandle::is_open);
        if let Some(session) = live {
            if let Some(start) = table.claim_start(stream, &operation_id, session.id()) {
                send_start(&session, start);
            }
        } else {
            drop(table);
            tokio::spawn(Arc::clone(self).activate(stream, operation_id));
        }
    }

    /// Detach a listener. The last listener out sends `stop`.
    ///
    /// Once this returns, nothing more is pushed to the listener's sink.
    pub fn detach(&self, stream: StreamId, listener: ListenerId) {
        let mut table = self.table.lock();
        match table.detach(stream, listener) {
            DetachOutcome::NotAttached => {}
            DetachOutcome::Left => {
                tracing::debug!(stream_id = stream, listener, "Listener left");
            }
            DetachOutcome::Deactivated {
                operation_id,
                started_on,
            } => {
                tracing::debug!(
                    stream_id = stream,
                    listener,
                    operation_id = %operation_id,
                    "Stream deactivated"
                );
                metrics::set_active_subscriptions(table.stats().active_operations);

                let current = self.provider.current_session();
                if let Some(session) = current.filter(|s| Some(s.id()) == started_on) {
                    send_stop(&session, operation_id);
                }
            }
        }
    }

    /// Connect on behalf of a fresh activation, then send its `start`.
    ///
    /// A failed connection leaves the activation pending; the connection
    /// manager reports the failure and the next established session starts
    /// it.
    async fn activate(self: Arc<Self>, stream: StreamId, operation_id: OperationId) {
        let session = match self.provider.ensure_connected().await {
            Ok(session) => session,
            Err(error) => {
                tracing::debug!(
                    stream_id = stream,
                    operation_id = %operation_id,
                    error = %error,
                    "Activation waiting for a connection"
                );
                return;
            }
        };

        let mut table = self.table.lock();
        if let Some(start) = table.claim_start(stream, &operation_id, session.id()) {
            send_start(&session, start);
        }
    }

    // =========================================================================
    // Inbound Routing
    // =========================================================================

    /// Route an inbound frame read from `session`.
    pub fn route(&self, session: SessionId, frame: ServerFrame) {
        let kind = frame.kind();
        let mut table = self.table.lock();

        let (operation_id, outcome) = match frame {
            ServerFrame::Data { id, payload } => {
                let outcome = table.route_data(session, &id, payload);
                (id, outcome)
            }
            ServerFrame::Error { id, payload } => {
                let error = SubscriptionError::Operation(payload);
                let outcome = table.finish(session, &id, Some(error));
                (id, outcome)
            }
            ServerFrame::Complete { id } => {
                let outcome = table.finish(session, &id, None);
                (id, outcome)
            }
            ServerFrame::ConnectionAck { .. }
            | ServerFrame::ConnectionError { .. }
            | ServerFrame::KeepAlive => {
                drop(table);
                tracing::debug!(session_id = session, frame = kind, "Ignoring connection frame");
                return;
            }
        };

        let active = table.stats().active_operations;
        drop(table);

        match outcome {
            RouteOutcome::Delivered(listeners) => {
                tracing::trace!(
                    session_id = session,
                    operation_id = %operation_id,
                    frame = kind,
                    listeners,
                    "Frame routed"
                );
                if kind != "data" {
                    metrics::set_active_subscriptions(active);
                }
            }
            RouteOutcome::Unknown => {
                tracing::debug!(
                    session_id = session,
                    operation_id = %operation_id,
                    frame = kind,
                    "Dropping frame for unknown operation"
                );
                metrics::record_frame_dropped("unknown_operation");
            }
            RouteOutcome::StaleSession => {
                tracing::debug!(
                    session_id = session,
                    operation_id = %operation_id,
                    frame = kind,
                    "Dropping frame from a previous session"
                );
                metrics::record_frame_dropped("stale_session");
            }
        }
    }

    // =========================================================================
    // Connection Events
    // =========================================================================

    /// Start every live activation not yet started on `session`.
    pub fn on_established(&self, session: &SessionHandle) {
        let mut table = self.table.lock();
        let pending = table.claim_all_starts(session.id());
        let count = pending.len();

        for start in pending {
            send_start(session, start);
        }
        drop(table);

        if count > 0 {
            tracing::info!(session_id = session.id(), operations = count, "Subscriptions started");
        }
    }

    /// Report a failed on-demand connection to streams waiting for it.
    ///
    /// Listeners stay attached and receive nothing.
    pub fn connect_failed(&self, error: &TransportError) {
        let handlers = self.table.lock().unstarted_handlers();
        notify(&handlers, error);
    }

    /// Deliver a terminal transport error to every listener.
    pub fn fail_all(&self, error: &TransportError) {
        let handlers = self.table.lock().fail_all(error);
        metrics::set_active_subscriptions(0);

        tracing::warn!(error = %error, "Subscriptions failed");
        notify(&handlers, error);
    }

    /// Complete every listener and refuse further attaches.
    ///
    /// Operations started on `session` get a `stop` queued ahead of the
    /// connection teardown. Returns the number of operations released.
    pub fn complete_all(&self, session: Option<&SessionHandle>) -> usize {
        let released = self.table.lock().close();
        metrics::set_active_subscriptions(0);

        if let Some(session) = session {
            released
                .iter()
                .filter(|r| r.started_on == Some(session.id()))
                .for_each(|r| send_stop(session, r.operation_id.clone()));
        }

        let listeners: usize = released.iter().map(|r| r.listeners).sum();
        tracing::debug!(operations = released.len(), listeners, "Subscriptions completed");
        released.len()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Number of listeners attached to a stream.
    #[must_use]
    pub fn listener_count(&self, stream: StreamId) -> usize {
        self.table.lock().listener_count(stream)
    }

    /// Operation id currently used by a stream.
    #[must_use]
    pub fn operation_id(&self, stream: StreamId) -> Option<OperationId> {
        self.table.lock().operation_id(stream)
    }

    /// Check if `complete_all` has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.table.lock().is_closed()
    }

    /// Get statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        self.table.lock().stats()
    }
}

fn send_start(session: &SessionHandle, start: PendingStart) {
    let operation_id = start.operation_id.clone();
    let request = Arc::unwrap_or_clone(start.request);

    match session.send(ClientFrame::start(start.operation_id, request)) {
        Ok(()) => tracing::debug!(
            session_id = session.id(),
            operation_id = %operation_id,
            "Sent start"
        ),
        // The next established session restarts it
        Err(error) => tracing::debug!(
            session_id = session.id(),
            operation_id = %operation_id,
            error = %error,
            "Start not sent"
        ),
    }
}

fn send_stop(session: &SessionHandle, operation_id: OperationId) {
    if let Err(error) = session.send(ClientFrame::stop(operation_id.clone())) {
        tracing::debug!(
            session_id = session.id(),
            operation_id = %operation_id,
            error = %error,
            "Stop not sent"
        );
    } else {
        tracing::debug!(session_id = session.id(), operation_id = %operation_id, "Sent stop");
    }
}

/// Invoke transport error handlers outside any lock.
pub(crate) fn notify(handlers: &[TransportErrorHandler], error: &TransportError) {
    if handlers.is_empty() {
        return;
    }
    tracing::debug!(handlers = handlers.len(), error = %error, "Invoking transport error handlers");
    for handler in handlers {
        handler(error);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::application::ports::MockSessionProvider;
    use crate::domain::graphql::GraphQLResponse;
    use crate::infrastructure::graphql_ws::session::Outbound;

    const QUERY: &str = "subscription { messageAdded { content } }";

    /// Registry whose provider always hands out one live session.
    fn connected(
        session_id: SessionId,
    ) -> (
        Arc<SubscriptionRegistry>,
        SessionHandle,
        mpsc::UnboundedReceiver<Outbound>,
    ) {
        let (session, outbound) = SessionHandle::detached(session_id);

        let mut provider = MockSessionProvider::new();
        let current = session.clone();
        provider
            .expect_current_session()
            .returning(move || Some(current.clone()));
        let ensured = session.clone();
        provider
            .expect_ensure_connected()
            .returning(move || Ok(ensured.clone()));

        let registry = Arc::new(SubscriptionRegistry::new(Arc::new(provider)));
        (registry, session, outbound)
    }

    /// Registry whose provider has no session and cannot connect.
    fn disconnected() -> Arc<SubscriptionRegistry> {
        let mut provider = MockSessionProvider::new();
        provider.expect_current_session().returning(|| None);
        provider
            .expect_ensure_connected()
            .returning(|| Err(TransportError::ConnectionFailed("refused".to_string())));
        Arc::new(SubscriptionRegistry::new(Arc::new(provider)))
    }

    fn stream(registry: &SubscriptionRegistry) -> StreamSpec {
        registry.new_stream(GraphQLRequest::new(QUERY), None)
    }

    fn drain(outbound: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<ClientFrame> {
        std::iter::from_fn(|| outbound.try_recv().ok())
            .filter_map(|item| match item {
                Outbound::Frame(frame) => Some(frame),
                _ => None,
            })
            .collect()
    }

    fn count(frames: &[ClientFrame], kind: &str) -> usize {
        frames.iter().filter(|f| f.kind() == kind).count()
    }

    fn message(content: &str) -> GraphQLResponse {
        GraphQLResponse {
            data: Some(json!({"messageAdded": {"content": content}})),
            ..GraphQLResponse::default()
        }
    }

    fn data_frame(id: &str, content: &str) -> ServerFrame {
        ServerFrame::Data {
            id: id.to_string(),
            payload: message(content),
        }
    }

    async fn wait_for_count(counter: &AtomicUsize, n: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while counter.load(Ordering::SeqCst) < n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("count not reached in time");
    }

    fn counting_handler() -> (TransportErrorHandler, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler: TransportErrorHandler = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (handler, calls)
    }

    #[tokio::test]
    async fn first_listener_sends_start() {
        let (registry, _session, mut outbound) = connected(1);
        let spec = stream(&registry);

        let (_listener, _events) = registry.attach(&spec);

        let frames = drain(&mut outbound);
        assert_eq!(frames.len(), 1);
        let op = registry.operation_id(spec.id).unwrap();
        assert_eq!(frames[0], ClientFrame::start(op, GraphQLRequest::new(QUERY)));
    }

    #[tokio::test]
    async fn shared_stream_starts_once_and_stops_once() {
        let (registry, _session, mut outbound) = connected(1);
        let spec = stream(&registry);

        let (a, _ea) = registry.attach(&spec);
        let (b, _eb) = registry.attach(&spec);
        registry.detach(spec.id, a);
        assert_eq!(count(&drain(&mut outbound), "stop"), 0);

        registry.detach(spec.id, b);

        let frames = drain(&mut outbound);
        assert_eq!(count(&frames, "stop"), 1);
        assert_eq!(registry.listener_count(spec.id), 0);
    }

    #[tokio::test]
    async fn reattach_after_drain_uses_new_operation() {
        let (registry, _session, mut outbound) = connected(1);
        let spec = stream(&registry);

        let (a, _ea) = registry.attach(&spec);
        let first = registry.operation_id(spec.id).unwrap();
        registry.detach(spec.id, a);
        let (_b, _eb) = registry.attach(&spec);
        let second = registry.operation_id(spec.id).unwrap();

        assert_ne!(first, second);
        let frames = drain(&mut outbound);
        assert_eq!(
            frames.iter().map(ClientFrame::kind).collect::<Vec<_>>(),
            ["start", "stop", "start"]
        );
    }

    #[tokio::test]
    async fn data_multicasts_to_attached_listeners_only() {
        let (registry, _session, _outbound) = connected(1);
        let spec = stream(&registry);
        let (a, mut ea) = registry.attach(&spec);
        let (_b, mut eb) = registry.attach(&spec);
        let op = registry.operation_id(spec.id).unwrap();

        registry.route(1, data_frame(&op, "Hello World"));
        registry.detach(spec.id, a);
        registry.route(1, data_frame(&op, "lorem ipsum"));

        assert_eq!(ea.try_recv().unwrap(), ListenerEvent::Data(message("Hello World")));
        assert!(ea.try_recv().is_err());
        assert_eq!(eb.try_recv().unwrap(), ListenerEvent::Data(message("Hello World")));
        assert_eq!(eb.try_recv().unwrap(), ListenerEvent::Data(message("lorem ipsum")));
    }

    #[tokio::test]
    async fn frames_for_unknown_or_stale_operations_are_dropped() {
        let (registry, _session, _outbound) = connected(2);
        let spec = stream(&registry);
        let (_a, mut events) = registry.attach(&spec);
        let op = registry.operation_id(spec.id).unwrap();

        registry.route(2, data_frame("unknown", "x"));
        registry.route(1, data_frame(&op, "stale"));

        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn complete_frame_ends_run_and_allows_restart() {
        let (registry, _session, mut outbound) = connected(1);
        let spec = stream(&registry);
        let (a, mut events) = registry.attach(&spec);
        let op = registry.operation_id(spec.id).unwrap();

        registry.route(1, ServerFrame::Complete { id: op.clone() });

        assert_eq!(events.try_recv().unwrap(), ListenerEvent::Complete);
        assert!(registry.operation_id(spec.id).is_none());

        // Late detach of the ended listener sends nothing
        registry.detach(spec.id, a);
        assert_eq!(count(&drain(&mut outbound), "stop"), 0);

        let (_b, _eb) = registry.attach(&spec);
        assert_eq!(count(&drain(&mut outbound), "start"), 1);
    }

    #[tokio::test]
    async fn error_frame_reaches_only_its_operation() {
        let (registry, _session, _outbound) = connected(1);
        let failing = stream(&registry);
        let healthy = stream(&registry);
        let (_a, mut ea) = registry.attach(&failing);
        let (_b, mut eb) = registry.attach(&healthy);
        let op = registry.operation_id(failing.id).unwrap();

        let payload = json!([{"message": "unknown field"}]);
        registry.route(1, ServerFrame::Error { id: op, payload: payload.clone() });

        assert_eq!(
            ea.try_recv().unwrap(),
            ListenerEvent::Error(SubscriptionError::Operation(payload))
        );
        assert!(eb.try_recv().is_err());
        assert_eq!(registry.stats().active_operations, 1);
    }

    #[tokio::test]
    async fn connection_frames_are_ignored() {
        let (registry, _session, _outbound) = connected(1);
        let spec = stream(&registry);
        let (_a, mut events) = registry.attach(&spec);

        registry.route(1, ServerFrame::KeepAlive);
        registry.route(1, ServerFrame::ConnectionAck { payload: None });

        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn activation_without_session_connects_first() {
        let (session, mut outbound) = SessionHandle::detached(3);
        let mut provider = MockSessionProvider::new();
        provider.expect_current_session().returning(|| None);
        provider
            .expect_ensure_connected()
            .times(1)
            .returning(move || Ok(session.clone()));
        let registry = Arc::new(SubscriptionRegistry::new(Arc::new(provider)));
        let spec = stream(&registry);

        let (_a, _events) = registry.attach(&spec);

        let item = tokio::time::timeout(Duration::from_secs(1), outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(item, Outbound::Frame(ClientFrame::Start { .. })));
    }

    #[tokio::test]
    async fn connect_failure_notifies_and_resumes_on_next_session() {
        let registry = disconnected();
        let (handler, calls) = counting_handler();
        let spec = registry.new_stream(GraphQLRequest::new(QUERY), Some(handler));

        let (_a, mut events) = registry.attach(&spec);
        tokio::task::yield_now().await;
        registry.connect_failed(&TransportError::ConnectionFailed("refused".to_string()));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(events.try_recv().is_err());
        assert_eq!(registry.listener_count(spec.id), 1);

        let (session, mut outbound) = SessionHandle::detached(9);
        registry.on_established(&session);

        let frames = drain(&mut outbound);
        assert_eq!(count(&frames, "start"), 1);
    }

    #[tokio::test]
    async fn joining_listener_retries_failed_connect() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let mut provider = MockSessionProvider::new();
        provider.expect_current_session().returning(|| None);
        provider.expect_ensure_connected().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::ConnectionFailed("refused".to_string()))
        });
        let registry = Arc::new(SubscriptionRegistry::new(Arc::new(provider)));
        let spec = stream(&registry);

        let (_a, _ea) = registry.attach(&spec);
        wait_for_count(&attempts, 1).await;
        registry.connect_failed(&TransportError::ConnectionFailed("refused".to_string()));

        let (_b, _eb) = registry.attach(&spec);
        wait_for_count(&attempts, 2).await;

        // Same pending operation, both listeners still attached
        assert_eq!(registry.listener_count(spec.id), 2);
        assert_eq!(registry.stats().started, 0);
    }

    #[tokio::test]
    async fn joining_listener_starts_pending_operation_on_live_session() {
        let (session, mut outbound) = SessionHandle::detached(5);
        let live = Arc::new(parking_lot::Mutex::new(None::<SessionHandle>));
        let current = Arc::clone(&live);
        let mut provider = MockSessionProvider::new();
        provider
            .expect_current_session()
            .returning(move || current.lock().clone());
        provider
            .expect_ensure_connected()
            .returning(|| Err(TransportError::ConnectionFailed("refused".to_string())));
        let registry = Arc::new(SubscriptionRegistry::new(Arc::new(provider)));
        let spec = stream(&registry);

        let (_a, _ea) = registry.attach(&spec);
        tokio::task::yield_now().await;
        *live.lock() = Some(session);

        let (_b, _eb) = registry.attach(&spec);
        let (_c, _ec) = registry.attach(&spec);

        assert_eq!(count(&drain(&mut outbound), "start"), 1);
        assert_eq!(registry.stats().started, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_attach_detach_shares_one_operation() {
        const WORKERS: usize = 8;
        const ROUNDS: usize = 200;

        let (registry, _session, mut outbound) = connected(1);
        let spec = stream(&registry);
        let stop = tokio_util::sync::CancellationToken::new();

        let router = {
            let registry = Arc::clone(&registry);
            let stop = stop.clone();
            let stream_id = spec.id;
            tokio::spawn(async move {
                let mut routed = 0usize;
                while !stop.is_cancelled() {
                    if let Some(op) = registry.operation_id(stream_id) {
                        registry.route(1, data_frame(&op, "tick"));
                        routed += 1;
                    }
                    tokio::task::yield_now().await;
                }
                routed
            })
        };

        let workers: Vec<_> = (0..WORKERS)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let spec = spec.clone();
                tokio::spawn(async move {
                    for _ in 0..ROUNDS {
                        let (listener, mut events) = registry.attach(&spec);
                        tokio::task::yield_now().await;
                        registry.detach(spec.id, listener);

                        // Whatever was queued before detach, then the sink is gone
                        while let Ok(event) = events.try_recv() {
                            assert_eq!(event, ListenerEvent::Data(message("tick")));
                        }
                        assert_eq!(
                            events.try_recv(),
                            Err(mpsc::error::TryRecvError::Disconnected)
                        );
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.await.unwrap();
        }
        stop.cancel();
        router.await.unwrap();

        let frames = drain(&mut outbound);
        assert!(!frames.is_empty());
        assert_eq!(frames.len() % 2, 0);

        // Strictly alternating start/stop pairs, one fresh operation per pair
        let mut seen = std::collections::HashSet::new();
        for pair in frames.chunks(2) {
            let (ClientFrame::Start { id: started, .. }, ClientFrame::Stop { id: stopped }) =
                (&pair[0], &pair[1])
            else {
                panic!("expected start then stop, got {pair:?}");
            };
            assert_eq!(started, stopped);
            assert!(seen.insert(started.clone()), "operation {started} started twice");
        }
        assert_eq!(registry.listener_count(spec.id), 0);
        assert_eq!(registry.stats(), SubscriptionStats::default());
    }

    #[tokio::test]
    async fn established_session_restarts_live_operations() {
        let (registry, _session, mut outbound) = connected(1);
        let spec = stream(&registry);
        let (_a, _events) = registry.attach(&spec);
        drain(&mut outbound);

        let (resumed, mut resumed_outbound) = SessionHandle::detached(2);
        registry.on_established(&resumed);
        registry.on_established(&resumed);

        assert_eq!(count(&drain(&mut resumed_outbound), "start"), 1);
    }

    #[tokio::test]
    async fn fail_all_delivers_transport_error_and_invokes_handlers() {
        let (registry, _session, _outbound) = connected(1);
        let (handler, calls) = counting_handler();
        let spec = registry.new_stream(GraphQLRequest::new(QUERY), Some(handler));
        let (_a, mut ea) = registry.attach(&spec);
        let (_b, mut eb) = registry.attach(&spec);

        let error = TransportError::KeepAliveTimeout(Duration::from_secs(30));
        registry.fail_all(&error);

        let expected = ListenerEvent::Error(SubscriptionError::Transport(error));
        assert_eq!(ea.try_recv().unwrap(), expected);
        assert_eq!(eb.try_recv().unwrap(), expected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.stats(), SubscriptionStats::default());
    }

    #[tokio::test]
    async fn complete_all_completes_stops_and_closes() {
        let (registry, session, mut outbound) = connected(1);
        let (handler, calls) = counting_handler();
        let first = registry.new_stream(GraphQLRequest::new(QUERY), Some(handler));
        let second = stream(&registry);
        let (_a, mut ea) = registry.attach(&first);
        let (_b, mut eb) = registry.attach(&second);
        drain(&mut outbound);

        assert_eq!(registry.complete_all(Some(&session)), 2);

        assert_eq!(ea.try_recv().unwrap(), ListenerEvent::Complete);
        assert_eq!(eb.try_recv().unwrap(), ListenerEvent::Complete);
        assert_eq!(count(&drain(&mut outbound), "stop"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(registry.is_closed());

        // Late attach completes immediately without a start
        let (_c, mut ec) = registry.attach(&second);
        assert_eq!(ec.try_recv().unwrap(), ListenerEvent::Complete);
        assert!(drain(&mut outbound).is_empty());
    }

    proptest! {
        #[test]
        fn start_and_stop_follow_listener_edges(ops in prop::collection::vec(any::<bool>(), 1..64)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let _guard = runtime.enter();

            let (registry, _session, mut outbound) = connected(1);
            let spec = stream(&registry);
            let mut attached: Vec<(ListenerId, mpsc::UnboundedReceiver<ListenerEvent>)> = Vec::new();
            let (mut rises, mut falls) = (0, 0);

            for attach in ops {
                if attach {
                    if attached.is_empty() {
                        rises += 1;
                    }
                    attached.push(registry.attach(&spec));
                } else if !attached.is_empty() {
                    let (listener, _events) = attached.remove(0);
                    registry.detach(spec.id, listener);
                    if attached.is_empty() {
                        falls += 1;
                    }
                }
                prop_assert_eq!(registry.listener_count(spec.id), attached.len());
            }

            let frames = drain(&mut outbound);
            prop_assert_eq!(count(&frames, "start"), rises);
            prop_assert_eq!(count(&frames, "stop"), falls);
        }
    }
}
