//! Subscription Streams
//!
//! A [`SubscriptionStream`] is a cold, restartable multicast source: it does
//! nothing until a listener attaches, shares one upstream operation among
//! all of its listeners, and can be listened to again after every run ends.
//!
//! Listeners come in two forms:
//!
//! - [`Listener`]: a `futures::Stream` of results, detached on drop
//! - [`DetachHandle`]: callbacks driven by a background task

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use futures::stream::FusedStream;
use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use super::registry::SubscriptionRegistry;
use crate::domain::graphql::{GraphQLRequest, GraphQLResponse};
use crate::domain::subscription::{
    ListenerEvent, ListenerId, StreamId, StreamSpec, SubscriptionError,
};

// =============================================================================
// Subscription Stream
// =============================================================================

/// A GraphQL subscription that any number of listeners can share.
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct SubscriptionStream {
    spec: StreamSpec,
    registry: Arc<SubscriptionRegistry>,
}

impl std::fmt::Debug for SubscriptionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionStream")
            .field("id", &self.spec.id)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl SubscriptionStream {
    pub(crate) const fn new(spec: StreamSpec, registry: Arc<SubscriptionRegistry>) -> Self {
        Self { spec, registry }
    }

    /// Stream identifier.
    #[must_use]
    pub const fn id(&self) -> StreamId {
        self.spec.id
    }

    /// The subscription this stream runs.
    #[must_use]
    pub fn request(&self) -> &GraphQLRequest {
        &self.spec.request
    }

    /// Number of listeners currently attached.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.registry.listener_count(self.spec.id)
    }

    /// Attach a new listener.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn listen(&self) -> Listener {
        let (id, events) = self.registry.attach(&self.spec);

        Listener {
            id,
            stream: self.spec.id,
            registry: Arc::clone(&self.registry),
            events: UnboundedReceiverStream::new(events),
            done: false,
            detached: false,
        }
    }

    /// Attach a callback listener.
    ///
    /// `on_data` runs for every result. Exactly one of `on_error` and
    /// `on_complete` runs when the run ends, unless the listener is detached
    /// first. Dropping the returned handle leaves the listener attached.
    pub fn listen_with<D, E, C>(&self, mut on_data: D, on_error: E, on_complete: C) -> DetachHandle
    where
        D: FnMut(GraphQLResponse) + Send + 'static,
        E: FnOnce(SubscriptionError) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let mut listener = self.listen();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let outcome = loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break None,
                    item = listener.next() => match item {
                        Some(Ok(response)) => on_data(response),
                        Some(Err(error)) => break Some(Err(error)),
                        None => break Some(Ok(())),
                    },
                }
            };

            listener.detach();
            match outcome {
                Some(Ok(())) => on_complete(),
                Some(Err(error)) => on_error(error),
                None => {}
            }
        });

        DetachHandle { cancel, task }
    }
}

// =============================================================================
// Listener
// =============================================================================

/// One attachment to a [`SubscriptionStream`].
///
/// Yields every result pushed while attached. Ends after completion, or
/// after yielding one error. Dropping the listener detaches it.
pub struct Listener {
    id: ListenerId,
    stream: StreamId,
    registry: Arc<SubscriptionRegistry>,
    events: UnboundedReceiverStream<ListenerEvent>,
    done: bool,
    detached: bool,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("stream", &self.stream)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Listener identifier.
    #[must_use]
    pub const fn id(&self) -> ListenerId {
        self.id
    }

    /// Identifier of the stream this listener is attached to.
    #[must_use]
    pub const fn stream_id(&self) -> StreamId {
        self.stream
    }

    /// Detach from the stream. The last listener out stops the operation.
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.detached {
            self.detached = true;
            self.registry.detach(self.stream, self.id);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.release();
    }
}

impl Stream for Listener {
    type Item = Result<GraphQLResponse, SubscriptionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match ready!(self.events.poll_next_unpin(cx)) {
            Some(ListenerEvent::Data(response)) => Poll::Ready(Some(Ok(response))),
            Some(ListenerEvent::Error(error)) => {
                self.done = true;
                Poll::Ready(Some(Err(error)))
            }
            Some(ListenerEvent::Complete) | None => {
                self.done = true;
                Poll::Ready(None)
            }
        }
    }
}

impl FusedStream for Listener {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

// =============================================================================
// Detach Handle
// =============================================================================

/// Handle to a callback listener started by [`SubscriptionStream::listen_with`].
#[derive(Debug)]
pub struct DetachHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DetachHandle {
    /// Detach the listener.
    ///
    /// No callback runs after this returns, and neither `on_error` nor
    /// `on_complete` runs for a listener detached before its run ended.
    pub async fn detach(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Listener callback task failed");
        }
    }

    /// Check if the listener has ended (completed, failed or detached).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

// =============================================================================
// Tests
// =============================================================================
