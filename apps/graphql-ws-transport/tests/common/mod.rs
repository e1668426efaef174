//! In-process `graphql-ws` server for integration tests.
//!
//! Acknowledges `connection_init`, tracks `start`/`stop` per connection and
//! pushes `messageAdded` results to every started operation on
//! [`TestServer::add_message`]. [`TestServer::shutdown`] drops every socket
//! without a close frame.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_util::sync::CancellationToken;

pub const SUBSCRIPTION: &str = "subscription { messageAdded { content } }";

#[derive(Default)]
struct Counters {
    connections: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    terminates: AtomicUsize,
}

pub struct TestServer {
    addr: SocketAddr,
    counters: Arc<Counters>,
    messages: broadcast::Sender<String>,
    cancel: CancellationToken,
    accept: JoinHandle<()>,
}

impl TestServer {
    /// Start on an ephemeral port.
    pub async fn start() -> Self {
        Self::start_on("127.0.0.1:0".parse().unwrap()).await
    }

    /// Start on a fixed address, e.g. to restart after `shutdown`.
    pub async fn start_on(addr: SocketAddr) -> Self {
        let socket = TcpSocket::new_v4().unwrap();
        socket.set_reuseaddr(true).unwrap();
        socket.bind(addr).unwrap();
        let listener = socket.listen(64).unwrap();
        let addr = listener.local_addr().unwrap();

        let counters = Arc::new(Counters::default());
        let (messages, _) = broadcast::channel(256);
        let cancel = CancellationToken::new();

        let accept = {
            let counters = Arc::clone(&counters);
            let messages = messages.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let stream = tokio::select! {
                        () = cancel.cancelled() => return,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => stream,
                            Err(_) => continue,
                        },
                    };
                    tokio::spawn(serve(
                        stream,
                        Arc::clone(&counters),
                        messages.subscribe(),
                        cancel.clone(),
                    ));
                }
            })
        };

        Self {
            addr,
            counters,
            messages,
            cancel,
            accept,
        }
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}/graphql", self.addr)
    }

    /// Publish a message to every started subscription.
    pub fn add_message(&self, content: &str) {
        let _ = self.messages.send(content.to_string());
    }

    pub fn connections(&self) -> usize {
        self.counters.connections.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.counters.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.counters.stops.load(Ordering::SeqCst)
    }

    pub fn terminates(&self) -> usize {
        self.counters.terminates.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` starts were received.
    pub async fn wait_for_starts(&self, n: usize) {
        self.wait_until(|s| s.starts() >= n).await;
    }

    /// Wait until at least `n` stops were received.
    pub async fn wait_for_stops(&self, n: usize) {
        self.wait_until(|s| s.stops() >= n).await;
    }

    pub async fn wait_until(&self, done: impl Fn(&Self) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done(self) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server condition not reached in time");
    }

    /// Drop every connection without a close frame and stop listening.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.accept.await;
        // Let connection tasks observe the cancellation and drop their sockets
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Accept the `graphql-ws` subprotocol if offered.
#[allow(clippy::result_large_err, clippy::unnecessary_wraps)]
fn negotiate(request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if offered.split(',').any(|p| p.trim() == "graphql-ws") {
        response
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("graphql-ws"));
    }
    Ok(response)
}

async fn serve(
    stream: TcpStream,
    counters: Arc<Counters>,
    mut messages: broadcast::Receiver<String>,
    cancel: CancellationToken,
) {
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, negotiate).await else {
        return;
    };
    counters.connections.fetch_add(1, Ordering::SeqCst);

    let (mut write, mut read) = ws.split();
    let mut started: Vec<String> = Vec::new();
    let mut writable = true;

    loop {
        let outgoing: Vec<Value> = tokio::select! {
            // Abrupt: the socket is dropped without a close frame
            () = cancel.cancelled() => return,
            message = read.next() => {
                let Some(Ok(message)) = message else { return };
                let Message::Text(text) = message else { continue };
                let Ok(frame) = serde_json::from_str::<Value>(&text) else { continue };
                let id = frame["id"].as_str().unwrap_or_default().to_string();

                match frame["type"].as_str() {
                    Some("connection_init") => vec![json!({"type": "connection_ack"})],
                    Some("start") => {
                        counters.starts.fetch_add(1, Ordering::SeqCst);
                        started.push(id);
                        vec![]
                    }
                    Some("stop") => {
                        counters.stops.fetch_add(1, Ordering::SeqCst);
                        started.retain(|op| *op != id);
                        vec![json!({"type": "complete", "id": id})]
                    }
                    Some("connection_terminate") => {
                        counters.terminates.fetch_add(1, Ordering::SeqCst);
                        vec![]
                    }
                    _ => vec![],
                }
            }
            content = messages.recv() => match content {
                Ok(content) => started
                    .iter()
                    .map(|id| json!({
                        "type": "data",
                        "id": id,
                        "payload": {"data": {"messageAdded": {"content": content}}},
                    }))
                    .collect(),
                Err(broadcast::error::RecvError::Lagged(_)) => vec![],
                Err(broadcast::error::RecvError::Closed) => return,
            },
        };

        // Keep reading after a failed write so trailing client frames are counted
        for frame in outgoing {
            if writable && write.send(Message::Text(frame.to_string().into())).await.is_err() {
                writable = false;
            }
        }
    }
}
