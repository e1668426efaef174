//! Keep-Alive Monitor
//!
//! Detects silent socket loss. The monitor asks the session to send a
//! WebSocket ping every interval; any inbound traffic (server `ka`, data,
//! pong) counts as a sign of life. Silence beyond the timeout while a ping is
//! outstanding is reported as a timeout, which the session treats as an
//! abnormal closure.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::TransportSettings;

/// Keep-alive timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// Interval between client pings.
    pub interval: Duration,
    /// Silence tolerated while a ping is outstanding.
    pub timeout: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            timeout: Duration::from_secs(30),
        }
    }
}

impl KeepAliveConfig {
    /// Create configuration from `TransportSettings`.
    #[must_use]
    pub const fn from_settings(settings: &TransportSettings) -> Self {
        Self {
            interval: settings.keepalive_interval,
            timeout: settings.keepalive_timeout,
        }
    }
}

/// Events emitted by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveEvent {
    /// A ping should be sent.
    SendPing,
    /// The peer has been silent too long.
    Timeout(Duration),
}

/// Liveness shared between the monitor and the session reader.
#[derive(Debug)]
pub struct Liveness {
    last_seen: RwLock<Instant>,
    ping_outstanding: AtomicBool,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    /// Create liveness state, counting now as the last sign of life.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_seen: RwLock::new(Instant::now()),
            ping_outstanding: AtomicBool::new(false),
        }
    }

    /// Record inbound traffic of any kind.
    pub fn record_activity(&self) {
        *self.last_seen.write() = Instant::now();
        self.ping_outstanding.store(false, Ordering::SeqCst);
    }

    /// Record that a ping was queued.
    pub fn mark_ping_sent(&self) {
        self.ping_outstanding.store(true, Ordering::SeqCst);
    }

    /// Check if a ping is waiting for any answer.
    #[must_use]
    pub fn is_ping_outstanding(&self) -> bool {
        self.ping_outstanding.load(Ordering::SeqCst)
    }

    /// Time since the last inbound traffic.
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.last_seen.read().elapsed()
    }
}

/// Periodic liveness check for one session.
pub struct KeepAliveMonitor {
    config: KeepAliveConfig,
    liveness: Arc<Liveness>,
    event_tx: mpsc::Sender<KeepAliveEvent>,
    cancel: CancellationToken,
}

impl KeepAliveMonitor {
    /// Create a new monitor.
    #[must_use]
    pub const fn new(
        config: KeepAliveConfig,
        liveness: Arc<Liveness>,
        event_tx: mpsc::Sender<KeepAliveEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            liveness,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the receiver is gone or a timeout is detected.
    pub async fn run(self) {
        let start = tokio::time::Instant::now() + self.config.interval;
        let mut interval = tokio::time::interval_at(start, self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::trace!("Keep-alive monitor cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if !self.tick().await {
                        break;
                    }
                }
            }
        }
    }

    /// Returns `false` when the loop should exit.
    async fn tick(&self) -> bool {
        if self.liveness.is_ping_outstanding() {
            let silence = self.liveness.silence();
            if silence > self.config.timeout {
                tracing::warn!(
                    silence_ms = silence.as_millis(),
                    timeout_ms = self.config.timeout.as_millis(),
                    "Keep-alive timeout"
                );
                let _ = self.event_tx.send(KeepAliveEvent::Timeout(silence)).await;
                return false;
            }
        }

        if self.event_tx.send(KeepAliveEvent::SendPing).await.is_err() {
            tracing::trace!("Keep-alive receiver gone");
            return false;
        }
        self.liveness.mark_ping_sent();
        true
    }
}
