//! Chaos injection wrapper for [`Connector`].
//!
//! [`ChaosConnector`] wraps any `C: Connector` and injects configurable
//! failures into the connections it opens: random send errors, a hard cut
//! after a number of sends, refused connects, and latency.

use crate::message::Message;
use crate::transport::{Connector, Duplex, MessageSink, TransportError};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Configuration for transport chaos injection.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Probability of a send failing \[0.0, 1.0\].
    pub failure_rate: f64,
    /// Cut every connection once this many sends have gone through,
    /// counted across all connections.
    pub fail_after_sends: Option<usize>,
    /// Refuse new connections.
    pub refuse_connect: bool,
    /// Fixed latency injected before each send.
    pub latency: Duration,
    /// Random additional latency in \[0, jitter\].
    pub jitter: Duration,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            fail_after_sends: None,
            refuse_connect: false,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
struct ChaosState {
    config: RwLock<ChaosConfig>,
    sends: AtomicUsize,
}

impl ChaosState {
    /// Apply chaos checks: returns Err if the send should fail.
    async fn maybe_fail(&self) -> Result<(), TransportError> {
        let (delay, failure_rate, fail_after) = {
            let config = self.config.read().await;
            let jitter_ms = if config.jitter.is_zero() {
                0
            } else {
                rand::thread_rng().gen_range(0..=config.jitter.as_millis() as u64)
            };
            let delay = config.latency + Duration::from_millis(jitter_ms);
            (delay, config.failure_rate, config.fail_after_sends)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(limit) = fail_after {
            if self.sends.load(Ordering::SeqCst) >= limit {
                return Err(TransportError::Failed("chaos: connection cut".into()));
            }
        }

        if failure_rate > 0.0 && rand::thread_rng().gen_bool(failure_rate.min(1.0)) {
            return Err(TransportError::Failed("chaos: random failure".into()));
        }

        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A [`Connector`] wrapper that injects chaos into its connections.
pub struct ChaosConnector<C: Connector> {
    inner: Arc<C>,
    state: Arc<ChaosState>,
}

impl<C: Connector> std::fmt::Debug for ChaosConnector<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosConnector").finish_non_exhaustive()
    }
}

impl<C: Connector> ChaosConnector<C> {
    pub fn new(inner: C, config: ChaosConfig) -> Self {
        Self {
            inner: Arc::new(inner),
            state: Arc::new(ChaosState {
                config: RwLock::new(config),
                sends: AtomicUsize::new(0),
            }),
        }
    }

    /// Dynamically update the random failure rate.
    pub async fn set_failure_rate(&self, rate: f64) {
        self.state.config.write().await.failure_rate = rate;
    }

    /// Cut connections after `sends` more successful sends; `None` heals.
    pub async fn set_fail_after_sends(&self, sends: Option<usize>) {
        let current = self.state.sends.load(Ordering::SeqCst);
        self.state.config.write().await.fail_after_sends = sends.map(|n| current + n);
    }

    pub async fn set_refuse_connect(&self, refuse: bool) {
        self.state.config.write().await.refuse_connect = refuse;
    }

    /// Sends that went through so far.
    pub fn sends(&self) -> usize {
        self.state.sends.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl<C: Connector> Connector for ChaosConnector<C> {
    async fn connect(&self) -> Result<Duplex, TransportError> {
        if self.state.config.read().await.refuse_connect {
            return Err(TransportError::Failed("chaos: connection refused".into()));
        }
        let duplex = self.inner.connect().await?;
        Ok(Duplex {
            sink: Box::new(ChaosSink {
                inner: duplex.sink,
                state: self.state.clone(),
            }),
            source: duplex.source,
        })
    }
}

struct ChaosSink {
    inner: Box<dyn MessageSink>,
    state: Arc<ChaosState>,
}

#[async_trait::async_trait]
impl MessageSink for ChaosSink {
    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        if let Err(e) = self.state.maybe_fail().await {
            // A failed send leaves the connection unusable, as on a real socket.
            let _ = self.inner.close().await;
            return Err(e);
        }
        self.inner.send(message).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}

// ────────────────────────── Tests ──────────────────────────
