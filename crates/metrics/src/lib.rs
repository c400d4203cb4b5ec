//! Metrics and tracing setup for mergebox.
//!
//! Provides a global [`NodeMetrics`] singleton backed by the `prometheus`
//! crate, plus an optional lightweight HTTP server for Prometheus scraping.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

/// Global metrics instance.
static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for a mergebox node.
pub struct NodeMetrics {
    pub registry: Registry,

    // ── Wire messages ──
    pub messages_sent_by_type: IntCounterVec,
    pub messages_received_by_type: IntCounterVec,

    // ── Batches ──
    pub batches_sent: IntCounter,
    pub batches_received: IntCounter,
    pub batch_retries: IntCounter,

    // ── Merge outcomes ──
    pub documents_merged: IntCounter,
    pub documents_discarded: IntCounter,
    pub entries_rejected: IntCounter,
    pub resurrections: IntCounter,
    pub merge_latency_secs: Histogram,

    // ── Tombstones ──
    pub tombstones_collected: IntCounter,

    // ── Indexes ──
    pub index_writes: IntCounterVec,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for merge latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help)).expect("counter opts")
}

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let messages_sent_by_type = IntCounterVec::new(
            Opts::new(
                "mergebox_messages_sent_total",
                "Outbound replication messages, by type",
            ),
            &["message_type"],
        )
        .expect("messages_sent_by_type counter vec");
        let messages_received_by_type = IntCounterVec::new(
            Opts::new(
                "mergebox_messages_received_total",
                "Inbound replication messages, by type",
            ),
            &["message_type"],
        )
        .expect("messages_received_by_type counter vec");

        let batches_sent = counter("mergebox_batches_sent_total", "Batch chunks sent");
        let batches_received = counter("mergebox_batches_received_total", "Batch chunks merged");
        let batch_retries = counter(
            "mergebox_batch_retries_total",
            "Batch chunks resent after an ack timeout or checksum mismatch",
        );

        let documents_merged = counter(
            "mergebox_documents_merged_total",
            "Incoming documents and tombstones applied locally",
        );
        let documents_discarded = counter(
            "mergebox_documents_discarded_total",
            "Incoming entries that lost the last-write-wins comparison",
        );
        let entries_rejected = counter(
            "mergebox_entries_rejected_total",
            "Malformed incoming entries skipped during merge",
        );
        let resurrections = counter(
            "mergebox_resurrections_total",
            "Tombstoned documents brought back by a later write",
        );
        let merge_latency_secs = Histogram::with_opts(
            HistogramOpts::new("mergebox_merge_latency_seconds", "Batch merge latency in seconds")
                .buckets(LATENCY_BUCKETS.to_vec()),
        )
        .expect("merge_latency_secs histogram");

        let tombstones_collected = counter(
            "mergebox_tombstones_collected_total",
            "Expired tombstones removed by garbage collection",
        );

        let index_writes = IntCounterVec::new(
            Opts::new("mergebox_index_writes_total", "Index mutations, by indexer"),
            &["indexer"],
        )
        .expect("index_writes counter vec");

        // Register all metrics
        registry
            .register(Box::new(messages_sent_by_type.clone()))
            .expect("register messages_sent_by_type");
        registry
            .register(Box::new(messages_received_by_type.clone()))
            .expect("register messages_received_by_type");
        registry
            .register(Box::new(batches_sent.clone()))
            .expect("register batches_sent");
        registry
            .register(Box::new(batches_received.clone()))
            .expect("register batches_received");
        registry
            .register(Box::new(batch_retries.clone()))
            .expect("register batch_retries");
        registry
            .register(Box::new(documents_merged.clone()))
            .expect("register documents_merged");
        registry
            .register(Box::new(documents_discarded.clone()))
            .expect("register documents_discarded");
        registry
            .register(Box::new(entries_rejected.clone()))
            .expect("register entries_rejected");
        registry
            .register(Box::new(resurrections.clone()))
            .expect("register resurrections");
        registry
            .register(Box::new(merge_latency_secs.clone()))
            .expect("register merge_latency_secs");
        registry
            .register(Box::new(tombstones_collected.clone()))
            .expect("register tombstones_collected");
        registry
            .register(Box::new(index_writes.clone()))
            .expect("register index_writes");

        Self {
            registry,
            messages_sent_by_type,
            messages_received_by_type,
            batches_sent,
            batches_received,
            batch_retries,
            documents_merged,
            documents_discarded,
            entries_rejected,
            resurrections,
            merge_latency_secs,
            tombstones_collected,
            index_writes,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

/// Helper: start a merge latency timer. Returns a guard that records
/// elapsed time on drop.
pub fn start_merge_timer() -> prometheus::HistogramTimer {
    metrics().merge_latency_secs.start_timer()
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    if req.uri().path() != "/metrics" {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found")))
            .expect("valid HTTP response"));
    }
    let body = encode_metrics();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .expect("valid HTTP response"))
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// This spawns a lightweight HTTP/1.1 server. Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init_and_increment() {
        let m = metrics();

        let before = m.batches_sent.get();
        m.batches_sent.inc();
        m.batches_sent.inc();
        assert_eq!(m.batches_sent.get(), before + 2);

        let before = m
            .messages_sent_by_type
            .with_label_values(&["connect"])
            .get();
        m.messages_sent_by_type.with_label_values(&["connect"]).inc();
        m.messages_sent_by_type
            .with_label_values(&["batch_ack"])
            .inc();
        assert_eq!(
            m.messages_sent_by_type
                .with_label_values(&["connect"])
                .get(),
            before + 1
        );
    }

    #[test]
    fn test_encode_metrics_format() {
        metrics().tombstones_collected.inc();
        metrics().index_writes.with_label_values(&["range"]).inc();

        let output = encode_metrics();
        assert!(output.contains("mergebox_tombstones_collected_total"));
        assert!(output.contains("mergebox_index_writes_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_merge_timer_records() {
        let before = metrics().merge_latency_secs.get_sample_count();
        {
            let _timer = start_merge_timer();
        }
        assert!(metrics().merge_latency_secs.get_sample_count() > before);
    }
}
