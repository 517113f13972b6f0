use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use owo_colors::OwoColorize;
use prometheus::{Encoder, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use super::colors::{FG1, FG2};

/// Prometheus counters and histograms produced by the reconciliation
/// engine. Mirrors the shape of the per-controller `ControllerMetrics`
/// the teacher wires into its `reconcile` function, generalized to a
/// single engine-wide struct since there is one make-right loop rather
/// than one controller per resource kind.
pub struct EngineMetrics {
    pub registry: Registry,
    pub reconcile_counter: IntCounterVec,
    pub action_counter: IntCounterVec,
    pub read_histogram: HistogramVec,
    pub write_histogram: HistogramVec,
    pub active_fibers: IntGaugeVec,
}

impl EngineMetrics {
    pub fn new(namespace_label: &str) -> Self {
        let registry = Registry::new();

        let reconcile_counter = IntCounterVec::new(
            prometheus::Opts::new(
                "domain_reconcile_total",
                "Total number of make-right executions per domain",
            )
            .namespace(namespace_label),
            &["domain_uid", "namespace"],
        )
        .unwrap();

        let action_counter = IntCounterVec::new(
            prometheus::Opts::new(
                "domain_action_total",
                "Total number of make-right actions taken, by kind",
            )
            .namespace(namespace_label),
            &["domain_uid", "namespace", "action"],
        )
        .unwrap();

        let read_histogram = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "domain_plan_read_seconds",
                "Time spent computing the make-right decision",
            )
            .namespace(namespace_label),
            &["domain_uid", "namespace", "action"],
        )
        .unwrap();

        let write_histogram = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "domain_plan_write_seconds",
                "Time spent executing a step chain",
            )
            .namespace(namespace_label),
            &["domain_uid", "namespace", "action"],
        )
        .unwrap();

        let active_fibers = IntGaugeVec::new(
            prometheus::Opts::new(
                "domain_active_fibers",
                "Number of currently active fibers per namespace and gate",
            )
            .namespace(namespace_label),
            &["namespace", "gate"],
        )
        .unwrap();

        registry
            .register(Box::new(reconcile_counter.clone()))
            .unwrap();
        registry
            .register(Box::new(action_counter.clone()))
            .unwrap();
        registry
            .register(Box::new(read_histogram.clone()))
            .unwrap();
        registry
            .register(Box::new(write_histogram.clone()))
            .unwrap();
        registry
            .register(Box::new(active_fibers.clone()))
            .unwrap();

        EngineMetrics {
            registry,
            reconcile_counter,
            action_counter,
            read_histogram,
            write_histogram,
            active_fibers,
        }
    }

    fn render(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder.encode(&families, &mut buffer).unwrap();
        buffer
    }
}

/// Serves `/metrics` on `addr` until the process exits. Spawned once at
/// startup and left running regardless of leadership, same as the
/// teacher leaves its metrics server independent of leader election.
pub async fn serve(metrics: Arc<EngineMetrics>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    println!(
        "{}",
        format!("📈 Metrics listening on {}", addr).color(FG1)
    );
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let metrics = metrics.clone();
                async move {
                    let _ = req;
                    let body = metrics.render();
                    Ok::<_, std::convert::Infallible>(Response::new(Full::new(Bytes::from(body))))
                }
            });
            if let Err(err) = Builder::new(hyper_util::rt::TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                eprintln!("{}", format!("metrics connection error: {err}").color(FG2));
            }
        });
    }
}
