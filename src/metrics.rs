//! Broker Metrics
//!
//! Prometheus counters and histograms for the marketplace operations, kept
//! in a registry owned by the broker process and exposed on a plain hyper
//! `/metrics` endpoint.

use crate::error::{Error, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Outcome label values
pub const OUTCOME_SUCCESS: &str = "success";
pub const OUTCOME_ERROR: &str = "error";

/// Operation metrics for the broker
pub struct BrokerMetrics {
    registry: Registry,
    operations: IntCounterVec,
    durations: HistogramVec,
}

impl BrokerMetrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new(
                "broker_operations_total",
                "Marketplace operations handled, by outcome",
            ),
            &["operation", "outcome"],
        )
        .map_err(metrics_error)?;

        let durations = HistogramVec::new(
            HistogramOpts::new(
                "broker_operation_duration_seconds",
                "Duration of marketplace operations",
            ),
            &["operation"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(durations.clone()))
            .map_err(metrics_error)?;

        Ok(Arc::new(Self {
            registry,
            operations,
            durations,
        }))
    }

    /// Record one finished operation
    pub fn observe(&self, operation: &str, success: bool, elapsed: Duration) {
        let outcome = if success { OUTCOME_SUCCESS } else { OUTCOME_ERROR };
        self.operations
            .with_label_values(&[operation, outcome])
            .inc();
        self.durations
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    /// Number of recorded operations with the given labels
    pub fn operation_count(&self, operation: &str, outcome: &str) -> u64 {
        self.operations
            .with_label_values(&[operation, outcome])
            .get()
    }

    /// Text exposition of every metric
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn metrics_error(err: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", err))
}

// =============================================================================
// Metrics Server
// =============================================================================

fn metrics_response(metrics: &BrokerMetrics, path: &str) -> Response<Body> {
    let (status, body) = match path {
        "/metrics" => match metrics.render() {
            Ok(text) => (StatusCode::OK, text),
            Err(e) => {
                error!("Failed to render metrics: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        },
        _ => (StatusCode::NOT_FOUND, "not found".to_string()),
    };

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    if status == StatusCode::OK {
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        );
    }
    response
}

/// Serve `/metrics` until the process exits
pub async fn run_metrics_server(addr: SocketAddr, metrics: Arc<BrokerMetrics>) -> Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let response = metrics_response(&metrics, req.uri().path());
                async move { Ok::<_, Infallible>(response) }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
