//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::crd::SessionState;

lazy_static::lazy_static! {
    /// Total number of reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "backup_agent_reconciliations_total",
        "Total number of reconciliations",
        &["kind"]
    ).unwrap();

    /// Total number of reconciliation errors
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "backup_agent_reconciliation_errors_total",
        "Total number of reconciliation errors",
        &["kind"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "backup_agent_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 60.0, 300.0]
    ).unwrap();

    /// Target state transitions written to session status
    pub static ref STATE_TRANSITIONS: CounterVec = register_counter_vec!(
        "backup_agent_state_transitions_total",
        "Total number of target state transitions",
        &["kind", "from", "to"]
    ).unwrap();

    /// Total number of finished backups
    pub static ref BACKUPS_TOTAL: CounterVec = register_counter_vec!(
        "backup_agent_backups_total",
        "Total number of backups by outcome",
        &["outcome", "namespace", "target"]
    ).unwrap();

    /// Backup duration histogram
    pub static ref BACKUP_DURATION: HistogramVec = register_histogram_vec!(
        "backup_agent_backup_duration_seconds",
        "Duration of backup engine runs",
        &["namespace", "target"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]
    ).unwrap();

    /// Total number of finished restores
    pub static ref RESTORES_TOTAL: CounterVec = register_counter_vec!(
        "backup_agent_restores_total",
        "Total number of restores by outcome",
        &["outcome", "namespace", "target"]
    ).unwrap();

    /// Reconciliations deferred on volume snapshots that are not ready
    pub static ref SNAPSHOTS_PENDING: CounterVec = register_counter_vec!(
        "backup_agent_volume_snapshots_pending_total",
        "Number of times a backup waited for volume snapshots",
        &["namespace"]
    ).unwrap();

    /// Agent health (1 = healthy, 0 = unhealthy)
    pub static ref AGENT_HEALTH: prometheus::Gauge = prometheus::register_gauge!(
        "backup_agent_health",
        "Agent health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Count a state transition
pub fn record_transition(kind: &str, from: SessionState, to: SessionState) {
    STATE_TRANSITIONS
        .with_label_values(&[kind, from.as_str(), to.as_str()])
        .inc();
}

/// Outcome label of a terminal state
pub fn outcome_label(state: SessionState) -> &'static str {
    match state {
        SessionState::Success => "success",
        _ => "failure",
    }
}

/// Start the metrics HTTP server
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    AGENT_HEALTH.set(1.0);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" | "/readyz" => text_response(StatusCode::OK, "ok"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(content_type) = encoder.format_type().parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, content_type);
    }
    response
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}
