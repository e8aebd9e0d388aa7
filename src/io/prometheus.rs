//! Prometheus metrics HTTP endpoint
//!
//! Exposes gate metrics in Prometheus text format at /metrics and a
//! liveness check at /health. Uses hyper for the HTTP server.

use crate::domain::types::AuthorizationOutcome;
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_plate_metrics(&mut output, site_id, &summary);
    write_authorization_metrics(&mut output, site_id, &summary);
    write_gate_metrics(&mut output, site_id, &summary);

    output
}

fn write_plate_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "gate_plates_received_total",
        "Plate recognitions submitted to the supervisor",
        MetricType::Counter,
        site,
        summary.plates_received,
    );
    write_metric(
        output,
        "gate_plates_rejected_total",
        "Plates rejected by validation",
        MetricType::Counter,
        site,
        summary.plates_rejected,
    );
    write_metric(
        output,
        "gate_plates_dropped_busy_total",
        "Plates dropped because a cycle was in progress",
        MetricType::Counter,
        site,
        summary.plates_dropped_busy,
    );
}

fn write_authorization_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    let name = "gate_authorizations_total";
    let _ = writeln!(output, "# HELP {name} Authorization outcomes by kind");
    let _ = writeln!(output, "# TYPE {name} counter");
    for outcome in AuthorizationOutcome::ALL {
        let _ = writeln!(
            output,
            "{name}{{site=\"{site}\",outcome=\"{}\"}} {}",
            outcome.as_str(),
            summary.outcome(outcome)
        );
    }

    write_histogram(
        output,
        "gate_authorization_latency_ms",
        "Plate to decision latency in milliseconds",
        site,
        &summary.auth_latency_buckets,
        summary.auth_latency_sum_ms,
    );
    write_metric(
        output,
        "gate_authorization_latency_p99_ms",
        "99th percentile authorization latency",
        MetricType::Gauge,
        site,
        summary.auth_latency_p99_ms,
    );
    write_metric(
        output,
        "gate_authorization_latency_max_ms",
        "Maximum authorization latency since last scrape",
        MetricType::Gauge,
        site,
        summary.auth_latency_max_ms,
    );
}

fn write_gate_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "gate_cycles_total",
        "Completed open/close cycles",
        MetricType::Counter,
        site,
        summary.gate_cycles_total,
    );
    write_metric(
        output,
        "gate_state",
        "Gate state (0=closed, 1=awaiting, 2=moving, 3=open)",
        MetricType::Gauge,
        site,
        summary.gate_state,
    );
    write_metric(
        output,
        "gate_decisions_dropped_total",
        "Decision records dropped by egress",
        MetricType::Counter,
        site,
        summary.decisions_dropped,
    );
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &site_id);
            let mut response = text_response(StatusCode::OK, body);
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            Ok(response)
        }
        (&Method::GET, "/health") => Ok(text_response(StatusCode::OK, "ok")),
        _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                handle_request(req, metrics.clone(), site_id.clone())
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::GateState;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();

        metrics.record_plate_received();
        metrics.record_plate_received();
        metrics.record_plate_rejected();
        metrics.record_authorization(AuthorizationOutcome::Authorized, 40);
        metrics.record_authorization(AuthorizationOutcome::Timeout, 2000);
        metrics.record_gate_cycle();
        metrics.set_gate_state(GateState::Open);

        let output = format_prometheus_metrics(&metrics, "lot-a");

        assert!(output.contains("gate_plates_received_total{site=\"lot-a\"} 2"));
        assert!(output.contains("gate_plates_rejected_total{site=\"lot-a\"} 1"));
        assert!(output.contains("gate_authorizations_total{site=\"lot-a\",outcome=\"authorized\"} 1"));
        assert!(output.contains("gate_authorizations_total{site=\"lot-a\",outcome=\"timeout\"} 1"));
        assert!(output.contains("gate_authorizations_total{site=\"lot-a\",outcome=\"denied\"} 0"));
        assert!(output.contains("gate_cycles_total{site=\"lot-a\"} 1"));
        assert!(output.contains("gate_state{site=\"lot-a\"} 3"));
    }

    #[test]
    fn test_histogram_is_cumulative() {
        let metrics = Metrics::new();
        metrics.record_authorization(AuthorizationOutcome::Denied, 5);
        metrics.record_authorization(AuthorizationOutcome::Denied, 15);
        metrics.record_authorization(AuthorizationOutcome::Denied, 100_000);

        let output = format_prometheus_metrics(&metrics, "s");

        assert!(output.contains("gate_authorization_latency_ms_bucket{site=\"s\",le=\"10\"} 1"));
        assert!(output.contains("gate_authorization_latency_ms_bucket{site=\"s\",le=\"20\"} 2"));
        assert!(output.contains("gate_authorization_latency_ms_bucket{site=\"s\",le=\"+Inf\"} 3"));
        assert!(output.contains("gate_authorization_latency_ms_count{site=\"s\"} 3"));
        assert!(output.contains("gate_authorization_latency_ms_sum{site=\"s\"} 100020"));
    }
}
