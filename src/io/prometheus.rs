//! Prometheus metrics HTTP endpoint
//!
//! Exposes router metrics in Prometheus text format at /metrics and a
//! liveness probe at /health. Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, METRICS_DELIVERY_BOUNDS, METRICS_NUM_BUCKETS};
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
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with cumulative buckets, sum and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
///
/// Reads only monotonic counters, gauges and the lifetime histogram, so a
/// scrape never disturbs the periodic log report.
fn format_prometheus_metrics(metrics: &Metrics, site: &str) -> String {
    let mut output = String::with_capacity(4096);
    let counters: [(&str, &str, u64); 9] = [
        ("asset_events_consumed_total", "Scan events persisted and acknowledged", metrics.events_consumed_total()),
        ("asset_events_duplicate_total", "Redelivered events already audited", metrics.duplicate_events_total()),
        ("asset_decode_failures_total", "Inbound payloads that failed to decode", metrics.decode_failures_total()),
        ("asset_deliveries_total", "Successful sink deliveries", metrics.deliveries_total()),
        ("asset_delivery_failures_total", "Failed sink attempts", metrics.delivery_failures_total()),
        ("asset_dispatch_abandoned_total", "Dispatches that ended abandoned", metrics.abandoned_total()),
        ("asset_dispatch_short_circuited_total", "Attempts rejected by an open breaker", metrics.short_circuited_total()),
        ("asset_scans_total", "Decoded codes handed to scanner sessions", metrics.scans_total()),
        ("asset_publish_dropped_total", "Scan events dropped on a full publish queue", metrics.publish_dropped_total()),
    ];
    for (name, help, val) in counters {
        write_metric(&mut output, name, help, MetricType::Counter, site, val);
    }

    write_metric(
        &mut output,
        "asset_dispatch_in_flight",
        "Events whose fan-out is running",
        MetricType::Gauge,
        site,
        metrics.dispatch_in_flight(),
    );
    write_metric(
        &mut output,
        "asset_open_breakers",
        "Sink circuit breakers currently open",
        MetricType::Gauge,
        site,
        metrics.open_breakers(),
    );

    let (buckets, sum_ms) = metrics.delivery_histogram();
    write_histogram(
        &mut output,
        "asset_delivery_latency_ms",
        "Successful sink delivery latency in milliseconds",
        site,
        &buckets,
        &METRICS_DELIVERY_BOUNDS,
        sum_ms,
    );
    output
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let mut response = text_response(StatusCode::OK, format_prometheus_metrics(&metrics, &site_id));
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            Ok(response)
        }
        (&Method::GET, "/health") => Ok(text_response(StatusCode::OK, "ok".to_string())),
        _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found".to_string())),
    }
}

/// Serve /metrics and /health until shutdown
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
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
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

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_event_consumed(150);
        metrics.record_delivery(40);
        metrics.record_delivery(7000);
        metrics.record_abandoned();
        metrics.breaker_opened();

        let output = format_prometheus_metrics(&metrics, "hq");

        assert!(output.contains("asset_events_consumed_total{site=\"hq\"} 1"));
        assert!(output.contains("asset_dispatch_abandoned_total{site=\"hq\"} 1"));
        assert!(output.contains("asset_open_breakers{site=\"hq\"} 1"));
        assert!(output.contains("asset_delivery_latency_ms_bucket{site=\"hq\",le=\"50\"} 1"));
        assert!(output.contains("asset_delivery_latency_ms_bucket{site=\"hq\",le=\"+Inf\"} 2"));
        assert!(output.contains("asset_delivery_latency_ms_sum{site=\"hq\"} 7040"));
    }

    #[test]
    fn test_scrape_does_not_reset_report() {
        let metrics = Metrics::new();
        metrics.record_event_consumed(100);
        let _ = format_prometheus_metrics(&metrics, "hq");
        assert_eq!(metrics.report().persist_avg_us, 100);
    }
}
