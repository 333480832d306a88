//! Prometheus metrics HTTP endpoint
//!
//! Exposes engine metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

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
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
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
    bounds: &[u64; 10],
    avg: u64,
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

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_sample_metrics(&mut output, site_id, &summary);
    write_transition_metrics(&mut output, site_id, &summary);
    write_notification_metrics(&mut output, site_id, &summary);

    output
}

fn write_sample_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "geofence_samples_total",
        "Location samples evaluated",
        MetricType::Counter,
        site,
        summary.samples_total,
    );
    write_metric(
        output,
        "geofence_samples_rejected_total",
        "Location samples rejected by the accuracy gate",
        MetricType::Counter,
        site,
        summary.samples_rejected,
    );
    let _ = writeln!(output, "# HELP geofence_samples_per_sec Samples evaluated per second");
    let _ = writeln!(output, "# TYPE geofence_samples_per_sec gauge");
    let _ = writeln!(output, "geofence_samples_per_sec{{site=\"{site}\"}} {:.2}", summary.samples_per_sec);

    write_histogram(
        output,
        "geofence_eval_latency_us",
        "Sample evaluation latency in microseconds",
        site,
        &summary.lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.avg_eval_latency_us,
    );
    write_metric(
        output,
        "geofence_eval_latency_p99_us",
        "99th percentile evaluation latency",
        MetricType::Gauge,
        site,
        summary.lat_p99_us,
    );
    write_metric(
        output,
        "geofence_ingest_dropped_total",
        "Location reports dropped due to channel full",
        MetricType::Counter,
        site,
        summary.ingest_dropped,
    );
}

fn write_transition_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(output, "geofence_entries_total", "Confirmed entries", MetricType::Counter, site, summary.entries_total);
    write_metric(
        output,
        "geofence_exits_confirmed_total",
        "Exits confirmed after the confirmation delay",
        MetricType::Counter,
        site,
        summary.exits_confirmed_total,
    );
    write_metric(
        output,
        "geofence_exits_cancelled_total",
        "Pending exits cancelled by a return inside",
        MetricType::Counter,
        site,
        summary.exits_cancelled_total,
    );
    write_metric(
        output,
        "geofence_pending_exits",
        "Exits currently awaiting confirmation",
        MetricType::Gauge,
        site,
        summary.pending_exits,
    );
    write_metric(
        output,
        "geofence_dwell_alerts_total",
        "Dwell threshold alerts raised",
        MetricType::Counter,
        site,
        summary.dwell_alerts_total,
    );
    write_metric(
        output,
        "geofence_emergency_alerts_total",
        "Danger zone emergency alerts raised",
        MetricType::Counter,
        site,
        summary.emergency_alerts_total,
    );
    write_metric(
        output,
        "geofence_errors_total",
        "Per-geofence evaluation errors",
        MetricType::Counter,
        site,
        summary.geofence_errors,
    );
}

fn write_notification_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    let _ = writeln!(output, "# HELP geofence_notifications_total Notification outcomes");
    let _ = writeln!(output, "# TYPE geofence_notifications_total counter");
    for (outcome, val) in [
        ("sent", summary.notifications_sent),
        ("cooldown", summary.notifications_cooldown),
        ("priority", summary.notifications_priority),
        ("failed", summary.notifications_failed),
    ] {
        let _ = writeln!(
            output,
            "geofence_notifications_total{{site=\"{site}\",outcome=\"{outcome}\"}} {val}"
        );
    }
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
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
            let mut response =
                text_response(StatusCode::OK, format_prometheus_metrics(&metrics, &site_id));
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            Ok(response)
        }
        (&Method::GET, "/health") => Ok(text_response(StatusCode::OK, "ok".into())),
        _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found".into())),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
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

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();

        metrics.record_sample_evaluated(150);
        metrics.record_sample_evaluated(250);
        metrics.record_entry();
        metrics.record_notification_sent();
        metrics.record_notification_cooldown();
        metrics.set_pending_exits(2);

        let output = format_prometheus_metrics(&metrics, "hsinchu");

        assert!(output.contains("geofence_samples_total{site=\"hsinchu\"} 2"));
        assert!(output.contains("geofence_eval_latency_us_bucket{site=\"hsinchu\",le=\"200\"} 1"));
        assert!(output.contains("geofence_eval_latency_us_count{site=\"hsinchu\"} 2"));
        assert!(output.contains("geofence_entries_total{site=\"hsinchu\"} 1"));
        assert!(output.contains("geofence_pending_exits{site=\"hsinchu\"} 2"));
        assert!(output.contains("geofence_notifications_total{site=\"hsinchu\",outcome=\"sent\"} 1"));
        assert!(output.contains("geofence_notifications_total{site=\"hsinchu\",outcome=\"cooldown\"} 1"));
    }

    #[test]
    fn test_scrape_does_not_reset_log_window() {
        let metrics = Metrics::new();
        metrics.record_sample_evaluated(150);

        let first = format_prometheus_metrics(&metrics, "s");
        let second = format_prometheus_metrics(&metrics, "s");
        assert!(first.contains("geofence_eval_latency_us_count{site=\"s\"} 1"));
        assert!(second.contains("geofence_eval_latency_us_count{site=\"s\"} 1"));

        let summary = metrics.report();
        assert_eq!(summary.max_eval_latency_us, 150);
    }
}
