//! Prometheus metrics for the csvlog tail.
//!
//! All metrics live in the default registry. Counters end in `_total`,
//! latencies in `_seconds`.

use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_histogram_vec, register_int_counter, Encoder, Gauge, HistogramVec,
    IntCounter,
};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

lazy_static! {
    pub static ref START_TIME_SECONDS: Gauge = register_gauge!(
        "pglog_agent_start_time_seconds",
        "Unix time at which the agent started"
    )
    .unwrap();
    pub static ref READ_BYTES_TOTAL: IntCounter = register_int_counter!(
        "pglog_agent_read_bytes_total",
        "Bytes of csvlog consumed as complete records"
    )
    .unwrap();
    pub static ref RECORDS_PROCESSED_TOTAL: IntCounter = register_int_counter!(
        "pglog_agent_records_processed_total",
        "Records handed to the processor successfully"
    )
    .unwrap();
    pub static ref FILE_SWITCHES_TOTAL: IntCounter = register_int_counter!(
        "pglog_agent_file_switches_total",
        "Switches from a drained log file to its successor"
    )
    .unwrap();
    pub static ref CHECKPOINT_DURATION: HistogramVec = register_histogram_vec!(
        "pglog_agent_checkpoint_duration_seconds",
        "Time spent reading and writing the checkpoint database",
        &["operation"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    )
    .unwrap();
}

pub fn record_start_time() {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default();
    START_TIME_SECONDS.set(now);
}

/// Text exposition of the default registry.
pub fn render() -> Result<Vec<u8>> {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .context("failed to encode metrics")?;
    Ok(buffer)
}

/// Serves `GET /metrics` until `cancel_token` fires.
pub async fn serve(addr: SocketAddr, cancel_token: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server to {addr}"))?;

    info!(%addr, "metrics server listening on /metrics");

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                info!("metrics server shutting down");
                return Ok(());
            }
            accept_result = listener.accept() => {
                let (stream, _) = match accept_result {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "failed to accept metrics connection");
                        continue;
                    }
                };

                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(|req: Request<Incoming>| async move {
                        Ok::<_, hyper::Error>(respond(req.uri().path()))
                    });
                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(error = %err, "error serving metrics connection");
                    }
                });
            }
        }
    }
}

fn respond(path: &str) -> Response<Full<Bytes>> {
    if path != "/metrics" {
        let mut response = Response::new(Full::new(Bytes::from_static(b"Not Found")));
        *response.status_mut() = StatusCode::NOT_FOUND;
        return response;
    }

    match render() {
        Ok(buffer) => {
            let mut response = Response::new(Full::new(Bytes::from(buffer)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
            response
        }
        Err(err) => {
            warn!(error = format!("{err:#}"), "failed to render metrics");
            let mut response = Response::new(Full::new(Bytes::from_static(b"encoding failed")));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_metrics_include_tail_counters() {
        READ_BYTES_TOTAL.inc_by(0);
        FILE_SWITCHES_TOTAL.inc_by(0);
        let text = String::from_utf8(render().unwrap()).unwrap();
        assert!(text.contains("pglog_agent_read_bytes_total"));
        assert!(text.contains("pglog_agent_file_switches_total"));
    }

    #[test]
    fn unknown_paths_are_not_found() {
        assert_eq!(respond("/").status(), StatusCode::NOT_FOUND);
        assert_eq!(respond("/metrics").status(), StatusCode::OK);
    }
}
