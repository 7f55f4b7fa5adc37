//! A3: Prometheus metrics and the `/metrics` scrape endpoint, grounded on the
//! reference system's `start_metrics_scrape_endpoint`/`*MetricsCollector`
//! pattern but narrowed to one collector for the upload pipeline.

use anyhow::{Context, Result};
use http::Response;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};
use slog::{error, info, Logger};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::runtime::Runtime;
use warp::Filter;

/// Starts listening on an HTTP endpoint so that Prometheus can scrape metrics
/// from this instance. On success, returns a `Runtime` the caller must keep
/// live, or the scrape task will be dropped.
pub fn start_metrics_scrape_endpoint(port: u16, logger: Logger) -> Result<Runtime> {
    let runtime = Runtime::new().context("failed to create runtime for metrics endpoint")?;

    let scrape_logger = logger.clone();
    runtime.spawn(async move {
        let endpoint = warp::get().and(warp::path("metrics")).map(move || {
            match handle_scrape() {
                Ok(body) => Response::builder()
                    // https://github.com/prometheus/docs/blob/master/content/docs/instrumenting/exposition_formats.md
                    .header("Content-Type", "text/plain; version=0.0.4")
                    .body(body),
                Err(err) => {
                    error!(scrape_logger, "unable to scrape Prometheus metrics"; "error" => format!("{err:#}"));
                    Response::builder().status(500).body(vec![])
                }
            }
        });

        info!(logger, "serving metrics scrapes"; "port" => port);
        warp::serve(endpoint)
            .run(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port))
            .await;
    });

    Ok(runtime)
}

fn handle_scrape() -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .context("failed to encode metrics")?;
    Ok(buffer)
}

/// The collectors exported by this collector, covering pre-requests, chunk
/// appends and commits, and the reaper's sweeps (§4.8 "Metrics").
#[derive(Debug, Clone)]
pub struct CollectorMetrics {
    pub uploads_started: IntCounter,
    pub uploads_finished: IntCounterVec,
    pub bytes_received: IntCounter,
    pub active_sessions: IntGauge,
    pub reap_sweeps: IntCounter,
    pub reap_files_removed: IntCounter,
}

impl CollectorMetrics {
    pub fn new() -> Result<CollectorMetrics> {
        CollectorMetrics::new_with_metric_prefix("collector")
    }

    /// Registers this process's collectors under `prefix_*` instead of the
    /// fixed `collector_*` names. `prometheus`'s default registry is global
    /// and rejects re-registering the same metric name, so integration
    /// tests that construct more than one `CollectorMetrics` in the same
    /// process need distinct prefixes.
    pub fn new_with_metric_prefix(prefix: &str) -> Result<CollectorMetrics> {
        let uploads_started: IntCounter = register_int_counter!(
            format!("{prefix}_uploads_started_total"),
            "Number of pre-requests accepted, creating a new upload session"
        )
        .context("failed to register uploads_started counter")?;

        let uploads_finished = register_int_counter_vec!(
            format!("{prefix}_uploads_finished_total"),
            "Number of upload sessions that reached a terminal state",
            &["status"]
        )
        .context("failed to register uploads_finished counter")?;

        let bytes_received: IntCounter = register_int_counter!(
            format!("{prefix}_bytes_received_total"),
            "Total bytes accepted across all chunk PUT requests"
        )
        .context("failed to register bytes_received counter")?;

        let active_sessions: IntGauge = register_int_gauge!(
            format!("{prefix}_active_sessions"),
            "Number of upload sessions currently tracked in memory"
        )
        .context("failed to register active_sessions gauge")?;

        let reap_sweeps: IntCounter = register_int_counter!(
            format!("{prefix}_reap_sweeps_total"),
            "Number of times the expired-chunk reaper has run"
        )
        .context("failed to register reap_sweeps counter")?;

        let reap_files_removed: IntCounter = register_int_counter!(
            format!("{prefix}_reap_files_removed_total"),
            "Number of temporary chunk files removed by the reaper"
        )
        .context("failed to register reap_files_removed counter")?;

        Ok(CollectorMetrics {
            uploads_started,
            uploads_finished,
            bytes_received,
            active_sessions,
            reap_sweeps,
            reap_files_removed,
        })
    }
}
