use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!(
        "hub_investments_total",
        "Investment attempts by result (accepted, rejected, error)."
    );
    describe_counter!(
        "hub_settlements_total",
        "Settled investments by outcome (won, lost, error)."
    );
    describe_counter!(
        "hub_points_awarded_total",
        "Points credited to users, by ledger reason."
    );
    describe_gauge!(
        "hub_settlement_due_last_run",
        "Investments found due by the last settlement sweep."
    );
    describe_histogram!(
        "hub_db_query_latency_ms",
        "SQLite call latency in milliseconds, by operation and status."
    );
    describe_counter!(
        "hub_db_query_errors_total",
        "Failed SQLite calls, by operation."
    );
    describe_counter!(
        common::observability::ERROR_EVENTS_METRIC,
        "ERROR-level tracing events, by target."
    );
}

/// Install the global recorder and serve `/metrics` on `port`. Needs a Tokio runtime.
pub fn install_prometheus(port: u16) -> Result<PrometheusHandle> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let (recorder, exporter) = PrometheusBuilder::new()
        .with_http_listener(addr)
        .build()
        .context("failed to build prometheus exporter")?;
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|err| anyhow::anyhow!("failed to install metrics recorder: {err}"))?;
    tokio::spawn(async move {
        if let Err(err) = exporter.await {
            tracing::error!(error = ?err, "prometheus exporter stopped");
        }
    });
    tracing::info!(%addr, "prometheus exporter listening");
    Ok(handle)
}
