//! Prometheus metrics recorder and HTTP endpoint.
//!
//! The recorder is a process singleton; the endpoint is optional and only
//! started when an address is configured.

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{
    AddressParseSnafu, AlreadyInitializedSnafu, MetricsError, NotInitializedSnafu,
    PrometheusInitSnafu,
};

/// Histogram buckets for commit and iteration durations (seconds).
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

static CONTROLLER: OnceLock<MetricsController> = OnceLock::new();

/// Handle to the installed Prometheus recorder.
pub struct MetricsController {
    handle: PrometheusHandle,
}

impl MetricsController {
    pub fn get() -> Result<&'static Self, MetricsError> {
        CONTROLLER.get().context(NotInitializedSnafu)
    }

    /// Render metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn install() -> Result<&'static MetricsController, MetricsError> {
    let handle = PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)
        .context(PrometheusInitSnafu)?
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    CONTROLLER
        .set(MetricsController { handle })
        .map_err(|_| AlreadyInitializedSnafu.build())?;

    MetricsController::get()
}

/// Install the recorder and serve `/metrics` and `/health` on `address`.
pub fn init_global(address: &str) -> Result<(), MetricsError> {
    let addr: SocketAddr = address.parse().context(AddressParseSnafu { address })?;
    let controller = install()?;

    tokio::spawn(run_server(addr, controller.handle.clone()));

    info!(%addr, "Metrics server started");
    Ok(())
}

/// Install the recorder without an HTTP endpoint.
///
/// Safe to call from many test threads; losers of the race wait for the winner.
pub fn init_test() {
    if install().is_err() {
        while CONTROLLER.get().is_none() {
            std::hint::spin_loop();
        }
    }
}

async fn run_server(addr: SocketAddr, handle: PrometheusHandle) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(handle));

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!("Metrics server error: {}", e);
    }
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler() -> &'static str {
    "ok\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit;
    use crate::metrics::events::RecordQuarantined;

    #[test]
    fn test_init_test_is_idempotent() {
        init_test();
        init_test();
        assert!(MetricsController::get().is_ok());
    }

    #[test]
    fn test_quarantine_counter_rendered_with_reason() {
        init_test();

        emit!(RecordQuarantined {
            reason: "parse_error",
            target: "render-test".to_string(),
        });

        let output = MetricsController::get().unwrap().render();
        assert!(output.contains("honeycomb_records_quarantined_total"));
        assert!(output.contains("parse_error"));
    }

    #[test]
    fn test_bad_address_rejected_before_install() {
        let err = init_global("not-an-address").unwrap_err();
        assert!(matches!(err, MetricsError::AddressParse { .. }));
    }
}
