use axum::http::StatusCode;
use axum::{routing, Router};
use fhir_common::health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::shutdown::ShutdownCoordinator;

pub fn app(
    liveness: HealthRegistry,
    shutdown: ShutdownCoordinator,
    metrics: Option<PrometheusHandle>,
) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route(
            "/_liveness",
            routing::get(move || std::future::ready(liveness.get_status())),
        )
        .route(
            "/_readiness",
            routing::get(move || std::future::ready(readiness(&shutdown))),
        )
        .route(
            "/metrics",
            routing::get(move || match metrics {
                Some(ref recorder_handle) => std::future::ready(recorder_handle.render()),
                None => std::future::ready("no metrics recorder installed".to_owned()),
            }),
        )
}

pub async fn index() -> &'static str {
    "fhir relay"
}

/// Ready until shutdown begins.
fn readiness(shutdown: &ShutdownCoordinator) -> (StatusCode, &'static str) {
    match shutdown.is_raised() {
        false => (StatusCode::OK, "ready"),
        true => (StatusCode::SERVICE_UNAVAILABLE, "shutting down"),
    }
}
