use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use serde::Serialize;

use backoffice_infra::jobs::JobStats;
use backoffice_infra::resilience::{BreakerHealth, CircuitState};

use crate::app::errors::app_error_to_response;
use crate::app::services::AppServices;

pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: &'static str,
    pub store: &'static str,
    pub cache: &'static str,
    pub uptime_seconds: i64,
    pub breakers: BTreeMap<String, BreakerHealth>,
    pub jobs: JobStats,
}

/// Process status. Reports `degraded` while any breaker is not closed.
pub async fn status(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let jobs = match services.queue.stats().await {
        Ok(jobs) => jobs,
        Err(e) => return app_error_to_response(e),
    };
    let breakers = services.breakers.health();
    let degraded = breakers.values().any(|b| b.state != CircuitState::Closed);

    Json(StatusReport {
        status: if degraded { "degraded" } else { "ok" },
        store: services.store_backend,
        cache: services.cache.provider_name(),
        uptime_seconds: (Utc::now() - services.started_at).num_seconds(),
        breakers,
        jobs,
    })
    .into_response()
}
