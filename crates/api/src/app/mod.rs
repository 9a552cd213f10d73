//! HTTP application wiring (Axum router + service wiring).
//!
//! - `services.rs`: infrastructure wiring (stores, cache, breakers, job queue, workers)
//! - `routes/`: HTTP routes + handlers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};

use crate::middleware;

pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    Router::new()
        .nest("/health", routes::router())
        .layer(Extension(services))
        .layer(axum::middleware::from_fn(middleware::request_context))
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use tower::ServiceExt;

    use backoffice_infra::cache::{CacheStore, InMemoryCacheBackend};
    use backoffice_infra::jobs::{EnqueueOptions, InMemoryJobStore, JobQueue};
    use backoffice_infra::resilience::{BreakerConfig, BreakerRegistry};

    use crate::context::REQUEST_ID_HEADER;

    fn test_services() -> Arc<services::AppServices> {
        let breakers = Arc::new(BreakerRegistry::new());
        breakers.register(BreakerConfig::asset_upload());
        breakers.register(BreakerConfig::asset_delete());
        Arc::new(services::AppServices {
            breakers,
            queue: JobQueue::new(
                "product-tasks",
                Arc::new(InMemoryJobStore::new()),
                EnqueueOptions::default(),
            ),
            cache: CacheStore::new(Arc::new(InMemoryCacheBackend::new())),
            store_backend: "in-memory",
            started_at: Utc::now(),
        })
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let res = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn liveness_echoes_request_id() {
        let app = build_app(test_services());
        let res = app
            .oneshot(
                Request::get("/health/liveness")
                    .header(REQUEST_ID_HEADER, "req-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[REQUEST_ID_HEADER], "req-42");
    }

    #[tokio::test]
    async fn status_reports_breakers_and_jobs() {
        let (status, body) = get_json(build_app(test_services()), "/health/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store"], "in-memory");
        assert_eq!(body["cache"], "memory");
        assert_eq!(body["breakers"]["asset-upload"]["state"], "CLOSED");
        assert_eq!(body["jobs"]["pending"], 0);
    }

    #[tokio::test]
    async fn open_breaker_marks_status_degraded() {
        let services = test_services();
        let upload = services.breakers.get("asset-upload").unwrap();
        for _ in 0..5 {
            let _ = upload
                .call(|| async { Err::<(), _>("asset store down") })
                .await;
        }

        let (status, body) = get_json(build_app(services), "/health/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["breakers"]["asset-upload"]["state"], "OPEN");
        assert_eq!(body["breakers"]["asset-delete"]["state"], "CLOSED");
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let res = build_app(test_services())
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(res.headers().contains_key(REQUEST_ID_HEADER));
    }
}
