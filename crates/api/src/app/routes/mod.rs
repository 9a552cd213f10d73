use axum::{routing::get, Router};

pub mod health;

pub fn router() -> Router {
    Router::new()
        .route("/liveness", get(health::liveness))
        .route("/status", get(health::status))
}
