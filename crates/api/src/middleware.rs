use std::time::Instant;

use axum::{
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::{Instrument, info, info_span};

use crate::context::{REQUEST_ID_HEADER, RequestContext};

/// Tags each request with a request id (echoed back in `x-request-id`) and logs its outcome.
pub async fn request_context(mut req: Request<axum::body::Body>, next: Next) -> Response {
    let header = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok());
    let ctx = RequestContext::from_header(header);
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    req.extensions_mut().insert(ctx.clone());

    let span = info_span!("request", request_id = %ctx.request_id(), %method, %path);
    let started = Instant::now();
    let mut response = next.run(req).instrument(span.clone()).await;

    span.in_scope(|| {
        info!(
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request completed"
        );
    });

    if let Ok(value) = HeaderValue::from_str(ctx.request_id()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
