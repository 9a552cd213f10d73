//! HTTP process: health endpoints, request context, and wiring of the infrastructure layer.

pub mod app;
pub mod context;
pub mod middleware;
