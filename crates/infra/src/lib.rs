//! Infrastructure layer: document stores, keyset pagination, cache, circuit breakers,
//! transactions, the background job queue and the services composing them.

pub mod assets;
pub mod cache;
pub mod config;
pub mod jobs;
pub mod migrations;
pub mod model;
pub mod pagination;
pub mod repository;
pub mod resilience;
pub mod services;
pub mod store;
pub mod transaction;
