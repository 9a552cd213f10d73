//! `backoffice-core` — shared foundation types.
//!
//! This crate contains the error taxonomy surfaced to callers and the strongly-typed
//! identifiers used across resources. No infrastructure concerns live here.

pub mod error;
pub mod id;

pub use error::{AppError, AppResult, ExternalFailure};
pub use id::{ActorId, RecordId};
