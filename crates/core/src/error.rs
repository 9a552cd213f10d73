//! Error taxonomy surfaced to callers of the service layer.

use thiserror::Error;

/// Result type used across the service layer.
pub type AppResult<T> = Result<T, AppError>;

/// Why a call to an external dependency did not produce a genuine result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExternalFailure {
    /// The breaker rejected the call without attempting it.
    #[error("circuit open")]
    CircuitOpen,

    /// The call exceeded the breaker timeout and was abandoned.
    #[error("timed out")]
    Timeout,

    /// The dependency itself returned an error.
    #[error("{0}")]
    Failed(String),
}

/// Service-level error.
///
/// Storage, cache and transport adapters have their own error enums; services translate
/// them into this taxonomy before anything reaches a caller.
#[derive(Debug, Error)]
pub enum AppError {
    /// Input failed validation (including out-of-range pagination limits).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A unique key is already taken.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The actor may not perform the operation.
    #[error("unauthorized")]
    Unauthorized,

    /// An external dependency failed, timed out or is behind an open circuit.
    #[error("external service '{service}' unavailable: {failure}")]
    ExternalService {
        service: String,
        failure: ExternalFailure,
        /// Whether a fallback ran (and itself failed) before this error was raised.
        fallback_used: bool,
    },

    /// A unit of work was rolled back; carries the error that caused the abort.
    #[error("transaction aborted: {0}")]
    TransactionAborted(#[source] Box<AppError>),

    /// A background job handler failed; the queue's retry policy decides what happens next.
    #[error("job processing failed: {0}")]
    JobProcessing(String),

    /// A pagination cursor could not be decoded.
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    /// Infrastructure failure with no more specific translation.
    #[error("storage error: {0}")]
    Storage(String),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn job(msg: impl Into<String>) -> Self {
        Self::JobProcessing(msg.into())
    }

    /// Wrap `cause` as the reason a transaction was rolled back.
    ///
    /// Already-aborted errors are returned unchanged so nested coordinators never stack
    /// wrappers.
    pub fn aborted(cause: AppError) -> Self {
        match cause {
            aborted @ AppError::TransactionAborted(_) => aborted,
            other => AppError::TransactionAborted(Box::new(other)),
        }
    }

    /// The innermost error, looking through transaction-abort wrappers.
    pub fn cause(&self) -> &AppError {
        match self {
            AppError::TransactionAborted(inner) => inner.cause(),
            other => other,
        }
    }

    /// Owned variant of [`AppError::cause`].
    pub fn into_cause(self) -> AppError {
        match self {
            AppError::TransactionAborted(inner) => inner.into_cause(),
            other => other,
        }
    }

    /// Stable machine-readable code, used in HTTP bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Unauthorized => "unauthorized",
            AppError::ExternalService { .. } => "external_service_error",
            AppError::TransactionAborted(_) => "transaction_aborted",
            AppError::JobProcessing(_) => "job_processing_error",
            AppError::InvalidCursor(_) => "invalid_cursor",
            AppError::Storage(_) => "storage_error",
        }
    }
}
