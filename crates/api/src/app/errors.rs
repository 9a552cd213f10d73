use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use backoffice_core::AppError;

pub fn app_error_to_response(err: AppError) -> axum::response::Response {
    let status = match err.cause() {
        AppError::Validation(_) | AppError::InvalidCursor(_) => StatusCode::BAD_REQUEST,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::Conflict(_) => StatusCode::CONFLICT,
        AppError::Unauthorized => StatusCode::UNAUTHORIZED,
        AppError::ExternalService { .. } => StatusCode::SERVICE_UNAVAILABLE,
        AppError::JobProcessing(_) | AppError::Storage(_) | AppError::TransactionAborted(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    json_error(status, err.code(), err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_errors_map_by_their_cause() {
        let response = app_error_to_response(AppError::aborted(AppError::conflict("sku taken")));
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app_error_to_response(AppError::InvalidCursor("bad".into()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
