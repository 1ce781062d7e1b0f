use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use ticketer::ErrorKind;

/// A failed request, rendered as
/// `{"success": false, "error": {"kind", "message"}, "request_id"}`.
#[derive(Debug)]
pub struct ApiError {
    pub error: ticketer::Error,
    pub request_id: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    success: bool,
    error: ErrorDetail,
    request_id: &'a str,
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(error: ticketer::Error, request_id: impl Into<String>) -> Self {
        Self {
            error,
            request_id: request_id.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.error.kind() {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::TransactionFailure => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    // Store failures carry driver detail that stays in the logs.
    fn public_message(&self) -> String {
        match self.error.kind() {
            ErrorKind::TransactionFailure => {
                "ticket allocation failed and was rolled back; no tickets were issued".to_owned()
            }
            _ => self.error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.error.kind().as_str();
        if status.is_server_error() {
            tracing::warn!(
                kind,
                status = status.as_u16(),
                request_id = %self.request_id,
                error = %self.error,
                "request failed"
            );
        }

        let body = ErrorBody {
            success: false,
            error: ErrorDetail {
                kind,
                message: self.public_message(),
            },
            request_id: &self.request_id,
        };
        (status, Json(body)).into_response()
    }
}
