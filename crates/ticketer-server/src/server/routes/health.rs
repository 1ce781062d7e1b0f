use crate::server::middleware::RequestId;
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: u16,
    pub message: &'static str,
    pub request_id: String,
}

/// `GET /api/v1/health-check`
///
/// Liveness only; the store is not probed.
pub async fn health_check(RequestId(request_id): RequestId) -> Json<Health> {
    Json(Health {
        status: 200,
        message: "The service is healthy",
        request_id,
    })
}
