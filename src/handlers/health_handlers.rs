//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness with object and upload session counts

use crate::services::storage_service::StorageService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;

/// `GET /healthz`
///
/// Always 200 with a plain JSON body; never touches the stores.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
pub async fn readyz(State(service): State<StorageService>) -> impl IntoResponse {
    let body = ReadyResponse {
        status: "ok".into(),
        objects: service.objects.len(),
        upload_sessions: service.sessions.len(),
    };
    (StatusCode::OK, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    objects: usize,
    upload_sessions: usize,
}
