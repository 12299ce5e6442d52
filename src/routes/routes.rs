//! Defines routes for the storage emulator HTTP surface.
//!
//! ## Structure
//! - **Upload endpoint**
//!   - `POST|PUT /v0/b/{bucket}/o`: resumable, multipart and media uploads
//!     (a trailing slash is accepted too)
//!
//! - **Object endpoints**
//!   - `GET    /v0/b/{bucket}/o/{*path}`: metadata, or content with `alt=media`
//!   - `POST   /v0/b/{bucket}/o/{*path}`: `create_token` / `delete_token`
//!   - `PATCH  /v0/b/{bucket}/o/{*path}`: update metadata
//!   - `DELETE /v0/b/{bucket}/o/{*path}`: delete object
//!
//! The wildcard `*path` allows nested names like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{delete_object, get_object, object_action, update_object},
        upload_handlers::upload_object,
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router. Every handler shares the `StorageService` state.
pub fn routes() -> Router<StorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Uploads
        .route("/v0/b/{bucket}/o", post(upload_object).put(upload_object))
        .route("/v0/b/{bucket}/o/", post(upload_object).put(upload_object))
        // Object-level routes
        .route(
            "/v0/b/{bucket}/o/{*path}",
            get(get_object)
                .post(object_action)
                .patch(update_object)
                .delete(delete_object),
        )
}
