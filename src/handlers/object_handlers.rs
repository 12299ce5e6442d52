//! HTTP handlers for committed objects under `/v0/b/{bucket}/o/{*path}`.
//! Storage and authorization concerns live in `StorageService`.

use crate::{
    errors::AppError,
    models::object::{ObjectMetadataResponse, StoredObject},
    services::{
        auth::Actor,
        storage_service::{ObjectPatch, StorageService},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

/// Query params accepted on an object path.
#[derive(Debug, Default, Deserialize)]
pub struct ObjectQuery {
    pub alt: Option<String>,
    pub token: Option<String>,
    pub create_token: Option<String>,
    pub delete_token: Option<String>,
}

/// GET `/v0/b/{bucket}/o/{*path}`: metadata, or the content with `alt=media`.
pub async fn get_object(
    State(service): State<StorageService>,
    Path((bucket, path)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let actor = Actor::from_headers(&headers);

    if q.alt.as_deref() == Some("media") {
        let obj = service
            .download_object(&actor, &bucket, &path, q.token.as_deref())
            .await?;
        let mut response = Response::new(Body::from(obj.content.clone()));
        *response.status_mut() = StatusCode::OK;
        set_object_headers(response.headers_mut(), &obj);
        return Ok(response);
    }

    let obj = service.get_object_metadata(&actor, &bucket, &path).await?;
    Ok(metadata_response(&obj))
}

/// POST `/v0/b/{bucket}/o/{*path}`: download token management.
pub async fn object_action(
    State(service): State<StorageService>,
    Path((bucket, path)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let actor = Actor::from_headers(&headers);

    let obj = match (q.create_token.as_deref(), q.delete_token.as_deref()) {
        (Some(flag), None) => {
            service
                .tokens
                .create_token(&actor, &bucket, &path, flag)
                .await?
        }
        (None, Some(token)) => {
            service
                .tokens
                .delete_token(&actor, &bucket, &path, token)
                .await?
        }
        (Some(_), Some(_)) => {
            return Err(AppError::bad_request(
                "create_token and delete_token cannot be combined",
            ));
        }
        (None, None) => {
            return Err(AppError::bad_request(
                "expected a create_token or delete_token parameter",
            ));
        }
    };
    Ok(metadata_response(&obj))
}

/// DELETE `/v0/b/{bucket}/o/{*path}`
pub async fn delete_object(
    State(service): State<StorageService>,
    Path((bucket, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let actor = Actor::from_headers(&headers);
    service.delete_object(&actor, &bucket, &path).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PATCH `/v0/b/{bucket}/o/{*path}`: content type and custom metadata.
pub async fn update_object(
    State(service): State<StorageService>,
    Path((bucket, path)): Path<(String, String)>,
    headers: HeaderMap,
    Json(patch): Json<ObjectPatch>,
) -> Result<Response, AppError> {
    let actor = Actor::from_headers(&headers);
    let obj = service
        .update_object_metadata(&actor, &bucket, &path, patch)
        .await?;
    Ok(metadata_response(&obj))
}

pub fn metadata_response(obj: &StoredObject) -> Response {
    (StatusCode::OK, Json(ObjectMetadataResponse::from(obj))).into_response()
}

fn set_object_headers(headers: &mut HeaderMap, obj: &StoredObject) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&obj.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(obj.size));

    if let Ok(value) = HeaderValue::from_str(&obj.etag()) {
        headers.insert(header::ETAG, value);
    }

    let last_modified = obj.updated.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    if let Ok(value) = HeaderValue::from_str(&last_modified) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
