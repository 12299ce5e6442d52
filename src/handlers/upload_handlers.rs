//! Upload entry point: maps the upload protocol and command headers of a
//! request onto the resumable state machine, the multipart parser or a raw
//! single-shot upload, and renders the result as status code plus
//! `X-Goog-Upload-*` headers.

use crate::{
    errors::{AppError, UPLOAD_STATUS_HEADER},
    handlers::object_handlers::metadata_response,
    models::{object::NewObject, session::UploadMetadata},
    services::{
        auth::Actor,
        multipart::parse_multipart_related,
        resumable::{
            CommandOutcome, CommandRequest, StartedUpload, UploadCommand, UploadError,
            parse_offset,
        },
        storage_service::StorageService,
    },
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde::Deserialize;

pub const UPLOAD_PROTOCOL_HEADER: &str = "x-goog-upload-protocol";
pub const UPLOAD_COMMAND_HEADER: &str = "x-goog-upload-command";
pub const UPLOAD_OFFSET_HEADER: &str = "x-goog-upload-offset";
pub const UPLOAD_URL_HEADER: &str = "x-goog-upload-url";
pub const UPLOAD_CONTROL_URL_HEADER: &str = "x-goog-upload-control-url";
pub const UPLOAD_SIZE_RECEIVED_HEADER: &str = "x-goog-upload-size-received";
pub const UPLOAD_HEADER_CONTENT_TYPE: &str = "x-goog-upload-header-content-type";

/// Query params accepted on the upload endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    pub name: Option<String>,
    #[serde(rename = "uploadType")]
    pub upload_type: Option<String>,
    pub upload_id: Option<String>,
    pub upload_protocol: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadProtocol {
    Resumable,
    Multipart,
    /// Raw body, committed in one request.
    Media,
}

impl UploadProtocol {
    /// The protocol header wins over the query string; with neither the
    /// request is a raw media upload.
    pub fn resolve(headers: &HeaderMap, query: &UploadQuery) -> Result<Self, UploadError> {
        let declared = header_str(headers, UPLOAD_PROTOCOL_HEADER)
            .or(query.upload_protocol.as_deref())
            .or(query.upload_type.as_deref());

        match declared.map(|p| p.trim().to_ascii_lowercase()).as_deref() {
            None | Some("media") | Some("raw") => Ok(UploadProtocol::Media),
            Some("resumable") => Ok(UploadProtocol::Resumable),
            Some("multipart") => Ok(UploadProtocol::Multipart),
            Some(other) => Err(UploadError::UnknownProtocol(other.to_string())),
        }
    }
}

/// `POST|PUT /v0/b/{bucket}/o`: every upload flavour lands here.
pub async fn upload_object(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let actor = Actor::from_headers(&headers);
    let body = read_body(body, service.max_upload_bytes).await?;

    if let Some(upload_id) = query.upload_id.as_deref() {
        return session_command(&service, &bucket, &query, upload_id, &actor, &headers, body)
            .await;
    }

    match UploadProtocol::resolve(&headers, &query)? {
        UploadProtocol::Resumable => {
            start_resumable(&service, &bucket, &query, &actor, &headers, body)
        }
        UploadProtocol::Multipart => {
            multipart_upload(&service, &bucket, &query, &actor, &headers, body).await
        }
        UploadProtocol::Media => {
            media_upload(&service, &bucket, &query, &actor, &headers, body).await
        }
    }
}

fn start_resumable(
    service: &StorageService,
    bucket: &str,
    query: &UploadQuery,
    actor: &Actor,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let command = command_header(headers)?;
    if command != UploadCommand::Start {
        return Err(UploadError::UnexpectedCommand(command).into());
    }

    let mut metadata: UploadMetadata = if body.iter().all(u8::is_ascii_whitespace) {
        UploadMetadata::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| UploadError::InvalidMetadata(err.to_string()))?
    };
    if metadata.content_type.is_none() {
        metadata.content_type =
            header_str(headers, UPLOAD_HEADER_CONTENT_TYPE).map(str::to_string);
    }

    let started = service
        .resumable
        .start(actor, bucket, query.name.as_deref(), metadata)?;
    let url = upload_url(&base_url(service, headers), &started);
    let url = HeaderValue::from_str(&url)
        .map_err(|err| AppError::internal(format!("invalid upload url: {err}")))?;

    let mut resp_headers = HeaderMap::new();
    resp_headers.insert(HeaderName::from_static(UPLOAD_URL_HEADER), url.clone());
    resp_headers.insert(HeaderName::from_static(UPLOAD_CONTROL_URL_HEADER), url);
    resp_headers.insert(
        HeaderName::from_static(UPLOAD_STATUS_HEADER),
        HeaderValue::from_static("active"),
    );
    Ok((StatusCode::OK, resp_headers).into_response())
}

async fn session_command(
    service: &StorageService,
    bucket: &str,
    query: &UploadQuery,
    upload_id: &str,
    actor: &Actor,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let command = command_header(headers)?;
    let offset = header_str(headers, UPLOAD_OFFSET_HEADER)
        .map(parse_offset)
        .transpose()?;

    let outcome = service
        .resumable
        .execute(CommandRequest {
            upload_id,
            bucket,
            path: query.name.as_deref(),
            actor,
            command,
            offset,
            body,
        })
        .await?;

    let response = match outcome {
        CommandOutcome::Finalized(obj) => {
            let mut response = metadata_response(&obj);
            set_status(response.headers_mut(), "final");
            response
        }
        CommandOutcome::Active { bytes_received } => {
            status_response("active", Some(bytes_received))
        }
        CommandOutcome::Cancelled => status_response("cancelled", None),
        CommandOutcome::Status {
            state,
            bytes_received,
        } => status_response(state.as_status(), Some(bytes_received)),
    };
    Ok(response)
}

async fn multipart_upload(
    service: &StorageService,
    bucket: &str,
    query: &UploadQuery,
    actor: &Actor,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let content_type = header_str(headers, header::CONTENT_TYPE.as_str());
    let upload = parse_multipart_related(content_type, body).await?;
    let name = query
        .name
        .clone()
        .or(upload.metadata.name)
        .filter(|n| !n.is_empty())
        .ok_or(UploadError::MissingObjectName)?;

    let new = NewObject {
        content: upload.data,
        content_type: upload.metadata.content_type.or(Some(upload.content_type)),
        custom_metadata: upload.metadata.metadata.unwrap_or_default(),
    };
    let obj = service.upload_direct(actor, bucket, &name, new).await?;
    Ok(metadata_response(&obj))
}

async fn media_upload(
    service: &StorageService,
    bucket: &str,
    query: &UploadQuery,
    actor: &Actor,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let name = query
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or(UploadError::MissingObjectName)?;

    let new = NewObject {
        content: body,
        content_type: header_str(headers, header::CONTENT_TYPE.as_str()).map(str::to_string),
        ..Default::default()
    };
    let obj = service.upload_direct(actor, bucket, name, new).await?;
    Ok(metadata_response(&obj))
}

/// Collect the request body, refusing anything larger than `limit`.
async fn read_body(body: Body, limit: usize) -> Result<Bytes, AppError> {
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|err| AppError::bad_request(format!("failed to read request body: {err}")))?;
        if buf.len() + chunk.len() > limit {
            return Err(UploadError::TooLarge { limit }.into());
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

fn command_header(headers: &HeaderMap) -> Result<UploadCommand, UploadError> {
    header_str(headers, UPLOAD_COMMAND_HEADER)
        .ok_or(UploadError::MissingCommand)?
        .parse()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn base_url(service: &StorageService, headers: &HeaderMap) -> String {
    if let Some(url) = &service.public_url {
        return url.clone();
    }
    let host = header_str(headers, header::HOST.as_str()).unwrap_or("localhost");
    format!("http://{host}")
}

/// URL a client uses for every follow-up command of a session.
pub fn upload_url(base: &str, started: &StartedUpload) -> String {
    format!(
        "{}/v0/b/{}/o?name={}&upload_id={}&upload_protocol=resumable",
        base.trim_end_matches('/'),
        urlencoding::encode(&started.bucket),
        urlencoding::encode(&started.path),
        urlencoding::encode(&started.upload_id),
    )
}

fn set_status(headers: &mut HeaderMap, status: &'static str) {
    headers.insert(
        HeaderName::from_static(UPLOAD_STATUS_HEADER),
        HeaderValue::from_static(status),
    );
}

fn status_response(status: &'static str, bytes_received: Option<u64>) -> Response {
    let mut headers = HeaderMap::new();
    set_status(&mut headers, status);
    if let Some(received) = bytes_received {
        headers.insert(
            HeaderName::from_static(UPLOAD_SIZE_RECEIVED_HEADER),
            HeaderValue::from(received),
        );
    }
    (StatusCode::OK, headers).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(HeaderName::from_static(*name), HeaderValue::from_static(*value));
        }
        map
    }

    #[test]
    fn protocol_header_beats_query() {
        let query = UploadQuery {
            upload_type: Some("multipart".into()),
            ..Default::default()
        };
        let protocol = UploadProtocol::resolve(
            &headers(&[(UPLOAD_PROTOCOL_HEADER, "resumable")]),
            &query,
        )
        .unwrap();
        assert_eq!(protocol, UploadProtocol::Resumable);

        let protocol = UploadProtocol::resolve(&HeaderMap::new(), &query).unwrap();
        assert_eq!(protocol, UploadProtocol::Multipart);
    }

    #[test]
    fn no_protocol_means_media() {
        let protocol = UploadProtocol::resolve(&HeaderMap::new(), &UploadQuery::default()).unwrap();
        assert_eq!(protocol, UploadProtocol::Media);
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let err = UploadProtocol::resolve(
            &headers(&[(UPLOAD_PROTOCOL_HEADER, "carrier-pigeon")]),
            &UploadQuery::default(),
        )
        .unwrap_err();
        assert!(matches!(err, UploadError::UnknownProtocol(p) if p == "carrier-pigeon"));
    }

    #[test]
    fn upload_url_encodes_path() {
        let started = StartedUpload {
            upload_id: "abc123".into(),
            bucket: "demo.appspot.com".into(),
            path: "dir/file name.txt".into(),
        };
        assert_eq!(
            upload_url("http://localhost:9199/", &started),
            "http://localhost:9199/v0/b/demo.appspot.com/o?name=dir%2Ffile%20name.txt&upload_id=abc123&upload_protocol=resumable"
        );
    }

    #[tokio::test]
    async fn read_body_enforces_limit() {
        let err = read_body(Body::from("0123456789"), 4).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let ok = read_body(Body::from("0123"), 4).await.unwrap();
        assert_eq!(&ok[..], b"0123");
    }
}
