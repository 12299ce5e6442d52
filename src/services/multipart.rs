//! Single-request `multipart/related` uploads.
//!
//! The body carries two parts: a JSON metadata part and the object payload.
//! The request content type is checked before the body is read, so a
//! malformed request never touches a session or the object store.

use crate::models::session::UploadMetadata;
use bytes::Bytes;
use futures::{future, stream};
use mime::Mime;
use std::convert::Infallible;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MultipartError {
    #[error("Bad content type. {0}")]
    BadContentType(String),
    #[error("expected a metadata part and a data part, got {0} part(s)")]
    PartCount(usize),
    #[error("malformed multipart body: {0}")]
    Malformed(#[from] multer::Error),
    #[error("invalid metadata part: {0}")]
    InvalidMetadata(String),
}

/// A parsed multipart upload.
#[derive(Debug)]
pub struct MultipartUpload {
    pub metadata: UploadMetadata,
    /// Content type declared on the payload part.
    pub content_type: String,
    pub data: Bytes,
}

struct Part {
    content_type: Option<Mime>,
    body: Bytes,
}

/// Parse a `multipart/related` request body.
pub async fn parse_multipart_related(
    content_type: Option<&str>,
    body: Bytes,
) -> Result<MultipartUpload, MultipartError> {
    let boundary = related_boundary(content_type.unwrap_or_default())?;

    let mut multipart =
        multer::Multipart::new(stream::once(future::ready(Ok::<_, Infallible>(body))), boundary);
    let mut parts = Vec::with_capacity(2);
    while let Some(field) = multipart.next_field().await? {
        let content_type = field.content_type().cloned();
        let body = field.bytes().await?;
        parts.push(Part { content_type, body });
    }

    let [metadata_part, data_part] = <[Part; 2]>::try_from(parts)
        .map_err(|parts| MultipartError::PartCount(parts.len()))?;

    match &metadata_part.content_type {
        Some(ct) if ct.type_() == mime::APPLICATION && ct.subtype() == mime::JSON => {}
        other => {
            return Err(MultipartError::BadContentType(format!(
                "Metadata part must be application/json, got `{}`",
                describe(other)
            )));
        }
    }
    let metadata: UploadMetadata = serde_json::from_slice(&metadata_part.body)
        .map_err(|err| MultipartError::InvalidMetadata(err.to_string()))?;

    let content_type = data_part.content_type.ok_or_else(|| {
        MultipartError::BadContentType("Data part has a missing or invalid content type".into())
    })?;

    Ok(MultipartUpload {
        metadata,
        content_type: content_type.to_string(),
        data: data_part.body,
    })
}

fn related_boundary(content_type: &str) -> Result<String, MultipartError> {
    let bad = || {
        MultipartError::BadContentType(format!(
            "Expected multipart/related, got `{content_type}`"
        ))
    };
    let parsed: Mime = content_type.parse().map_err(|_| bad())?;
    let related = parsed.subtype().as_str().eq_ignore_ascii_case("related");
    if parsed.type_() != mime::MULTIPART || !related {
        return Err(bad());
    }

    parsed
        .get_param(mime::BOUNDARY)
        .map(|value| value.as_str().trim_matches('"').to_string())
        .filter(|boundary| !boundary.is_empty())
        .ok_or_else(|| MultipartError::BadContentType("Missing multipart boundary".into()))
}

fn describe(content_type: &Option<Mime>) -> String {
    content_type
        .as_ref()
        .map(Mime::to_string)
        .unwrap_or_else(|| "none".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CT: &str = "multipart/related; boundary=xyz";

    fn body(metadata_type: &str, data_type: &str, data: &str) -> Bytes {
        Bytes::from(format!(
            "--xyz\r\nContent-Type: {metadata_type}\r\n\r\n{{\"name\":\"a.txt\",\"contentType\":\"text/plain\"}}\r\n\
             --xyz\r\nContent-Type: {data_type}\r\n\r\n{data}\r\n--xyz--\r\n"
        ))
    }

    #[tokio::test]
    async fn parses_metadata_and_payload() {
        let upload = parse_multipart_related(
            Some(CT),
            body("application/json; charset=utf-8", "text/plain", "hello"),
        )
        .await
        .unwrap();
        assert_eq!(upload.metadata.name.as_deref(), Some("a.txt"));
        assert_eq!(upload.content_type, "text/plain");
        assert_eq!(&upload.data[..], b"hello");
    }

    #[tokio::test]
    async fn payload_may_contain_line_breaks() {
        let upload = parse_multipart_related(
            Some("multipart/related; boundary=\"xyz\""),
            body("application/json", "text/plain", "a\r\nb\r\n"),
        )
        .await
        .unwrap();
        assert_eq!(&upload.data[..], b"a\r\nb\r\n");
    }

    #[tokio::test]
    async fn rejects_foreign_request_content_type() {
        let err = parse_multipart_related(Some("foo"), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MultipartError::BadContentType(_)));
        assert!(err.to_string().starts_with("Bad content type"));

        let err = parse_multipart_related(Some("multipart/form-data; boundary=xyz"), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MultipartError::BadContentType(_)));

        let err = parse_multipart_related(None, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, MultipartError::BadContentType(_)));
    }

    #[tokio::test]
    async fn rejects_missing_boundary() {
        let err = parse_multipart_related(Some("multipart/related"), Bytes::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boundary"));
    }

    #[tokio::test]
    async fn rejects_non_json_metadata_part() {
        let err = parse_multipart_related(Some(CT), body("text/plain", "text/plain", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, MultipartError::BadContentType(_)));
    }

    #[tokio::test]
    async fn rejects_bad_data_part_content_type() {
        let err = parse_multipart_related(Some(CT), body("application/json", "foo", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, MultipartError::BadContentType(_)));
    }

    #[tokio::test]
    async fn rejects_single_part_body() {
        let raw = Bytes::from_static(
            b"--xyz\r\nContent-Type: application/json\r\n\r\n{}\r\n--xyz--\r\n",
        );
        let err = parse_multipart_related(Some(CT), raw).await.unwrap_err();
        assert!(matches!(err, MultipartError::PartCount(1)));
    }

    #[tokio::test]
    async fn rejects_truncated_body() {
        let raw = Bytes::from_static(b"--xyz\r\nContent-Type: application/json\r\n\r\n{}");
        let err = parse_multipart_related(Some(CT), raw).await.unwrap_err();
        assert!(matches!(err, MultipartError::Malformed(_)));
    }
}
