//! Represents an object (blob) committed to a bucket, plus its download tokens.

use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A single committed object.
///
/// The record owns the payload bytes. `content` is skipped by serde so the
/// same struct doubles as the on-disk snapshot record, with the payload
/// written out as a separate blob.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StoredObject {
    /// Bucket the object lives in.
    pub bucket: String,

    /// Full object path within the bucket (e.g. `images/cat.png`).
    pub path: String,

    /// Payload bytes.
    #[serde(skip)]
    pub content: Bytes,

    /// Content type (MIME type).
    pub content_type: String,

    /// Size in bytes.
    pub size: u64,

    /// Strictly increasing per overwrite of the same key.
    pub generation: i64,

    /// Incremented on every metadata-only change.
    pub metageneration: i64,

    /// Base64-encoded MD5 digest of `content`.
    pub md5_hash: String,

    pub time_created: DateTime<Utc>,

    pub updated: DateTime<Utc>,

    /// User supplied key/value metadata.
    #[serde(default)]
    pub custom_metadata: BTreeMap<String, String>,

    /// Download tokens in creation order, no duplicates.
    #[serde(default)]
    pub download_tokens: Vec<String>,
}

/// The caller-controlled part of a new object.
#[derive(Clone, Debug, Default)]
pub struct NewObject {
    pub content: Bytes,
    pub content_type: Option<String>,
    pub custom_metadata: BTreeMap<String, String>,
}

impl StoredObject {
    /// Build a fresh record for `content` at the given generation.
    pub fn new(bucket: &str, path: &str, new: NewObject, generation: i64) -> Self {
        let now = Utc::now();
        let md5_hash = general_purpose::STANDARD.encode(md5::compute(&new.content).0);
        Self {
            bucket: bucket.to_string(),
            path: path.to_string(),
            size: new.content.len() as u64,
            content: new.content,
            content_type: new
                .content_type
                .filter(|ct| !ct.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            generation,
            metageneration: 1,
            md5_hash,
            time_created: now,
            updated: now,
            custom_metadata: new.custom_metadata,
            download_tokens: Vec::new(),
        }
    }

    /// Append a freshly generated token and return it.
    pub fn mint_download_token(&mut self) -> String {
        let token = self.push_token();
        self.touch_metadata();
        token
    }

    /// Give a freshly committed record its first token. Part of the commit
    /// itself, so the metageneration is left alone.
    pub fn ensure_download_token(&mut self) {
        if self.download_tokens.is_empty() {
            self.push_token();
        }
    }

    fn push_token(&mut self) -> String {
        let mut token = Uuid::new_v4().to_string();
        while self.download_tokens.contains(&token) {
            token = Uuid::new_v4().to_string();
        }
        self.download_tokens.push(token.clone());
        token
    }

    /// Remove `token` if present.
    ///
    /// The list is never left empty: when nothing remains a replacement is
    /// minted and returned.
    pub fn revoke_download_token(&mut self, token: &str) -> Option<String> {
        let before = self.download_tokens.len();
        self.download_tokens.retain(|t| t != token);
        if self.download_tokens.len() != before {
            self.touch_metadata();
        }
        if self.download_tokens.is_empty() {
            Some(self.mint_download_token())
        } else {
            None
        }
    }

    pub fn has_download_token(&self, token: &str) -> bool {
        self.download_tokens.iter().any(|t| t == token)
    }

    /// Quoted ETag value derived from the MD5 digest.
    pub fn etag(&self) -> String {
        format!("\"{}\"", self.md5_hash)
    }

    pub fn touch_metadata(&mut self) {
        self.metageneration += 1;
        self.updated = Utc::now();
    }
}

/// Object metadata as it is rendered on the wire.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadataResponse {
    pub name: String,
    pub bucket: String,
    pub generation: String,
    pub metageneration: String,
    pub content_type: String,
    pub time_created: String,
    pub updated: String,
    pub storage_class: &'static str,
    pub size: String,
    pub md5_hash: String,
    pub content_encoding: &'static str,
    pub content_disposition: &'static str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_tokens: Option<String>,
}

impl From<&StoredObject> for ObjectMetadataResponse {
    fn from(obj: &StoredObject) -> Self {
        Self {
            name: obj.path.clone(),
            bucket: obj.bucket.clone(),
            generation: obj.generation.to_string(),
            metageneration: obj.metageneration.to_string(),
            content_type: obj.content_type.clone(),
            time_created: obj.time_created.to_rfc3339(),
            updated: obj.updated.to_rfc3339(),
            storage_class: "STANDARD",
            size: obj.size.to_string(),
            md5_hash: obj.md5_hash.clone(),
            content_encoding: "identity",
            content_disposition: "inline",
            metadata: obj.custom_metadata.clone(),
            download_tokens: (!obj.download_tokens.is_empty())
                .then(|| obj.download_tokens.join(",")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object() -> StoredObject {
        StoredObject::new(
            "demo.appspot.com",
            "a/b.txt",
            NewObject {
                content: Bytes::from_static(b"hello"),
                content_type: Some("text/plain".into()),
                ..Default::default()
            },
            1,
        )
    }

    #[test]
    fn new_object_computes_size_and_md5() {
        let obj = object();
        assert_eq!(obj.size, 5);
        assert_eq!(obj.md5_hash, "XUFAKrxLKna5cZ2REBfFkg==");
        assert_eq!(obj.etag(), "\"XUFAKrxLKna5cZ2REBfFkg==\"");
        assert!(obj.download_tokens.is_empty());
    }

    #[test]
    fn blank_content_type_falls_back_to_octet_stream() {
        let obj = StoredObject::new(
            "b",
            "p",
            NewObject {
                content_type: Some("  ".into()),
                ..Default::default()
            },
            1,
        );
        assert_eq!(obj.content_type, DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn revoking_one_of_two_tokens_keeps_the_other() {
        let mut obj = object();
        let a = obj.mint_download_token();
        let b = obj.mint_download_token();

        assert_eq!(obj.revoke_download_token(&a), None);
        assert_eq!(obj.download_tokens, vec![b]);
    }

    #[test]
    fn revoking_last_token_mints_replacement() {
        let mut obj = object();
        let a = obj.mint_download_token();

        let replacement = obj.revoke_download_token(&a).expect("replacement");
        assert_ne!(replacement, a);
        assert_eq!(obj.download_tokens, vec![replacement]);
    }

    #[test]
    fn revoking_unknown_token_is_a_no_op() {
        let mut obj = object();
        let a = obj.mint_download_token();
        let metageneration = obj.metageneration;

        assert_eq!(obj.revoke_download_token("nope"), None);
        assert_eq!(obj.download_tokens, vec![a]);
        assert_eq!(obj.metageneration, metageneration);
    }

    #[test]
    fn response_joins_tokens_with_commas() {
        let mut obj = object();
        let a = obj.mint_download_token();
        let b = obj.mint_download_token();

        let resp = ObjectMetadataResponse::from(&obj);
        assert_eq!(resp.download_tokens, Some(format!("{a},{b}")));
        assert_eq!(resp.name, "a/b.txt");
        assert_eq!(resp.size, "5");
    }

    #[test]
    fn response_omits_tokens_when_none_exist() {
        let json = serde_json::to_value(ObjectMetadataResponse::from(&object())).unwrap();
        assert!(json.get("downloadTokens").is_none());
        assert_eq!(json["contentType"], "text/plain");
    }
}
