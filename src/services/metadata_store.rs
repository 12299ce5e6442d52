//! ObjectStore: the in-memory map of committed objects, keyed by
//! `(bucket, path)`.
//!
//! Every mutation runs inside a single `DashMap` entry guard, so writes to one
//! key are serialized while different keys proceed in parallel.

use crate::{
    models::object::{NewObject, StoredObject},
    services::auth::AccessDenied,
};
use chrono::Utc;
use dashmap::{DashMap, mapref::entry::Entry};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object `{path}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, path: String },
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("invalid object path")]
    InvalidObjectPath,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Forbidden(#[from] AccessDenied),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub bucket: String,
    pub path: String,
}

impl ObjectKey {
    pub fn new(bucket: &str, path: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            path: path.to_string(),
        }
    }
}

const MAX_OBJECT_PATH_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 222;

#[derive(Default)]
pub struct ObjectStore {
    objects: DashMap<ObjectKey, StoredObject>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn get(&self, bucket: &str, path: &str) -> StoreResult<StoredObject> {
        self.objects
            .get(&ObjectKey::new(bucket, path))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| not_found(bucket, path))
    }

    /// Create or overwrite the object at `(bucket, path)`.
    ///
    /// Overwrites keep the existing download tokens and bump the generation.
    /// A record that ends up without any token gets one minted.
    pub fn commit(&self, bucket: &str, path: &str, new: NewObject) -> StoreResult<StoredObject> {
        validate_bucket_name(bucket)?;
        validate_object_path(path)?;

        let committed = match self.objects.entry(ObjectKey::new(bucket, path)) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.get();
                let generation = next_generation(Some(previous.generation));
                let mut obj = StoredObject::new(bucket, path, new, generation);
                obj.download_tokens = previous.download_tokens.clone();
                obj.ensure_download_token();
                occupied.insert(obj.clone());
                obj
            }
            Entry::Vacant(vacant) => {
                let mut obj = StoredObject::new(bucket, path, new, next_generation(None));
                obj.ensure_download_token();
                vacant.insert(obj.clone());
                obj
            }
        };

        debug!(
            bucket,
            path,
            generation = committed.generation,
            size = committed.size,
            "object committed"
        );
        Ok(committed)
    }

    /// Apply `f` to the object under its key's exclusive guard and return the
    /// updated record.
    pub fn update<F>(&self, bucket: &str, path: &str, f: F) -> StoreResult<StoredObject>
    where
        F: FnOnce(&mut StoredObject),
    {
        let mut entry = self
            .objects
            .get_mut(&ObjectKey::new(bucket, path))
            .ok_or_else(|| not_found(bucket, path))?;
        f(entry.value_mut());
        Ok(entry.value().clone())
    }

    pub fn remove(&self, bucket: &str, path: &str) -> StoreResult<StoredObject> {
        self.objects
            .remove(&ObjectKey::new(bucket, path))
            .map(|(_, obj)| obj)
            .ok_or_else(|| not_found(bucket, path))
    }

    /// Copy of every object, ordered by bucket then path.
    pub fn snapshot(&self) -> Vec<StoredObject> {
        let mut all: Vec<StoredObject> = self.objects.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| (&a.bucket, &a.path).cmp(&(&b.bucket, &b.path)));
        all
    }

    /// Insert a record as-is, replacing whatever was there.
    pub fn restore(&self, obj: StoredObject) {
        self.objects.insert(ObjectKey::new(&obj.bucket, &obj.path), obj);
    }
}

fn not_found(bucket: &str, path: &str) -> StoreError {
    StoreError::ObjectNotFound {
        bucket: bucket.to_string(),
        path: path.to_string(),
    }
}

/// Generations are microsecond timestamps, forced strictly above the previous
/// generation of the same key.
fn next_generation(previous: Option<i64>) -> i64 {
    let now = Utc::now().timestamp_micros();
    match previous {
        Some(prev) if prev >= now => prev + 1,
        _ => now,
    }
}

/// Reject empty, oversized, or control-character object paths.
pub fn validate_object_path(path: &str) -> StoreResult<()> {
    if path.is_empty() || path.len() > MAX_OBJECT_PATH_LEN {
        return Err(StoreError::InvalidObjectPath);
    }
    if path.bytes().any(|b| b.is_ascii_control()) {
        return Err(StoreError::InvalidObjectPath);
    }
    Ok(())
}

/// Validate a bucket name.
///
/// - 3–222 characters
/// - lowercase letters, digits, dots, hyphens, underscores
/// - must start and end with a letter or digit
/// - no consecutive dots, not shaped like an IPv4 address
pub fn validate_bucket_name(name: &str) -> StoreResult<()> {
    let invalid = |reason: &str| StoreError::InvalidBucketName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return Err(invalid("must be between 3 and 222 characters"));
    }

    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-' | '_'))
    {
        return Err(invalid(
            "allowed characters are lowercase letters, digits, dots, hyphens, and underscores",
        ));
    }

    let alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if !alnum(name.chars().next()) || !alnum(name.chars().last()) {
        return Err(invalid("must start and end with a lowercase letter or digit"));
    }

    if name.contains("..") {
        return Err(invalid("cannot contain consecutive dots"));
    }

    if is_ipv4_like(name) {
        return Err(invalid("must not be formatted like an IP address"));
    }

    Ok(())
}

fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}
