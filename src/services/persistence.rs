//! Import/export of committed objects.
//!
//! Layout under the snapshot directory:
//! - `metadata.json`: every object record, without payloads
//! - `blobs/{shard}/{shard}/{md5(bucket/path)}`: one payload per object
//!
//! Files are written to a temporary sibling and renamed into place. Upload
//! sessions are never exported.

use crate::{models::object::StoredObject, services::metadata_store::ObjectStore};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info};
use uuid::Uuid;

const METADATA_FILE: &str = "metadata.json";
const BLOB_DIR: &str = "blobs";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("snapshot metadata not found at {0}")]
    MissingMetadata(PathBuf),
    #[error("blob for `{bucket}/{path}` is {actual} bytes, metadata says {expected}")]
    SizeMismatch {
        bucket: String,
        path: String,
        expected: u64,
        actual: u64,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[derive(Serialize, Deserialize)]
struct SnapshotEntry {
    #[serde(flatten)]
    object: StoredObject,
    /// Blob location relative to the snapshot directory.
    blob: String,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    objects: Vec<SnapshotEntry>,
}

/// Write every object in `store` below `dir`. Returns the number exported.
pub async fn export_snapshot(store: &ObjectStore, dir: &Path) -> PersistenceResult<usize> {
    fs::create_dir_all(dir).await?;

    let mut entries = Vec::new();
    for object in store.snapshot() {
        let blob = blob_path(&object.bucket, &object.path);
        write_atomic(&dir.join(&blob), &object.content).await?;
        debug!(bucket = %object.bucket, path = %object.path, "exported blob");
        entries.push(SnapshotEntry {
            blob: blob.to_string_lossy().replace('\\', "/"),
            object,
        });
    }

    let count = entries.len();
    let json = serde_json::to_vec_pretty(&Snapshot { objects: entries })?;
    write_atomic(&dir.join(METADATA_FILE), &json).await?;
    info!(count, dir = %dir.display(), "exported storage snapshot");
    Ok(count)
}

/// Load a snapshot written by [`export_snapshot`] into `store`, replacing
/// objects with the same key. Returns the number imported.
pub async fn import_snapshot(store: &ObjectStore, dir: &Path) -> PersistenceResult<usize> {
    let metadata_path = dir.join(METADATA_FILE);
    let raw = match fs::read(&metadata_path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(PersistenceError::MissingMetadata(metadata_path));
        }
        Err(err) => return Err(err.into()),
    };
    let snapshot: Snapshot = serde_json::from_slice(&raw)?;

    let count = snapshot.objects.len();
    for SnapshotEntry { mut object, blob } in snapshot.objects {
        let content = fs::read(dir.join(&blob)).await?;
        if content.len() as u64 != object.size {
            return Err(PersistenceError::SizeMismatch {
                bucket: object.bucket,
                path: object.path,
                expected: object.size,
                actual: content.len() as u64,
            });
        }
        object.content = Bytes::from(content);
        store.restore(object);
    }

    info!(count, dir = %dir.display(), "imported storage snapshot");
    Ok(count)
}

/// `blobs/{aa}/{bb}/{md5}` for an object, where `aa`/`bb` are the first two
/// digest bytes.
fn blob_path(bucket: &str, path: &str) -> PathBuf {
    let digest = md5::compute(format!("{}/{}", bucket, path));
    let mut blob = PathBuf::from(BLOB_DIR);
    blob.push(format!("{:02x}", digest[0]));
    blob.push(format!("{:02x}", digest[1]));
    blob.push(format!("{:x}", digest));
    blob
}

/// Write `data` to a temp file next to `target`, fsync, then rename over it.
async fn write_atomic(target: &Path, data: &[u8]) -> io::Result<()> {
    let parent = target
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| io::Error::other("snapshot path missing parent directory"))?;
    fs::create_dir_all(&parent).await?;
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

    let result = async {
        let mut file = File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await?;
        fs::rename(&tmp_path, target).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
    }
    result
}
