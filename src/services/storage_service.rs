//! src/services/storage_service.rs
//!
//! StorageService: shared state handed to every handler. It owns the object
//! metadata store, the upload session store and the authorization gate, and
//! exposes the operations that act on committed objects directly: reads,
//! downloads, deletes, metadata patches and single-request uploads.

use crate::{
    models::object::{NewObject, StoredObject},
    services::{
        auth::{self, Actor, AuthorizationGate, Capability},
        metadata_store::{ObjectStore, StoreError, StoreResult},
        resumable::ResumableUploads,
        session_store::UploadSessionStore,
        token_manager::DownloadTokenManager,
    },
};
use serde::Deserialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::info;

/// Partial metadata update accepted by `PATCH`. A `null` value in `metadata`
/// removes that key.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectPatch {
    pub content_type: Option<String>,
    pub metadata: Option<BTreeMap<String, Option<String>>>,
}

#[derive(Clone)]
pub struct StorageService {
    pub objects: Arc<ObjectStore>,
    pub sessions: Arc<UploadSessionStore>,
    pub gate: Arc<dyn AuthorizationGate>,
    pub resumable: ResumableUploads,
    pub tokens: DownloadTokenManager,
    /// Base URL for resumable upload URLs; derived per request when unset.
    pub public_url: Option<String>,
    pub max_upload_bytes: usize,
}

impl StorageService {
    pub fn new(
        gate: Arc<dyn AuthorizationGate>,
        max_upload_bytes: usize,
        public_url: Option<String>,
    ) -> Self {
        let objects = Arc::new(ObjectStore::new());
        let sessions = Arc::new(UploadSessionStore::new());
        Self {
            resumable: ResumableUploads::new(
                sessions.clone(),
                objects.clone(),
                gate.clone(),
                max_upload_bytes,
            ),
            tokens: DownloadTokenManager::new(objects.clone(), gate.clone()),
            objects,
            sessions,
            gate,
            public_url,
            max_upload_bytes,
        }
    }

    /// Metadata lookup. A missing object is reported before authorization.
    pub async fn get_object_metadata(
        &self,
        actor: &Actor,
        bucket: &str,
        path: &str,
    ) -> StoreResult<StoredObject> {
        let obj = self.objects.get(bucket, path)?;
        auth::ensure(self.gate.as_ref(), actor, Capability::Read, bucket, path).await?;
        Ok(obj)
    }

    /// Content download. A matching download token stands in for read
    /// permission.
    pub async fn download_object(
        &self,
        actor: &Actor,
        bucket: &str,
        path: &str,
        token: Option<&str>,
    ) -> StoreResult<StoredObject> {
        let obj = self.objects.get(bucket, path)?;
        if token.is_some_and(|t| obj.has_download_token(t)) {
            return Ok(obj);
        }
        auth::ensure(self.gate.as_ref(), actor, Capability::Read, bucket, path).await?;
        Ok(obj)
    }

    pub async fn delete_object(
        &self,
        actor: &Actor,
        bucket: &str,
        path: &str,
    ) -> StoreResult<StoredObject> {
        self.objects.get(bucket, path)?;
        auth::ensure(self.gate.as_ref(), actor, Capability::Delete, bucket, path).await?;
        let removed = self.objects.remove(bucket, path)?;
        info!(%actor, bucket, path, "object deleted");
        Ok(removed)
    }

    pub async fn update_object_metadata(
        &self,
        actor: &Actor,
        bucket: &str,
        path: &str,
        patch: ObjectPatch,
    ) -> StoreResult<StoredObject> {
        self.objects.get(bucket, path)?;
        auth::ensure(self.gate.as_ref(), actor, Capability::Write, bucket, path).await?;
        self.objects.update(bucket, path, |obj| {
            if let Some(content_type) = patch.content_type {
                obj.content_type = content_type;
            }
            for (key, value) in patch.metadata.unwrap_or_default() {
                match value {
                    Some(value) => obj.custom_metadata.insert(key, value),
                    None => obj.custom_metadata.remove(&key),
                };
            }
            obj.touch_metadata();
        })
    }

    /// Commit an object in one request (multipart or raw media upload).
    /// Write permission is checked against the target before anything is
    /// stored.
    pub async fn upload_direct(
        &self,
        actor: &Actor,
        bucket: &str,
        path: &str,
        new: NewObject,
    ) -> StoreResult<StoredObject> {
        if new.content.len() > self.max_upload_bytes {
            return Err(StoreError::BadRequest(format!(
                "upload exceeds the {} byte limit",
                self.max_upload_bytes
            )));
        }
        auth::ensure(self.gate.as_ref(), actor, Capability::Write, bucket, path).await?;
        let committed = self.objects.commit(bucket, path, new)?;
        info!(%actor, bucket, path, size = committed.size, "object uploaded");
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::auth::{AuthMode, PolicyGate};
    use bytes::Bytes;

    const BUCKET: &str = "demo-project.appspot.com";

    fn service() -> StorageService {
        StorageService::new(
            Arc::new(PolicyGate::new(AuthMode::Authenticated)),
            1024,
            None,
        )
    }

    fn user() -> Actor {
        Actor::User { uid: "alice".into() }
    }

    fn hello() -> NewObject {
        NewObject {
            content: Bytes::from_static(b"hello"),
            content_type: Some("text/plain".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn direct_upload_requires_write() {
        let svc = service();
        let err = svc
            .upload_direct(&Actor::Anonymous, BUCKET, "a.txt", hello())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));
        assert_eq!(svc.objects.len(), 0);

        svc.upload_direct(&user(), BUCKET, "a.txt", hello())
            .await
            .unwrap();
        assert_eq!(svc.objects.len(), 1);
    }

    #[tokio::test]
    async fn direct_upload_enforces_size_limit() {
        let svc = service();
        let new = NewObject {
            content: Bytes::from(vec![0u8; 2048]),
            ..Default::default()
        };
        let err = svc
            .upload_direct(&user(), BUCKET, "big", new)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BadRequest(_)));
    }

    #[tokio::test]
    async fn missing_object_reports_not_found_before_forbidden() {
        let svc = service();
        let err = svc
            .get_object_metadata(&Actor::Anonymous, BUCKET, "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ObjectNotFound { .. }));
    }

    #[tokio::test]
    async fn download_token_substitutes_for_read_permission() {
        let svc = service();
        let obj = svc
            .upload_direct(&user(), BUCKET, "a.txt", hello())
            .await
            .unwrap();
        let token = obj.download_tokens[0].clone();

        assert!(
            svc.download_object(&Actor::Anonymous, BUCKET, "a.txt", Some(&token))
                .await
                .is_ok()
        );
        assert!(matches!(
            svc.download_object(&Actor::Anonymous, BUCKET, "a.txt", Some("wrong"))
                .await,
            Err(StoreError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn delete_then_read_is_not_found() {
        let svc = service();
        svc.upload_direct(&user(), BUCKET, "a.txt", hello())
            .await
            .unwrap();

        let err = svc
            .delete_object(&Actor::Anonymous, BUCKET, "a.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));

        svc.delete_object(&user(), BUCKET, "a.txt").await.unwrap();
        assert!(matches!(
            svc.get_object_metadata(&user(), BUCKET, "a.txt").await,
            Err(StoreError::ObjectNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn patch_updates_metadata_and_metageneration() {
        let svc = service();
        let mut new = hello();
        new.custom_metadata.insert("keep".into(), "1".into());
        new.custom_metadata.insert("drop".into(), "2".into());
        let before = svc
            .upload_direct(&user(), BUCKET, "a.txt", new)
            .await
            .unwrap();

        let patch = ObjectPatch {
            content_type: Some("application/json".into()),
            metadata: Some(BTreeMap::from([
                ("drop".to_string(), None),
                ("add".to_string(), Some("3".to_string())),
            ])),
        };
        let after = svc
            .update_object_metadata(&user(), BUCKET, "a.txt", patch)
            .await
            .unwrap();

        assert_eq!(after.content_type, "application/json");
        assert_eq!(after.metageneration, before.metageneration + 1);
        assert_eq!(
            after.custom_metadata,
            BTreeMap::from([
                ("add".to_string(), "3".to_string()),
                ("keep".to_string(), "1".to_string()),
            ])
        );
    }
}
