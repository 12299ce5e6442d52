//! Download token management.
//!
//! Both operations require the `Administer` capability, checked before any
//! token state is read. Once an object has a token it keeps at least one:
//! deleting the last token mints its replacement under the same key guard.

use crate::{
    models::object::StoredObject,
    services::{
        auth::{self, Actor, AuthorizationGate, Capability},
        metadata_store::{ObjectStore, StoreError, StoreResult},
    },
};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct DownloadTokenManager {
    objects: Arc<ObjectStore>,
    gate: Arc<dyn AuthorizationGate>,
}

impl DownloadTokenManager {
    pub fn new(objects: Arc<ObjectStore>, gate: Arc<dyn AuthorizationGate>) -> Self {
        Self { objects, gate }
    }

    /// Append a new token. `flag` is the raw `create_token` query value and
    /// must be exactly `true`.
    pub async fn create_token(
        &self,
        actor: &Actor,
        bucket: &str,
        path: &str,
        flag: &str,
    ) -> StoreResult<StoredObject> {
        if flag != "true" {
            return Err(StoreError::BadRequest(format!(
                "create_token must be `true`, got `{flag}`"
            )));
        }
        auth::ensure(self.gate.as_ref(), actor, Capability::Administer, bucket, path).await?;

        let updated = self.objects.update(bucket, path, |obj| {
            obj.mint_download_token();
        })?;
        info!(bucket, path, tokens = updated.download_tokens.len(), "download token created");
        Ok(updated)
    }

    /// Remove `token`. If it was the last one, a replacement is minted in the
    /// same step so the list is never observed empty.
    pub async fn delete_token(
        &self,
        actor: &Actor,
        bucket: &str,
        path: &str,
        token: &str,
    ) -> StoreResult<StoredObject> {
        auth::ensure(self.gate.as_ref(), actor, Capability::Administer, bucket, path).await?;

        let mut replacement = None;
        let updated = self.objects.update(bucket, path, |obj| {
            replacement = obj.revoke_download_token(token);
        })?;
        info!(
            bucket,
            path,
            replaced = replacement.is_some(),
            tokens = updated.download_tokens.len(),
            "download token deleted"
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::object::NewObject,
        services::auth::{AuthMode, PolicyGate},
    };
    use bytes::Bytes;

    const BUCKET: &str = "demo-project.appspot.com";
    const PATH: &str = "docs/readme.txt";

    fn setup() -> (DownloadTokenManager, Arc<ObjectStore>, String) {
        let objects = Arc::new(ObjectStore::new());
        let obj = objects
            .commit(
                BUCKET,
                PATH,
                NewObject {
                    content: Bytes::from_static(b"hi"),
                    ..Default::default()
                },
            )
            .unwrap();
        let first = obj.download_tokens[0].clone();
        let manager = DownloadTokenManager::new(
            objects.clone(),
            Arc::new(PolicyGate::new(AuthMode::Authenticated)),
        );
        (manager, objects, first)
    }

    #[tokio::test]
    async fn create_appends_in_order() {
        let (manager, _, first) = setup();
        let updated = manager
            .create_token(&Actor::Owner, BUCKET, PATH, "true")
            .await
            .unwrap();
        assert_eq!(updated.download_tokens.len(), 2);
        assert_eq!(updated.download_tokens[0], first);
    }

    #[tokio::test]
    async fn create_rejects_values_other_than_true() {
        let (manager, _, _) = setup();
        for flag in ["false", "TRUE", "1", ""] {
            let err = manager
                .create_token(&Actor::Owner, BUCKET, PATH, flag)
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::BadRequest(_)), "flag {flag:?}");
        }
    }

    #[tokio::test]
    async fn non_admins_are_forbidden_before_lookup() {
        let (manager, objects, first) = setup();
        let user = Actor::User { uid: "u".into() };

        let err = manager
            .create_token(&user, BUCKET, PATH, "true")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));

        let err = manager
            .delete_token(&user, BUCKET, "missing", &first)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));

        assert_eq!(objects.get(BUCKET, PATH).unwrap().download_tokens, vec![first]);
    }

    #[tokio::test]
    async fn delete_keeps_remaining_tokens_in_order() {
        let (manager, _, first) = setup();
        let second = manager
            .create_token(&Actor::Owner, BUCKET, PATH, "true")
            .await
            .unwrap()
            .download_tokens[1]
            .clone();

        let updated = manager
            .delete_token(&Actor::Owner, BUCKET, PATH, &first)
            .await
            .unwrap();
        assert_eq!(updated.download_tokens, vec![second]);
    }

    #[tokio::test]
    async fn deleting_the_only_token_regenerates_one() {
        let (manager, _, first) = setup();
        let updated = manager
            .delete_token(&Actor::Owner, BUCKET, PATH, &first)
            .await
            .unwrap();
        assert_eq!(updated.download_tokens.len(), 1);
        assert_ne!(updated.download_tokens[0], first);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let (manager, _, _) = setup();
        let err = manager
            .create_token(&Actor::Owner, BUCKET, "nope", "true")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ObjectNotFound { .. }));
    }
}
