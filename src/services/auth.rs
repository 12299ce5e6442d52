//! Actor identity and the authorization gate.
//!
//! Rules evaluation lives outside this crate; everything here consumes it as
//! a yes/no capability check through [`AuthorizationGate`]. [`PolicyGate`] is
//! the built-in stand-in driven by [`AuthMode`].

use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use base64::{Engine as _, engine::general_purpose};
use clap::ValueEnum;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Bearer credential that identifies the emulator administrator.
pub const OWNER_TOKEN: &str = "owner";

/// Who is making a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Anonymous,
    User { uid: String },
    Owner,
}

impl Actor {
    /// Resolve the actor from the `Authorization` header.
    ///
    /// Missing or unparseable credentials resolve to `Anonymous`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                v.strip_prefix("Bearer ")
                    .or_else(|| v.strip_prefix("bearer "))
            })
            .map(|token| Self::from_bearer(token.trim()))
            .unwrap_or(Actor::Anonymous)
    }

    /// Interpret a bearer token. Tokens are unsigned JWTs; only the payload
    /// is decoded.
    pub fn from_bearer(token: &str) -> Self {
        if token == OWNER_TOKEN {
            return Actor::Owner;
        }

        let mut parts = token.split('.');
        let (Some(_header), Some(payload), Some(_signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Actor::Anonymous;
        };

        general_purpose::URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .ok()
            .and_then(|raw| serde_json::from_slice::<Value>(&raw).ok())
            .and_then(|claims| {
                ["user_id", "sub"]
                    .iter()
                    .find_map(|claim| claims.get(*claim).and_then(Value::as_str))
                    .filter(|uid| !uid.is_empty())
                    .map(str::to_string)
            })
            .map(|uid| Actor::User { uid })
            .unwrap_or(Actor::Anonymous)
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Actor::Anonymous)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Anonymous => f.write_str("anonymous"),
            Actor::User { uid } => write!(f, "user:{uid}"),
            Actor::Owner => f.write_str("owner"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Read,
    Write,
    Delete,
    /// Managing download tokens. Distinct from `Read`.
    Administer,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::Read => "read",
            Capability::Write => "write",
            Capability::Delete => "delete",
            Capability::Administer => "administer",
        })
    }
}

/// Access policy applied by [`PolicyGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum AuthMode {
    /// Everyone may read, write and delete.
    Open,
    /// Signed-in users may read, write and delete.
    #[default]
    Authenticated,
    /// Only the owner credential is accepted.
    Locked,
}

#[derive(Debug, Error)]
#[error("permission denied: {actor} may not {capability} `{bucket}/{path}`")]
pub struct AccessDenied {
    pub actor: Actor,
    pub capability: Capability,
    pub bucket: String,
    pub path: String,
}

/// Capability check consumed by every mutating or token-revealing operation.
#[async_trait]
pub trait AuthorizationGate: Send + Sync {
    async fn authorize(
        &self,
        actor: &Actor,
        capability: Capability,
        bucket: &str,
        path: &str,
    ) -> bool;
}

/// Ask the gate and turn a denial into an error.
pub async fn ensure(
    gate: &dyn AuthorizationGate,
    actor: &Actor,
    capability: Capability,
    bucket: &str,
    path: &str,
) -> Result<(), AccessDenied> {
    if gate.authorize(actor, capability, bucket, path).await {
        Ok(())
    } else {
        tracing::debug!(%actor, %capability, bucket, path, "authorization denied");
        Err(AccessDenied {
            actor: actor.clone(),
            capability,
            bucket: bucket.to_string(),
            path: path.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyGate {
    mode: AuthMode,
}

impl PolicyGate {
    pub fn new(mode: AuthMode) -> Self {
        Self { mode }
    }
}

#[async_trait]
impl AuthorizationGate for PolicyGate {
    async fn authorize(
        &self,
        actor: &Actor,
        capability: Capability,
        _bucket: &str,
        _path: &str,
    ) -> bool {
        if matches!(actor, Actor::Owner) {
            return true;
        }
        match (capability, self.mode) {
            (Capability::Administer, _) => false,
            (_, AuthMode::Open) => true,
            (_, AuthMode::Authenticated) => actor.is_authenticated(),
            (_, AuthMode::Locked) => false,
        }
    }
}
