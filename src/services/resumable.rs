//! Resumable upload protocol.
//!
//! A session is opened by `start` and driven by later, independent requests
//! carrying `upload`, `finalize`, `cancel` or `query` commands. Authorization
//! is deferred: `start` and `upload` never consult the gate, `finalize` does,
//! so an unauthenticated client can open and fill a session but never commit
//! it.
//!
//! Evaluation order for every command against an existing session:
//! 1. lookup (unknown id or mismatched target → not found)
//! 2. the command's transition table (terminal states answer here)
//! 3. offset and size checks
//! 4. the gate, for commands that commit
//! 5. side effects
//!
//! Nothing is mutated before step 5, so a refused command leaves the session
//! exactly as it found it.

use crate::{
    models::{
        object::{NewObject, StoredObject},
        session::{CancelTransition, Refusal, UploadMetadata, UploadState},
    },
    services::{
        auth::{self, AccessDenied, Actor, AuthorizationGate, Capability},
        metadata_store::{
            ObjectStore, StoreError, validate_bucket_name, validate_object_path,
        },
        session_store::{SessionHandle, UploadSessionStore},
    },
};
use bytes::Bytes;
use std::{fmt, str::FromStr, sync::Arc};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload session `{0}` not found")]
    SessionNotFound(String),
    #[error("upload session `{0}` was cancelled")]
    SessionCancelled(String),
    #[error("upload session `{0}` is already finalized")]
    AlreadyFinalized(String),
    #[error("upload offset mismatch: expected {expected}, got {got}")]
    OffsetMismatch { expected: u64, got: u64 },
    #[error("missing X-Goog-Upload-Offset header")]
    MissingOffset,
    #[error("invalid X-Goog-Upload-Offset header `{0}`")]
    InvalidOffset(String),
    #[error("upload exceeds the {limit} byte limit")]
    TooLarge { limit: usize },
    #[error("missing object name")]
    MissingObjectName,
    #[error("missing X-Goog-Upload-Command header")]
    MissingCommand,
    #[error("unknown upload command `{0}`")]
    UnknownCommand(String),
    #[error("upload command `{0}` is not valid here")]
    UnexpectedCommand(UploadCommand),
    #[error("unsupported upload protocol `{0}`")]
    UnknownProtocol(String),
    #[error("invalid upload metadata: {0}")]
    InvalidMetadata(String),
    #[error(transparent)]
    Forbidden(#[from] AccessDenied),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A value of the `X-Goog-Upload-Command` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadCommand {
    Start,
    Upload,
    Finalize,
    /// `upload, finalize`: an upload immediately followed by a finalize.
    UploadFinalize,
    Cancel,
    Query,
}

impl UploadCommand {
    pub fn includes_upload(self) -> bool {
        matches!(self, UploadCommand::Upload | UploadCommand::UploadFinalize)
    }

    pub fn includes_finalize(self) -> bool {
        matches!(self, UploadCommand::Finalize | UploadCommand::UploadFinalize)
    }
}

impl FromStr for UploadCommand {
    type Err = UploadError;

    /// Parse a comma separated command list. Only `upload` and `finalize`
    /// combine; anything else unknown or combined is rejected.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<String> = raw
            .split(',')
            .map(|part| part.trim().to_ascii_lowercase())
            .filter(|part| !part.is_empty())
            .collect();
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();

        match parts.as_slice() {
            ["start"] => Ok(UploadCommand::Start),
            ["upload"] => Ok(UploadCommand::Upload),
            ["finalize"] => Ok(UploadCommand::Finalize),
            ["upload", "finalize"] | ["finalize", "upload"] => Ok(UploadCommand::UploadFinalize),
            ["cancel"] => Ok(UploadCommand::Cancel),
            ["query"] => Ok(UploadCommand::Query),
            [] => Err(UploadError::MissingCommand),
            _ => Err(UploadError::UnknownCommand(raw.trim().to_string())),
        }
    }
}

impl fmt::Display for UploadCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UploadCommand::Start => "start",
            UploadCommand::Upload => "upload",
            UploadCommand::Finalize => "finalize",
            UploadCommand::UploadFinalize => "upload, finalize",
            UploadCommand::Cancel => "cancel",
            UploadCommand::Query => "query",
        })
    }
}

/// A command addressed to an existing session.
#[derive(Debug)]
pub struct CommandRequest<'a> {
    pub upload_id: &'a str,
    pub bucket: &'a str,
    /// Object path from the upload URL, when present.
    pub path: Option<&'a str>,
    pub actor: &'a Actor,
    pub command: UploadCommand,
    pub offset: Option<u64>,
    pub body: Bytes,
}

#[derive(Debug)]
pub enum CommandOutcome {
    /// Bytes were accepted; the session is still open.
    Active { bytes_received: u64 },
    /// Content was committed.
    Finalized(StoredObject),
    Cancelled,
    /// Answer to `query`.
    Status {
        state: UploadState,
        bytes_received: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedUpload {
    pub upload_id: String,
    pub bucket: String,
    pub path: String,
}

#[derive(Clone)]
pub struct ResumableUploads {
    sessions: Arc<UploadSessionStore>,
    objects: Arc<ObjectStore>,
    gate: Arc<dyn AuthorizationGate>,
    max_upload_bytes: usize,
}

impl ResumableUploads {
    pub fn new(
        sessions: Arc<UploadSessionStore>,
        objects: Arc<ObjectStore>,
        gate: Arc<dyn AuthorizationGate>,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            sessions,
            objects,
            gate,
            max_upload_bytes,
        }
    }

    /// Open a session. Always succeeds for a well-formed target regardless of
    /// who asks; the write check happens at `finalize`.
    pub fn start(
        &self,
        actor: &Actor,
        bucket: &str,
        name: Option<&str>,
        metadata: UploadMetadata,
    ) -> Result<StartedUpload, UploadError> {
        let path = name
            .or(metadata.name.as_deref())
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .ok_or(UploadError::MissingObjectName)?;
        validate_bucket_name(bucket)?;
        validate_object_path(&path)?;

        let upload_id = self.sessions.create(bucket, &path, metadata);
        info!(%actor, bucket, path = %path, upload_id = %upload_id, "resumable upload started");

        Ok(StartedUpload {
            upload_id,
            bucket: bucket.to_string(),
            path,
        })
    }

    /// Run one protocol command against an existing session.
    pub async fn execute(&self, req: CommandRequest<'_>) -> Result<CommandOutcome, UploadError> {
        match req.command {
            UploadCommand::Start => Err(UploadError::UnexpectedCommand(req.command)),
            UploadCommand::Cancel => self.cancel(&req).await,
            UploadCommand::Query => self.query(&req).await,
            UploadCommand::Upload | UploadCommand::Finalize | UploadCommand::UploadFinalize => {
                self.transfer(req).await
            }
        }
    }

    fn lookup(&self, req: &CommandRequest<'_>) -> Result<SessionHandle, UploadError> {
        self.sessions
            .get(req.upload_id)
            .ok_or_else(|| UploadError::SessionNotFound(req.upload_id.to_string()))
    }

    async fn transfer(&self, req: CommandRequest<'_>) -> Result<CommandOutcome, UploadError> {
        let handle = self.lookup(&req)?;
        let mut session = handle.lock().await;
        if !session.targets(req.bucket, req.path) {
            return Err(UploadError::SessionNotFound(req.upload_id.to_string()));
        }
        session.touch();

        session
            .state
            .on_commit()
            .map_err(|refusal| refused(refusal, req.upload_id))?;

        if req.command.includes_upload() {
            let offset = req.offset.ok_or(UploadError::MissingOffset)?;
            check_offset(session.bytes_received, offset)?;
            let total = session.bytes_received as usize + req.body.len();
            if total > self.max_upload_bytes {
                return Err(UploadError::TooLarge {
                    limit: self.max_upload_bytes,
                });
            }
        } else if let Some(offset) = req.offset {
            check_offset(session.bytes_received, offset)?;
        }

        if !req.command.includes_finalize() {
            session.append(&req.body);
            debug!(
                upload_id = req.upload_id,
                bytes_received = session.bytes_received,
                buffered = session.pending_len(),
                "upload chunk accepted"
            );
            return Ok(CommandOutcome::Active {
                bytes_received: session.bytes_received,
            });
        }

        auth::ensure(
            self.gate.as_ref(),
            req.actor,
            Capability::Write,
            &session.bucket,
            &session.path,
        )
        .await?;

        let tail: &[u8] = if req.command.includes_upload() {
            &req.body
        } else {
            &[]
        };
        let new = NewObject {
            content: session.content_with(tail),
            content_type: session.content_type.clone(),
            custom_metadata: session.custom_metadata.clone(),
        };
        let committed = self.objects.commit(&session.bucket, &session.path, new)?;
        session.finish(tail.len(), req.actor.clone());

        info!(
            actor = %req.actor,
            upload_id = req.upload_id,
            bucket = %committed.bucket,
            path = %committed.path,
            size = committed.size,
            "resumable upload finalized"
        );
        Ok(CommandOutcome::Finalized(committed))
    }

    async fn cancel(&self, req: &CommandRequest<'_>) -> Result<CommandOutcome, UploadError> {
        let handle = self.lookup(req)?;
        let mut session = handle.lock().await;
        if !session.targets(req.bucket, req.path) {
            return Err(UploadError::SessionNotFound(req.upload_id.to_string()));
        }
        session.touch();

        match session
            .state
            .on_cancel()
            .map_err(|refusal| refused(refusal, req.upload_id))?
        {
            CancelTransition::Cancel => {
                session.state = UploadState::Cancelled;
                session.discard_pending();
                info!(upload_id = req.upload_id, "resumable upload cancelled");
            }
            CancelTransition::AlreadyCancelled => {
                debug!(upload_id = req.upload_id, "repeat cancel");
            }
        }
        Ok(CommandOutcome::Cancelled)
    }

    async fn query(&self, req: &CommandRequest<'_>) -> Result<CommandOutcome, UploadError> {
        let handle = self.lookup(req)?;
        let mut session = handle.lock().await;
        if !session.targets(req.bucket, req.path) {
            return Err(UploadError::SessionNotFound(req.upload_id.to_string()));
        }
        if !session.state.is_terminal() {
            session.touch();
        }
        Ok(CommandOutcome::Status {
            state: session.state,
            bytes_received: session.bytes_received,
        })
    }
}

fn refused(refusal: Refusal, upload_id: &str) -> UploadError {
    match refusal {
        Refusal::Finalized => UploadError::AlreadyFinalized(upload_id.to_string()),
        Refusal::Cancelled => UploadError::SessionCancelled(upload_id.to_string()),
    }
}

fn check_offset(expected: u64, got: u64) -> Result<(), UploadError> {
    if expected == got {
        Ok(())
    } else {
        Err(UploadError::OffsetMismatch { expected, got })
    }
}

/// Parse the `X-Goog-Upload-Offset` header value.
pub fn parse_offset(raw: &str) -> Result<u64, UploadError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| UploadError::InvalidOffset(raw.to_string()))
}
