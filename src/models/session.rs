//! Represents an in-flight resumable upload session.

use crate::services::auth::Actor;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::{collections::BTreeMap, fmt, time::Instant};

/// Lifecycle state of an upload session. `Finalized` and `Cancelled` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Active,
    Finalized,
    Cancelled,
}

/// Why a command was refused by a transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// The session already committed its content.
    Finalized,
    /// The session was cancelled and only answers further cancels.
    Cancelled,
}

/// Outcome of a `cancel` transition that is allowed to proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelTransition {
    Cancel,
    AlreadyCancelled,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, UploadState::Active)
    }

    /// Transition table for `upload` and `finalize`.
    pub fn on_commit(self) -> Result<(), Refusal> {
        match self {
            UploadState::Active => Ok(()),
            UploadState::Finalized => Err(Refusal::Finalized),
            UploadState::Cancelled => Err(Refusal::Cancelled),
        }
    }

    /// Transition table for `cancel`. Repeat cancels succeed; cancelling a
    /// finalized session does not.
    pub fn on_cancel(self) -> Result<CancelTransition, Refusal> {
        match self {
            UploadState::Active => Ok(CancelTransition::Cancel),
            UploadState::Cancelled => Ok(CancelTransition::AlreadyCancelled),
            UploadState::Finalized => Err(Refusal::Finalized),
        }
    }

    /// Value reported in the `X-Goog-Upload-Status` header.
    pub fn as_status(self) -> &'static str {
        match self {
            UploadState::Active => "active",
            UploadState::Finalized => "final",
            UploadState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_status())
    }
}

/// Metadata a client may send alongside `start` or inside a multipart body.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug)]
pub struct UploadSession {
    /// Opaque id embedded in the upload URL.
    pub id: String,

    pub bucket: String,

    pub path: String,

    /// Content type the committed object will carry.
    pub content_type: Option<String>,

    pub custom_metadata: BTreeMap<String, String>,

    pub state: UploadState,

    /// Never decreases.
    pub bytes_received: u64,

    /// Actor captured when the session was committed.
    pub auth_context: Option<Actor>,

    pending: BytesMut,

    pub created_at: DateTime<Utc>,

    pub last_activity: Instant,
}

impl UploadSession {
    pub fn new(id: String, bucket: &str, path: &str, metadata: UploadMetadata) -> Self {
        Self {
            id,
            bucket: bucket.to_string(),
            path: path.to_string(),
            content_type: metadata.content_type,
            custom_metadata: metadata.metadata.unwrap_or_default(),
            state: UploadState::Active,
            bytes_received: 0,
            auth_context: None,
            pending: BytesMut::new(),
            created_at: Utc::now(),
            last_activity: Instant::now(),
        }
    }

    /// True when the session was started for this bucket (and path, when the
    /// caller supplied one).
    pub fn targets(&self, bucket: &str, path: Option<&str>) -> bool {
        self.bucket == bucket && path.is_none_or(|p| p == self.path)
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn append(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        self.bytes_received += chunk.len() as u64;
    }

    /// Buffered content followed by `tail`. Leaves the session untouched so
    /// a failed commit has nothing to undo.
    pub fn content_with(&self, tail: &[u8]) -> Bytes {
        let mut content = BytesMut::with_capacity(self.pending.len() + tail.len());
        content.extend_from_slice(&self.pending);
        content.extend_from_slice(tail);
        content.freeze()
    }

    /// Record a successful commit of the buffer plus a tail of `tail_len`
    /// bytes made by `actor`.
    pub fn finish(&mut self, tail_len: usize, actor: Actor) {
        self.bytes_received += tail_len as u64;
        self.discard_pending();
        self.auth_context = Some(actor);
        self.state = UploadState::Finalized;
    }

    pub fn discard_pending(&mut self) {
        self.pending = BytesMut::new();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_table_only_allows_active() {
        assert_eq!(UploadState::Active.on_commit(), Ok(()));
        assert_eq!(UploadState::Finalized.on_commit(), Err(Refusal::Finalized));
        assert_eq!(UploadState::Cancelled.on_commit(), Err(Refusal::Cancelled));
    }

    #[test]
    fn cancel_table_is_idempotent_but_not_after_finalize() {
        assert_eq!(UploadState::Active.on_cancel(), Ok(CancelTransition::Cancel));
        assert_eq!(
            UploadState::Cancelled.on_cancel(),
            Ok(CancelTransition::AlreadyCancelled)
        );
        assert_eq!(UploadState::Finalized.on_cancel(), Err(Refusal::Finalized));
    }

    #[test]
    fn append_accumulates_without_finishing() {
        let mut session = UploadSession::new("id".into(), "b", "p", UploadMetadata::default());
        session.append(b"abc");
        session.append(b"de");
        assert_eq!(session.bytes_received, 5);

        assert_eq!(&session.content_with(b"f")[..], b"abcdef");
        assert_eq!(session.pending_len(), 5);
        assert_eq!(session.bytes_received, 5);
        assert_eq!(session.state, UploadState::Active);
    }

    #[test]
    fn finish_releases_buffer_and_records_actor() {
        let mut session = UploadSession::new("id".into(), "b", "p", UploadMetadata::default());
        session.append(b"abc");
        session.finish(2, Actor::Owner);

        assert_eq!(session.state, UploadState::Finalized);
        assert_eq!(session.bytes_received, 5);
        assert_eq!(session.pending_len(), 0);
        assert_eq!(session.auth_context, Some(Actor::Owner));
    }

    #[test]
    fn targets_checks_bucket_and_optional_path() {
        let session = UploadSession::new("id".into(), "b", "p", UploadMetadata::default());
        assert!(session.targets("b", None));
        assert!(session.targets("b", Some("p")));
        assert!(!session.targets("b", Some("q")));
        assert!(!session.targets("c", None));
    }
}
