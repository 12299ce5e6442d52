//! Resumable upload session records keyed by upload id.
//!
//! Each session sits behind its own async mutex. Commands against one session
//! serialize on that mutex (held across the authorization await), while
//! different sessions never contend.

use crate::models::session::{UploadMetadata, UploadSession};
use dashmap::DashMap;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info};
use uuid::Uuid;

pub type SessionHandle = Arc<Mutex<UploadSession>>;

#[derive(Default)]
pub struct UploadSessionStore {
    sessions: DashMap<String, SessionHandle>,
}

impl UploadSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new `Active` session and return its id.
    pub fn create(&self, bucket: &str, path: &str, metadata: UploadMetadata) -> String {
        let id = Uuid::new_v4().simple().to_string();
        let session = UploadSession::new(id.clone(), bucket, path, metadata);
        self.sessions
            .insert(id.clone(), Arc::new(Mutex::new(session)));
        id
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Drop sessions whose last command is at least `max_idle` old.
    ///
    /// Sessions currently locked by a command are busy, not idle, and are
    /// kept. Returns the number of sessions removed.
    pub fn reap_idle(&self, max_idle: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, handle| match handle.try_lock() {
            Ok(session) => {
                let keep = session.last_activity.elapsed() < max_idle;
                if !keep {
                    debug!(
                        upload_id = %session.id,
                        state = %session.state,
                        created_at = %session.created_at,
                        committed_by = ?session.auth_context,
                        "dropping idle upload session"
                    );
                }
                keep
            }
            Err(_) => true,
        });
        before.saturating_sub(self.sessions.len())
    }

    /// Run [`reap_idle`](Self::reap_idle) periodically for the life of the
    /// process.
    pub fn spawn_reaper(self: Arc<Self>, retention: Duration) -> JoinHandle<()> {
        let period = (retention / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let reaped = self.reap_idle(retention);
                if reaped > 0 {
                    info!(reaped, remaining = self.len(), "reaped idle upload sessions");
                }
            }
        })
    }
}
