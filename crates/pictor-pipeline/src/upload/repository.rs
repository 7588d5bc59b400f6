use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use pictor_core::models::UploadSession;

/// Result of trying to start completion of a session.
#[derive(Debug, Clone)]
pub enum SessionClaim {
    Claimed(UploadSession),
    NotFound,
    Incomplete { missing: Vec<u32> },
    AlreadyProcessing,
}

/// Live upload sessions. Every method is atomic with respect to the others.
#[async_trait]
pub trait UploadSessionRepository: Send + Sync {
    /// Insert unless `max_sessions` sessions are already live.
    async fn try_insert(&self, session: UploadSession, max_sessions: usize) -> Result<bool>;

    async fn get(&self, session_id: Uuid) -> Result<Option<UploadSession>>;

    /// Record receipt of chunk `index`. Returns the updated session, or
    /// `None` if it no longer exists.
    async fn mark_chunk_received(
        &self,
        session_id: Uuid,
        index: u32,
    ) -> Result<Option<UploadSession>>;

    /// Flag a fully received session as processing.
    async fn claim_for_completion(&self, session_id: Uuid) -> Result<SessionClaim>;

    async fn remove(&self, session_id: Uuid) -> Result<Option<UploadSession>>;

    /// Remove and return sessions created before `cutoff`.
    async fn remove_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadSession>>;

    async fn count(&self) -> Result<usize>;
}

/// Session table owned by one manager instance.
#[derive(Clone, Default)]
pub struct InMemoryUploadSessionRepository {
    sessions: Arc<Mutex<HashMap<Uuid, UploadSession>>>,
}

impl InMemoryUploadSessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session verbatim, ignoring the live-session ceiling.
    pub async fn put(&self, session: UploadSession) {
        self.sessions
            .lock()
            .await
            .insert(session.session_id, session);
    }
}

#[async_trait]
impl UploadSessionRepository for InMemoryUploadSessionRepository {
    async fn try_insert(&self, session: UploadSession, max_sessions: usize) -> Result<bool> {
        let mut sessions = self.sessions.lock().await;
        if sessions.len() >= max_sessions {
            return Ok(false);
        }
        sessions.insert(session.session_id, session);
        Ok(true)
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<UploadSession>> {
        Ok(self.sessions.lock().await.get(&session_id).cloned())
    }

    async fn mark_chunk_received(
        &self,
        session_id: Uuid,
        index: u32,
    ) -> Result<Option<UploadSession>> {
        let mut sessions = self.sessions.lock().await;
        Ok(sessions.get_mut(&session_id).map(|session| {
            session.received_chunks.insert(index);
            session.clone()
        }))
    }

    async fn claim_for_completion(&self, session_id: Uuid) -> Result<SessionClaim> {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&session_id) else {
            return Ok(SessionClaim::NotFound);
        };
        if session.is_processing {
            return Ok(SessionClaim::AlreadyProcessing);
        }
        if !session.is_complete() {
            return Ok(SessionClaim::Incomplete {
                missing: session.missing_chunks(),
            });
        }
        session.is_processing = true;
        Ok(SessionClaim::Claimed(session.clone()))
    }

    async fn remove(&self, session_id: Uuid) -> Result<Option<UploadSession>> {
        Ok(self.sessions.lock().await.remove(&session_id))
    }

    async fn remove_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadSession>> {
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<Uuid> = sessions
            .values()
            .filter(|s| s.is_expired(cutoff))
            .map(|s| s.session_id)
            .collect();
        Ok(expired
            .into_iter()
            .filter_map(|id| sessions.remove(&id))
            .collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.sessions.lock().await.len())
    }
}
