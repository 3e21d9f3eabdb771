//! In-process conversation sessions
//!
//! Session-mode models get a handle instead of a stored message list. The
//! transcript behind the handle lives only in memory and expires when idle,
//! so handles persisted before a restart may point at nothing.

use crate::config::ModelKind;
use crate::llm::Message;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// A live conversation with one model
#[derive(Debug)]
pub struct Session {
    /// Messages exchanged so far
    pub transcript: Vec<Message>,
    max_messages: usize,
}

impl Session {
    const fn new(max_messages: usize) -> Self {
        Self {
            transcript: Vec::new(),
            max_messages,
        }
    }

    /// Record a completed exchange, dropping the oldest turns past the cap
    pub fn record_turn(&mut self, user_message: &str, reply: &str) {
        self.transcript.push(Message::user(user_message));
        self.transcript.push(Message::assistant(reply));
        if self.transcript.len() > self.max_messages {
            let excess = self.transcript.len() - self.max_messages;
            // Cut whole turns so the transcript still opens with a user message
            let cut = excess + excess % 2;
            self.transcript.drain(..cut.min(self.transcript.len()));
        }
    }
}

/// Shared handle to a session
pub type SessionHandle = Arc<Mutex<Session>>;

/// Registry of live sessions with idle expiry
#[derive(Clone)]
pub struct SessionRegistry {
    cache: Cache<Uuid, SessionHandle>,
    max_messages: usize,
}

impl SessionRegistry {
    /// Create a registry
    ///
    /// # Arguments
    ///
    /// * `idle` - Sessions untouched for this long are dropped
    /// * `max_capacity` - Maximum number of live sessions
    /// * `max_messages` - Transcript cap per session
    #[must_use]
    pub fn new(idle: Duration, max_capacity: u64, max_messages: usize) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_idle(idle)
            .build();

        Self {
            cache,
            max_messages,
        }
    }

    /// Start a new session
    pub async fn create(&self, model: ModelKind) -> (Uuid, SessionHandle) {
        let id = Uuid::new_v4();
        let session = Arc::new(Mutex::new(Session::new(self.max_messages)));
        self.cache.insert(id, session.clone()).await;
        debug!(session_id = %id, model = %model, "Session created");
        (id, session)
    }

    /// Look up a live session
    pub async fn get(&self, id: &Uuid) -> Option<SessionHandle> {
        self.cache.get(id).await
    }

    /// Drop a session
    pub async fn remove(&self, id: &Uuid) {
        if self.cache.remove(id).await.is_some() {
            debug!(session_id = %id, "Session removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Duration::from_secs(60), 100, 6)
    }

    #[tokio::test]
    async fn test_create_get_remove() {
        let registry = registry();
        let (id, _) = registry.create(ModelKind::Gemini).await;

        let session = registry.get(&id).await;
        assert!(session.is_some());

        registry.remove(&id).await;
        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        assert!(registry().get(&Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_transcript_cap_keeps_whole_turns() {
        let registry = registry();
        let (_, session) = registry.create(ModelKind::Grok).await;
        let mut session = session.lock().await;

        for i in 0..5 {
            session.record_turn(&format!("q{i}"), &format!("a{i}"));
        }

        assert_eq!(session.transcript.len(), 6);
        assert_eq!(session.transcript[0], Message::user("q2"));
        assert_eq!(session.transcript[5], Message::assistant("a4"));
    }
}
