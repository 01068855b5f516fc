use crate::types::{TaskId, Turn};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

/// One user's conversation with the coordinator.
#[derive(Debug)]
pub struct ConversationSession {
    pub client_id: String,
    history: Vec<Turn>,
    /// User text not yet sent to the model.
    pub last_user_message: Option<String>,
    pub pending_delegation: bool,
    pub dispatched: BTreeSet<TaskId>,
}

impl ConversationSession {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            history: Vec::new(),
            last_user_message: None,
            pending_delegation: false,
            dispatched: BTreeSet::new(),
        }
    }

    /// History only grows; there is no way to edit or drop a turn.
    pub fn push(&mut self, turn: Turn) {
        self.history.push(turn);
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }
}

pub type SharedSession = Arc<Mutex<ConversationSession>>;

/// Sessions keyed by client identity, alive for the process lifetime unless evicted.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SharedSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session for `client_id`, creating it on first contact.
    /// The flag tells whether this call created it.
    pub async fn create(&self, client_id: &str) -> (SharedSession, bool) {
        if let Some(existing) = self.lookup(client_id).await {
            return (existing, false);
        }
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(client_id) {
            return (existing.clone(), false);
        }
        let session = Arc::new(Mutex::new(ConversationSession::new(client_id)));
        sessions.insert(client_id.to_string(), session.clone());
        info!(client = client_id, sessions = sessions.len(), "session created");
        (session, true)
    }

    pub async fn lookup(&self, client_id: &str) -> Option<SharedSession> {
        self.sessions.read().await.get(client_id).cloned()
    }

    pub async fn evict(&self, client_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(client_id).is_some();
        if removed {
            info!(client = client_id, "session evicted");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
