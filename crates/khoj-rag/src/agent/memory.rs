//! Pluggable conversation persistence.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::RagError;
use crate::provider::ChatMessage;

/// Session-keyed message persistence. The agent loads on run start when
/// configured and saves after each run.
#[async_trait]
pub trait MemoryProvider: Send + Sync {
    async fn save(&self, session_id: &str, messages: &[ChatMessage]) -> Result<(), RagError>;

    /// Empty when the session has never been saved.
    async fn load(&self, session_id: &str) -> Result<Vec<ChatMessage>, RagError>;

    async fn clear(&self, session_id: &str) -> Result<(), RagError>;
}

/// Reference in-memory implementation. Stores copies on write and returns
/// copies on read, so callers can't mutate stored history from outside.
#[derive(Default)]
pub struct InMemoryMemoryProvider {
    sessions: RwLock<HashMap<String, Vec<ChatMessage>>>,
}

impl InMemoryMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

#[async_trait]
impl MemoryProvider for InMemoryMemoryProvider {
    async fn save(&self, session_id: &str, messages: &[ChatMessage]) -> Result<(), RagError> {
        self.sessions
            .write()
            .insert(session_id.to_string(), messages.to_vec());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Vec<ChatMessage>, RagError> {
        Ok(self
            .sessions
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear(&self, session_id: &str) -> Result<(), RagError> {
        self.sessions.write().remove(session_id);
        Ok(())
    }
}
