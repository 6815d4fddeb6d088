use std::collections::HashMap;

use tokio::sync::RwLock;

use super::error::StorageResult;
use super::ids::SessionId;
use super::types::PersistedTurn;
use super::{BoxFuture, HistoryStore};

/// Process-local history, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    entries: RwLock<HashMap<SessionId, Vec<PersistedTurn>>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(session_id: SessionId, turns: Vec<PersistedTurn>) -> Self {
        Self {
            entries: RwLock::new(HashMap::from([(session_id, turns)])),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn read_history<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, StorageResult<Vec<PersistedTurn>>> {
        Box::pin(async move {
            let entries = self.entries.read().await;
            Ok(entries.get(session_id).cloned().unwrap_or_default())
        })
    }

    fn write_history<'a>(
        &'a self,
        session_id: &'a SessionId,
        turns: &'a [PersistedTurn],
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut entries = self.entries.write().await;
            entries.insert(*session_id, turns.to_vec());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_session_reads_empty() {
        let store = MemoryHistoryStore::new();
        assert!(store.read_history(&SessionId::new_v7()).await.unwrap().is_empty());
        assert_eq!(store.session_count().await, 0);
    }

    #[tokio::test]
    async fn seeded_history_is_returned_in_order() {
        let session_id = SessionId::new_v7();
        let turns = vec![PersistedTurn::user("a"), PersistedTurn::assistant("b")];
        let store = MemoryHistoryStore::with_history(session_id, turns.clone());

        assert_eq!(store.read_history(&session_id).await.unwrap(), turns);

        store.write_history(&session_id, &[]).await.unwrap();
        assert!(store.read_history(&session_id).await.unwrap().is_empty());
    }
}
