use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod json_file;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::SessionId;
pub use json_file::JsonFileHistoryStore;
pub use memory::MemoryHistoryStore;
pub use sqlite::SqliteHistoryStore;
pub use types::{PersistedTurn, TurnRole};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Persistence collaborator for conversation history.
pub trait HistoryStore: Send + Sync {
    /// Returns the stored turns in order, or an empty list when nothing was written yet.
    fn read_history<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, StorageResult<Vec<PersistedTurn>>>;

    /// Replaces the stored history with `turns`.
    fn write_history<'a>(
        &'a self,
        session_id: &'a SessionId,
        turns: &'a [PersistedTurn],
    ) -> BoxFuture<'a, StorageResult<()>>;
}
