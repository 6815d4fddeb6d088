use std::sync::Arc;

use snafu::ResultExt;
use tern_storage::{HistoryStore, JsonFileHistoryStore, MemoryHistoryStore, SqliteHistoryStore};

use crate::error::{AppResult, OpenHistorySnafu};
use crate::settings::{HistoryBackend, SQLITE_FILE_NAME, Settings};

/// Opens the persistence backend named in `settings`.
pub async fn open_history_store(settings: &Settings) -> AppResult<Arc<dyn HistoryStore>> {
    let root = settings.history_root();
    let store: Arc<dyn HistoryStore> = match settings.history_backend {
        HistoryBackend::Json => Arc::new(JsonFileHistoryStore::new(&root)),
        HistoryBackend::Sqlite => {
            let location = root.join(SQLITE_FILE_NAME);
            Arc::new(
                SqliteHistoryStore::open(&location.to_string_lossy())
                    .await
                    .context(OpenHistorySnafu {
                        stage: "open-sqlite-history",
                    })?,
            )
        }
        HistoryBackend::Memory => Arc::new(MemoryHistoryStore::new()),
    };

    tracing::info!(
        backend = ?settings.history_backend,
        root = %root.display(),
        "history store ready"
    );
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_storage::{PersistedTurn, SessionId};

    fn settings_for(backend: HistoryBackend, dir: &std::path::Path) -> Settings {
        Settings {
            history_backend: backend,
            history_dir: Some(dir.to_path_buf()),
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn every_backend_round_trips_history() {
        let dir = tempfile::tempdir().unwrap();
        let turns = vec![PersistedTurn::user("q"), PersistedTurn::error("timeout")];

        for backend in [
            HistoryBackend::Json,
            HistoryBackend::Sqlite,
            HistoryBackend::Memory,
        ] {
            let store = open_history_store(&settings_for(backend, dir.path()))
                .await
                .unwrap();
            let session_id = SessionId::new_v7();

            assert!(store.read_history(&session_id).await.unwrap().is_empty());
            store.write_history(&session_id, &turns).await.unwrap();
            assert_eq!(store.read_history(&session_id).await.unwrap(), turns);
        }

        assert!(dir.path().join(SQLITE_FILE_NAME).exists());
    }
}
