use std::path::{Path, PathBuf};

use snafu::ResultExt;

use super::error::{
    CreateHistoryDirectorySnafu, DecodeHistorySnafu, EncodeHistorySnafu, ReadHistoryFileSnafu,
    ReplaceHistoryFileSnafu, StorageResult, WriteHistoryFileSnafu,
};
use super::ids::SessionId;
use super::types::PersistedTurn;
use super::{BoxFuture, HistoryStore};

pub const HISTORY_FILE_EXTENSION: &str = "json";

/// One JSON array file per session under a root directory.
#[derive(Debug, Clone)]
pub struct JsonFileHistoryStore {
    root: PathBuf,
}

impl JsonFileHistoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn history_path(&self, session_id: &SessionId) -> PathBuf {
        self.root
            .join(format!("{session_id}.{HISTORY_FILE_EXTENSION}"))
    }

    async fn read_turns(&self, session_id: &SessionId) -> StorageResult<Vec<PersistedTurn>> {
        let path = self.history_path(session_id);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(session_id = %session_id, "no history file yet");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(source).context(ReadHistoryFileSnafu {
                    stage: "json-history-read",
                    path: display_path(&path),
                });
            }
        };

        if contents.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        serde_json::from_slice(&contents).context(DecodeHistorySnafu {
            stage: "json-history-decode",
            path: display_path(&path),
        })
    }

    async fn write_turns(
        &self,
        session_id: &SessionId,
        turns: &[PersistedTurn],
    ) -> StorageResult<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .context(CreateHistoryDirectorySnafu {
                stage: "json-history-create-directory",
                path: display_path(&self.root),
            })?;

        let encoded = serde_json::to_vec_pretty(turns).context(EncodeHistorySnafu {
            stage: "json-history-encode",
        })?;

        let path = self.history_path(session_id);
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, encoded)
            .await
            .context(WriteHistoryFileSnafu {
                stage: "json-history-write-temporary",
                path: display_path(&temp_path),
            })?;

        // Rename keeps readers from ever observing a half-written array.
        tokio::fs::rename(&temp_path, &path)
            .await
            .context(ReplaceHistoryFileSnafu {
                stage: "json-history-rename-temporary",
                from: display_path(&temp_path),
                to: display_path(&path),
            })?;

        tracing::debug!(
            session_id = %session_id,
            turn_count = turns.len(),
            "wrote history file"
        );
        Ok(())
    }
}

impl HistoryStore for JsonFileHistoryStore {
    fn read_history<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, StorageResult<Vec<PersistedTurn>>> {
        Box::pin(self.read_turns(session_id))
    }

    fn write_history<'a>(
        &'a self,
        session_id: &'a SessionId,
        turns: &'a [PersistedTurn],
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(self.write_turns(session_id, turns))
    }
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}
