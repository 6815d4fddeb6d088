use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, StorageResult,
};
use super::ids::SessionId;
use super::types::{PersistedTurn, TurnRole};
use super::{BoxFuture, HistoryStore};

#[derive(Debug, FromRow)]
struct HistoryTurnRow {
    role: String,
    content: String,
}

/// History persisted as ordered rows in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteHistoryStore {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteHistoryStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single connection keeps `:memory:` databases alive for the pool's lifetime.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::info!(database_url = %database_url, "opened sqlite history store");
        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    async fn read_turns(&self, session_id: &SessionId) -> StorageResult<Vec<PersistedTurn>> {
        let rows = sqlx::query_as::<_, HistoryTurnRow>(
            "SELECT role, content FROM history_turns WHERE session_id = ? ORDER BY seq ASC",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "sqlite-history-select",
        })?;

        rows.into_iter().map(row_to_turn).collect()
    }

    async fn write_turns(
        &self,
        session_id: &SessionId,
        turns: &[PersistedTurn],
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "sqlite-history-begin",
        })?;

        sqlx::query("DELETE FROM history_turns WHERE session_id = ?")
            .bind(session_id.to_string())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "sqlite-history-delete",
            })?;

        for (index, turn) in turns.iter().enumerate() {
            let seq = usize_to_i64(index, "sqlite-history-seq")?;
            sqlx::query(
                "INSERT INTO history_turns (session_id, seq, role, content) VALUES (?, ?, ?, ?)",
            )
            .bind(session_id.to_string())
            .bind(seq)
            .bind(turn.role.as_str())
            .bind(turn.content.as_str())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "sqlite-history-insert",
            })?;
        }

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "sqlite-history-commit",
        })?;

        tracing::debug!(
            session_id = %session_id,
            turn_count = turns.len(),
            "wrote sqlite history"
        );
        Ok(())
    }
}

impl HistoryStore for SqliteHistoryStore {
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

fn row_to_turn(row: HistoryTurnRow) -> StorageResult<PersistedTurn> {
    let role = TurnRole::parse(&row.role).context(InvariantViolationSnafu {
        stage: "sqlite-history-role",
        details: format!("unknown history role '{}'", row.role),
    })?;
    Ok(PersistedTurn::new(role, row.content))
}

fn usize_to_i64(value: usize, stage: &'static str) -> StorageResult<i64> {
    i64::try_from(value).ok().context(InvariantViolationSnafu {
        stage,
        details: format!("value {value} does not fit sqlite INTEGER"),
    })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    if let Some(parent) = Path::new(database_location).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
