use std::sync::Arc;

use snafu::ResultExt;
use tern_llm::{PromptMessage, PromptRole};
use tern_storage::{HistoryStore, PersistedTurn, SessionId, TurnRole};

use super::error::{LoadHistorySnafu, SaveHistorySnafu, SessionResult};
use super::message::{ChatMessage, Role};

/// Number of most recent turns kept as model context.
pub const DEFAULT_HISTORY_WINDOW: usize = 30;

/// Translates between chat messages and persisted turns and applies the sliding window.
#[derive(Clone)]
pub struct HistoryCodec {
    store: Arc<dyn HistoryStore>,
    session_id: SessionId,
    window: usize,
}

impl HistoryCodec {
    pub fn new(store: Arc<dyn HistoryStore>, session_id: SessionId) -> Self {
        Self {
            store,
            session_id,
            window: DEFAULT_HISTORY_WINDOW,
        }
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Reads the stored history and keeps only its most recent `window` turns.
    pub async fn load(&self) -> SessionResult<Vec<PersistedTurn>> {
        let turns = self
            .store
            .read_history(&self.session_id)
            .await
            .context(LoadHistorySnafu {
                stage: "codec-load",
            })?;

        let stored_len = turns.len();
        let windowed = truncate_to_window(turns, self.window);
        if windowed.len() < stored_len {
            tracing::debug!(
                session_id = %self.session_id,
                stored_len,
                window = self.window,
                "truncated history to sliding window"
            );
        }
        Ok(windowed)
    }

    /// Writes `turns` verbatim; the caller decides what belongs in the list.
    pub async fn save(&self, turns: &[PersistedTurn]) -> SessionResult<()> {
        self.store
            .write_history(&self.session_id, turns)
            .await
            .context(SaveHistorySnafu {
                stage: "codec-save",
            })
    }

    pub fn to_persisted(message: &ChatMessage) -> PersistedTurn {
        let role = match message.role {
            Role::User => TurnRole::User,
            Role::Assistant => TurnRole::Assistant,
            Role::Error => TurnRole::Error,
        };
        PersistedTurn::new(role, message.content.clone())
    }

    /// Rebuilds a finalized chat message; ids are minted fresh on every restore.
    pub fn from_persisted(turn: &PersistedTurn) -> ChatMessage {
        let role = match turn.role {
            TurnRole::User => Role::User,
            TurnRole::Assistant => Role::Assistant,
            TurnRole::Error => Role::Error,
        };
        ChatMessage::new(role, turn.content.clone())
    }

    /// Model context for `turns`. Error records stay in history but are never sent upstream.
    pub fn to_prompt(turns: &[PersistedTurn]) -> Vec<PromptMessage> {
        turns
            .iter()
            .filter_map(|turn| match turn.role {
                TurnRole::User => Some(PromptMessage::new(PromptRole::User, turn.content.clone())),
                TurnRole::Assistant => Some(PromptMessage::new(
                    PromptRole::Assistant,
                    turn.content.clone(),
                )),
                TurnRole::Error => None,
            })
            .collect()
    }
}

/// Keeps the last `window` entries in stored order.
pub fn truncate_to_window(mut turns: Vec<PersistedTurn>, window: usize) -> Vec<PersistedTurn> {
    if turns.len() > window {
        turns.drain(..turns.len() - window);
    }
    turns
}
