use snafu::{OptionExt, ensure};

use super::error::{InvalidStateSnafu, SessionResult};
use super::message::{ChatMessage, MessageId, Role};

/// Mutation applied to a [`Transcript`], reported to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptChange {
    Appended(MessageId),
    UpdatedLast(MessageId),
    RemovedLast(MessageId),
    Cleared,
    Restored,
}

/// Ordered in-memory chat log. Append-only apart from the streaming tail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn last_error(&self) -> Option<&ChatMessage> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::Error)
    }

    pub fn append(&mut self, message: ChatMessage) -> SessionResult<TranscriptChange> {
        ensure!(
            !self.messages.iter().any(|existing| existing.id == message.id),
            InvalidStateSnafu {
                stage: "transcript-append",
                details: format!("message id {} is already present", message.id),
            }
        );
        // A second streaming message would break the single-tail invariant.
        ensure!(
            !message.is_streaming || self.streaming_count() == 0,
            InvalidStateSnafu {
                stage: "transcript-append",
                details: "a streaming message is already open".to_string(),
            }
        );

        let id = message.id;
        self.messages.push(message);
        Ok(TranscriptChange::Appended(id))
    }

    /// Appends `delta` to the streaming assistant tail and sets its streaming flag.
    pub fn update_last(
        &mut self,
        delta: &str,
        still_streaming: bool,
    ) -> SessionResult<TranscriptChange> {
        let last = self.messages.last_mut().context(InvalidStateSnafu {
            stage: "transcript-update-last",
            details: "transcript is empty".to_string(),
        })?;
        ensure!(
            last.role == Role::Assistant,
            InvalidStateSnafu {
                stage: "transcript-update-last",
                details: format!("last message is {:?}, not an assistant message", last.role),
            }
        );
        ensure!(
            last.is_streaming,
            InvalidStateSnafu {
                stage: "transcript-update-last",
                details: "last assistant message is already finalized".to_string(),
            }
        );

        last.content.push_str(delta);
        last.is_streaming = still_streaming;
        Ok(TranscriptChange::UpdatedLast(last.id))
    }

    pub fn remove_last(&mut self) -> SessionResult<(ChatMessage, TranscriptChange)> {
        let removed = self.messages.pop().context(InvalidStateSnafu {
            stage: "transcript-remove-last",
            details: "transcript is empty".to_string(),
        })?;
        let change = TranscriptChange::RemovedLast(removed.id);
        Ok((removed, change))
    }

    pub fn clear(&mut self) -> TranscriptChange {
        self.messages.clear();
        TranscriptChange::Cleared
    }

    /// Replaces the whole log, e.g. when reopening a conversation from persisted history.
    pub fn replace_all(&mut self, messages: Vec<ChatMessage>) -> TranscriptChange {
        self.messages = messages;
        TranscriptChange::Restored
    }

    pub fn streaming_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|message| message.is_streaming)
            .count()
    }
}
