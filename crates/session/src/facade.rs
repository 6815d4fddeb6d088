use std::sync::Arc;

use serde::Serialize;
use tern_llm::{CompletionTransport, OptionsResolver, SessionContext};
use tern_storage::{HistoryStore, SessionId};

use super::codec::HistoryCodec;
use super::controller::{ChatController, TurnOutcome};
use super::error::SessionResult;
use super::message::ChatMessage;
use super::observer::{ObservedTranscript, SubscriptionId, TranscriptObserver};

/// Serializable snapshot handed to the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub messages: Vec<ChatMessage>,
    pub is_streaming: bool,
    pub last_error: Option<String>,
    pub persist_error: Option<String>,
}

/// Public surface of one conversation.
pub struct ChatSession {
    controller: ChatController,
    transcript: Arc<ObservedTranscript>,
}

impl ChatSession {
    pub fn new(
        session_id: SessionId,
        transport: Arc<dyn CompletionTransport>,
        resolver: Arc<dyn OptionsResolver>,
        store: Arc<dyn HistoryStore>,
    ) -> Self {
        let transcript = Arc::new(ObservedTranscript::new());
        let controller = ChatController::new(
            SessionContext::new(session_id.to_string()),
            HistoryCodec::new(store, session_id),
            transport,
            resolver,
            transcript.clone(),
        );
        Self {
            controller,
            transcript,
        }
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.controller.set_history_window(window);
        self
    }

    /// System prompt sent ahead of the history on every turn.
    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.controller.set_preamble(Some(preamble.into()));
        self
    }

    /// Names the settings preset the options resolver should use for this session.
    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.controller.set_preset(preset.into());
        self
    }

    pub fn session_id(&self) -> SessionId {
        self.controller.session_id()
    }

    pub fn history_window(&self) -> usize {
        self.controller.history_window()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.transcript
            .read(|transcript| transcript.messages().to_vec())
    }

    pub fn is_streaming(&self) -> bool {
        self.controller.is_sending()
    }

    /// Content of the most recent error message, if any.
    pub fn last_error(&self) -> Option<String> {
        self.transcript.read(|transcript| {
            transcript
                .last_error()
                .map(|message| message.content.clone())
        })
    }

    pub fn persist_error(&self) -> Option<String> {
        self.controller.persist_error()
    }

    pub fn view(&self) -> SessionView {
        let (messages, last_error) = self.transcript.read(|transcript| {
            (
                transcript.messages().to_vec(),
                transcript
                    .last_error()
                    .map(|message| message.content.clone()),
            )
        });
        SessionView {
            messages,
            is_streaming: self.is_streaming(),
            last_error,
            persist_error: self.persist_error(),
        }
    }

    pub async fn send_message(&self, text: &str) -> SessionResult<TurnOutcome> {
        self.controller.send_message(text).await
    }

    pub fn cancel(&self) -> bool {
        self.controller.cancel()
    }

    pub async fn clear(&self) -> SessionResult<()> {
        self.controller.clear().await
    }

    pub async fn restore(&self) -> SessionResult<usize> {
        self.controller.restore().await
    }

    pub fn subscribe(&self, observer: Arc<dyn TranscriptObserver>) -> SubscriptionId {
        self.transcript.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.transcript.unsubscribe(id)
    }
}
