use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use snafu::ensure;
use tern_llm::{
    CompletionRequest, CompletionTransport, DeltaStream, OptionsResolver, PromptMessage,
    SessionContext, StreamEvent,
};
use tern_storage::{PersistedTurn, SessionId};
use tokio::sync::oneshot;

use super::codec::HistoryCodec;
use super::error::{BusySnafu, EmptyPromptSnafu, SessionError, SessionResult};
use super::message::ChatMessage;
use super::observer::ObservedTranscript;

/// How one send ended once the transcript and history were settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Cancelled,
    /// The turn was recorded as an error message carrying `message`.
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamTermination {
    Completed,
    Cancelled,
    Failed(String),
}

#[derive(Default)]
struct SessionState {
    locked: bool,
    // Only sends are cancellable; clear and restore hold the lock without it.
    sending: bool,
    cancel_requested: bool,
    cancel_tx: Option<oneshot::Sender<()>>,
    persist_error: Option<String>,
}

/// Releases the single-flight lock when a send or clear finishes, including when its future is dropped.
struct LockGuard<'a> {
    controller: &'a ChatController,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.controller.release_lock();
    }
}

/// Orchestrates send, cancel and clear for one conversation.
pub struct ChatController {
    context: SessionContext,
    codec: HistoryCodec,
    transport: Arc<dyn CompletionTransport>,
    resolver: Arc<dyn OptionsResolver>,
    preamble: Option<String>,
    state: Mutex<SessionState>,
    transcript: Arc<ObservedTranscript>,
}

impl ChatController {
    pub(crate) fn new(
        context: SessionContext,
        codec: HistoryCodec,
        transport: Arc<dyn CompletionTransport>,
        resolver: Arc<dyn OptionsResolver>,
        transcript: Arc<ObservedTranscript>,
    ) -> Self {
        Self {
            context,
            codec,
            transport,
            resolver,
            preamble: None,
            state: Mutex::new(SessionState::default()),
            transcript,
        }
    }

    pub(crate) fn set_preamble(&mut self, preamble: Option<String>) {
        self.preamble = preamble.filter(|preamble| !preamble.trim().is_empty());
    }

    pub(crate) fn set_preset(&mut self, preset: String) {
        self.context = std::mem::take(&mut self.context).with_preset(preset);
    }

    pub(crate) fn set_history_window(&mut self, window: usize) {
        self.codec = self.codec.clone().with_window(window);
    }

    pub fn session_id(&self) -> SessionId {
        self.codec.session_id()
    }

    pub fn history_window(&self) -> usize {
        self.codec.window()
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    /// True while a send is in flight.
    pub fn is_sending(&self) -> bool {
        self.state().sending
    }

    pub fn persist_error(&self) -> Option<String> {
        self.state().persist_error.clone()
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire_lock(&self, stage: &'static str) -> SessionResult<LockGuard<'_>> {
        let mut state = self.state();
        ensure!(!state.locked, BusySnafu { stage });
        state.locked = true;
        Ok(LockGuard { controller: self })
    }

    fn acquire_send_lock(&self) -> SessionResult<(LockGuard<'_>, oneshot::Receiver<()>)> {
        let mut state = self.state();
        ensure!(
            !state.locked,
            BusySnafu {
                stage: "send-message"
            }
        );

        let (cancel_tx, cancel_rx) = oneshot::channel();
        state.locked = true;
        state.sending = true;
        state.cancel_requested = false;
        state.cancel_tx = Some(cancel_tx);
        Ok((LockGuard { controller: self }, cancel_rx))
    }

    fn release_lock(&self) {
        {
            let mut state = self.state();
            state.locked = false;
            state.sending = false;
            state.cancel_requested = false;
            state.cancel_tx = None;
        }

        // Only reachable when a send future was dropped mid-stream.
        let dangling = self
            .transcript
            .read(|transcript| transcript.last().is_some_and(|last| last.is_streaming));
        if dangling {
            tracing::warn!(
                session_id = %self.session_id(),
                "send abandoned mid-stream; finalizing streaming message"
            );
            if let Err(error) = self.transcript.update_last("", false) {
                tracing::error!(session_id = %self.session_id(), error = %error, "failed to finalize abandoned message");
            }
        }
    }

    fn cancel_requested(&self) -> bool {
        self.state().cancel_requested
    }

    /// Requests cooperative cancellation of the in-flight send. No-op while idle.
    pub fn cancel(&self) -> bool {
        let mut state = self.state();
        if !state.sending || state.cancel_requested {
            return false;
        }

        state.cancel_requested = true;
        if let Some(cancel_tx) = state.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
        tracing::debug!(session_id = %self.session_id(), "cancellation requested");
        true
    }

    pub async fn send_message(&self, text: &str) -> SessionResult<TurnOutcome> {
        ensure!(
            !text.trim().is_empty(),
            EmptyPromptSnafu {
                stage: "send-message"
            }
        );

        let (_guard, cancel_rx) = match self.acquire_send_lock() {
            Ok(acquired) => acquired,
            Err(error) => {
                tracing::debug!(session_id = %self.session_id(), "send ignored while busy");
                return Err(error);
            }
        };

        let result = self.run_turn(text.to_string(), cancel_rx).await;
        if let Err(error @ SessionError::InvalidState { .. }) = &result {
            tracing::error!(session_id = %self.session_id(), error = %error, "session invariant violated");
        }
        result
    }

    async fn run_turn(
        &self,
        text: String,
        mut cancel_rx: oneshot::Receiver<()>,
    ) -> SessionResult<TurnOutcome> {
        let session_id = self.session_id();

        // The user message lands before any I/O so it shows even if the backend stalls.
        let user_message = ChatMessage::user(text);
        let user_turn = HistoryCodec::to_persisted(&user_message);
        let prompt = PromptMessage::user(user_message.content.clone());
        self.transcript.append(user_message)?;

        let prior_history = match self.codec.load().await {
            Ok(turns) => turns,
            Err(error) => {
                let message = error.to_string();
                tracing::warn!(session_id = %session_id, error = %message, "history load failed");
                // Nothing is written back: the stored history stays as it was.
                self.transcript.append(ChatMessage::error(message.clone()))?;
                return Ok(TurnOutcome::Failed { message });
            }
        };

        if self.cancel_requested() {
            tracing::info!(session_id = %session_id, "turn cancelled before the request was sent");
            let mut turns = prior_history;
            turns.push(user_turn);
            self.persist(&turns).await;
            return Ok(TurnOutcome::Cancelled);
        }

        self.transcript
            .append(ChatMessage::assistant_placeholder())?;

        let options = self.resolver.resolve(&self.context);
        let mut request =
            CompletionRequest::new(HistoryCodec::to_prompt(&prior_history), prompt);
        if let Some(preamble) = &self.preamble {
            request = request.with_preamble(preamble.clone());
        }

        tracing::info!(
            session_id = %session_id,
            transport = self.transport.name(),
            model = %options.model,
            history_len = prior_history.len(),
            "turn started"
        );

        let mut accumulated = String::new();
        let termination = match self.transport.open_stream(request, &options) {
            Ok(handle) => {
                tokio::spawn(handle.worker);
                self.consume_stream(handle.stream, &mut cancel_rx, &mut accumulated)
                    .await?
            }
            Err(error) => {
                tracing::warn!(session_id = %session_id, error = %error, "failed to open stream");
                StreamTermination::Failed(error.to_string())
            }
        };

        let mut turns = prior_history;
        turns.push(user_turn);

        if accumulated.is_empty() {
            self.transcript.remove_last()?;
        } else {
            let finalized = self.transcript.finalize_last()?;
            turns.push(HistoryCodec::to_persisted(&finalized));
        }

        let outcome = match termination {
            StreamTermination::Completed => TurnOutcome::Completed,
            StreamTermination::Cancelled => TurnOutcome::Cancelled,
            StreamTermination::Failed(message) => {
                let error_message = ChatMessage::error(message.clone());
                turns.push(HistoryCodec::to_persisted(&error_message));
                self.transcript.append(error_message)?;
                TurnOutcome::Failed { message }
            }
        };

        tracing::info!(
            session_id = %session_id,
            outcome = ?outcome,
            response_len = accumulated.len(),
            "turn finished"
        );

        self.persist(&turns).await;
        Ok(outcome)
    }

    async fn consume_stream(
        &self,
        mut stream: DeltaStream,
        cancel_rx: &mut oneshot::Receiver<()>,
        accumulated: &mut String,
    ) -> SessionResult<StreamTermination> {
        loop {
            if self.cancel_requested() {
                stream.cancel();
                return Ok(StreamTermination::Cancelled);
            }

            let event = tokio::select! {
                biased;
                _ = &mut *cancel_rx => {
                    stream.cancel();
                    return Ok(StreamTermination::Cancelled);
                }
                event = stream.recv() => event,
            };

            match event {
                Some(StreamEvent::Delta(delta)) => {
                    if delta.is_empty() {
                        continue;
                    }
                    self.transcript.update_last(&delta, true)?;
                    accumulated.push_str(&delta);
                }
                Some(StreamEvent::Done) => return Ok(StreamTermination::Completed),
                Some(StreamEvent::Error(message)) => return Ok(StreamTermination::Failed(message)),
                None => {
                    return Ok(StreamTermination::Failed(
                        "stream ended before a terminal event".to_string(),
                    ));
                }
            }
        }
    }

    async fn persist(&self, turns: &[PersistedTurn]) {
        match self.codec.save(turns).await {
            Ok(()) => {
                self.state().persist_error = None;
            }
            Err(error) => {
                tracing::error!(
                    session_id = %self.session_id(),
                    error = %error,
                    turn_count = turns.len(),
                    "failed to persist history"
                );
                self.state().persist_error = Some(error.to_string());
            }
        }
    }

    /// Persists an empty history, then empties the transcript. Rejected while a send runs.
    pub async fn clear(&self) -> SessionResult<()> {
        let _guard = self.acquire_lock("clear")?;

        self.codec.save(&[]).await?;
        self.state().persist_error = None;
        self.transcript.clear();
        tracing::info!(session_id = %self.session_id(), "conversation cleared");
        Ok(())
    }

    /// Rebuilds the transcript from the windowed persisted history.
    pub async fn restore(&self) -> SessionResult<usize> {
        let _guard = self.acquire_lock("restore")?;

        let turns = self.codec.load().await?;
        let messages = turns
            .iter()
            .map(HistoryCodec::from_persisted)
            .collect::<Vec<_>>();
        let restored = messages.len();
        self.transcript.replace_all(messages);
        tracing::debug!(session_id = %self.session_id(), restored, "transcript restored");
        Ok(restored)
    }
}
