use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use snafu::ResultExt;
use tern_session::{ChatMessage, ChatSession, MessageId, Role, TranscriptChange, TranscriptObserver};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;

use crate::error::{AppResult, ReadInputSnafu, SignalSnafu};
use crate::settings::SettingsStore;

const BUSY_NOTICE: &str = "(still answering; press ctrl-c to cancel)";

/// Shared terminal writer used by both the REPL and the transcript printer.
#[derive(Clone)]
pub struct Console {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Console {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(out))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    pub fn write(&self, text: &str) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    pub fn line(&self, text: &str) {
        self.write(&format!("{text}\n"));
    }
}

pub fn render_message(message: &ChatMessage) -> String {
    let speaker = match message.role {
        Role::User => "you",
        Role::Assistant => "assistant",
        Role::Error => "error",
    };
    format!("{speaker}: {}", message.content)
}

/// Prints assistant output as it streams in.
pub struct TranscriptPrinter {
    console: Console,
    printed: Mutex<Option<(MessageId, usize)>>,
}

impl TranscriptPrinter {
    pub fn new(console: Console) -> Self {
        Self {
            console,
            printed: Mutex::new(None),
        }
    }
}

impl TranscriptObserver for TranscriptPrinter {
    fn transcript_changed(&self, change: &TranscriptChange, messages: &[ChatMessage]) {
        let mut printed = self.printed.lock().unwrap_or_else(PoisonError::into_inner);
        match change {
            TranscriptChange::Appended(_) => {
                if let Some(message) = messages.last().filter(|m| m.role == Role::Error) {
                    self.console.line(&render_message(message));
                }
            }
            TranscriptChange::UpdatedLast(id) => {
                let Some(message) = messages.last() else {
                    return;
                };
                let offset = match *printed {
                    Some((printed_id, len)) if printed_id == *id => len,
                    _ => {
                        self.console.write("assistant: ");
                        0
                    }
                };
                if let Some(fresh) = message.content.get(offset..) {
                    self.console.write(fresh);
                }
                *printed = Some((*id, message.content.len()));
                if !message.is_streaming {
                    self.console.line("");
                    *printed = None;
                }
            }
            TranscriptChange::RemovedLast(_) => {
                *printed = None;
            }
            TranscriptChange::Cleared => {
                *printed = None;
                self.console.line("(conversation cleared)");
            }
            TranscriptChange::Restored => {
                for message in messages {
                    self.console.line(&render_message(message));
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Prompt(String),
    Clear,
    History,
    Reload,
    Quit,
    Unknown(String),
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Self::Empty;
        }
        match trimmed {
            "/clear" => Self::Clear,
            "/history" => Self::History,
            "/reload" => Self::Reload,
            "/quit" | "/exit" => Self::Quit,
            other if other.starts_with('/') => Self::Unknown(other.to_string()),
            _ => Self::Prompt(line.trim_end().to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// Line-oriented driver for one session. Each prompt runs on its own task.
pub struct Repl {
    session: Arc<ChatSession>,
    console: Console,
    settings: Option<Arc<SettingsStore>>,
    turn: Option<JoinHandle<()>>,
}

impl Repl {
    pub fn new(session: Arc<ChatSession>, console: Console) -> Self {
        Self {
            session,
            console,
            settings: None,
            turn: None,
        }
    }

    /// Enables `/reload`; the session resolves options from the same store.
    pub fn with_settings(mut self, settings: Arc<SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub async fn run<R>(mut self, input: R) -> AppResult<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        let quit = loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal.context(SignalSnafu { stage: "repl-ctrl-c" })?;
                    if self.session.cancel() {
                        self.console.line("(cancelling)");
                    } else {
                        self.console.line("(nothing to cancel; /quit exits)");
                    }
                }
                line = lines.next_line() => {
                    let Some(line) = line.context(ReadInputSnafu { stage: "repl-read-line" })? else {
                        break false;
                    };
                    if self.handle(Command::parse(&line)).await == Flow::Quit {
                        break true;
                    }
                }
            }
        };

        self.finish(quit).await;
        Ok(())
    }

    async fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::Empty => {}
            Command::Quit => return Flow::Quit,
            Command::Unknown(name) => {
                self.console
                    .line(&format!("unknown command {name}; try /clear, /history, /reload or /quit"));
            }
            Command::History => {
                let messages = self.session.messages();
                if messages.is_empty() {
                    self.console.line("(no messages)");
                }
                for message in &messages {
                    self.console.line(&render_message(message));
                }
            }
            Command::Reload => match &self.settings {
                Some(settings) if settings.reload() => {
                    self.console.line(&format!(
                        "(settings reloaded from {})",
                        settings.config_path().display()
                    ));
                }
                Some(settings) => {
                    self.console.line(&format!(
                        "(could not parse {}; keeping current settings)",
                        settings.config_path().display()
                    ));
                }
                None => self.console.line("(no settings file in use)"),
            },
            Command::Clear => match self.session.clear().await {
                Ok(()) => {}
                Err(error) if error.is_busy() => self.console.line(BUSY_NOTICE),
                Err(error) => {
                    tracing::error!(error = %error, "clear failed");
                    self.console.line(&format!("error: {error}"));
                }
            },
            Command::Prompt(text) => self.start_turn(text),
        }
        Flow::Continue
    }

    fn start_turn(&mut self, text: String) {
        if self.session.is_streaming() {
            self.console.line(BUSY_NOTICE);
            return;
        }

        let session = self.session.clone();
        let console = self.console.clone();
        self.turn = Some(tokio::spawn(async move {
            match session.send_message(&text).await {
                Ok(outcome) => tracing::debug!(outcome = ?outcome, "turn finished"),
                Err(error) if error.is_busy() => console.line(BUSY_NOTICE),
                Err(error) => {
                    tracing::error!(error = %error, "send failed");
                    console.line(&format!("error: {error}"));
                }
            }
            if let Some(error) = session.persist_error() {
                console.line(&format!("(history not saved: {error})"));
            }
        }));
    }

    /// Waits for the in-flight turn; `/quit` cancels it first, end of input lets it finish.
    async fn finish(&mut self, cancel: bool) {
        let Some(turn) = self.turn.take() else {
            return;
        };
        if cancel {
            self.session.cancel();
        }
        if let Err(error) = turn.await {
            tracing::error!(error = %error, "turn task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_llm::{
        CompletionRequest, CompletionTransport, ModelOptions, StaticOptionsResolver, StreamEvent,
        StreamHandle, TransportResult, make_delta_stream,
    };
    use tern_storage::{HistoryStore, MemoryHistoryStore, PersistedTurn, SessionId};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Answers every prompt with the same deltas.
    struct CannedTransport {
        deltas: Vec<&'static str>,
    }

    impl CompletionTransport for CannedTransport {
        fn name(&self) -> &str {
            "canned"
        }

        fn open_stream(
            &self,
            _request: CompletionRequest,
            _options: &ModelOptions,
        ) -> TransportResult<StreamHandle> {
            let (event_tx, stream, _cancel_rx) = make_delta_stream();
            for delta in &self.deltas {
                let _ = event_tx.send(StreamEvent::Delta(delta.to_string()));
            }
            let _ = event_tx.send(StreamEvent::Done);
            Ok(StreamHandle {
                stream,
                worker: Box::pin(async {}),
            })
        }
    }

    fn session_with(
        deltas: Vec<&'static str>,
        store: Arc<MemoryHistoryStore>,
        session_id: SessionId,
    ) -> Arc<ChatSession> {
        Arc::new(ChatSession::new(
            session_id,
            Arc::new(CannedTransport { deltas }),
            Arc::new(StaticOptionsResolver::new(ModelOptions::default())),
            store,
        ))
    }

    #[test]
    fn commands_are_parsed() {
        assert_eq!(Command::parse("  "), Command::Empty);
        assert_eq!(Command::parse("/clear"), Command::Clear);
        assert_eq!(Command::parse(" /history "), Command::History);
        assert_eq!(Command::parse("/exit"), Command::Quit);
        assert_eq!(Command::parse("/reload"), Command::Reload);
        assert_eq!(
            Command::parse("/model x"),
            Command::Unknown("/model x".to_string())
        );
        assert_eq!(
            Command::parse("  indented question\n"),
            Command::Prompt("  indented question".to_string())
        );
    }

    #[test]
    fn printer_writes_only_new_text() {
        let buffer = SharedBuffer::default();
        let printer = TranscriptPrinter::new(Console::new(buffer.clone()));
        let mut message = ChatMessage::assistant_placeholder();
        let id = message.id;

        printer.transcript_changed(
            &TranscriptChange::Appended(id),
            std::slice::from_ref(&message),
        );
        for delta in ["Hel", "lo"] {
            message.content.push_str(delta);
            printer.transcript_changed(
                &TranscriptChange::UpdatedLast(id),
                std::slice::from_ref(&message),
            );
        }
        message.is_streaming = false;
        printer.transcript_changed(
            &TranscriptChange::UpdatedLast(id),
            std::slice::from_ref(&message),
        );
        printer.transcript_changed(
            &TranscriptChange::Appended(MessageId::new_v7()),
            &[message.clone(), ChatMessage::error("boom")],
        );

        assert_eq!(buffer.contents(), "assistant: Hello\nerror: boom\n");
    }

    #[tokio::test]
    async fn piped_prompt_is_answered_before_exit() {
        let buffer = SharedBuffer::default();
        let console = Console::new(buffer.clone());
        let store = Arc::new(MemoryHistoryStore::new());
        let session_id = SessionId::new_v7();
        let session = session_with(vec!["hi", " there"], store.clone(), session_id);
        session.subscribe(Arc::new(TranscriptPrinter::new(console.clone())));

        Repl::new(session, console)
            .run(&b"\n/unknown\nhello\n"[..])
            .await
            .unwrap();

        let output = buffer.contents();
        assert!(output.contains("unknown command /unknown"));
        assert!(output.contains("assistant: hi there\n"));
        assert_eq!(
            store.read_history(&session_id).await.unwrap(),
            vec![
                PersistedTurn::user("hello"),
                PersistedTurn::assistant("hi there")
            ]
        );
    }

    #[tokio::test]
    async fn history_and_clear_commands() {
        let buffer = SharedBuffer::default();
        let console = Console::new(buffer.clone());
        let session_id = SessionId::new_v7();
        let store = Arc::new(MemoryHistoryStore::with_history(
            session_id,
            vec![PersistedTurn::user("q"), PersistedTurn::assistant("a")],
        ));
        let session = session_with(Vec::new(), store.clone(), session_id);
        session.subscribe(Arc::new(TranscriptPrinter::new(console.clone())));
        session.restore().await.unwrap();

        let mut repl = Repl::new(session.clone(), console);
        assert_eq!(repl.handle(Command::History).await, Flow::Continue);
        assert_eq!(repl.handle(Command::Clear).await, Flow::Continue);
        assert_eq!(repl.handle(Command::History).await, Flow::Continue);
        assert_eq!(repl.handle(Command::Quit).await, Flow::Quit);

        assert_eq!(
            buffer.contents(),
            "you: q\nassistant: a\nyou: q\nassistant: a\n(conversation cleared)\n(no messages)\n"
        );
        assert!(store.read_history(&session_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reload_picks_up_edited_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = Arc::new(SettingsStore::new(
            path.clone(),
            crate::settings::EnvOverrides::default(),
        ));
        let buffer = SharedBuffer::default();
        let session = session_with(Vec::new(), Arc::new(MemoryHistoryStore::new()), SessionId::new_v7());
        let mut repl = Repl::new(session, Console::new(buffer.clone())).with_settings(settings.clone());

        std::fs::write(&path, r#"{ "model": { "model_name": "edited" } }"#).unwrap();
        repl.handle(Command::Reload).await;

        assert_eq!(settings.settings().model.model_name, "edited");
        assert!(buffer.contents().starts_with("(settings reloaded from "));
    }
}
