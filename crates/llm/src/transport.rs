use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::options::ModelOptions;

/// Speaker role understood by completion backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: PromptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(PromptRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(PromptRole::Assistant, content)
    }
}

/// Context already on record plus the new user turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub history: Vec<PromptMessage>,
    pub prompt: PromptMessage,
    pub preamble: Option<String>,
}

impl CompletionRequest {
    pub fn new(history: Vec<PromptMessage>, prompt: PromptMessage) -> Self {
        Self {
            history,
            prompt,
            preamble: None,
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }
}

/// Provider-agnostic stream payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Done,
    Error(String),
}

pub type StreamWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("no model specified for completion request"))]
    MissingModel { stage: &'static str },
    #[snafu(display("no api token or endpoint configured"))]
    MissingCredentials { stage: &'static str },
    #[snafu(display("invalid api type '{api_type}'"))]
    UnsupportedApiType {
        stage: &'static str,
        api_type: String,
    },
    #[snafu(display("api type '{api_type}' requires an endpoint"))]
    MissingEndpoint {
        stage: &'static str,
        api_type: &'static str,
    },
    #[snafu(display("api type '{api_type}' requires an api token"))]
    MissingApiToken {
        stage: &'static str,
        api_type: &'static str,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

/// Receiving half of one streamed completion.
///
/// Dropping the stream signals cancellation to the worker.
pub struct DeltaStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct StreamHandle {
    pub stream: DeltaStream,
    pub worker: StreamWorker,
}

impl DeltaStream {
    pub fn new(
        events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Returns true only for the first call that reached a live worker.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for DeltaStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Server-streamed completion backend.
pub trait CompletionTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Validates the call and hands back the stream plus the worker that feeds it.
    ///
    /// Failures after the worker starts are delivered as [`StreamEvent::Error`].
    fn open_stream(
        &self,
        request: CompletionRequest,
        options: &ModelOptions,
    ) -> TransportResult<StreamHandle>;
}

pub fn make_delta_stream() -> (
    mpsc::UnboundedSender<StreamEvent>,
    DeltaStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (event_tx, DeltaStream::new(event_rx, cancel_tx), cancel_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_send_order() {
        let (event_tx, mut stream, _cancel_rx) = make_delta_stream();
        event_tx.send(StreamEvent::Delta("Hel".into())).unwrap();
        event_tx.send(StreamEvent::Delta("lo".into())).unwrap();
        event_tx.send(StreamEvent::Done).unwrap();
        drop(event_tx);

        assert_eq!(stream.recv().await, Some(StreamEvent::Delta("Hel".into())));
        assert_eq!(stream.recv().await, Some(StreamEvent::Delta("lo".into())));
        assert_eq!(stream.recv().await, Some(StreamEvent::Done));
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn cancel_fires_once() {
        let (_event_tx, mut stream, cancel_rx) = make_delta_stream();
        assert!(stream.cancel());
        assert!(!stream.cancel());
        assert!(cancel_rx.await.is_ok());
    }

    #[tokio::test]
    async fn dropping_stream_signals_worker() {
        let (_event_tx, stream, cancel_rx) = make_delta_stream();
        drop(stream);
        assert!(cancel_rx.await.is_ok());
    }
}
