use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tern_llm::{
    CompletionRequest, CompletionTransport, ModelOptions, SessionContext, StaticOptionsResolver,
    StreamEvent, StreamHandle, StreamWorker, TransportError, TransportResult, make_delta_stream,
};
use tern_storage::{
    BoxFuture, HistoryStore, MemoryHistoryStore, PersistedTurn, SessionId, StorageError,
    StorageResult,
};
use tokio::sync::{Semaphore, mpsc};

use super::codec::HistoryCodec;
use super::controller::ChatController;
use super::observer::ObservedTranscript;

pub(crate) enum Script {
    /// Emitted back to back as soon as the worker runs.
    Events(Vec<StreamEvent>),
    /// Forwarded one by one as the test pushes them, until cancelled.
    Manual(mpsc::UnboundedReceiver<StreamEvent>),
    OpenError(TransportError),
}

impl Script {
    pub(crate) fn events(events: Vec<StreamEvent>) -> Self {
        Self::Events(events)
    }
}

#[derive(Default)]
struct ScriptState {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<CompletionRequest>>,
    cancellations: AtomicUsize,
}

#[derive(Clone)]
pub(crate) struct ScriptedTransport {
    state: Arc<ScriptState>,
}

impl ScriptedTransport {
    pub(crate) fn new(scripts: Vec<Script>) -> Self {
        Self {
            state: Arc::new(ScriptState {
                scripts: Mutex::new(scripts.into()),
                ..ScriptState::default()
            }),
        }
    }

    pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub(crate) fn cancellations(&self) -> usize {
        self.state.cancellations.load(Ordering::SeqCst)
    }
}

impl CompletionTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    fn open_stream(
        &self,
        request: CompletionRequest,
        _options: &ModelOptions,
    ) -> TransportResult<StreamHandle> {
        self.state.requests.lock().unwrap().push(request);
        let script = self
            .state
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("no scripted response left");

        let (event_tx, stream, mut cancel_rx) = make_delta_stream();
        let state = self.state.clone();
        let worker: StreamWorker = match script {
            Script::OpenError(error) => return Err(error),
            Script::Events(events) => Box::pin(async move {
                for event in events {
                    if event_tx.send(event).is_err() {
                        return;
                    }
                }
            }),
            Script::Manual(mut gate) => Box::pin(async move {
                loop {
                    tokio::select! {
                        _ = &mut cancel_rx => {
                            state.cancellations.fetch_add(1, Ordering::SeqCst);
                            return;
                        }
                        event = gate.recv() => match event {
                            Some(event) => {
                                if event_tx.send(event).is_err() {
                                    return;
                                }
                            }
                            None => return,
                        },
                    }
                }
            }),
        };

        Ok(StreamHandle { stream, worker })
    }
}

/// Memory store whose writes fail until [`FailingWrites::heal`] is called.
pub(crate) struct FailingWrites {
    inner: MemoryHistoryStore,
    failing: AtomicBool,
}

impl FailingWrites {
    pub(crate) fn new() -> Self {
        Self {
            inner: MemoryHistoryStore::new(),
            failing: AtomicBool::new(true),
        }
    }

    pub(crate) fn heal(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }
}

impl HistoryStore for FailingWrites {
    fn read_history<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, StorageResult<Vec<PersistedTurn>>> {
        self.inner.read_history(session_id)
    }

    fn write_history<'a>(
        &'a self,
        session_id: &'a SessionId,
        turns: &'a [PersistedTurn],
    ) -> BoxFuture<'a, StorageResult<()>> {
        if self.failing.load(Ordering::SeqCst) {
            return Box::pin(async {
                Err(StorageError::InvariantViolation {
                    stage: "failing-writes",
                    details: "disk full".to_string(),
                })
            });
        }
        self.inner.write_history(session_id, turns)
    }
}

/// Memory store whose reads wait for one [`GatedReads::release`] each.
pub(crate) struct GatedReads {
    inner: MemoryHistoryStore,
    gate: Semaphore,
}

impl GatedReads {
    pub(crate) fn new() -> Self {
        Self {
            inner: MemoryHistoryStore::new(),
            gate: Semaphore::new(0),
        }
    }

    pub(crate) fn release(&self) {
        self.gate.add_permits(1);
    }
}

impl HistoryStore for GatedReads {
    fn read_history<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, StorageResult<Vec<PersistedTurn>>> {
        Box::pin(async move {
            self.gate
                .acquire()
                .await
                .expect("read gate closed")
                .forget();
            self.inner.read_history(session_id).await
        })
    }

    fn write_history<'a>(
        &'a self,
        session_id: &'a SessionId,
        turns: &'a [PersistedTurn],
    ) -> BoxFuture<'a, StorageResult<()>> {
        self.inner.write_history(session_id, turns)
    }
}

pub(crate) fn delta(text: &str) -> StreamEvent {
    StreamEvent::Delta(text.to_string())
}

pub(crate) fn controller_for(
    session_id: SessionId,
    transport: ScriptedTransport,
    store: Arc<dyn HistoryStore>,
) -> ChatController {
    ChatController::new(
        SessionContext::new(session_id.to_string()),
        HistoryCodec::new(store, session_id),
        Arc::new(transport),
        Arc::new(StaticOptionsResolver::new(ModelOptions::new("scripted-model"))),
        Arc::new(ObservedTranscript::new()),
    )
}

pub(crate) fn controller_with(
    transport: ScriptedTransport,
    store: Arc<dyn HistoryStore>,
) -> ChatController {
    controller_for(SessionId::new_v7(), transport, store)
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub(crate) async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within two seconds"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
