use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use snafu::OptionExt;

use super::error::{InvalidStateSnafu, SessionResult};
use super::message::ChatMessage;
use super::transcript::{Transcript, TranscriptChange};

/// Receives every transcript mutation synchronously, right after it is applied.
///
/// Called while the transcript lock is held: implementations must not call back into the session.
pub trait TranscriptObserver: Send + Sync {
    fn transcript_changed(&self, change: &TranscriptChange, messages: &[ChatMessage]);
}

impl<F> TranscriptObserver for F
where
    F: Fn(&TranscriptChange, &[ChatMessage]) + Send + Sync,
{
    fn transcript_changed(&self, change: &TranscriptChange, messages: &[ChatMessage]) {
        self(change, messages)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Inner {
    transcript: Transcript,
    observers: Vec<(SubscriptionId, Arc<dyn TranscriptObserver>)>,
}

/// Transcript shared between the controller (single writer) and any number of readers.
pub(crate) struct ObservedTranscript {
    inner: Mutex<Inner>,
    next_subscription: AtomicU64,
}

impl ObservedTranscript {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                transcript: Transcript::new(),
                observers: Vec::new(),
            }),
            next_subscription: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscribe(&self, observer: Arc<dyn TranscriptObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.lock().observers.push((id, observer));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.observers.len();
        inner.observers.retain(|(existing, _)| *existing != id);
        inner.observers.len() != before
    }

    /// Applies `mutation` and notifies observers before the lock is released.
    pub(crate) fn mutate<T>(
        &self,
        mutation: impl FnOnce(&mut Transcript) -> SessionResult<(T, TranscriptChange)>,
    ) -> SessionResult<T> {
        let mut inner = self.lock();
        let (output, change) = mutation(&mut inner.transcript)?;
        let Inner {
            transcript,
            observers,
        } = &*inner;
        for (_, observer) in observers {
            observer.transcript_changed(&change, transcript.messages());
        }
        Ok(output)
    }

    pub(crate) fn read<T>(&self, reader: impl FnOnce(&Transcript) -> T) -> T {
        reader(&self.lock().transcript)
    }

    pub(crate) fn append(&self, message: ChatMessage) -> SessionResult<()> {
        self.mutate(|transcript| Ok(((), transcript.append(message)?)))
    }

    pub(crate) fn update_last(&self, delta: &str, still_streaming: bool) -> SessionResult<()> {
        self.mutate(|transcript| Ok(((), transcript.update_last(delta, still_streaming)?)))
    }

    /// Flips the streaming flag off and returns the finalized message.
    pub(crate) fn finalize_last(&self) -> SessionResult<ChatMessage> {
        self.mutate(|transcript| {
            let change = transcript.update_last("", false)?;
            let finalized = transcript.last().cloned();
            Ok((finalized, change))
        })?
        .context(InvalidStateSnafu {
            stage: "transcript-finalize-last",
            details: "finalized message disappeared".to_string(),
        })
    }

    pub(crate) fn remove_last(&self) -> SessionResult<ChatMessage> {
        self.mutate(|transcript| transcript.remove_last())
    }

    pub(crate) fn clear(&self) {
        let _ = self.mutate(|transcript| Ok(((), transcript.clear())));
    }

    pub(crate) fn replace_all(&self, messages: Vec<ChatMessage>) {
        let _ = self.mutate(|transcript| Ok(((), transcript.replace_all(messages))));
    }
}
