mod codec;
mod controller;
mod error;
mod facade;
mod message;
mod observer;
#[cfg(test)]
mod testing;
mod transcript;

pub use codec::{DEFAULT_HISTORY_WINDOW, HistoryCodec, truncate_to_window};
pub use controller::TurnOutcome;
pub use error::{SessionError, SessionResult};
pub use facade::{ChatSession, SessionView};
pub use message::{ChatMessage, MessageId, Role};
pub use observer::{SubscriptionId, TranscriptObserver};
pub use transcript::{Transcript, TranscriptChange};
