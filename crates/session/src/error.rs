use snafu::Snafu;
use tern_storage::StorageError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    /// Another send or clear is still running.
    #[snafu(display("session is busy on `{stage}`"))]
    Busy { stage: &'static str },
    #[snafu(display("prompt is empty"))]
    EmptyPrompt { stage: &'static str },
    /// Controller defect; never caused by an external fault.
    #[snafu(display("invalid session state on `{stage}`: {details}"))]
    InvalidState {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to load conversation history: {source}"))]
    LoadHistory {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to save conversation history: {source}"))]
    SaveHistory {
        stage: &'static str,
        source: StorageError,
    },
}

impl SessionError {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
