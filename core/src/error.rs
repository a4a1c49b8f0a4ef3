//! Error taxonomy for `orchestrator-core`, shaped like
//! `codex-core::error::CodexErr`: one `thiserror` enum with `#[from]`
//! conversions for the handful of external error types the crate touches,
//! plus domain-specific variants for the cases spec.md §7 enumerates.

use uuid::Uuid;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("no session with id: {0}")]
    SessionNotFound(Uuid),

    #[error("invalid argument `{field}`: {message}")]
    InvalidArgument { field: String, message: String },

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("a process is already running for session {0}")]
    ProcessAlreadyRunning(Uuid),

    #[error("write to input pipe for session {0} failed: pipe is closed")]
    DeadPipe(Uuid),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokioJoin(#[from] tokio::task::JoinError),
}

impl CoreError {
    pub fn invalid_argument(field: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }
}
