use thiserror::Error;

/// Failures an engine call can hand back to its caller. Stream and
/// fallback failures never reach a caller; they surface in-band as a
/// synthetic assistant message instead.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No access token available")]
    Auth,

    #[error("History load failed: {0}")]
    History(String),

    #[error("Draft already sent for this session")]
    DuplicateDraft,
}

pub type Result<T> = std::result::Result<T, EngineError>;
