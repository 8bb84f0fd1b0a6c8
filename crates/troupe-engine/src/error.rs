use thiserror::Error;

/// Errors raised by the scheduling engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] troupe_store::StoreError),

    #[error(transparent)]
    Runs(#[from] troupe_runs::RunStoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] troupe_llm::ClientError),

    /// Regenerate was requested against a non-assistant message.
    #[error("Message is not regenerable: {id}")]
    NotRegenerable { id: String },

    /// A maintenance operation was pointed at a run in the wrong state.
    #[error("Run {id} is not in state {expected}")]
    WrongRunState { id: String, expected: &'static str },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
