use thiserror::Error;

/// Errors raised by the run store and round ledger.
///
/// Expected races (claim lost, queued slot occupied) are NOT errors — they
/// come back as typed outcomes so callers must handle them.
#[derive(Debug, Error)]
pub enum RunStoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Run not found: {id}")]
    RunNotFound { id: String },

    #[error("Round not found: {id}")]
    RoundNotFound { id: String },

    #[error("Illegal transition for run {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] troupe_store::StoreError),
}

pub type Result<T> = std::result::Result<T, RunStoreError>;
