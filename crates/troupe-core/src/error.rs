use thiserror::Error;

#[derive(Debug, Error)]
pub enum TroupeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Conversation not found: {id}")]
    ConversationNotFound { id: String },

    #[error("Run not found: {id}")]
    RunNotFound { id: String },

    #[error("Membership not found: {id}")]
    MembershipNotFound { id: String },

    #[error("LLM transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TroupeError {
    /// Short error code string surfaced on the ephemeral channel.
    pub fn code(&self) -> &'static str {
        match self {
            TroupeError::Config(_) => "CONFIG_ERROR",
            TroupeError::Database(_) => "DATABASE_ERROR",
            TroupeError::ConversationNotFound { .. } => "CONVERSATION_NOT_FOUND",
            TroupeError::RunNotFound { .. } => "RUN_NOT_FOUND",
            TroupeError::MembershipNotFound { .. } => "MEMBERSHIP_NOT_FOUND",
            TroupeError::Transport(_) => "TRANSPORT_ERROR",
            TroupeError::Serialization(_) => "SERIALIZATION_ERROR",
            TroupeError::Io(_) => "IO_ERROR",
            TroupeError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, TroupeError>;
