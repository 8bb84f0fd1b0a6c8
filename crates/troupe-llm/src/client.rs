use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A single message handed to the LLM transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub content: String,
    /// Speaker name for multi-party prompts (OpenAI `name` field).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Sampling parameters for one generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 1.0,
            top_p: 1.0,
            top_k: None,
            repetition_penalty: None,
        }
    }
}

/// Request to an LLM transport.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<PromptMessage>,
    pub sampling: SamplingParams,
    pub stop_sequences: Vec<String>,
    pub stream: bool,
    pub request_logprobs: bool,
}

/// Terminal usage record from the provider. Providers without usage
/// reporting omit it; token counters are then left untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Events emitted while a generation streams.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental text from the model.
    Delta { text: String },
    /// Stream completed; `content` is the full accumulated text.
    Done {
        content: String,
        usage: Option<Usage>,
    },
    /// Transport-level failure mid-stream.
    Error { error: ClientError },
}

/// Transport failures, by recovery class.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// Non-2xx response from the provider.
    #[error("HTTP error ({status}): {message}")]
    Http { status: u16, message: String },

    /// Could not reach the provider at all.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// The provider answered but the payload was unusable.
    #[error("Provider error: {0}")]
    Provider(String),
}

impl ClientError {
    /// The run-error code this failure is recorded under.
    pub fn code(&self) -> &'static str {
        match self {
            ClientError::Http { .. } => "http_error",
            ClientError::Connection(_) => "connection_error",
            ClientError::Timeout(_) => "timeout",
            ClientError::Provider(_) => "provider_error",
        }
    }

    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClientError::Timeout(e.to_string())
        } else if e.is_connect() {
            ClientError::Connection(e.to_string())
        } else if let Some(status) = e.status() {
            ClientError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            ClientError::Provider(e.to_string())
        }
    }
}

/// Common interface for LLM transports.
///
/// Implementations stream chunk events through `tx` and finish with a
/// `Done` carrying the accumulated content and usage. Returning `Err` means
/// the request never started streaming (connection refused, auth rejected);
/// mid-stream failures arrive as `StreamEvent::Error`.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Transport name for logging.
    fn name(&self) -> &str;

    async fn stream_chat(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_the_run_error_table() {
        assert_eq!(
            ClientError::Http {
                status: 500,
                message: "oops".into()
            }
            .code(),
            "http_error"
        );
        assert_eq!(ClientError::Connection("refused".into()).code(), "connection_error");
        assert_eq!(ClientError::Timeout("30s".into()).code(), "timeout");
        assert_eq!(ClientError::Provider("bad json".into()).code(), "provider_error");
    }
}
