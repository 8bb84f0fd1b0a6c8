//! Deterministic offline transport.
//!
//! Replies are pre-loaded and drained in order — one per `stream_chat`
//! call. Used by the test suite and by demo setups that must not touch a
//! real provider.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::client::{ChatClient, ChatRequest, ClientError, StreamEvent, Usage};

/// One scripted generation outcome.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Stream these chunks, then finish with the given usage.
    Text {
        chunks: Vec<String>,
        usage: Option<Usage>,
    },
    /// Fail before streaming starts (connection refused, bad auth).
    FailEarly(ClientError),
    /// Stream some chunks, then fail mid-stream.
    FailMidStream {
        chunks: Vec<String>,
        error: ClientError,
    },
}

impl ScriptedReply {
    /// A single-chunk reply with token usage proportional to its length.
    pub fn text(body: &str) -> Self {
        ScriptedReply::Text {
            chunks: vec![body.to_string()],
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: body.split_whitespace().count() as u32,
            }),
        }
    }

    /// A word-by-word streaming reply (whitespace-preserving).
    pub fn streamed(body: &str) -> Self {
        let mut chunks = Vec::new();
        let mut current = String::new();
        for ch in body.chars() {
            current.push(ch);
            if ch == ' ' {
                chunks.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        ScriptedReply::Text {
            chunks,
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: body.split_whitespace().count() as u32,
            }),
        }
    }
}

pub struct ScriptedClient {
    replies: Mutex<VecDeque<ScriptedReply>>,
    /// Delay between chunks, letting tests interleave cancellation.
    chunk_delay: std::time::Duration,
}

impl ScriptedClient {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            chunk_delay: std::time::Duration::ZERO,
        }
    }

    pub fn with_chunk_delay(mut self, delay: std::time::Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Append another reply to the script.
    pub fn push(&self, reply: ScriptedReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_chat(
        &self,
        _req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ClientError> {
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ScriptedReply::text("(script exhausted)"));

        match reply {
            ScriptedReply::FailEarly(e) => Err(e),
            ScriptedReply::Text { chunks, usage } => {
                let mut content = String::new();
                for chunk in chunks {
                    if !self.chunk_delay.is_zero() {
                        tokio::time::sleep(self.chunk_delay).await;
                    }
                    content.push_str(&chunk);
                    if tx.send(StreamEvent::Delta { text: chunk }).await.is_err() {
                        return Ok(()); // receiver dropped
                    }
                }
                let _ = tx.send(StreamEvent::Done { content, usage }).await;
                Ok(())
            }
            ScriptedReply::FailMidStream { chunks, error } => {
                for chunk in chunks {
                    if !self.chunk_delay.is_zero() {
                        tokio::time::sleep(self.chunk_delay).await;
                    }
                    if tx.send(StreamEvent::Delta { text: chunk }).await.is_err() {
                        return Ok(());
                    }
                }
                let _ = tx.send(StreamEvent::Error { error }).await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MessageRole, PromptMessage, SamplingParams};

    fn request() -> ChatRequest {
        ChatRequest {
            model: "scripted".into(),
            messages: vec![PromptMessage {
                role: MessageRole::User,
                content: "hello".into(),
                name: None,
            }],
            sampling: SamplingParams::default(),
            stop_sequences: Vec::new(),
            stream: true,
            request_logprobs: false,
        }
    }

    #[tokio::test]
    async fn streams_chunks_then_done() {
        let client = ScriptedClient::new(vec![ScriptedReply::streamed("hello brave world")]);
        let (tx, mut rx) = mpsc::channel(16);
        client.stream_chat(&request(), tx).await.unwrap();

        let mut deltas = Vec::new();
        let mut done = None;
        while let Some(ev) = rx.recv().await {
            match ev {
                StreamEvent::Delta { text } => deltas.push(text),
                StreamEvent::Done { content, usage } => done = Some((content, usage)),
                StreamEvent::Error { error } => panic!("unexpected error: {error}"),
            }
        }
        assert_eq!(deltas.len(), 3);
        let (content, usage) = done.unwrap();
        assert_eq!(content, "hello brave world");
        assert_eq!(usage.unwrap().completion_tokens, 3);
    }

    #[tokio::test]
    async fn early_failure_returns_err() {
        let client = ScriptedClient::new(vec![ScriptedReply::FailEarly(ClientError::Http {
            status: 401,
            message: "bad key".into(),
        })]);
        let (tx, _rx) = mpsc::channel(16);
        let err = client.stream_chat(&request(), tx).await.unwrap_err();
        assert_eq!(err.code(), "http_error");
    }
}
