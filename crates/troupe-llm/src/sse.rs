//! OpenAI-compatible streaming transport.
//!
//! Speaks the `/v1/chat/completions` SSE dialect: one `data: <json>` line per
//! chunk, `data: [DONE]` terminator, optional usage object on the final
//! chunk when `stream_options.include_usage` is set.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use troupe_core::config::ProviderConfig;

use crate::client::{ChatClient, ChatRequest, ClientError, StreamEvent, Usage};

pub struct SseChatClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    chat_path: String,
}

impl SseChatClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(ClientError::from_reqwest)?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
            chat_path: config
                .chat_path
                .clone()
                .unwrap_or_else(|| "/v1/chat/completions".to_string()),
        })
    }
}

#[async_trait]
impl ChatClient for SseChatClient {
    fn name(&self) -> &str {
        "sse"
    }

    async fn stream_chat(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ClientError> {
        let body = build_request_body(req);
        let url = format!("{}{}", self.base_url, self.chat_path);

        debug!(model = %req.model, "sending streaming chat request");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "chat API error");
            return Err(ClientError::Http {
                status,
                message: text,
            });
        }

        process_stream(resp, tx).await;
        Ok(())
    }
}

fn build_request_body(req: &ChatRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req
        .messages
        .iter()
        .map(|m| {
            let mut msg = serde_json::json!({
                "role": m.role,
                "content": m.content,
            });
            if let Some(name) = &m.name {
                msg["name"] = serde_json::json!(name);
            }
            msg
        })
        .collect();

    let mut body = serde_json::json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.sampling.max_tokens,
        "temperature": req.sampling.temperature,
        "top_p": req.sampling.top_p,
        "stream": req.stream,
    });
    if req.stream {
        // Ask for the usage object on the final chunk.
        body["stream_options"] = serde_json::json!({ "include_usage": true });
    }
    if !req.stop_sequences.is_empty() {
        body["stop"] = serde_json::json!(req.stop_sequences);
    }
    if let Some(top_k) = req.sampling.top_k {
        body["top_k"] = serde_json::json!(top_k);
    }
    if let Some(penalty) = req.sampling.repetition_penalty {
        body["frequency_penalty"] = serde_json::json!(penalty);
    }
    if req.request_logprobs {
        body["logprobs"] = serde_json::json!(true);
    }
    body
}

/// Read the SSE byte stream, emit `Delta` per content chunk, finish with
/// `Done` carrying accumulated content and usage.
async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut content = String::new();
    let mut usage: Option<Usage> = None;
    let mut line_buf = String::new();

    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        error: ClientError::from_reqwest(e),
                    })
                    .await;
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        // SSE frames arrive split across TCP chunks; keep the incomplete
        // trailing line in the buffer.
        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                let _ = tx
                    .send(StreamEvent::Done {
                        content: content.clone(),
                        usage,
                    })
                    .await;
                return;
            }
            match serde_json::from_str::<StreamChunk>(data) {
                Ok(parsed) => {
                    if let Some(u) = parsed.usage {
                        usage = Some(Usage {
                            prompt_tokens: u.prompt_tokens,
                            completion_tokens: u.completion_tokens,
                        });
                    }
                    if let Some(delta) = parsed
                        .choices
                        .first()
                        .and_then(|c| c.delta.content.as_deref())
                    {
                        if !delta.is_empty() {
                            content.push_str(delta);
                            if tx
                                .send(StreamEvent::Delta {
                                    text: delta.to_string(),
                                })
                                .await
                                .is_err()
                            {
                                return; // receiver dropped
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!(error = %e, "skipping unparseable SSE data line");
                }
            }
        }

        line_buf = remainder;
    }

    // Stream ended without [DONE] — still emit what we have.
    let _ = tx.send(StreamEvent::Done { content, usage }).await;
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<UsageChunk>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageChunk {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}
