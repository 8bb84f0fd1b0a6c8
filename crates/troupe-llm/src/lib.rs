//! `troupe-llm` — LLM transport seam and prompt assembly.
//!
//! The scheduler core only depends on two traits from here:
//! [`ChatClient`] (streaming generation) and [`PromptAssembler`]
//! (conversation state → ordered message list). Ships an
//! OpenAI-compatible SSE transport and a deterministic scripted one.

pub mod client;
pub mod prompt;
pub mod script;
pub mod sse;

pub use client::{
    ChatClient, ChatRequest, ClientError, MessageRole, PromptMessage, SamplingParams, StreamEvent,
    Usage,
};
pub use prompt::{AssembledPrompt, PromptAssembler, PromptInput, TranscriptAssembler};
pub use script::{ScriptedClient, ScriptedReply};
pub use sse::SseChatClient;
