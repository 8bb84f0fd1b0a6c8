use serde::{Deserialize, Serialize};

/// Ephemeral JSON events: typing state, streaming previews, scheduler
/// notices. Nothing here is persistent — a client that reconnects rebuilds
/// its view from the timeline and ignores what it missed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EphemeralEvent {
    /// A speaker's generation started; show the typing bubble.
    TypingStart {
        speaker_membership_id: String,
        display_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bubble_class: Option<String>,
        is_user: bool,
    },
    TypingStop {
        speaker_membership_id: String,
    },
    /// Cumulative streamed content for the typing preview.
    StreamChunk {
        run_id: String,
        content: String,
    },
    StreamComplete {
        run_id: String,
    },
    RunCanceled {
        run_id: String,
        reason: String,
    },
    RunSkipped {
        run_id: String,
        reason: String,
    },
    RunFailed {
        run_id: String,
        code: String,
        message: String,
    },
    AutoDisabled,
    AutoStepsUpdated {
        membership_id: String,
        remaining_steps: u32,
    },
    /// The round queue projection changed (round opened/advanced/closed).
    GroupQueueUpdated {
        scheduling_state: String,
        queue_membership_ids: Vec<String>,
    },
}

/// An ephemeral event stamped with the conversation's revision fence.
/// Clients discard envelopes whose `render_seq` is not greater than the
/// last one they applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EphemeralEnvelope {
    pub conversation_id: String,
    pub render_seq: i64,
    #[serde(flatten)]
    pub event: EphemeralEvent,
}

/// Persistent timeline events, keyed by stable DOM id. Emitted only after
/// the backing row is committed, so a client can always re-fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PersistentEvent {
    Append {
        dom_id: String,
        message: serde_json::Value,
    },
    Replace {
        dom_id: String,
        message: serde_json::Value,
    },
    Remove {
        dom_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentEnvelope {
    pub conversation_id: String,
    pub render_seq: i64,
    #[serde(flatten)]
    pub event: PersistentEvent,
}
