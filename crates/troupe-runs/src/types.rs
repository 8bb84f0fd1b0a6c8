use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a generation attempt is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// An ordinary AI turn (user reply, round advance, auto-mode tick).
    AutoResponse,
    /// A new swipe on an existing assistant message.
    Regenerate,
    /// A user-forced turn for a specific speaker.
    ForceTalk,
}

/// Lifecycle state of a run.
///
/// Transitions: `queued -> running | canceled | skipped`,
/// `running -> succeeded | failed | canceled | skipped`. Terminal states
/// are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Skipped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled | RunStatus::Skipped
        )
    }

    /// Whether `self -> to` is an allowed state-machine edge.
    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        match self {
            RunStatus::Queued => matches!(
                to,
                RunStatus::Running | RunStatus::Canceled | RunStatus::Skipped
            ),
            RunStatus::Running => to.is_terminal(),
            _ => false,
        }
    }
}

/// Structured failure attached to a terminal run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RunError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Trigger context stamped onto a run at planning time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunDebug {
    /// What caused the run ("user_message", "force_talk", "auto_mode", …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    /// Guard: the prompt-visible tail the planner observed. A mismatch at
    /// claim time skips the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_last_message_id: Option<String>,
    /// Which component enqueued the run ("planner", "turn_scheduler", "reaper").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_by: Option<String>,
    /// For regenerate runs: the assistant message receiving the new swipe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_message_id: Option<String>,
}

/// A persisted generation attempt.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: String,
    pub conversation_id: String,
    pub kind: RunKind,
    pub status: RunStatus,
    /// Free-form trigger tag for dashboards.
    pub reason: String,
    pub speaker_membership_id: String,
    pub round_id: Option<String>,
    /// Earliest execution time. `None` means immediately claimable.
    pub run_after: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Sticky cooperative-cancellation timestamp.
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub error: Option<RunError>,
    pub debug: RunDebug,
    pub created_at: String,
    pub updated_at: String,
}

impl Run {
    /// Seconds since the last heartbeat, or since start when none was written.
    pub fn heartbeat_age_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        self.heartbeat_at
            .or(self.started_at)
            .map(|t| (now - t).num_seconds())
    }
}

/// Result of a claim attempt. Losing the race is expected, not an error.
#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(Run),
    NotClaimable,
}

/// Result of `create_queued` — the slot may already be occupied.
#[derive(Debug)]
pub enum CreateOutcome {
    Created(Run),
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Active,
    Completed,
    Canceled,
}

/// Per-slot outcome inside a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

/// The ledger of a single round of AI speech.
#[derive(Debug, Clone)]
pub struct Round {
    pub id: String,
    pub conversation_id: String,
    pub status: RoundStatus,
    pub scheduling_state: troupe_store::SchedulingState,
    pub current_position: i64,
    pub slots: Vec<RoundSlot>,
    pub created_at: String,
    pub updated_at: String,
}

impl Round {
    pub fn current_slot(&self) -> Option<&RoundSlot> {
        self.slots
            .iter()
            .find(|s| s.position == self.current_position)
    }

    /// Whether every slot has reached a terminal status.
    pub fn is_exhausted(&self) -> bool {
        self.current_position >= self.slots.len() as i64
    }
}

#[derive(Debug, Clone)]
pub struct RoundSlot {
    pub id: String,
    pub round_id: String,
    pub membership_id: String,
    pub position: i64,
    pub status: SlotStatus,
}

macro_rules! str_enum {
    ($ty:ty { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)+
                }
            }

            pub fn parse(s: &str) -> crate::error::Result<Self> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err(crate::error::RunStoreError::InvalidValue(format!(
                        "unknown {}: {other}",
                        stringify!($ty)
                    ))),
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(RunKind { AutoResponse => "auto_response", Regenerate => "regenerate", ForceTalk => "force_talk" });
str_enum!(RunStatus {
    Queued => "queued",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    Canceled => "canceled",
    Skipped => "skipped",
});
str_enum!(RoundStatus { Active => "active", Completed => "completed", Canceled => "canceled" });
str_enum!(SlotStatus {
    Pending => "pending",
    Succeeded => "succeeded",
    Failed => "failed",
    Skipped => "skipped",
});
