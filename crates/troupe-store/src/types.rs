use serde::{Deserialize, Serialize};

/// How the next AI speaker is chosen after a user turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyOrder {
    /// No automatic selection — every AI turn is user-initiated.
    Manual,
    /// SillyTavern-style mention + talkativeness activation.
    Natural,
    /// Strict rotation over position order.
    List,
    /// Each participant speaks at most once per epoch.
    Pooled,
}

/// What happens when user input arrives while a generation is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputPolicy {
    /// The outer controller rejects the input; the scheduler never sees it.
    Reject,
    /// Queue the follow-up behind the running generation.
    Queue,
    /// Cancel the running generation and replace the queued slot.
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Root,
    Branch,
    Thread,
}

/// Cached projection of the round ledger onto the conversation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingState {
    Idle,
    AiGenerating,
    Paused,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipKind {
    Human,
    Character,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Participation {
    Active,
    Muted,
    Observer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Active,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopilotMode {
    None,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Message visibility on the timeline.
///
/// `Normal` and `Excluded` traverse the prompt window (excluded messages are
/// greyed out but still anchor ordering); `Hidden` is skipped everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Normal,
    Excluded,
    Hidden,
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
                    other => Err(crate::error::StoreError::InvalidValue(format!(
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

str_enum!(ReplyOrder { Manual => "manual", Natural => "natural", List => "list", Pooled => "pooled" });
str_enum!(InputPolicy { Reject => "reject", Queue => "queue", Restart => "restart" });
str_enum!(ConversationKind { Root => "root", Branch => "branch", Thread => "thread" });
str_enum!(SchedulingState { Idle => "idle", AiGenerating => "ai_generating", Paused => "paused", Failed => "failed" });
str_enum!(MembershipKind { Human => "human", Character => "character" });
str_enum!(Participation { Active => "active", Muted => "muted", Observer => "observer" });
str_enum!(MemberStatus { Active => "active", Removed => "removed" });
str_enum!(CopilotMode { None => "none", Full => "full" });
str_enum!(Role { User => "user", Assistant => "assistant", System => "system" });
str_enum!(Visibility { Normal => "normal", Excluded => "excluded", Hidden => "hidden" });

/// Configuration container for a group of participants and their
/// conversations. Immutable-by-reference from the scheduler's point of view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Space {
    pub id: String,
    pub name: String,
    pub reply_order: ReplyOrder,
    pub allow_self_responses: bool,
    pub auto_mode_enabled: bool,
    pub auto_mode_delay_ms: u64,
    /// Rounds left in the current auto-mode budget.
    pub auto_rounds_remaining: u32,
    pub input_policy: InputPolicy,
    pub user_turn_debounce_ms: u64,
    /// Skip the non-speaker trim pass on generated text.
    pub relax_message_trim: bool,
    /// How character cards are folded into prompts ("swap", "append", …).
    /// Consumed by the prompt assembler; opaque to the scheduler.
    pub card_handling: String,
    /// Per-space token ceiling. `None` means unlimited.
    pub token_limit: Option<i64>,
    pub prompt_tokens_total: i64,
    pub completion_tokens_total: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// A participant slot within a space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceMembership {
    pub id: String,
    pub space_id: String,
    pub kind: MembershipKind,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub bubble_class: Option<String>,
    /// Rotation order within the space.
    pub position: i64,
    pub participation: Participation,
    pub status: MemberStatus,
    /// Probability weight for the natural strategy. `None` means the 0.5 default.
    pub talkativeness: Option<f64>,
    pub copilot_mode: CopilotMode,
    pub copilot_remaining_steps: u32,
    /// Character card text, already parsed upstream.
    pub persona: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl SpaceMembership {
    /// Whether the scheduler may pick this participant as a speaker.
    ///
    /// Characters always can; humans only while copilot is in full mode.
    pub fn can_auto_respond(&self) -> bool {
        match self.kind {
            MembershipKind::Character => true,
            MembershipKind::Human => self.copilot_mode == CopilotMode::Full,
        }
    }

    /// The eligibility invariant the scheduler filters on.
    pub fn is_eligible(&self) -> bool {
        self.status == MemberStatus::Active
            && self.participation == Participation::Active
            && self.can_auto_respond()
    }

    pub fn effective_talkativeness(&self) -> f64 {
        self.talkativeness.unwrap_or(0.5)
    }
}

/// A message timeline inside a space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub space_id: String,
    pub kind: ConversationKind,
    pub parent_conversation_id: Option<String>,
    pub forked_from_message_id: Option<String>,
    pub scheduling_state: SchedulingState,
    /// Monotone fence clients use to discard out-of-order realtime updates.
    pub group_queue_revision: i64,
    /// Cached membership ids of the active round's queue, for UI display.
    pub round_queue_ids: Vec<String>,
    pub prompt_tokens_total: i64,
    pub completion_tokens_total: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// An ordered entry on a conversation timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    /// Strictly monotone per conversation; allocated as max(seq)+1 inside the
    /// inserting transaction.
    pub seq: i64,
    pub role: Role,
    pub visibility: Visibility,
    pub author_membership_id: Option<String>,
    /// Shared content blob reference — see `content.rs` for the refcount rules.
    pub text_content_id: String,
    /// Resolved body of the active swipe (or the sole content for user rows).
    pub content: String,
    pub active_swipe_id: Option<String>,
    pub swipe_count: i64,
    /// The run that produced this message, when AI-generated.
    pub run_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Message {
    /// Stable DOM id used by the persistent fan-out channel.
    pub fn dom_id(&self) -> String {
        format!("message_{}", self.id)
    }
}

/// An alternative generated body for one assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSwipe {
    pub id: String,
    pub message_id: String,
    pub position: i64,
    pub text_content_id: String,
    pub content: String,
    pub run_id: Option<String>,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_enums_roundtrip() {
        assert_eq!(ReplyOrder::parse("pooled").unwrap(), ReplyOrder::Pooled);
        assert_eq!(SchedulingState::AiGenerating.as_str(), "ai_generating");
        assert_eq!(
            Visibility::parse(Visibility::Excluded.as_str()).unwrap(),
            Visibility::Excluded
        );
        assert!(ReplyOrder::parse("round_robin").is_err());
    }

    #[test]
    fn human_without_copilot_cannot_auto_respond() {
        let mut m = membership(MembershipKind::Human);
        assert!(!m.is_eligible());
        m.copilot_mode = CopilotMode::Full;
        assert!(m.is_eligible());
    }

    #[test]
    fn muted_character_is_ineligible() {
        let mut m = membership(MembershipKind::Character);
        assert!(m.is_eligible());
        m.participation = Participation::Muted;
        assert!(!m.is_eligible());
    }

    fn membership(kind: MembershipKind) -> SpaceMembership {
        SpaceMembership {
            id: "m-1".into(),
            space_id: "s-1".into(),
            kind,
            display_name: "Alice".into(),
            avatar_url: None,
            bubble_class: None,
            position: 0,
            participation: Participation::Active,
            status: MemberStatus::Active,
            talkativeness: None,
            copilot_mode: CopilotMode::None,
            copilot_remaining_steps: 0,
            persona: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }
}
