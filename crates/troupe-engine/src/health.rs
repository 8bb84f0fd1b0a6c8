//! Per-conversation health probe.
//!
//! Pure: inspects and reports, never mutates. The reaper acts on what this
//! reports.

use chrono::{DateTime, Utc};
use serde::Serialize;

use troupe_runs::RunStatus;
use troupe_store::{Role, SchedulingState};

use crate::selector::{predicted_queue, SelectorInput};
use crate::planner::previous_assistant_author;
use crate::{Result, Scheduler, HISTORY_WINDOW};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Failed,
}

/// What an operator (or an automated caller) should do next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HealthAction {
    /// Retry the failed run via `retry_failed_run`.
    Retry { run_id: String },
    /// The scheduler is unexpectedly idle; a generate with this speaker
    /// matches what the planner would have chosen.
    Generate { speaker_membership_id: String },
    /// A stale running run needs the reaper.
    Reap { run_id: String },
    /// The round cursor lags the timeline; `reap_stale` reconciles it.
    Reconcile { round_id: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<HealthAction>,
    pub details: serde_json::Value,
}

impl HealthReport {
    fn ok() -> Self {
        Self {
            status: HealthStatus::Ok,
            action: None,
            details: serde_json::json!({}),
        }
    }
}

impl Scheduler {
    /// Inspect one conversation's scheduling health.
    pub fn health_check(&self, conversation_id: &str, now: DateTime<Utc>) -> Result<HealthReport> {
        let conversation = self.conversations.get(conversation_id)?;
        let space = self.spaces.get(&conversation.space_id)?;
        let running = self.runs.running_run(conversation_id)?;
        let queued = self.runs.queued_run(conversation_id)?;

        // A running run that stopped heartbeating trumps everything else.
        if let Some(run) = &running {
            let age = run.heartbeat_age_secs(now).unwrap_or(i64::MAX);
            if age > self.config.stuck_threshold_secs as i64 {
                return Ok(HealthReport {
                    status: HealthStatus::Degraded,
                    action: Some(HealthAction::Reap {
                        run_id: run.id.clone(),
                    }),
                    details: serde_json::json!({
                        "heartbeat_age_secs": age,
                        "threshold_secs": self.config.stuck_threshold_secs,
                    }),
                });
            }
        }

        if conversation.scheduling_state == SchedulingState::Failed {
            let offending = self
                .runs
                .latest_terminal(conversation_id)?
                .filter(|r| r.status == RunStatus::Failed);
            return Ok(HealthReport {
                status: HealthStatus::Failed,
                action: offending.as_ref().map(|r| HealthAction::Retry {
                    run_id: r.id.clone(),
                }),
                details: serde_json::json!({
                    "error": offending.and_then(|r| r.error.map(|e| serde_json::json!({
                        "code": e.code,
                        "message": e.message,
                    }))),
                }),
            });
        }

        // Unexpected idle: auto-mode wants to run but nothing is planned.
        if conversation.scheduling_state == SchedulingState::Idle
            && space.auto_mode_enabled
            && space.auto_rounds_remaining > 0
            && running.is_none()
            && queued.is_none()
        {
            let members: Vec<_> = self
                .spaces
                .eligible_members(&space.id)?
                .into_iter()
                .collect();
            let history = self.messages.history(conversation_id, HISTORY_WINDOW)?;
            let previous = previous_assistant_author(&history);
            let suggestion = predicted_queue(
                &SelectorInput {
                    reply_order: space.reply_order,
                    allow_self: space.allow_self_responses,
                    members: &members,
                    previous_speaker_id: previous.as_deref(),
                    history: &history,
                },
                1,
            )
            .into_iter()
            .next();

            return Ok(HealthReport {
                status: HealthStatus::Degraded,
                action: suggestion.map(|speaker_membership_id| HealthAction::Generate {
                    speaker_membership_id,
                }),
                details: serde_json::json!({
                    "reason": "idle_with_auto_mode_enabled",
                    "rounds_remaining": space.auto_rounds_remaining,
                }),
            });
        }

        // Drift: claims to be generating but holds no run at all.
        if conversation.scheduling_state == SchedulingState::AiGenerating
            && running.is_none()
            && queued.is_none()
        {
            if let Some(round) = self.rounds.active_round(conversation_id)? {
                let tail = self.messages.prompt_visible_tail(conversation_id)?;
                let slot_spoke = round.current_slot().is_some_and(|slot| {
                    tail.as_ref().is_some_and(|m| {
                        m.role == Role::Assistant
                            && m.author_membership_id.as_deref()
                                == Some(slot.membership_id.as_str())
                    })
                });
                return Ok(HealthReport {
                    status: HealthStatus::Degraded,
                    action: Some(HealthAction::Reconcile {
                        round_id: round.id.clone(),
                    }),
                    details: serde_json::json!({
                        "reason": "ai_generating_without_runs",
                        "current_position": round.current_position,
                        "current_slot_already_spoke": slot_spoke,
                    }),
                });
            }
            return Ok(HealthReport {
                status: HealthStatus::Degraded,
                action: None,
                details: serde_json::json!({ "reason": "ai_generating_without_runs" }),
            });
        }

        Ok(HealthReport::ok())
    }
}
