//! Run planner — translates external triggers into at most one queued run.
//!
//! Every entry point works inside a single transaction over the shared
//! connection: inspect the running/queued slots, apply the space's
//! input-policy, overwrite-or-insert the queued slot (last writer wins),
//! update the scheduling projection, and finish with a worker kick.

use chrono::{Duration, Utc};
use tracing::{info, instrument, warn};

use troupe_events::EphemeralEvent;
use troupe_runs::rounds::{tx_active_round, tx_close_round, tx_open_round};
use troupe_runs::store::{
    tx_request_cancel, tx_running_run, tx_stamp_cancel_reason, tx_upsert_queued,
};
use troupe_runs::{NewRun, RoundStatus, Run, RunDebug, RunKind};
use troupe_store::conversations::{
    get_conversation, tx_set_round_queue, tx_set_scheduling_state,
};
use troupe_store::messages::{get_message, tx_history, tx_prompt_visible_tail};
use troupe_store::spaces::{get_membership, get_space, tx_members};
use troupe_store::{
    CopilotMode, InputPolicy, Message, ReplyOrder, Role, SchedulingState, Space, SpaceMembership,
};

use crate::selector::{predicted_queue, select_speaker, SelectorInput};
use crate::{EngineError, Result, Scheduler, HISTORY_WINDOW};

/// Which copilot trigger produced a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopilotPhase {
    Start,
    Followup,
    Continue,
}

impl CopilotPhase {
    fn trigger(&self) -> &'static str {
        match self {
            CopilotPhase::Start => "copilot_start",
            CopilotPhase::Followup => "copilot_followup",
            CopilotPhase::Continue => "copilot_continue",
        }
    }
}

impl Scheduler {
    /// A user message was committed. Opens a fresh round and queues its
    /// first speaker, honoring the space's input-policy against any running
    /// generation.
    ///
    /// Under `restart` the running run gets a cancel request and the queued
    /// slot is overwritten — never destroyed.
    #[instrument(skip(self, message), fields(conversation = %message.conversation_id))]
    pub fn plan_user_message(&self, message: &Message) -> Result<Option<Run>> {
        let now = Utc::now();
        let run = {
            let mut db = self.db.lock().unwrap();
            let tx = db.transaction().map_err(troupe_store::StoreError::from)?;

            let conversation = get_conversation(&tx, &message.conversation_id)?;
            let space = get_space(&tx, &conversation.space_id)?;
            if space.reply_order == ReplyOrder::Manual {
                return Ok(None);
            }

            let members: Vec<SpaceMembership> = tx_members(&tx, &space.id)?
                .into_iter()
                .filter(|m| m.is_eligible())
                .collect();
            let history = tx_history(&tx, &conversation.id, HISTORY_WINDOW)?;
            let previous = previous_assistant_author(&history);

            let input = SelectorInput {
                reply_order: space.reply_order,
                allow_self: space.allow_self_responses,
                members: &members,
                previous_speaker_id: previous.as_deref(),
                history: &history,
            };
            let speaker = {
                let mut dice = self.dice.lock().unwrap();
                select_speaker(&input, dice.as_mut())
            };
            let Some(speaker) = speaker else {
                return Ok(None);
            };

            // Materialize the round queue: the chosen speaker first, the
            // rest in the strategy's predicted order.
            let mut queue = predicted_queue(&input, members.len());
            queue.retain(|id| *id != speaker);
            queue.insert(0, speaker.clone());

            if let Some(old) = tx_active_round(&tx, &conversation.id)? {
                tx_close_round(&tx, &old.id, RoundStatus::Canceled)?;
            }
            let round = tx_open_round(&tx, &conversation.id, &queue)?;
            tx_set_round_queue(&tx, &conversation.id, &queue)?;

            // With a queued-policy generation still running, the follow-up
            // legitimately executes against a longer timeline — the tail
            // guard only arms when nothing can commit in between.
            let mut expected_tail = Some(message.id.clone());
            if let Some(running) = tx_running_run(&tx, &conversation.id)? {
                match space.input_policy {
                    // The outer controller should have rejected the message
                    // before the planner ever saw it.
                    InputPolicy::Reject => {
                        warn!(run = %running.id, "planner invoked under reject policy; ignoring");
                        return Ok(None);
                    }
                    InputPolicy::Queue => {
                        expected_tail = None;
                    }
                    InputPolicy::Restart => {
                        info!(run = %running.id, "restart policy: cancelling running run");
                        tx_request_cancel(&tx, &running.id, now)?;
                        tx_stamp_cancel_reason(&tx, &running.id, "restart_policy")?;
                    }
                }
            }

            let debounce = effective_debounce(&space, self.config.user_turn_debounce_ms);
            let run = tx_upsert_queued(
                &tx,
                &NewRun {
                    conversation_id: conversation.id.clone(),
                    kind: RunKind::AutoResponse,
                    reason: "user_message".into(),
                    speaker_membership_id: speaker,
                    run_after: (debounce > 0).then(|| now + Duration::milliseconds(debounce as i64)),
                    round_id: Some(round.id.clone()),
                    debug: RunDebug {
                        trigger: Some("user_message".into()),
                        expected_last_message_id: expected_tail,
                        scheduled_by: Some("planner".into()),
                        target_message_id: None,
                    },
                },
            )?;
            let rev = tx_set_scheduling_state(&tx, &conversation.id, SchedulingState::AiGenerating)?;
            tx.commit().map_err(troupe_store::StoreError::from)?;

            self.publisher.publish_ephemeral(
                &conversation.id,
                rev,
                EphemeralEvent::GroupQueueUpdated {
                    scheduling_state: SchedulingState::AiGenerating.as_str().into(),
                    queue_membership_ids: queue,
                },
            );
            run
        };
        self.kick_workers();
        Ok(Some(run))
    }

    /// Force a specific speaker to talk, regardless of reply order.
    /// Cancels any active round; the forced turn is roundless.
    #[instrument(skip(self), fields(conversation = %conversation_id, speaker = %speaker_membership_id))]
    pub fn plan_force_talk(
        &self,
        conversation_id: &str,
        speaker_membership_id: &str,
    ) -> Result<Run> {
        let run = {
            let mut db = self.db.lock().unwrap();
            let tx = db.transaction().map_err(troupe_store::StoreError::from)?;

            let conversation = get_conversation(&tx, conversation_id)?;
            get_membership(&tx, speaker_membership_id)?;

            if let Some(round) = tx_active_round(&tx, conversation_id)? {
                tx_close_round(&tx, &round.id, RoundStatus::Canceled)?;
            }
            tx_set_round_queue(&tx, conversation_id, &[speaker_membership_id.to_string()])?;

            let run = tx_upsert_queued(
                &tx,
                &NewRun {
                    conversation_id: conversation.id.clone(),
                    kind: RunKind::ForceTalk,
                    reason: "force_talk".into(),
                    speaker_membership_id: speaker_membership_id.to_string(),
                    run_after: None,
                    round_id: None,
                    debug: RunDebug {
                        trigger: Some("force_talk".into()),
                        scheduled_by: Some("planner".into()),
                        ..RunDebug::default()
                    },
                },
            )?;
            let rev = tx_set_scheduling_state(&tx, conversation_id, SchedulingState::AiGenerating)?;
            tx.commit().map_err(troupe_store::StoreError::from)?;

            self.publisher.publish_ephemeral(
                conversation_id,
                rev,
                EphemeralEvent::GroupQueueUpdated {
                    scheduling_state: SchedulingState::AiGenerating.as_str().into(),
                    queue_membership_ids: vec![speaker_membership_id.to_string()],
                },
            );
            run
        };
        self.kick_workers();
        Ok(run)
    }

    /// Regenerate an assistant message as a new swipe. Guarded at claim time:
    /// the target must still be the prompt-visible tail.
    #[instrument(skip(self), fields(target = %target_message_id))]
    pub fn plan_regenerate(&self, target_message_id: &str) -> Result<Run> {
        let run = {
            let mut db = self.db.lock().unwrap();
            let tx = db.transaction().map_err(troupe_store::StoreError::from)?;

            let target = get_message(&tx, target_message_id)?;
            if target.role != Role::Assistant {
                return Err(EngineError::NotRegenerable {
                    id: target_message_id.to_string(),
                });
            }
            let speaker = target
                .author_membership_id
                .clone()
                .ok_or_else(|| EngineError::NotRegenerable {
                    id: target_message_id.to_string(),
                })?;

            if let Some(round) = tx_active_round(&tx, &target.conversation_id)? {
                tx_close_round(&tx, &round.id, RoundStatus::Canceled)?;
            }

            let run = tx_upsert_queued(
                &tx,
                &NewRun {
                    conversation_id: target.conversation_id.clone(),
                    kind: RunKind::Regenerate,
                    reason: "regenerate".into(),
                    speaker_membership_id: speaker,
                    run_after: None,
                    round_id: None,
                    debug: RunDebug {
                        trigger: Some("regenerate".into()),
                        expected_last_message_id: Some(target.id.clone()),
                        scheduled_by: Some("planner".into()),
                        target_message_id: Some(target.id.clone()),
                    },
                },
            )?;
            let rev =
                tx_set_scheduling_state(&tx, &target.conversation_id, SchedulingState::AiGenerating)?;
            tx.commit().map_err(troupe_store::StoreError::from)?;

            self.publisher.publish_ephemeral(
                &target.conversation_id,
                rev,
                EphemeralEvent::GroupQueueUpdated {
                    scheduling_state: SchedulingState::AiGenerating.as_str().into(),
                    queue_membership_ids: Vec::new(),
                },
            );
            run
        };
        self.kick_workers();
        Ok(run)
    }

    /// An auto-loop tick: continue AI-to-AI progression from the given
    /// trigger message. No-op unless the space has auto-mode on.
    #[instrument(skip(self), fields(conversation = %conversation_id))]
    pub fn plan_auto_followup(
        &self,
        conversation_id: &str,
        trigger_message_id: &str,
    ) -> Result<Option<Run>> {
        let run = {
            let mut db = self.db.lock().unwrap();
            let tx = db.transaction().map_err(troupe_store::StoreError::from)?;

            let conversation = get_conversation(&tx, conversation_id)?;
            let space = get_space(&tx, &conversation.space_id)?;
            if !space.auto_mode_enabled {
                return Ok(None);
            }

            let members: Vec<SpaceMembership> = tx_members(&tx, &space.id)?
                .into_iter()
                .filter(|m| m.is_eligible())
                .collect();
            let history = tx_history(&tx, conversation_id, HISTORY_WINDOW)?;
            let previous = previous_assistant_author(&history);
            let input = SelectorInput {
                reply_order: space.reply_order,
                allow_self: space.allow_self_responses,
                members: &members,
                previous_speaker_id: previous.as_deref(),
                history: &history,
            };
            let speaker = {
                let mut dice = self.dice.lock().unwrap();
                select_speaker(&input, dice.as_mut())
            };
            let Some(speaker) = speaker else {
                return Ok(None);
            };

            let mut queue = predicted_queue(&input, members.len());
            queue.retain(|id| *id != speaker);
            queue.insert(0, speaker.clone());

            if let Some(old) = tx_active_round(&tx, conversation_id)? {
                tx_close_round(&tx, &old.id, RoundStatus::Canceled)?;
            }
            let round = tx_open_round(&tx, conversation_id, &queue)?;
            tx_set_round_queue(&tx, conversation_id, &queue)?;

            let run = tx_upsert_queued(
                &tx,
                &NewRun {
                    conversation_id: conversation_id.to_string(),
                    kind: RunKind::AutoResponse,
                    reason: "auto_mode".into(),
                    speaker_membership_id: speaker,
                    run_after: None,
                    round_id: Some(round.id.clone()),
                    debug: RunDebug {
                        trigger: Some("auto_mode".into()),
                        expected_last_message_id: Some(trigger_message_id.to_string()),
                        scheduled_by: Some("planner".into()),
                        target_message_id: None,
                    },
                },
            )?;
            let rev = tx_set_scheduling_state(&tx, conversation_id, SchedulingState::AiGenerating)?;
            tx.commit().map_err(troupe_store::StoreError::from)?;

            self.publisher.publish_ephemeral(
                conversation_id,
                rev,
                EphemeralEvent::GroupQueueUpdated {
                    scheduling_state: SchedulingState::AiGenerating.as_str().into(),
                    queue_membership_ids: queue,
                },
            );
            run
        };
        self.kick_workers();
        Ok(Some(run))
    }

    /// Queue a copilot turn for a human with a bound character.
    /// Steps are decremented on success only, by the turn driver.
    #[instrument(skip(self), fields(conversation = %conversation_id, member = %membership_id))]
    pub fn plan_copilot(
        &self,
        conversation_id: &str,
        membership_id: &str,
        phase: CopilotPhase,
    ) -> Result<Option<Run>> {
        let run = {
            let mut db = self.db.lock().unwrap();
            let tx = db.transaction().map_err(troupe_store::StoreError::from)?;

            let member = get_membership(&tx, membership_id)?;
            if member.copilot_mode != CopilotMode::Full || member.copilot_remaining_steps == 0 {
                return Ok(None);
            }

            let tail = tx_prompt_visible_tail(&tx, conversation_id)?;
            let run = tx_upsert_queued(
                &tx,
                &NewRun {
                    conversation_id: conversation_id.to_string(),
                    kind: RunKind::AutoResponse,
                    reason: phase.trigger().into(),
                    speaker_membership_id: membership_id.to_string(),
                    run_after: None,
                    round_id: None,
                    debug: RunDebug {
                        trigger: Some(phase.trigger().into()),
                        expected_last_message_id: tail.map(|m| m.id),
                        scheduled_by: Some("planner".into()),
                        target_message_id: None,
                    },
                },
            )?;
            let rev = tx_set_scheduling_state(&tx, conversation_id, SchedulingState::AiGenerating)?;
            tx.commit().map_err(troupe_store::StoreError::from)?;

            self.publisher.publish_ephemeral(
                conversation_id,
                rev,
                EphemeralEvent::GroupQueueUpdated {
                    scheduling_state: SchedulingState::AiGenerating.as_str().into(),
                    queue_membership_ids: vec![membership_id.to_string()],
                },
            );
            run
        };
        self.kick_workers();
        Ok(Some(run))
    }

    /// The deterministic speaker preview for a conversation — what the
    /// active strategy would schedule next, for UI display.
    pub fn predicted_speakers(&self, conversation_id: &str, limit: usize) -> Result<Vec<String>> {
        let conversation = self.conversations.get(conversation_id)?;
        let space = self.spaces.get(&conversation.space_id)?;
        let members = self.spaces.eligible_members(&space.id)?;
        let history = self.messages.history(conversation_id, HISTORY_WINDOW)?;
        let previous = previous_assistant_author(&history);
        Ok(predicted_queue(
            &SelectorInput {
                reply_order: space.reply_order,
                allow_self: space.allow_self_responses,
                members: &members,
                previous_speaker_id: previous.as_deref(),
                history: &history,
            },
            limit,
        ))
    }

    /// Enable or disable auto-mode on a space.
    ///
    /// Enabling demotes every full-copilot membership (the two drivers are
    /// mutually exclusive) and broadcasts the change to all of the space's
    /// conversations.
    pub fn set_auto_mode(&self, space_id: &str, enabled: bool, rounds: u32) -> Result<()> {
        let rounds = rounds.min(self.config.auto_mode_max_rounds);
        let demoted = self.spaces.set_auto_mode(space_id, enabled, rounds)?;

        for conversation in self.conversations.list_for_space(space_id)? {
            if !enabled {
                self.publisher.publish_ephemeral(
                    &conversation.id,
                    conversation.group_queue_revision,
                    EphemeralEvent::AutoDisabled,
                );
            }
            for member_id in &demoted {
                self.publisher.publish_ephemeral(
                    &conversation.id,
                    conversation.group_queue_revision,
                    EphemeralEvent::AutoStepsUpdated {
                        membership_id: member_id.clone(),
                        remaining_steps: 0,
                    },
                );
            }
        }
        Ok(())
    }
}

/// Author of the most recent assistant message, for rotation and
/// self-response exclusion.
pub(crate) fn previous_assistant_author(history: &[Message]) -> Option<String> {
    history
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .and_then(|m| m.author_membership_id.clone())
}

fn effective_debounce(space: &Space, default_ms: u64) -> u64 {
    if space.user_turn_debounce_ms > 0 {
        space.user_turn_debounce_ms
    } else {
        default_ms
    }
}
