//! Turn scheduler / round driver.
//!
//! Runs the "who talks next" decision on every terminal run outcome: map
//! the outcome onto the round's current slot, advance the cursor over
//! ineligible participants, enqueue the next speaker or close the round,
//! and spend the auto-mode budget one round at a time.

use chrono::{Duration, Utc};
use tracing::{info, instrument, warn};

use troupe_events::EphemeralEvent;
use troupe_runs::rounds::{
    tx_active_round, tx_close_round, tx_open_round, tx_set_cursor, tx_set_round_state,
    tx_set_slot_status,
};
use troupe_runs::store::tx_upsert_queued;
use troupe_runs::{NewRun, RoundStatus, Run, RunDebug, RunKind, RunStatus, SlotStatus};
use troupe_store::conversations::{
    get_conversation, tx_bump_revision, tx_set_round_queue, tx_set_scheduling_state,
};
use troupe_store::messages::{tx_history, tx_prompt_visible_tail};
use troupe_store::spaces::{
    get_membership, get_space, tx_decrement_auto_rounds, tx_decrement_copilot_step,
    tx_disable_copilot, tx_members, tx_set_auto_enabled,
};
use troupe_store::{CopilotMode, MembershipKind, SchedulingState, Space, SpaceMembership};

use crate::planner::previous_assistant_author;
use crate::selector::{predicted_queue, SelectorInput};
use crate::{Result, Scheduler, HISTORY_WINDOW};

impl Scheduler {
    /// Reconcile the round ledger with a terminal run outcome.
    ///
    /// Idempotent: replaying the callback for an already-settled run finds
    /// no active round slot to advance and changes nothing.
    #[instrument(skip(self, run), fields(run = %run.id, status = %run.status))]
    pub fn on_run_terminal(&self, run: &Run) -> Result<()> {
        if !run.status.is_terminal() {
            warn!("turn-complete callback for a non-terminal run; ignoring");
            return Ok(());
        }

        let mut events: Vec<(i64, EphemeralEvent)> = Vec::new();
        let mut kick = false;

        {
            let mut db = self.db.lock().unwrap();
            let tx = db.transaction().map_err(troupe_store::StoreError::from)?;

            let conversation = get_conversation(&tx, &run.conversation_id)?;
            let space = get_space(&tx, &conversation.space_id)?;

            let round = tx_active_round(&tx, &conversation.id)?
                .filter(|r| run.round_id.as_deref() == Some(r.id.as_str()));

            let Some(round) = round else {
                // Roundless run (force_talk, regenerate, copilot) — settle
                // the scheduling projection and stop. A replayed callback
                // finds the projection already settled and changes nothing.
                if conversation.scheduling_state != SchedulingState::AiGenerating {
                    return Ok(());
                }
                // A newer plan may already have work in flight (restart
                // policy replaces a canceled run); leave its projection alone.
                if troupe_runs::store::tx_queued_run(&tx, &conversation.id)?.is_some()
                    || troupe_runs::store::tx_running_run(&tx, &conversation.id)?.is_some()
                {
                    self.account_copilot_step(
                        &tx,
                        run,
                        &conversation.group_queue_revision,
                        &mut events,
                    )?;
                    tx.commit().map_err(troupe_store::StoreError::from)?;
                    self.flush(&run.conversation_id, events, kick);
                    return Ok(());
                }
                self.account_copilot_step(&tx, run, &conversation.group_queue_revision, &mut events)?;
                let state = if run.status == RunStatus::Failed {
                    SchedulingState::Failed
                } else {
                    SchedulingState::Idle
                };
                tx_set_round_queue(&tx, &conversation.id, &[])?;
                let rev = tx_set_scheduling_state(&tx, &conversation.id, state)?;
                tx.commit().map_err(troupe_store::StoreError::from)?;
                events.push((
                    rev,
                    EphemeralEvent::GroupQueueUpdated {
                        scheduling_state: state.as_str().into(),
                        queue_membership_ids: Vec::new(),
                    },
                ));
                self.flush(&run.conversation_id, events, kick);
                return Ok(());
            };

            // Idempotence guard: only the pending slot the run was scheduled
            // for can absorb its outcome. A replayed callback finds the
            // cursor already moved and changes nothing.
            let current_matches = round.current_slot().is_some_and(|s| {
                s.status == SlotStatus::Pending && s.membership_id == run.speaker_membership_id
            });
            if !current_matches {
                return Ok(());
            }
            self.account_copilot_step(&tx, run, &conversation.group_queue_revision, &mut events)?;

            // Map the outcome onto the current slot.
            let slot_status = match run.status {
                RunStatus::Succeeded => SlotStatus::Succeeded,
                RunStatus::Failed => SlotStatus::Failed,
                _ => SlotStatus::Skipped,
            };
            tx_set_slot_status(&tx, &round.id, round.current_position, slot_status)?;

            if run.status == RunStatus::Failed {
                // Pause the round; the reaper and health checker surface it.
                tx_set_round_state(&tx, &round.id, SchedulingState::Failed)?;
                let rev = tx_set_scheduling_state(&tx, &conversation.id, SchedulingState::Failed)?;
                tx.commit().map_err(troupe_store::StoreError::from)?;
                events.push((
                    rev,
                    EphemeralEvent::GroupQueueUpdated {
                        scheduling_state: SchedulingState::Failed.as_str().into(),
                        queue_membership_ids: Vec::new(),
                    },
                ));
                self.flush(&run.conversation_id, events, kick);
                return Ok(());
            }

            // Advance over now-ineligible slots.
            let mut position = round.current_position + 1;
            while let Some(slot) = round.slots.iter().find(|s| s.position == position) {
                let member = get_membership(&tx, &slot.membership_id)?;
                if member.is_eligible() {
                    break;
                }
                tx_set_slot_status(&tx, &round.id, position, SlotStatus::Skipped)?;
                position += 1;
            }
            tx_set_cursor(&tx, &round.id, position)?;

            if let Some(next) = round.slots.iter().find(|s| s.position == position) {
                // Schedule the next slot.
                let tail = tx_prompt_visible_tail(&tx, &conversation.id)?;
                tx_upsert_queued(
                    &tx,
                    &NewRun {
                        conversation_id: conversation.id.clone(),
                        kind: RunKind::AutoResponse,
                        reason: "round_advance".into(),
                        speaker_membership_id: next.membership_id.clone(),
                        run_after: None,
                        round_id: Some(round.id.clone()),
                        debug: RunDebug {
                            trigger: Some("round_advance".into()),
                            expected_last_message_id: tail.map(|m| m.id),
                            scheduled_by: Some("turn_scheduler".into()),
                            target_message_id: None,
                        },
                    },
                )?;
                let remaining: Vec<String> = round
                    .slots
                    .iter()
                    .filter(|s| s.position >= position)
                    .map(|s| s.membership_id.clone())
                    .collect();
                let rev = tx_bump_revision(&tx, &conversation.id)?;
                tx.commit().map_err(troupe_store::StoreError::from)?;
                events.push((
                    rev,
                    EphemeralEvent::GroupQueueUpdated {
                        scheduling_state: SchedulingState::AiGenerating.as_str().into(),
                        queue_membership_ids: remaining,
                    },
                ));
                kick = true;
            } else {
                // Round exhausted.
                tx_close_round(&tx, &round.id, RoundStatus::Completed)?;
                info!(round = %round.id, "round completed");

                let mut opened_next = false;
                if space.auto_mode_enabled {
                    // The budget is spent per completed round, never for a
                    // round that fails to open.
                    let remaining_rounds = tx_decrement_auto_rounds(&tx, &space.id)?;
                    if remaining_rounds > 0 {
                        opened_next = self.open_next_round(
                            &tx,
                            &conversation.id,
                            &space,
                            run,
                            &mut events,
                        )?;
                        if opened_next {
                            kick = true;
                        }
                    } else {
                        info!(space = %space.id, "auto-mode budget exhausted");
                    }
                }

                if !opened_next {
                    tx_set_round_queue(&tx, &conversation.id, &[])?;
                    let rev = tx_set_scheduling_state(&tx, &conversation.id, SchedulingState::Idle)?;
                    events.push((
                        rev,
                        EphemeralEvent::GroupQueueUpdated {
                            scheduling_state: SchedulingState::Idle.as_str().into(),
                            queue_membership_ids: Vec::new(),
                        },
                    ));
                }
                tx.commit().map_err(troupe_store::StoreError::from)?;
            }
        }

        self.flush(&run.conversation_id, events, kick);
        Ok(())
    }

    /// Spend a copilot step on a successful copilot turn. Exhaustion turns
    /// copilot off but leaves auto-mode alone.
    fn account_copilot_step(
        &self,
        tx: &rusqlite::Connection,
        run: &Run,
        rev: &i64,
        events: &mut Vec<(i64, EphemeralEvent)>,
    ) -> Result<()> {
        if run.status != RunStatus::Succeeded {
            return Ok(());
        }
        let speaker = get_membership(tx, &run.speaker_membership_id)?;
        if speaker.kind != MembershipKind::Human || speaker.copilot_mode != CopilotMode::Full {
            return Ok(());
        }
        let remaining = tx_decrement_copilot_step(tx, &speaker.id)?;
        if remaining == 0 {
            tx_disable_copilot(tx, &speaker.id)?;
            info!(member = %speaker.id, "copilot steps exhausted, copilot off");
        }
        events.push((
            *rev,
            EphemeralEvent::AutoStepsUpdated {
                membership_id: speaker.id.clone(),
                remaining_steps: remaining,
            },
        ));
        Ok(())
    }

    /// Open the next auto-mode round, or report that the strategy declined
    /// (drained pool, empty cast) — which terminates auto-mode.
    fn open_next_round(
        &self,
        tx: &rusqlite::Connection,
        conversation_id: &str,
        space: &Space,
        last_run: &Run,
        events: &mut Vec<(i64, EphemeralEvent)>,
    ) -> Result<bool> {
        let members: Vec<SpaceMembership> = tx_members(tx, &space.id)?
            .into_iter()
            .filter(|m| m.is_eligible())
            .collect();
        let history = tx_history(tx, conversation_id, HISTORY_WINDOW)?;
        let previous = previous_assistant_author(&history)
            .or_else(|| Some(last_run.speaker_membership_id.clone()));

        let input = SelectorInput {
            reply_order: space.reply_order,
            allow_self: space.allow_self_responses,
            members: &members,
            previous_speaker_id: previous.as_deref(),
            history: &history,
        };
        let queue = predicted_queue(&input, members.len());
        if queue.is_empty() {
            // Pooled exhaustion (or an empty cast): auto-mode ends here.
            info!(space = %space.id, "speaker pool drained, terminating auto-mode");
            tx_set_auto_enabled(tx, &space.id, false)?;
            let rev = tx_bump_revision(tx, conversation_id)?;
            events.push((rev, EphemeralEvent::AutoDisabled));
            return Ok(false);
        }

        let round = tx_open_round(tx, conversation_id, &queue)?;
        tx_set_round_queue(tx, conversation_id, &queue)?;
        let tail = tx_prompt_visible_tail(tx, conversation_id)?;
        let delay = space.auto_mode_delay_ms;
        tx_upsert_queued(
            tx,
            &NewRun {
                conversation_id: conversation_id.to_string(),
                kind: RunKind::AutoResponse,
                reason: "auto_round".into(),
                speaker_membership_id: queue[0].clone(),
                run_after: (delay > 0).then(|| Utc::now() + Duration::milliseconds(delay as i64)),
                round_id: Some(round.id),
                debug: RunDebug {
                    trigger: Some("auto_round".into()),
                    expected_last_message_id: tail.map(|m| m.id),
                    scheduled_by: Some("turn_scheduler".into()),
                    target_message_id: None,
                },
            },
        )?;
        let rev = tx_set_scheduling_state(tx, conversation_id, SchedulingState::AiGenerating)?;
        events.push((
            rev,
            EphemeralEvent::GroupQueueUpdated {
                scheduling_state: SchedulingState::AiGenerating.as_str().into(),
                queue_membership_ids: queue,
            },
        ));
        Ok(true)
    }

    /// Publish accumulated events (post-commit) and kick if needed.
    fn flush(&self, conversation_id: &str, events: Vec<(i64, EphemeralEvent)>, kick: bool) {
        for (rev, event) in events {
            self.publisher.publish_ephemeral(conversation_id, rev, event);
        }
        if kick {
            self.kick_workers();
        }
    }
}
