//! Reaper — the mutating half of self-healing.
//!
//! A background sweep finds runs whose workers died (no heartbeat), returns
//! their conversations to a recoverable state, and reconciles scheduler
//! drift. Also hosts the maintenance surface: `retry_failed_run` and
//! `cancel_stuck_run`. Every operation is idempotent — sweeping twice in a
//! row changes nothing the second time.

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use troupe_events::EphemeralEvent;
use troupe_runs::rounds::{tx_active_round, tx_close_round, tx_set_cursor, tx_set_slot_status};
use troupe_runs::store::{
    tx_finalize, tx_force_fail, tx_request_cancel, tx_stamp_cancel_reason, tx_upsert_queued,
};
use troupe_runs::{NewRun, RoundStatus, Run, RunDebug, RunError, RunKind, RunStatus, SlotStatus};
use troupe_store::conversations::tx_set_scheduling_state;
use troupe_store::messages::tx_prompt_visible_tail;
use troupe_store::{Role, SchedulingState};

use crate::{EngineError, Result, Scheduler};

/// What a reap sweep did.
#[derive(Debug, Default)]
pub struct ReapReport {
    /// Running runs failed with `heartbeat_timeout`.
    pub failed_running: Vec<String>,
    /// Conversations whose queued run was re-kicked.
    pub kicked: Vec<String>,
    /// Conversations marked `failed` (no queued run to continue with).
    pub marked_failed: Vec<String>,
    /// Conversations whose drifted round was advanced.
    pub reconciled: Vec<String>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.failed_running.is_empty()
            && self.kicked.is_empty()
            && self.marked_failed.is_empty()
            && self.reconciled.is_empty()
    }
}

impl Scheduler {
    /// Sweep for stale runs and scheduler drift.
    #[instrument(skip(self))]
    pub fn reap_stale(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let mut report = ReapReport::default();

        for stale in self.runs.stale_running(now)? {
            warn!(run = %stale.id, conversation = %stale.conversation_id, "reaping stale running run");
            let (rev, has_queued) = {
                let mut db = self.db.lock().unwrap();
                let tx = db.transaction().map_err(troupe_store::StoreError::from)?;
                tx_force_fail(
                    &tx,
                    &stale.id,
                    RunError::new("heartbeat_timeout", "worker stopped heartbeating"),
                    now,
                )?;
                let has_queued =
                    troupe_runs::store::tx_queued_run(&tx, &stale.conversation_id)?.is_some();
                let rev = if has_queued {
                    // Leave the projection alone; the queued run continues.
                    troupe_store::conversations::tx_bump_revision(&tx, &stale.conversation_id)?
                } else {
                    tx_set_scheduling_state(&tx, &stale.conversation_id, SchedulingState::Failed)?
                };
                tx.commit().map_err(troupe_store::StoreError::from)?;
                (rev, has_queued)
            };

            self.publisher.publish_ephemeral(
                &stale.conversation_id,
                rev,
                EphemeralEvent::RunFailed {
                    run_id: stale.id.clone(),
                    code: "heartbeat_timeout".into(),
                    message: "worker stopped heartbeating".into(),
                },
            );
            report.failed_running.push(stale.id);
            if has_queued {
                report.kicked.push(stale.conversation_id);
            } else {
                report.marked_failed.push(stale.conversation_id);
            }
        }

        // Queued runs past due with no worker ack: nothing to mutate, but a
        // kick costs nothing and revives a pool that missed a notify.
        if !self.runs.stale_queued(now)?.is_empty() {
            self.kick_workers();
        }

        for conversation in self.reconcile_drift()? {
            report.reconciled.push(conversation);
        }

        if !report.kicked.is_empty() || !report.reconciled.is_empty() {
            self.kick_workers();
        }
        if !report.is_empty() {
            info!(
                failed = report.failed_running.len(),
                kicked = report.kicked.len(),
                marked_failed = report.marked_failed.len(),
                reconciled = report.reconciled.len(),
                "reap sweep complete"
            );
        }
        Ok(report)
    }

    /// Requeue a failed run. Overwrites the conversation's queued slot, so
    /// retrying twice is the same as retrying once.
    #[instrument(skip(self), fields(run = %run_id))]
    pub fn retry_failed_run(&self, run_id: &str) -> Result<Run> {
        let failed = self.runs.get(run_id)?;
        if failed.status != RunStatus::Failed {
            return Err(EngineError::WrongRunState {
                id: run_id.to_string(),
                expected: "failed",
            });
        }

        let retry = {
            let mut db = self.db.lock().unwrap();
            let tx = db.transaction().map_err(troupe_store::StoreError::from)?;
            // The retry runs standalone; a round paused on this failure is
            // spent.
            if let Some(round) = tx_active_round(&tx, &failed.conversation_id)? {
                tx_close_round(&tx, &round.id, RoundStatus::Canceled)?;
            }
            let retry = tx_upsert_queued(
                &tx,
                &NewRun {
                    conversation_id: failed.conversation_id.clone(),
                    kind: failed.kind,
                    reason: "retry".into(),
                    speaker_membership_id: failed.speaker_membership_id.clone(),
                    run_after: None,
                    round_id: None,
                    debug: RunDebug {
                        trigger: Some("retry".into()),
                        scheduled_by: Some("maintenance".into()),
                        // Regenerate retries keep their guard (the swipe must
                        // still target the tail); plain retries run against
                        // whatever the timeline is now.
                        expected_last_message_id: match failed.kind {
                            RunKind::Regenerate => failed.debug.expected_last_message_id.clone(),
                            _ => None,
                        },
                        target_message_id: failed.debug.target_message_id.clone(),
                    },
                },
            )?;
            tx_set_scheduling_state(&tx, &failed.conversation_id, SchedulingState::AiGenerating)?;
            tx.commit().map_err(troupe_store::StoreError::from)?;
            retry
        };
        self.kick_workers();
        Ok(retry)
    }

    /// Cancel a run that is wedged. Queued runs cancel immediately; running
    /// runs get a cancel request, and are force-finalized only when their
    /// heartbeat shows the worker is gone. Terminal runs are a no-op.
    #[instrument(skip(self), fields(run = %run_id))]
    pub fn cancel_stuck_run(&self, run_id: &str, now: DateTime<Utc>) -> Result<Run> {
        let run = self.runs.get(run_id)?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        let mut db = self.db.lock().unwrap();
        let tx = db.transaction().map_err(troupe_store::StoreError::from)?;
        tx_request_cancel(&tx, &run.id, now)?;
        tx_stamp_cancel_reason(&tx, &run.id, "scheduler_stop")?;

        let worker_gone = run
            .heartbeat_age_secs(now)
            .is_none_or(|age| age > self.config.stuck_threshold_secs as i64);
        let finalized = if run.status == RunStatus::Queued || worker_gone {
            let r = tx_finalize(&tx, &run.id, RunStatus::Canceled, None, now)?;
            tx_set_scheduling_state(&tx, &run.conversation_id, SchedulingState::Idle)?;
            r
        } else {
            // A live worker will observe the request at its next chunk.
            troupe_runs::store::tx_get_run(&tx, &run.id)?
        };
        tx.commit().map_err(troupe_store::StoreError::from)?;
        Ok(finalized)
    }

    /// Advance rounds whose current slot already happened.
    ///
    /// Drift shows up as `scheduling_state = ai_generating` with no queued or
    /// running run: the worker died between committing and scheduling the
    /// next slot. When the current slot's speaker already has an assistant
    /// message newer than the round, the slot is treated as succeeded and
    /// the round re-driven; otherwise the slot is re-enqueued.
    fn reconcile_drift(&self) -> Result<Vec<String>> {
        let mut reconciled = Vec::new();

        for conversation in self
            .conversations
            .list_in_state(SchedulingState::AiGenerating)?
        {
            if self.runs.running_run(&conversation.id)?.is_some()
                || self.runs.queued_run(&conversation.id)?.is_some()
            {
                continue;
            }

            let mut db = self.db.lock().unwrap();
            let tx = db.transaction().map_err(troupe_store::StoreError::from)?;

            let Some(round) = tx_active_round(&tx, &conversation.id)? else {
                // No round and no run: plain drift back to idle.
                tx_set_scheduling_state(&tx, &conversation.id, SchedulingState::Idle)?;
                tx.commit().map_err(troupe_store::StoreError::from)?;
                reconciled.push(conversation.id.clone());
                continue;
            };
            let Some(slot) = round.current_slot() else {
                tx_close_round(&tx, &round.id, RoundStatus::Completed)?;
                tx_set_scheduling_state(&tx, &conversation.id, SchedulingState::Idle)?;
                tx.commit().map_err(troupe_store::StoreError::from)?;
                reconciled.push(conversation.id.clone());
                continue;
            };

            let tail = tx_prompt_visible_tail(&tx, &conversation.id)?;
            let slot_already_spoke = tail.as_ref().is_some_and(|m| {
                m.role == Role::Assistant
                    && m.author_membership_id.as_deref() == Some(slot.membership_id.as_str())
                    && m.created_at.as_str() >= round.created_at.as_str()
            });

            if slot_already_spoke {
                // The turn happened but the advance was lost. Settle the
                // slot, move the cursor, and either re-arm the next slot or
                // close the round.
                tx_set_slot_status(&tx, &round.id, slot.position, SlotStatus::Succeeded)?;
                let next_position = slot.position + 1;
                tx_set_cursor(&tx, &round.id, next_position)?;

                if let Some(next) = round.slots.iter().find(|s| s.position == next_position) {
                    tx_upsert_queued(
                        &tx,
                        &NewRun {
                            conversation_id: conversation.id.clone(),
                            kind: RunKind::AutoResponse,
                            reason: "drift_advance".into(),
                            speaker_membership_id: next.membership_id.clone(),
                            run_after: None,
                            round_id: Some(round.id.clone()),
                            debug: RunDebug {
                                trigger: Some("drift_advance".into()),
                                expected_last_message_id: tail.map(|m| m.id),
                                scheduled_by: Some("reaper".into()),
                                target_message_id: None,
                            },
                        },
                    )?;
                } else {
                    tx_close_round(&tx, &round.id, RoundStatus::Completed)?;
                    tx_set_scheduling_state(&tx, &conversation.id, SchedulingState::Idle)?;
                }
                tx.commit().map_err(troupe_store::StoreError::from)?;
            } else {
                // The turn never happened: put the slot's run back.
                let expected = tail.map(|m| m.id);
                tx_upsert_queued(
                    &tx,
                    &NewRun {
                        conversation_id: conversation.id.clone(),
                        kind: RunKind::AutoResponse,
                        reason: "drift_requeue".into(),
                        speaker_membership_id: slot.membership_id.clone(),
                        run_after: None,
                        round_id: Some(round.id.clone()),
                        debug: RunDebug {
                            trigger: Some("drift_requeue".into()),
                            expected_last_message_id: expected,
                            scheduled_by: Some("reaper".into()),
                            target_message_id: None,
                        },
                    },
                )?;
                tx.commit().map_err(troupe_store::StoreError::from)?;
            }
            reconciled.push(conversation.id.clone());
        }
        Ok(reconciled)
    }
}

