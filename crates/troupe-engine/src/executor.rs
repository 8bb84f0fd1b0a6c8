//! Run executor — drives a claimed run through generation to commit.
//!
//! The contract clients rely on: streamed tokens only ever reach the
//! ephemeral topic; the timeline row appears in one transaction together
//! with the run's `succeeded` finalize. Nobody observes a half-written
//! message, whatever happens to this worker.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use troupe_core::config::HEARTBEAT_MIN_INTERVAL_MS;
use troupe_events::{EphemeralEvent, PersistentEvent};
use troupe_llm::{ChatRequest, ClientError, SamplingParams, StreamEvent};
use troupe_llm::prompt::PromptInput;
use troupe_runs::store::tx_finalize;
use troupe_runs::{ClaimOutcome, Run, RunError, RunKind, RunStatus};
use troupe_store::conversations::{tx_bump_conversation_tokens, tx_bump_revision};
use troupe_store::messages::{get_message, tx_add_swipe, tx_insert_assistant_message};
use troupe_store::spaces::tx_bump_space_tokens;
use troupe_store::{Conversation, MemberStatus, Message, MembershipKind, SpaceMembership};

use crate::trim::trim_foreign_turns;
use crate::{EngineError, Result, Scheduler, HISTORY_WINDOW};

impl Scheduler {
    /// Claim and execute one run end to end. Losing the claim is a silent
    /// no-op; every other outcome finalizes the run exactly once and hands
    /// off to the turn driver.
    #[instrument(skip(self), fields(run = %run_id))]
    pub async fn execute_run(&self, run_id: &str) -> Result<()> {
        let now = Utc::now();
        let run = match self.runs.claim_atomic(run_id, now)? {
            ClaimOutcome::Claimed(r) => r,
            ClaimOutcome::NotClaimable => {
                debug!("claim lost");
                return Ok(());
            }
        };

        let conversation = self.conversations.get(&run.conversation_id)?;
        let space = self.spaces.get(&conversation.space_id)?;
        let speaker = self.spaces.member(&run.speaker_membership_id)?;
        let rev = conversation.group_queue_revision;

        // Guard: the prompt-visible tail must still be what the planner saw.
        if let Some(expected) = run.debug.expected_last_message_id.clone() {
            let tail = self.messages.prompt_visible_tail(&conversation.id)?;
            if tail.as_ref().map(|m| m.id.as_str()) != Some(expected.as_str()) {
                info!(expected = %expected, "expected-last-message guard fired");
                let finalized = self.runs.finalize(
                    &run.id,
                    RunStatus::Skipped,
                    Some(RunError::new(
                        "expected_last_message_mismatch",
                        "the timeline moved between planning and claim",
                    )),
                    Utc::now(),
                )?;
                self.publisher.publish_ephemeral(
                    &conversation.id,
                    rev,
                    EphemeralEvent::RunSkipped {
                        run_id: run.id.clone(),
                        reason: "message_mismatch".into(),
                    },
                );
                self.on_run_terminal(&finalized)?;
                return Ok(());
            }
        }

        // Guard: token budget — no LLM call when the space is out of budget.
        let used = space.prompt_tokens_total + space.completion_tokens_total;
        let limit = match (space.token_limit, self.config.global_token_limit) {
            (Some(s), Some(g)) => Some(s.min(g)),
            (Some(s), None) => Some(s),
            (None, g) => g,
        };
        if let Some(limit) = limit {
            if used >= limit {
                warn!(limit, used, "token budget exhausted");
                let finalized = self.runs.finalize(
                    &run.id,
                    RunStatus::Failed,
                    Some(
                        RunError::new("token_limit_exceeded", "space token budget exhausted")
                            .with_details(serde_json::json!({ "limit": limit, "used": used })),
                    ),
                    Utc::now(),
                )?;
                self.publisher.publish_ephemeral(
                    &conversation.id,
                    rev,
                    EphemeralEvent::RunFailed {
                        run_id: run.id.clone(),
                        code: "token_limit_exceeded".into(),
                        message: "space token budget exhausted".into(),
                    },
                );
                self.on_run_terminal(&finalized)?;
                return Ok(());
            }
        }

        self.publisher.publish_ephemeral(
            &conversation.id,
            rev,
            EphemeralEvent::TypingStart {
                speaker_membership_id: speaker.id.clone(),
                display_name: speaker.display_name.clone(),
                avatar_url: speaker.avatar_url.clone(),
                bubble_class: speaker.bubble_class.clone(),
                is_user: speaker.kind == MembershipKind::Human,
            },
        );

        let participants = self.spaces.members(&space.id)?;
        let history = self.messages.history(&conversation.id, HISTORY_WINDOW)?;
        let prompt = self.assembler.assemble(&PromptInput {
            speaker: &speaker,
            history: &history,
            participants: &participants,
            card_handling: &space.card_handling,
        });
        for warning in &prompt.warnings {
            debug!(%warning, "prompt assembly warning");
        }

        let request = ChatRequest {
            model: self.model.clone(),
            messages: prompt.messages,
            sampling: SamplingParams::default(),
            stop_sequences: prompt.stop_sequences,
            stream: true,
            request_logprobs: false,
        };

        // Stream. Chunks fan out to the typing preview only; the database
        // sees nothing until commit.
        let (tx, mut rx) = mpsc::channel(64);
        let client = Arc::clone(&self.client);
        let handle = tokio::spawn(async move { client.stream_chat(&request, tx).await });

        let mut content = String::new();
        let mut usage = None;
        let mut transport_error: Option<ClientError> = None;
        let mut last_heartbeat = now;

        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Delta { text } => {
                    content.push_str(&text);
                    self.publisher.publish_ephemeral(
                        &conversation.id,
                        rev,
                        EphemeralEvent::StreamChunk {
                            run_id: run.id.clone(),
                            content: content.clone(),
                        },
                    );

                    let tick = Utc::now();
                    if (tick - last_heartbeat).num_milliseconds() >= HEARTBEAT_MIN_INTERVAL_MS as i64
                    {
                        self.runs.heartbeat(&run.id, tick)?;
                        last_heartbeat = tick;
                    }

                    if self.runs.cancel_requested(&run.id)? {
                        handle.abort();
                        return self.finish_canceled(&run, &conversation, &speaker, rev);
                    }
                }
                StreamEvent::Done {
                    content: full,
                    usage: u,
                } => {
                    content = full;
                    usage = u;
                }
                StreamEvent::Error { error } => {
                    transport_error = Some(error);
                }
            }
        }
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => transport_error = Some(e),
            Err(e) if e.is_cancelled() => {}
            Err(e) => transport_error = Some(ClientError::Provider(e.to_string())),
        }

        if let Some(error) = transport_error {
            return self.finish_failed(&run, &conversation, &speaker, rev, error);
        }

        // One more cancellation check: a request that landed after the last
        // chunk must still stop the commit.
        if self.runs.cancel_requested(&run.id)? {
            return self.finish_canceled(&run, &conversation, &speaker, rev);
        }

        if content.trim().is_empty() {
            return self.finish_failed(
                &run,
                &conversation,
                &speaker,
                rev,
                ClientError::Provider("provider returned an empty completion".into()),
            );
        }

        // Group trim: keep only the speaker's turn.
        let other_names: Vec<String> = participants
            .iter()
            .filter(|p| p.id != speaker.id && p.status == MemberStatus::Active)
            .map(|p| p.display_name.clone())
            .collect();
        let final_text = if space.relax_message_trim || other_names.is_empty() {
            content
        } else {
            trim_foreign_turns(&content, &speaker.display_name, &other_names)
        };

        // Commit: timeline row (or swipe), token counters, and the
        // succeeded finalize in one transaction.
        let (message, rev, replaced) = {
            let mut db = self.db.lock().unwrap();
            let tx = db.transaction().map_err(troupe_store::StoreError::from)?;

            // Re-verify ownership inside the transaction: a preempting claim
            // or the reaper may have failed this run since the last check,
            // and a dead-claimed worker must never commit a message.
            let current = troupe_runs::store::tx_get_run(&tx, &run.id)?;
            if current.status != RunStatus::Running || current.cancel_requested_at.is_some() {
                drop(tx);
                drop(db);
                if current.status.is_terminal() {
                    warn!(run = %run.id, status = %current.status, "run lost before commit");
                    self.teardown_typing(&conversation, &speaker, &run, rev);
                    self.on_run_terminal(&current)?;
                    return Ok(());
                }
                return self.finish_canceled(&run, &conversation, &speaker, rev);
            }

            let (message, replaced) = match run.kind {
                RunKind::Regenerate => {
                    let target_id = run.debug.target_message_id.clone().ok_or_else(|| {
                        EngineError::Internal(format!("regenerate run {} has no target", run.id))
                    })?;
                    tx_add_swipe(&tx, &target_id, &final_text, &run.id)?;
                    (get_message(&tx, &target_id)?, true)
                }
                _ => (
                    tx_insert_assistant_message(
                        &tx,
                        &conversation.id,
                        &speaker.id,
                        &final_text,
                        &run.id,
                    )?,
                    false,
                ),
            };

            if let Some(u) = usage {
                tx_bump_conversation_tokens(
                    &tx,
                    &conversation.id,
                    u.prompt_tokens as i64,
                    u.completion_tokens as i64,
                )?;
                tx_bump_space_tokens(
                    &tx,
                    &space.id,
                    u.prompt_tokens as i64,
                    u.completion_tokens as i64,
                )?;
            }

            tx_finalize(&tx, &run.id, RunStatus::Succeeded, None, Utc::now())?;
            let rev = tx_bump_revision(&tx, &conversation.id)?;
            tx.commit().map_err(troupe_store::StoreError::from)?;
            (message, rev, replaced)
        };

        info!(
            message = %message.id,
            seq = message.seq,
            tokens_out = usage.map(|u| u.completion_tokens).unwrap_or(0),
            "run committed"
        );

        let payload = message_payload(&message, &speaker);
        self.publisher.publish_persistent(
            &conversation.id,
            rev,
            if replaced {
                PersistentEvent::Replace {
                    dom_id: message.dom_id(),
                    message: payload,
                }
            } else {
                PersistentEvent::Append {
                    dom_id: message.dom_id(),
                    message: payload,
                }
            },
        );
        self.publisher.publish_ephemeral(
            &conversation.id,
            rev,
            EphemeralEvent::TypingStop {
                speaker_membership_id: speaker.id.clone(),
            },
        );
        self.publisher.publish_ephemeral(
            &conversation.id,
            rev,
            EphemeralEvent::StreamComplete {
                run_id: run.id.clone(),
            },
        );

        let finalized = self.runs.get(&run.id)?;
        self.on_run_terminal(&finalized)?;
        Ok(())
    }

    /// Finalize as canceled: no message, clean ephemeral teardown.
    fn finish_canceled(
        &self,
        run: &Run,
        conversation: &Conversation,
        speaker: &SpaceMembership,
        rev: i64,
    ) -> Result<()> {
        let finalized = self
            .runs
            .finalize(&run.id, RunStatus::Canceled, None, Utc::now())?;
        let reason = finalized
            .error
            .as_ref()
            .map(|e| e.code.clone())
            .unwrap_or_else(|| "user_cancel".into());
        info!(run = %run.id, %reason, "run canceled");

        self.publisher.publish_ephemeral(
            &conversation.id,
            rev,
            EphemeralEvent::RunCanceled {
                run_id: run.id.clone(),
                reason,
            },
        );
        self.teardown_typing(conversation, speaker, run, rev);
        self.on_run_terminal(&finalized)?;
        Ok(())
    }

    /// Finalize as failed after a transport error. Never auto-retried.
    fn finish_failed(
        &self,
        run: &Run,
        conversation: &Conversation,
        speaker: &SpaceMembership,
        rev: i64,
        error: ClientError,
    ) -> Result<()> {
        warn!(run = %run.id, %error, "generation failed");
        let run_error = RunError::new(error.code(), error.to_string());
        let finalized =
            self.runs
                .finalize(&run.id, RunStatus::Failed, Some(run_error), Utc::now())?;

        self.publisher.publish_ephemeral(
            &conversation.id,
            rev,
            EphemeralEvent::RunFailed {
                run_id: run.id.clone(),
                code: error.code().into(),
                message: error.to_string(),
            },
        );
        self.teardown_typing(conversation, speaker, run, rev);
        self.on_run_terminal(&finalized)?;
        Ok(())
    }

    fn teardown_typing(
        &self,
        conversation: &Conversation,
        speaker: &SpaceMembership,
        run: &Run,
        rev: i64,
    ) {
        self.publisher.publish_ephemeral(
            &conversation.id,
            rev,
            EphemeralEvent::TypingStop {
                speaker_membership_id: speaker.id.clone(),
            },
        );
        self.publisher.publish_ephemeral(
            &conversation.id,
            rev,
            EphemeralEvent::StreamComplete {
                run_id: run.id.clone(),
            },
        );
    }
}

/// The persistent-channel view of a committed message.
fn message_payload(message: &Message, speaker: &SpaceMembership) -> serde_json::Value {
    serde_json::json!({
        "id": message.id,
        "seq": message.seq,
        "role": message.role,
        "content": message.content,
        "author_membership_id": message.author_membership_id,
        "author_name": speaker.display_name,
        "swipe_count": message.swipe_count,
        "active_swipe_id": message.active_swipe_id,
        "run_id": message.run_id,
        "created_at": message.created_at,
    })
}
