//! End-to-end scheduler scenarios against an in-memory store and a scripted
//! LLM transport.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;

use troupe_core::SchedulerConfig;
use troupe_engine::{ScriptedDice, Scheduler, WorkerPool};
use troupe_events::{EphemeralEnvelope, Publisher};
use troupe_llm::{ScriptedClient, ScriptedReply, TranscriptAssembler};
use troupe_runs::{ClaimOutcome, RunStatus};
use troupe_store::{
    CopilotMode, NewMembership, NewSpace, ReplyOrder, Role, SchedulingState, Space,
};

struct Harness {
    scheduler: Arc<Scheduler>,
    client: Arc<ScriptedClient>,
    space: Space,
    conversation_id: String,
    member_ids: Vec<String>,
}

fn harness(new_space: NewSpace, character_names: &[&str], replies: Vec<ScriptedReply>) -> Harness {
    harness_with(new_space, character_names, replies, Duration::ZERO)
}

fn harness_with(
    new_space: NewSpace,
    character_names: &[&str],
    replies: Vec<ScriptedReply>,
    chunk_delay: Duration,
) -> Harness {
    let conn = Connection::open_in_memory().expect("in-memory sqlite");
    let db = troupe_store::shared(conn);
    let publisher = Arc::new(Publisher::new());
    let client = Arc::new(ScriptedClient::new(replies).with_chunk_delay(chunk_delay));
    let scheduler = Scheduler::new(
        db,
        SchedulerConfig::default(),
        "test-model",
        client.clone(),
        Arc::new(TranscriptAssembler),
        publisher,
    )
    .expect("scheduler");

    let space = scheduler.spaces.create(new_space).expect("space");
    let mut member_ids = Vec::new();
    for (position, name) in character_names.iter().enumerate() {
        let member = scheduler
            .spaces
            .add_member(&space.id, NewMembership::character(name, position as i64))
            .expect("member");
        member_ids.push(member.id);
    }
    let conversation = scheduler.conversations.create(&space.id).expect("conversation");

    Harness {
        scheduler,
        client,
        space,
        conversation_id: conversation.id,
        member_ids,
    }
}

impl Harness {
    /// Claim-and-execute queued runs until the conversation settles.
    async fn drain(&self) {
        for _ in 0..64 {
            let Some(run) = self
                .scheduler
                .runs
                .due_queued(Utc::now(), 1)
                .unwrap()
                .into_iter()
                .next()
            else {
                return;
            };
            self.scheduler.execute_run(&run.id).await.unwrap();
        }
        panic!("conversation did not settle within 64 runs");
    }

    fn assistant_contents(&self) -> Vec<String> {
        self.scheduler
            .messages
            .history(&self.conversation_id, 100)
            .unwrap()
            .into_iter()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content)
            .collect()
    }

    fn assert_single_slot_invariants(&self) {
        let runs = self
            .scheduler
            .runs
            .runs_for_conversation(&self.conversation_id)
            .unwrap();
        let running = runs.iter().filter(|r| r.status == RunStatus::Running).count();
        let queued = runs.iter().filter(|r| r.status == RunStatus::Queued).count();
        assert!(running <= 1, "more than one running run");
        assert!(queued <= 1, "more than one queued run");
    }
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<EphemeralEnvelope>) -> Vec<serde_json::Value> {
    let mut events = Vec::new();
    while let Ok(env) = rx.try_recv() {
        events.push(serde_json::to_value(&env).unwrap());
    }
    events
}

// --- scenario 1: concurrent claim -----------------------------------------

#[tokio::test]
async fn concurrent_claim_commits_exactly_one_message() {
    let h = harness(
        NewSpace {
            reply_order: ReplyOrder::List,
            ..NewSpace::default()
        },
        &["Alice"],
        vec![ScriptedReply::text("The door creaks open.")],
    );

    let user = h
        .scheduler
        .messages
        .commit_user_message(&h.conversation_id, None, "Someone's at the door.")
        .unwrap();
    let run = h.scheduler.plan_user_message(&user).unwrap().expect("queued run");

    let (a, b) = tokio::join!(
        h.scheduler.execute_run(&run.id),
        h.scheduler.execute_run(&run.id),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(h.assistant_contents(), vec!["The door creaks open."]);
    assert_eq!(
        h.scheduler.runs.get(&run.id).unwrap().status,
        RunStatus::Succeeded
    );
    h.assert_single_slot_invariants();
}

// --- scenario 2: restart policy mid-stream --------------------------------

#[tokio::test]
async fn restart_policy_cancels_midstream_and_requeues() {
    let h = harness_with(
        NewSpace {
            reply_order: ReplyOrder::Natural,
            input_policy: troupe_store::InputPolicy::Restart,
            ..NewSpace::default()
        },
        &["Alice"],
        vec![
            ScriptedReply::streamed(
                "Hello and welcome to a very long answer that keeps streaming on and on",
            ),
            ScriptedReply::text("Let me answer your second question instead."),
        ],
        Duration::from_millis(20),
    );
    // Natural strategy: every talkativeness draw passes, first pick wins.
    h.scheduler.set_dice(Box::new(ScriptedDice::new(vec![0.0; 32])));

    let first = h
        .scheduler
        .messages
        .commit_user_message(&h.conversation_id, None, "First question?")
        .unwrap();
    let run1 = h.scheduler.plan_user_message(&first).unwrap().expect("run");

    let scheduler = Arc::clone(&h.scheduler);
    let run1_id = run1.id.clone();
    let streaming = tokio::spawn(async move { scheduler.execute_run(&run1_id).await });

    // Let the stream produce a few chunks, then interrupt with new input.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let second = h
        .scheduler
        .messages
        .commit_user_message(&h.conversation_id, None, "Second question?")
        .unwrap();
    let run2 = h.scheduler.plan_user_message(&second).unwrap().expect("run");
    streaming.await.unwrap().unwrap();

    let run1 = h.scheduler.runs.get(&run1.id).unwrap();
    assert_eq!(run1.status, RunStatus::Canceled);
    assert_eq!(run1.error.unwrap().code, "restart_policy");
    assert_eq!(run2.debug.trigger.as_deref(), Some("user_message"));

    h.drain().await;

    // The canceled generation left nothing behind; only the new one landed.
    let contents = h.assistant_contents();
    assert_eq!(contents, vec!["Let me answer your second question instead."]);
    h.assert_single_slot_invariants();
}

// --- scenario 3: expected-last-message guard -------------------------------

#[tokio::test]
async fn regenerate_is_skipped_when_the_tail_moves() {
    let h = harness(
        NewSpace {
            reply_order: ReplyOrder::List,
            ..NewSpace::default()
        },
        &["Alice"],
        vec![ScriptedReply::text("Original answer.")],
    );

    let user = h
        .scheduler
        .messages
        .commit_user_message(&h.conversation_id, None, "Question.")
        .unwrap();
    let run = h.scheduler.plan_user_message(&user).unwrap().unwrap();
    h.scheduler.execute_run(&run.id).await.unwrap();

    let target = h
        .scheduler
        .messages
        .prompt_visible_tail(&h.conversation_id)
        .unwrap()
        .unwrap();
    assert_eq!(target.role, Role::Assistant);

    let regen = h.scheduler.plan_regenerate(&target.id).unwrap();
    let mut events = h.scheduler.publisher.subscribe_ephemeral(&h.conversation_id);

    // The timeline moves before any worker claims the regenerate.
    h.scheduler
        .messages
        .commit_user_message(&h.conversation_id, None, "Wait, one more thing.")
        .unwrap();

    h.scheduler.execute_run(&regen.id).await.unwrap();

    let regen = h.scheduler.runs.get(&regen.id).unwrap();
    assert_eq!(regen.status, RunStatus::Skipped);
    assert_eq!(regen.error.unwrap().code, "expected_last_message_mismatch");

    // The target is untouched: still one swipe, same content.
    let target = h.scheduler.messages.get(&target.id).unwrap();
    assert_eq!(target.swipe_count, 1);
    assert_eq!(target.content, "Original answer.");

    let skipped: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter(|e| e["type"] == "run_skipped")
        .collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0]["reason"], "message_mismatch");
}

#[tokio::test]
async fn regenerate_adds_a_swipe_when_the_tail_holds() {
    let h = harness(
        NewSpace {
            reply_order: ReplyOrder::List,
            ..NewSpace::default()
        },
        &["Alice"],
        vec![
            ScriptedReply::text("Take one."),
            ScriptedReply::text("Take two."),
        ],
    );

    let user = h
        .scheduler
        .messages
        .commit_user_message(&h.conversation_id, None, "Go.")
        .unwrap();
    let run = h.scheduler.plan_user_message(&user).unwrap().unwrap();
    h.scheduler.execute_run(&run.id).await.unwrap();

    let target = h
        .scheduler
        .messages
        .prompt_visible_tail(&h.conversation_id)
        .unwrap()
        .unwrap();
    let regen = h.scheduler.plan_regenerate(&target.id).unwrap();
    h.scheduler.execute_run(&regen.id).await.unwrap();

    let target = h.scheduler.messages.get(&target.id).unwrap();
    assert_eq!(target.swipe_count, 2);
    assert_eq!(target.content, "Take two.");
    // Still a single timeline row.
    assert_eq!(h.assistant_contents().len(), 1);
}

// --- scenario 4: pooled exhaustion stops auto-mode -------------------------

#[tokio::test]
async fn pooled_exhaustion_halts_auto_mode_without_spending_budget() {
    let h = harness(
        NewSpace {
            reply_order: ReplyOrder::Pooled,
            ..NewSpace::default()
        },
        &["Alice", "Bob", "Cleo"],
        vec![
            ScriptedReply::text("Alice speaks."),
            ScriptedReply::text("Bob speaks."),
            ScriptedReply::text("Cleo speaks."),
        ],
    );
    h.scheduler.set_auto_mode(&h.space.id, true, 2).unwrap();
    h.scheduler.set_dice(Box::new(ScriptedDice::new(vec![0.0; 32])));

    let mut events = h.scheduler.publisher.subscribe_ephemeral(&h.conversation_id);
    let user = h
        .scheduler
        .messages
        .commit_user_message(&h.conversation_id, None, "Everyone, report in.")
        .unwrap();
    h.scheduler.plan_user_message(&user).unwrap().unwrap();
    h.drain().await;

    // One full round: every AI spoke exactly once.
    assert_eq!(h.assistant_contents().len(), 3);

    let space = h.scheduler.spaces.get(&h.space.id).unwrap();
    assert!(!space.auto_mode_enabled, "pool drain terminates auto-mode");
    // Budget spent for the completed round only, not the unstarted one.
    assert_eq!(space.auto_rounds_remaining, 1);

    let conversation = h.scheduler.conversations.get(&h.conversation_id).unwrap();
    assert_eq!(conversation.scheduling_state, SchedulingState::Idle);

    let events = drain_events(&mut events);
    assert!(events.iter().any(|e| e["type"] == "auto_disabled"));
    h.assert_single_slot_invariants();
}

// --- scenario 5: stale running run preempted -------------------------------

#[tokio::test]
async fn stale_running_run_is_preempted_by_the_next_claim() {
    let h = harness(
        NewSpace {
            reply_order: ReplyOrder::List,
            ..NewSpace::default()
        },
        &["Alice"],
        vec![ScriptedReply::text("Back from the dead.")],
    );

    // Run A: claimed three minutes ago, worker presumed dead.
    let run_a = h
        .scheduler
        .plan_force_talk(&h.conversation_id, &h.member_ids[0])
        .unwrap();
    let three_min_ago = Utc::now() - chrono::Duration::seconds(180);
    let ClaimOutcome::Claimed(_) = h.scheduler.runs.claim_atomic(&run_a.id, three_min_ago).unwrap()
    else {
        panic!("expected claim");
    };

    // Run B lands in the queued slot and a live worker picks it up.
    let run_b = h
        .scheduler
        .plan_force_talk(&h.conversation_id, &h.member_ids[0])
        .unwrap();
    h.scheduler.execute_run(&run_b.id).await.unwrap();

    let run_a = h.scheduler.runs.get(&run_a.id).unwrap();
    assert_eq!(run_a.status, RunStatus::Failed);
    assert_eq!(run_a.error.unwrap().code, "stale_running_run");
    assert!(run_a.cancel_requested_at.is_some());

    let run_b = h.scheduler.runs.get(&run_b.id).unwrap();
    assert_eq!(run_b.status, RunStatus::Succeeded);
    assert_eq!(h.assistant_contents(), vec!["Back from the dead."]);
    h.assert_single_slot_invariants();
}

// --- scenario 6: copilot exhaustion ----------------------------------------

#[tokio::test]
async fn copilot_exhaustion_disables_copilot_but_not_auto_mode() {
    let h = harness(
        NewSpace {
            reply_order: ReplyOrder::List,
            ..NewSpace::default()
        },
        &[],
        vec![
            ScriptedReply::text("Sam's copilot turn."),
            ScriptedReply::text("Alice round one."),
            ScriptedReply::text("Bob round one."),
            ScriptedReply::text("Alice round two."),
            ScriptedReply::text("Bob round three."),
        ],
    );
    let sam = h
        .scheduler
        .spaces
        .add_member(&h.space.id, NewMembership::human("Sam", 0))
        .unwrap();
    let _alice = h
        .scheduler
        .spaces
        .add_member(&h.space.id, NewMembership::character("Alice", 1))
        .unwrap();
    let _bob = h
        .scheduler
        .spaces
        .add_member(&h.space.id, NewMembership::character("Bob", 2))
        .unwrap();

    // Auto-mode first (enabling demotes copilots), then arm Sam's copilot.
    h.scheduler.set_auto_mode(&h.space.id, true, 3).unwrap();
    h.scheduler
        .spaces
        .set_copilot(&sam.id, CopilotMode::Full, 1)
        .unwrap();

    let mut events = h.scheduler.publisher.subscribe_ephemeral(&h.conversation_id);
    let user = h
        .scheduler
        .messages
        .commit_user_message(&h.conversation_id, None, "Carry on without me.")
        .unwrap();
    h.scheduler.plan_user_message(&user).unwrap().unwrap();
    h.drain().await;

    let sam = h.scheduler.spaces.member(&sam.id).unwrap();
    assert_eq!(sam.copilot_mode, CopilotMode::None);
    assert_eq!(sam.copilot_remaining_steps, 0);

    let space = h.scheduler.spaces.get(&h.space.id).unwrap();
    assert!(space.auto_mode_enabled, "auto-mode survives copilot exhaustion");
    assert_eq!(space.auto_rounds_remaining, 0, "all three rounds ran");

    let events = drain_events(&mut events);
    assert!(
        !events.iter().any(|e| e["type"] == "auto_disabled"),
        "copilot exhaustion must not disable auto-mode"
    );
    assert!(events
        .iter()
        .any(|e| e["type"] == "auto_steps_updated" && e["remaining_steps"] == 0));

    // Sam spoke once; the AI cast carried the remaining rounds.
    let contents = h.assistant_contents();
    assert_eq!(contents[0], "Sam's copilot turn.");
    assert_eq!(contents.len(), 5);
    h.assert_single_slot_invariants();
}

// --- idempotence ------------------------------------------------------------

#[tokio::test]
async fn planning_the_same_message_twice_keeps_one_queued_run() {
    let h = harness(
        NewSpace {
            reply_order: ReplyOrder::List,
            ..NewSpace::default()
        },
        &["Alice"],
        vec![],
    );
    let user = h
        .scheduler
        .messages
        .commit_user_message(&h.conversation_id, None, "Hello?")
        .unwrap();
    let first = h.scheduler.plan_user_message(&user).unwrap().unwrap();
    let second = h.scheduler.plan_user_message(&user).unwrap().unwrap();

    assert_eq!(first.id, second.id, "the queued slot is overwritten, not duplicated");
    let runs = h
        .scheduler
        .runs
        .runs_for_conversation(&h.conversation_id)
        .unwrap();
    assert_eq!(runs.len(), 1);
}

#[tokio::test]
async fn turn_complete_callback_is_idempotent() {
    let h = harness(
        NewSpace {
            reply_order: ReplyOrder::List,
            ..NewSpace::default()
        },
        &["Alice"],
        vec![ScriptedReply::text("Once.")],
    );
    let user = h
        .scheduler
        .messages
        .commit_user_message(&h.conversation_id, None, "Say it once.")
        .unwrap();
    let run = h.scheduler.plan_user_message(&user).unwrap().unwrap();
    h.scheduler.execute_run(&run.id).await.unwrap();
    h.drain().await;

    let before = h.scheduler.conversations.get(&h.conversation_id).unwrap();
    let finalized = h.scheduler.runs.get(&run.id).unwrap();
    h.scheduler.on_run_terminal(&finalized).unwrap();
    let after = h.scheduler.conversations.get(&h.conversation_id).unwrap();

    assert_eq!(before.scheduling_state, after.scheduling_state);
    assert_eq!(h.assistant_contents(), vec!["Once."]);
    let space = h.scheduler.spaces.get(&h.space.id).unwrap();
    assert_eq!(space.auto_rounds_remaining, 0);
}

// --- transport failure ------------------------------------------------------

#[tokio::test]
async fn transport_failure_marks_conversation_failed_and_health_suggests_retry() {
    let h = harness(
        NewSpace {
            reply_order: ReplyOrder::List,
            ..NewSpace::default()
        },
        &["Alice"],
        vec![ScriptedReply::FailEarly(troupe_llm::ClientError::Http {
            status: 500,
            message: "upstream exploded".into(),
        })],
    );
    let user = h
        .scheduler
        .messages
        .commit_user_message(&h.conversation_id, None, "Anyone there?")
        .unwrap();
    let run = h.scheduler.plan_user_message(&user).unwrap().unwrap();
    h.scheduler.execute_run(&run.id).await.unwrap();

    let run = h.scheduler.runs.get(&run.id).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_ref().unwrap().code, "http_error");
    assert!(h.assistant_contents().is_empty(), "no partial message");

    let conversation = h.scheduler.conversations.get(&h.conversation_id).unwrap();
    assert_eq!(conversation.scheduling_state, SchedulingState::Failed);

    let report = h.scheduler.health_check(&h.conversation_id, Utc::now()).unwrap();
    assert_eq!(report.status, troupe_engine::HealthStatus::Failed);
    assert_eq!(
        report.action,
        Some(troupe_engine::HealthAction::Retry { run_id: run.id.clone() })
    );

    // retry_failed_run queues a fresh attempt; the pool can pick it up.
    h.client.push(ScriptedReply::text("Recovered."));
    let retry = h.scheduler.retry_failed_run(&run.id).unwrap();
    h.scheduler.execute_run(&retry.id).await.unwrap();
    assert_eq!(h.assistant_contents(), vec!["Recovered."]);
}

// --- reaper -----------------------------------------------------------------

#[tokio::test]
async fn reaper_fails_stale_runs_and_marks_the_conversation() {
    let h = harness(
        NewSpace {
            reply_order: ReplyOrder::List,
            ..NewSpace::default()
        },
        &["Alice"],
        vec![],
    );
    let run = h
        .scheduler
        .plan_force_talk(&h.conversation_id, &h.member_ids[0])
        .unwrap();
    let long_ago = Utc::now() - chrono::Duration::seconds(600);
    let ClaimOutcome::Claimed(_) = h.scheduler.runs.claim_atomic(&run.id, long_ago).unwrap() else {
        panic!("expected claim");
    };

    let report = h.scheduler.reap_stale(Utc::now()).unwrap();
    assert_eq!(report.failed_running, vec![run.id.clone()]);
    assert_eq!(report.marked_failed, vec![h.conversation_id.clone()]);

    let run = h.scheduler.runs.get(&run.id).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.unwrap().code, "heartbeat_timeout");

    let conversation = h.scheduler.conversations.get(&h.conversation_id).unwrap();
    assert_eq!(conversation.scheduling_state, SchedulingState::Failed);

    // Sweeping again is a no-op.
    let report = h.scheduler.reap_stale(Utc::now()).unwrap();
    assert!(report.is_empty());
}

// --- worker pool ------------------------------------------------------------

#[tokio::test]
async fn worker_pool_drives_a_planned_run_to_commit() {
    let h = harness(
        NewSpace {
            reply_order: ReplyOrder::List,
            ..NewSpace::default()
        },
        &["Alice"],
        vec![ScriptedReply::text("Driven by the pool.")],
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let pool = WorkerPool::new(Arc::clone(&h.scheduler));
    let pool_task = tokio::spawn(pool.run(shutdown_rx));

    let user = h
        .scheduler
        .messages
        .commit_user_message(&h.conversation_id, None, "Pool test.")
        .unwrap();
    h.scheduler.plan_user_message(&user).unwrap().unwrap();

    // Wait for the commit to land.
    let mut settled = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if !h.assistant_contents().is_empty() {
            settled = true;
            break;
        }
    }
    let _ = shutdown_tx.send(true);
    let _ = pool_task.await;

    assert!(settled, "worker pool never committed the run");
    assert_eq!(h.assistant_contents(), vec!["Driven by the pool."]);
}
