//! `troupe-engine` — the conversation run scheduler.
//!
//! Decides who speaks next, executes streaming generations against that
//! decision, and recovers when workers die. All coordination happens through
//! the relational store: the engine keeps no authoritative in-memory state,
//! so any number of worker tasks (or processes sharing the database) can
//! cooperate.
//!
//! Component map:
//! - [`selector`] — pure speaker-selection strategies
//! - planner (`plan_*` methods) — triggers → at most one queued run
//! - executor ([`Scheduler::execute_run`]) — claim → stream → commit
//! - turn driver (`on_run_terminal`) — round cursor, auto-mode budget
//! - reaper / health — stale-run recovery and a pure health probe
//! - [`workers::WorkerPool`] — claims due runs, kick + poll

pub mod error;
pub mod executor;
pub mod health;
pub mod planner;
pub mod reaper;
pub mod selector;
pub mod trim;
pub mod turns;
pub mod workers;

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use troupe_core::SchedulerConfig;
use troupe_events::Publisher;
use troupe_llm::{ChatClient, PromptAssembler};
use troupe_runs::{RoundLedger, RunStore};
use troupe_store::db::Db;
use troupe_store::{ConversationStore, MessageStore, SpaceStore};

pub use error::{EngineError, Result};
pub use health::{HealthAction, HealthReport, HealthStatus};
pub use planner::CopilotPhase;
pub use reaper::ReapReport;
pub use selector::{ClockDice, Dice, ScriptedDice, SelectorInput};
pub use workers::WorkerPool;

/// How much history the prompt window and the selector look at.
pub(crate) const HISTORY_WINDOW: usize = 40;

/// Shared context for every scheduling component.
///
/// Deliberately holds no scheduling state of its own — the single source of
/// truth is the database. `kick` is only a latency optimisation: a worker
/// woken by it still has to win `claim_atomic`.
pub struct Scheduler {
    pub(crate) db: Db,
    pub spaces: SpaceStore,
    pub conversations: ConversationStore,
    pub messages: MessageStore,
    pub runs: RunStore,
    pub rounds: RoundLedger,
    pub publisher: Arc<Publisher>,
    pub(crate) client: Arc<dyn ChatClient>,
    pub(crate) assembler: Arc<dyn PromptAssembler>,
    pub config: SchedulerConfig,
    /// Model id stamped on outgoing chat requests.
    pub(crate) model: String,
    pub(crate) dice: Mutex<Box<dyn Dice + Send>>,
    kick: Notify,
}

impl Scheduler {
    pub fn new(
        db: Db,
        config: SchedulerConfig,
        model: impl Into<String>,
        client: Arc<dyn ChatClient>,
        assembler: Arc<dyn PromptAssembler>,
        publisher: Arc<Publisher>,
    ) -> Result<Arc<Self>> {
        {
            let conn = db.lock().unwrap();
            troupe_store::init_db(&conn)?;
            troupe_runs::db::init_db(&conn)?;
        }
        let stuck = config.stuck_threshold_secs;
        Ok(Arc::new(Self {
            spaces: SpaceStore::new(db.clone()),
            conversations: ConversationStore::new(db.clone()),
            messages: MessageStore::new(db.clone()),
            runs: RunStore::new(db.clone(), stuck),
            rounds: RoundLedger::new(db.clone()),
            publisher,
            client,
            assembler,
            config,
            model: model.into(),
            dice: Mutex::new(Box::new(ClockDice::new())),
            db,
            kick: Notify::new(),
        }))
    }

    /// Swap the dice — tests script the natural strategy's draws with this.
    pub fn set_dice(&self, dice: Box<dyn Dice + Send>) {
        *self.dice.lock().unwrap() = dice;
    }

    /// Nudge the worker pool: a queued run may be claimable now.
    pub fn kick_workers(&self) {
        self.kick.notify_waiters();
    }

    /// Await the next kick.
    pub(crate) async fn kicked(&self) {
        self.kick.notified().await;
    }
}
