//! `troupe-runs` — the run state machine and the round ledger.
//!
//! # Overview
//!
//! Every generation attempt is a `conversation_runs` row created in `queued`,
//! claimed atomically into `running`, and finalized exactly once into one of
//! four absorbing terminal states. Two partial unique indexes make the
//! single-slot invariants (at most one running, at most one queued run per
//! conversation) hold at the database level, whatever the workers do.
//!
//! | Status      | Meaning                                            |
//! |-------------|----------------------------------------------------|
//! | `queued`    | Planned; waiting for a worker and `run_after`      |
//! | `running`   | Claimed by a worker; heartbeating                  |
//! | `succeeded` | Committed a message (or swipe)                     |
//! | `failed`    | Errored; structured `{code, message, details}` set |
//! | `canceled`  | Cooperatively stopped; no message emitted          |
//! | `skipped`   | Preconditions no longer held at claim time         |
//!
//! Rounds record the ordered speaker queue for one traversal of the eligible
//! AI participants; the turn scheduler in `troupe-engine` drives the cursor.

pub mod db;
pub mod error;
pub mod rounds;
pub mod store;
pub mod types;

pub use error::{Result, RunStoreError};
pub use rounds::RoundLedger;
pub use store::{NewRun, RunStore};
pub use types::{
    ClaimOutcome, CreateOutcome, Round, RoundSlot, RoundStatus, Run, RunDebug, RunError, RunKind,
    RunStatus, SlotStatus,
};
