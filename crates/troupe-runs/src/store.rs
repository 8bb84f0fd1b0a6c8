use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tracing::{info, instrument, warn};

use troupe_core::ids::{new_id, now_rfc3339};
use troupe_store::db::Db;

use crate::error::{Result, RunStoreError};
use crate::types::{ClaimOutcome, CreateOutcome, Run, RunDebug, RunError, RunKind, RunStatus};

/// Creation parameters for a queued run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub conversation_id: String,
    pub kind: RunKind,
    pub reason: String,
    pub speaker_membership_id: String,
    pub run_after: Option<DateTime<Utc>>,
    pub round_id: Option<String>,
    pub debug: RunDebug,
}

/// Durable record of every generation attempt.
///
/// The store never raises for expected races: a lost claim comes back as
/// [`ClaimOutcome::NotClaimable`], an occupied queue slot as
/// [`CreateOutcome::Conflict`]. The partial unique indexes in `db.rs` back
/// the single-slot invariants even against bugs here.
pub struct RunStore {
    db: Db,
    /// A running run whose heartbeat is older than this is preemptable.
    stuck_threshold: Duration,
}

impl RunStore {
    pub fn new(db: Db, stuck_threshold_secs: u64) -> Self {
        Self {
            db,
            stuck_threshold: Duration::seconds(stuck_threshold_secs as i64),
        }
    }

    /// Insert a queued run, failing with `Conflict` when the slot is taken.
    #[instrument(skip(self, new), fields(conversation = %new.conversation_id, kind = %new.kind))]
    pub fn create_queued(&self, new: NewRun) -> Result<CreateOutcome> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        if tx_queued_run(&tx, &new.conversation_id)?.is_some() {
            return Ok(CreateOutcome::Conflict);
        }
        let run = tx_insert_queued(&tx, &new)?;
        tx.commit()?;
        Ok(CreateOutcome::Created(run))
    }

    /// Single-slot upsert: overwrite the existing queued run (last writer
    /// wins) or insert a fresh one.
    pub fn upsert_queued(&self, new: NewRun) -> Result<Run> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let run = tx_upsert_queued(&tx, &new)?;
        tx.commit()?;
        Ok(run)
    }

    /// Atomically claim a queued run for execution.
    ///
    /// The claim succeeds only while the run is still `queued` and its
    /// `run_after` has elapsed; a second concurrent caller observes zero
    /// affected rows and gets `NotClaimable`.
    ///
    /// A *stale* running run on the same conversation (heartbeat older than
    /// the stuck threshold) is finalized as `failed(stale_running_run)` and
    /// cancel-stamped in the same transaction, so a still-alive worker bails
    /// out at its next cancellation check. A healthy running run blocks the
    /// claim instead.
    #[instrument(skip(self), fields(run = %run_id))]
    pub fn claim_atomic(&self, run_id: &str, now: DateTime<Utc>) -> Result<ClaimOutcome> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let run = tx_get_run(&tx, run_id)?;
        if let Some(running) = tx_running_run(&tx, &run.conversation_id)? {
            let stale = running
                .heartbeat_age_secs(now)
                .is_none_or(|age| age > self.stuck_threshold.num_seconds());
            if !stale {
                return Ok(ClaimOutcome::NotClaimable);
            }
            warn!(stale_run = %running.id, "preempting stale running run");
            tx_force_fail(
                &tx,
                &running.id,
                RunError::new("stale_running_run", "preempted by a newer claim"),
                now,
            )?;
        }

        let now_str = now.to_rfc3339();
        let n = tx.execute(
            "UPDATE conversation_runs
             SET status = 'running', started_at = ?2, heartbeat_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'queued'
               AND (run_after IS NULL OR run_after <= ?2)",
            rusqlite::params![run_id, now_str],
        )?;
        if n == 0 {
            // Drop the transaction (rollback) so a failed claim leaves no trace.
            return Ok(ClaimOutcome::NotClaimable);
        }

        let claimed = tx_get_run(&tx, run_id)?;
        tx.commit()?;
        Ok(ClaimOutcome::Claimed(claimed))
    }

    /// Request cooperative cancellation. Non-destructive and sticky: only
    /// sets `cancel_requested_at`; the executing worker observes it and
    /// finalizes as `canceled`.
    pub fn request_cancel(&self, run_id: &str, now: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock().unwrap();
        tx_request_cancel(&db, run_id, now)
    }

    /// Whether cancellation has been requested — checked at chunk boundaries.
    pub fn cancel_requested(&self, run_id: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let flagged: bool = db
            .query_row(
                "SELECT cancel_requested_at IS NOT NULL FROM conversation_runs WHERE id = ?1",
                [run_id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => RunStoreError::RunNotFound {
                    id: run_id.to_string(),
                },
                other => RunStoreError::Database(other),
            })?;
        Ok(flagged)
    }

    /// Record liveness on a running run.
    pub fn heartbeat(&self, run_id: &str, now: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE conversation_runs SET heartbeat_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'running'",
            rusqlite::params![run_id, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Drive a run to a terminal status.
    ///
    /// Finalizing an already-terminal run is a no-op returning the stored
    /// row (terminal states are absorbing), so retries and double callbacks
    /// are safe. Any other disallowed edge is an error.
    #[instrument(skip(self, error), fields(run = %run_id, to = %status))]
    pub fn finalize(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<RunError>,
        now: DateTime<Utc>,
    ) -> Result<Run> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let run = tx_finalize(&tx, run_id, status, error, now)?;
        tx.commit()?;
        Ok(run)
    }

    pub fn get(&self, run_id: &str) -> Result<Run> {
        let db = self.db.lock().unwrap();
        tx_get_run(&db, run_id)
    }

    pub fn queued_run(&self, conversation_id: &str) -> Result<Option<Run>> {
        let db = self.db.lock().unwrap();
        tx_queued_run(&db, conversation_id)
    }

    pub fn running_run(&self, conversation_id: &str) -> Result<Option<Run>> {
        let db = self.db.lock().unwrap();
        tx_running_run(&db, conversation_id)
    }

    /// Queued runs whose `run_after` has elapsed, oldest first — the worker
    /// pool's polling query.
    pub fn due_queued(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Run>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM conversation_runs
             WHERE status = 'queued' AND (run_after IS NULL OR run_after <= ?1)
             ORDER BY created_at
             LIMIT ?2",
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![now.to_rfc3339(), limit as i64],
            row_to_run,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Running runs whose heartbeat predates `now - stuck_threshold`.
    pub fn stale_running(&self, now: DateTime<Utc>) -> Result<Vec<Run>> {
        let cutoff = (now - self.stuck_threshold).to_rfc3339();
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM conversation_runs
             WHERE status = 'running'
               AND COALESCE(heartbeat_at, started_at, created_at) < ?1",
        ))?;
        let rows = stmt.query_map([cutoff], row_to_run)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Queued runs that have sat unclaimed past the stuck threshold even
    /// though they were due.
    pub fn stale_queued(&self, now: DateTime<Utc>) -> Result<Vec<Run>> {
        let cutoff = (now - self.stuck_threshold).to_rfc3339();
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM conversation_runs
             WHERE status = 'queued'
               AND updated_at < ?1
               AND (run_after IS NULL OR run_after < ?1)",
        ))?;
        let rows = stmt.query_map([cutoff], row_to_run)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Most recent terminal run for a conversation, if any.
    pub fn latest_terminal(&self, conversation_id: &str) -> Result<Option<Run>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!(
                "SELECT {RUN_COLUMNS} FROM conversation_runs
                 WHERE conversation_id = ?1
                   AND status IN ('succeeded','failed','canceled','skipped')
                 ORDER BY finished_at DESC
                 LIMIT 1"
            ),
            [conversation_id],
            row_to_run,
        ) {
            Ok(r) => Ok(Some(r)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(RunStoreError::Database(e)),
        }
    }

    pub fn runs_for_conversation(&self, conversation_id: &str) -> Result<Vec<Run>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM conversation_runs
             WHERE conversation_id = ?1 ORDER BY created_at",
        ))?;
        let rows = stmt.query_map([conversation_id], row_to_run)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

// ---------------------------------------------------------------------------
// Transaction-level helpers (compose inside a caller-owned transaction)
// ---------------------------------------------------------------------------

const RUN_COLUMNS: &str = "id, conversation_id, kind, status, reason, speaker_membership_id, \
     round_id, run_after, started_at, finished_at, heartbeat_at, cancel_requested_at, \
     error, debug, created_at, updated_at";

pub fn tx_insert_queued(conn: &Connection, new: &NewRun) -> Result<Run> {
    let id = new_id();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO conversation_runs
         (id, conversation_id, kind, status, reason, speaker_membership_id,
          round_id, run_after, debug, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'queued', ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        rusqlite::params![
            id,
            new.conversation_id,
            new.kind.as_str(),
            new.reason,
            new.speaker_membership_id,
            new.round_id,
            new.run_after.map(|t| t.to_rfc3339()),
            serde_json::to_string(&new.debug)?,
            now,
        ],
    )?;
    tx_get_run(conn, &id)
}

/// Overwrite the conversation's queued slot or insert a fresh row.
pub fn tx_upsert_queued(conn: &Connection, new: &NewRun) -> Result<Run> {
    if let Some(existing) = tx_queued_run(conn, &new.conversation_id)? {
        conn.execute(
            "UPDATE conversation_runs
             SET kind = ?1, reason = ?2, speaker_membership_id = ?3,
                 run_after = ?4, round_id = ?5, debug = ?6, updated_at = ?7
             WHERE id = ?8 AND status = 'queued'",
            rusqlite::params![
                new.kind.as_str(),
                new.reason,
                new.speaker_membership_id,
                new.run_after.map(|t| t.to_rfc3339()),
                new.round_id,
                serde_json::to_string(&new.debug)?,
                now_rfc3339(),
                existing.id,
            ],
        )?;
        info!(run = %existing.id, "queued slot overwritten");
        return tx_get_run(conn, &existing.id);
    }
    tx_insert_queued(conn, new)
}

pub fn tx_get_run(conn: &Connection, run_id: &str) -> Result<Run> {
    conn.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM conversation_runs WHERE id = ?1"),
        [run_id],
        row_to_run,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => RunStoreError::RunNotFound {
            id: run_id.to_string(),
        },
        other => RunStoreError::Database(other),
    })
}

pub fn tx_queued_run(conn: &Connection, conversation_id: &str) -> Result<Option<Run>> {
    one_by_status(conn, conversation_id, "queued")
}

pub fn tx_running_run(conn: &Connection, conversation_id: &str) -> Result<Option<Run>> {
    one_by_status(conn, conversation_id, "running")
}

/// Sticky cancellation: first request wins, later ones are no-ops.
pub fn tx_request_cancel(conn: &Connection, run_id: &str, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE conversation_runs SET cancel_requested_at = ?2, updated_at = ?2
         WHERE id = ?1 AND cancel_requested_at IS NULL
           AND status IN ('queued', 'running')",
        rusqlite::params![run_id, now.to_rfc3339()],
    )?;
    Ok(())
}

/// Record why a cancellation was requested, without touching the status.
///
/// The executor finalizes canceled runs with no error of its own, so the
/// stamp left here survives into the terminal row. First stamp wins.
pub fn tx_stamp_cancel_reason(conn: &Connection, run_id: &str, code: &str) -> Result<()> {
    let error = RunError::new(code, "cancellation requested");
    conn.execute(
        "UPDATE conversation_runs SET error = ?2
         WHERE id = ?1 AND error IS NULL AND status IN ('queued', 'running')",
        rusqlite::params![run_id, serde_json::to_string(&error)?],
    )?;
    Ok(())
}

/// Drive a run to a terminal status inside the caller's transaction.
pub fn tx_finalize(
    conn: &Connection,
    run_id: &str,
    status: RunStatus,
    error: Option<RunError>,
    now: DateTime<Utc>,
) -> Result<Run> {
    let run = tx_get_run(conn, run_id)?;
    if run.status.is_terminal() {
        return Ok(run);
    }
    if !run.status.can_transition_to(status) {
        return Err(RunStoreError::IllegalTransition {
            id: run_id.to_string(),
            from: run.status.as_str(),
            to: status.as_str(),
        });
    }
    let error_json = error.map(|e| serde_json::to_string(&e)).transpose()?;
    conn.execute(
        "UPDATE conversation_runs
         SET status = ?2, finished_at = ?3, error = COALESCE(?4, error), updated_at = ?3
         WHERE id = ?1 AND status IN ('queued', 'running')",
        rusqlite::params![run_id, status.as_str(), now.to_rfc3339(), error_json],
    )?;
    tx_get_run(conn, run_id)
}

/// Fail a running run from the outside (stale preemption, reaper), stamping
/// cancellation so a still-alive worker aborts at its next check.
pub fn tx_force_fail(conn: &Connection, run_id: &str, error: RunError, now: DateTime<Utc>) -> Result<Run> {
    let now_str = now.to_rfc3339();
    conn.execute(
        "UPDATE conversation_runs
         SET status = 'failed', finished_at = ?2, error = ?3,
             cancel_requested_at = COALESCE(cancel_requested_at, ?2), updated_at = ?2
         WHERE id = ?1 AND status = 'running'",
        rusqlite::params![run_id, now_str, serde_json::to_string(&error)?],
    )?;
    tx_get_run(conn, run_id)
}

fn one_by_status(conn: &Connection, conversation_id: &str, status: &str) -> Result<Option<Run>> {
    match conn.query_row(
        &format!(
            "SELECT {RUN_COLUMNS} FROM conversation_runs
             WHERE conversation_id = ?1 AND status = ?2"
        ),
        rusqlite::params![conversation_id, status],
        row_to_run,
    ) {
        Ok(r) => Ok(Some(r)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(RunStoreError::Database(e)),
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let kind_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let error_json: Option<String> = row.get(12)?;
    let debug_json: String = row.get(13)?;
    Ok(Run {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        kind: RunKind::parse(&kind_str).map_err(|_| bad_text(2, &kind_str))?,
        status: RunStatus::parse(&status_str).map_err(|_| bad_text(3, &status_str))?,
        reason: row.get(4)?,
        speaker_membership_id: row.get(5)?,
        round_id: row.get(6)?,
        run_after: parse_ts(row.get(7)?),
        started_at: parse_ts(row.get(8)?),
        finished_at: parse_ts(row.get(9)?),
        heartbeat_at: parse_ts(row.get(10)?),
        cancel_requested_at: parse_ts(row.get(11)?),
        error: error_json.and_then(|j| serde_json::from_str(&j).ok()),
        debug: serde_json::from_str(&debug_json).unwrap_or_default(),
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

fn bad_text(idx: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unknown enum value: {raw}").into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn test_db() -> Db {
        let conn = Connection::open_in_memory().unwrap();
        // These tests exercise run-store logic against bare conversation ids
        // ("c-1", "c-2", ...) without materializing the owning `conversations`
        // rows, so FK enforcement (on by default in the bundled sqlite) must
        // be disabled for this connection.
        conn.execute_batch("PRAGMA foreign_keys = OFF;").unwrap();
        troupe_store::init_db(&conn).unwrap();
        crate::db::init_db(&conn).unwrap();
        troupe_store::shared(conn)
    }

    fn new_run(conversation: &str) -> NewRun {
        NewRun {
            conversation_id: conversation.to_string(),
            kind: RunKind::AutoResponse,
            reason: "test".into(),
            speaker_membership_id: "member-1".into(),
            run_after: None,
            round_id: None,
            debug: RunDebug::default(),
        }
    }

    #[test]
    fn second_create_conflicts() {
        let store = RunStore::new(test_db(), 120);
        assert!(matches!(
            store.create_queued(new_run("c-1")).unwrap(),
            CreateOutcome::Created(_)
        ));
        assert!(matches!(
            store.create_queued(new_run("c-1")).unwrap(),
            CreateOutcome::Conflict
        ));
        // A different conversation has its own slot.
        assert!(matches!(
            store.create_queued(new_run("c-2")).unwrap(),
            CreateOutcome::Created(_)
        ));
    }

    #[test]
    fn upsert_overwrites_in_place() {
        let store = RunStore::new(test_db(), 120);
        let first = store.upsert_queued(new_run("c-1")).unwrap();
        let mut replacement = new_run("c-1");
        replacement.speaker_membership_id = "member-2".into();
        replacement.reason = "newer".into();
        let second = store.upsert_queued(replacement).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.speaker_membership_id, "member-2");
        assert_eq!(second.reason, "newer");
    }

    #[test]
    fn claim_wins_exactly_once() {
        let store = RunStore::new(test_db(), 120);
        let CreateOutcome::Created(run) = store.create_queued(new_run("c-1")).unwrap() else {
            panic!("expected created");
        };
        let now = Utc::now();
        assert!(matches!(
            store.claim_atomic(&run.id, now).unwrap(),
            ClaimOutcome::Claimed(_)
        ));
        assert!(matches!(
            store.claim_atomic(&run.id, now).unwrap(),
            ClaimOutcome::NotClaimable
        ));
    }

    #[test]
    fn claim_respects_run_after() {
        let store = RunStore::new(test_db(), 120);
        let now = Utc::now();
        let mut new = new_run("c-1");
        new.run_after = Some(now + Duration::seconds(60));
        let CreateOutcome::Created(run) = store.create_queued(new).unwrap() else {
            panic!("expected created");
        };
        assert!(matches!(
            store.claim_atomic(&run.id, now).unwrap(),
            ClaimOutcome::NotClaimable
        ));
        assert!(matches!(
            store.claim_atomic(&run.id, now + Duration::seconds(61)).unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[test]
    fn healthy_running_run_blocks_claim() {
        let store = RunStore::new(test_db(), 120);
        let now = Utc::now();
        let CreateOutcome::Created(a) = store.create_queued(new_run("c-1")).unwrap() else {
            panic!()
        };
        let ClaimOutcome::Claimed(_) = store.claim_atomic(&a.id, now).unwrap() else {
            panic!()
        };

        let b = store.upsert_queued(new_run("c-1")).unwrap();
        assert!(matches!(
            store.claim_atomic(&b.id, now).unwrap(),
            ClaimOutcome::NotClaimable
        ));
    }

    #[test]
    fn stale_running_run_is_preempted_on_claim() {
        let store = RunStore::new(test_db(), 120);
        let t0 = Utc::now();
        let CreateOutcome::Created(a) = store.create_queued(new_run("c-1")).unwrap() else {
            panic!()
        };
        let ClaimOutcome::Claimed(_) = store.claim_atomic(&a.id, t0).unwrap() else {
            panic!()
        };

        let b = store.upsert_queued(new_run("c-1")).unwrap();
        let later = t0 + Duration::seconds(300);
        let ClaimOutcome::Claimed(claimed_b) = store.claim_atomic(&b.id, later).unwrap() else {
            panic!("expected stale preemption to unblock the claim");
        };
        assert_eq!(claimed_b.status, RunStatus::Running);

        let a = store.get(&a.id).unwrap();
        assert_eq!(a.status, RunStatus::Failed);
        assert_eq!(a.error.as_ref().unwrap().code, "stale_running_run");
        assert!(a.cancel_requested_at.is_some());
    }

    #[test]
    fn finalize_is_absorbing_and_guards_edges() {
        let store = RunStore::new(test_db(), 120);
        let now = Utc::now();
        let CreateOutcome::Created(run) = store.create_queued(new_run("c-1")).unwrap() else {
            panic!()
        };

        // queued -> succeeded is not a legal edge.
        assert!(matches!(
            store.finalize(&run.id, RunStatus::Succeeded, None, now),
            Err(RunStoreError::IllegalTransition { .. })
        ));

        // queued -> skipped is.
        let skipped = store
            .finalize(
                &run.id,
                RunStatus::Skipped,
                Some(RunError::new("expected_last_message_mismatch", "tail moved")),
                now,
            )
            .unwrap();
        assert_eq!(skipped.status, RunStatus::Skipped);

        // Terminal is absorbing: a second finalize is a no-op, not an error.
        let again = store.finalize(&run.id, RunStatus::Canceled, None, now).unwrap();
        assert_eq!(again.status, RunStatus::Skipped);
    }

    #[test]
    fn cancel_request_is_sticky() {
        let store = RunStore::new(test_db(), 120);
        let t0 = Utc::now();
        let CreateOutcome::Created(run) = store.create_queued(new_run("c-1")).unwrap() else {
            panic!()
        };
        assert!(!store.cancel_requested(&run.id).unwrap());

        store.request_cancel(&run.id, t0).unwrap();
        store.request_cancel(&run.id, t0 + Duration::seconds(9)).unwrap();
        let run = store.get(&run.id).unwrap();
        // First request wins; the run itself is still queued.
        assert_eq!(run.cancel_requested_at.unwrap().timestamp(), t0.timestamp());
        assert_eq!(run.status, RunStatus::Queued);
    }

    #[test]
    fn due_queued_orders_and_filters() {
        let store = RunStore::new(test_db(), 120);
        let now = Utc::now();
        store.upsert_queued(new_run("c-1")).unwrap();
        let mut delayed = new_run("c-2");
        delayed.run_after = Some(now + Duration::seconds(30));
        store.upsert_queued(delayed).unwrap();

        let due = store.due_queued(now, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].conversation_id, "c-1");

        let due = store.due_queued(now + Duration::seconds(31), 10).unwrap();
        assert_eq!(due.len(), 2);
    }
}
