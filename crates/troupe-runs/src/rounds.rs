use rusqlite::Connection;
use tracing::instrument;

use troupe_core::ids::{new_id, now_rfc3339};
use troupe_store::db::Db;
use troupe_store::SchedulingState;

use crate::error::{Result, RunStoreError};
use crate::types::{Round, RoundSlot, RoundStatus, SlotStatus};

/// Ledger of round records: the ordered speaker queue for one traversal of
/// the eligible AI participants, with a cursor and per-slot outcomes.
///
/// The queue is materialized when the round opens; membership mutations made
/// mid-round never rewrite it. Ineligible participants are skipped when the
/// cursor reaches their slot.
pub struct RoundLedger {
    db: Db,
}

impl RoundLedger {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Materialize a round from the predicted speaker queue.
    #[instrument(skip(self, member_ids), fields(conversation = %conversation_id, slots = member_ids.len()))]
    pub fn open(&self, conversation_id: &str, member_ids: &[String]) -> Result<Round> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let round = tx_open_round(&tx, conversation_id, member_ids)?;
        tx.commit()?;
        Ok(round)
    }

    pub fn get(&self, round_id: &str) -> Result<Round> {
        let db = self.db.lock().unwrap();
        tx_get_round(&db, round_id)
    }

    pub fn active_round(&self, conversation_id: &str) -> Result<Option<Round>> {
        let db = self.db.lock().unwrap();
        tx_active_round(&db, conversation_id)
    }
}

// ---------------------------------------------------------------------------
// Transaction-level helpers (compose inside a caller-owned transaction)
// ---------------------------------------------------------------------------

pub fn tx_open_round(conn: &Connection, conversation_id: &str, member_ids: &[String]) -> Result<Round> {
    let id = new_id();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO conversation_rounds (id, conversation_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?3)",
        rusqlite::params![id, conversation_id, now],
    )?;
    for (position, member_id) in member_ids.iter().enumerate() {
        conn.execute(
            "INSERT INTO conversation_round_participants
             (id, round_id, membership_id, position)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![new_id(), id, member_id, position as i64],
        )?;
    }
    tx_get_round(conn, &id)
}

pub fn tx_get_round(conn: &Connection, round_id: &str) -> Result<Round> {
    let mut round = conn
        .query_row(
            "SELECT id, conversation_id, status, scheduling_state, current_position,
                    created_at, updated_at
             FROM conversation_rounds WHERE id = ?1",
            [round_id],
            row_to_round,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => RunStoreError::RoundNotFound {
                id: round_id.to_string(),
            },
            other => RunStoreError::Database(other),
        })?;
    round.slots = load_slots(conn, round_id)?;
    Ok(round)
}

pub fn tx_active_round(conn: &Connection, conversation_id: &str) -> Result<Option<Round>> {
    let found = conn.query_row(
        "SELECT id FROM conversation_rounds
         WHERE conversation_id = ?1 AND status = 'active'
         ORDER BY created_at DESC LIMIT 1",
        [conversation_id],
        |row| row.get::<_, String>(0),
    );
    match found {
        Ok(id) => Ok(Some(tx_get_round(conn, &id)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(RunStoreError::Database(e)),
    }
}

/// Record the outcome of the slot at `position`.
pub fn tx_set_slot_status(
    conn: &Connection,
    round_id: &str,
    position: i64,
    status: SlotStatus,
) -> Result<()> {
    conn.execute(
        "UPDATE conversation_round_participants SET status = ?1
         WHERE round_id = ?2 AND position = ?3",
        rusqlite::params![status.as_str(), round_id, position],
    )?;
    Ok(())
}

pub fn tx_set_cursor(conn: &Connection, round_id: &str, position: i64) -> Result<()> {
    conn.execute(
        "UPDATE conversation_rounds SET current_position = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![position, now_rfc3339(), round_id],
    )?;
    Ok(())
}

pub fn tx_set_round_state(conn: &Connection, round_id: &str, state: SchedulingState) -> Result<()> {
    conn.execute(
        "UPDATE conversation_rounds SET scheduling_state = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![state.as_str(), now_rfc3339(), round_id],
    )?;
    Ok(())
}

/// Close a round. Remaining pending slots are marked skipped so the ledger
/// always ends in a fully-terminal state.
pub fn tx_close_round(conn: &Connection, round_id: &str, status: RoundStatus) -> Result<()> {
    conn.execute(
        "UPDATE conversation_round_participants SET status = 'skipped'
         WHERE round_id = ?1 AND status = 'pending'",
        [round_id],
    )?;
    conn.execute(
        "UPDATE conversation_rounds SET status = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![status.as_str(), now_rfc3339(), round_id],
    )?;
    Ok(())
}

fn load_slots(conn: &Connection, round_id: &str) -> Result<Vec<RoundSlot>> {
    let mut stmt = conn.prepare(
        "SELECT id, round_id, membership_id, position, status
         FROM conversation_round_participants
         WHERE round_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map([round_id], |row| {
        let status_str: String = row.get(4)?;
        Ok(RoundSlot {
            id: row.get(0)?,
            round_id: row.get(1)?,
            membership_id: row.get(2)?,
            position: row.get(3)?,
            status: SlotStatus::parse(&status_str).map_err(|_| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    format!("unknown slot status: {status_str}").into(),
                )
            })?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn row_to_round(row: &rusqlite::Row<'_>) -> rusqlite::Result<Round> {
    let status_str: String = row.get(2)?;
    let state_str: String = row.get(3)?;
    Ok(Round {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        status: RoundStatus::parse(&status_str).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unknown round status: {status_str}").into(),
            )
        })?,
        scheduling_state: SchedulingState::parse(&state_str).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown scheduling state: {state_str}").into(),
            )
        })?,
        current_position: row.get(4)?,
        slots: Vec::new(),
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}
