use rusqlite::Connection;

use crate::error::Result;

/// Initialise the run and round tables.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
/// The two partial unique indexes are the database-enforced single-slot
/// invariants: a conversation can hold at most one `running` and at most one
/// `queued` run, no matter how many workers race.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conversation_runs (
            id                    TEXT    NOT NULL PRIMARY KEY,
            conversation_id       TEXT    NOT NULL REFERENCES conversations(id),
            kind                  TEXT    NOT NULL,
            status                TEXT    NOT NULL DEFAULT 'queued',
            reason                TEXT    NOT NULL DEFAULT '',
            speaker_membership_id TEXT    NOT NULL,
            round_id              TEXT,
            run_after             TEXT,   -- ISO-8601 or NULL: earliest execution
            started_at            TEXT,
            finished_at           TEXT,
            heartbeat_at          TEXT,
            cancel_requested_at   TEXT,   -- sticky; set once, never cleared
            error                 TEXT,   -- JSON {code, message, details}
            debug                 TEXT    NOT NULL DEFAULT '{}',
            created_at            TEXT    NOT NULL,
            updated_at            TEXT    NOT NULL
        ) STRICT;

        CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_running
            ON conversation_runs(conversation_id) WHERE status = 'running';
        CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_queued
            ON conversation_runs(conversation_id) WHERE status = 'queued';

        -- Dashboard queries: all runs for a speaker in a given state.
        CREATE INDEX IF NOT EXISTS idx_runs_speaker
            ON conversation_runs(speaker_membership_id, status);
        CREATE INDEX IF NOT EXISTS idx_runs_conversation
            ON conversation_runs(conversation_id, created_at);

        CREATE TABLE IF NOT EXISTS conversation_rounds (
            id               TEXT    NOT NULL PRIMARY KEY,
            conversation_id  TEXT    NOT NULL REFERENCES conversations(id),
            status           TEXT    NOT NULL DEFAULT 'active',
            scheduling_state TEXT    NOT NULL DEFAULT 'ai_generating',
            current_position INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT    NOT NULL,
            updated_at       TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_rounds_conversation
            ON conversation_rounds(conversation_id, status);

        CREATE TABLE IF NOT EXISTS conversation_round_participants (
            id            TEXT    NOT NULL PRIMARY KEY,
            round_id      TEXT    NOT NULL REFERENCES conversation_rounds(id),
            membership_id TEXT    NOT NULL,
            position      INTEGER NOT NULL,
            status        TEXT    NOT NULL DEFAULT 'pending',
            UNIQUE (round_id, position)
        ) STRICT;
        ",
    )?;
    Ok(())
}
