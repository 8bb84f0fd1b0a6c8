use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::error::Result;

/// Shared database handle.
///
/// Every store in the workspace wraps the same connection so that
/// cross-table transactions (message commit + run finalize) are possible.
/// The mutex serializes writers, which is the single-node equivalent of
/// row-level locking on the conversation row.
pub type Db = Arc<Mutex<Connection>>;

/// Wrap an open connection in the shared handle.
pub fn shared(conn: Connection) -> Db {
    Arc::new(Mutex::new(conn))
}

/// Initialise the core timeline tables and their indexes.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
/// Run/round tables live in `troupe-runs` and are initialised separately
/// against the same connection.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS spaces (
            id                      TEXT    NOT NULL PRIMARY KEY,
            name                    TEXT    NOT NULL,
            reply_order             TEXT    NOT NULL DEFAULT 'natural',
            allow_self_responses    INTEGER NOT NULL DEFAULT 0,
            auto_mode_enabled       INTEGER NOT NULL DEFAULT 0,
            auto_mode_delay_ms      INTEGER NOT NULL DEFAULT 0,
            auto_rounds_remaining   INTEGER NOT NULL DEFAULT 0,
            input_policy            TEXT    NOT NULL DEFAULT 'queue',
            user_turn_debounce_ms   INTEGER NOT NULL DEFAULT 0,
            relax_message_trim      INTEGER NOT NULL DEFAULT 0,
            card_handling           TEXT    NOT NULL DEFAULT 'swap',
            token_limit             INTEGER,            -- NULL means unlimited
            prompt_tokens_total     INTEGER NOT NULL DEFAULT 0,
            completion_tokens_total INTEGER NOT NULL DEFAULT 0,
            created_at              TEXT    NOT NULL,
            updated_at              TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS space_memberships (
            id                      TEXT    NOT NULL PRIMARY KEY,
            space_id                TEXT    NOT NULL REFERENCES spaces(id),
            kind                    TEXT    NOT NULL,   -- human | character
            display_name            TEXT    NOT NULL,
            avatar_url              TEXT,
            bubble_class            TEXT,
            position                INTEGER NOT NULL,
            participation           TEXT    NOT NULL DEFAULT 'active',
            status                  TEXT    NOT NULL DEFAULT 'active',
            talkativeness           REAL,               -- NULL means the 0.5 default
            copilot_mode            TEXT    NOT NULL DEFAULT 'none',
            copilot_remaining_steps INTEGER NOT NULL DEFAULT 0,
            persona                 TEXT,
            created_at              TEXT    NOT NULL,
            updated_at              TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_memberships_space
            ON space_memberships(space_id, position);

        CREATE TABLE IF NOT EXISTS conversations (
            id                      TEXT    NOT NULL PRIMARY KEY,
            space_id                TEXT    NOT NULL REFERENCES spaces(id),
            kind                    TEXT    NOT NULL DEFAULT 'root',
            parent_conversation_id  TEXT,
            forked_from_message_id  TEXT,
            scheduling_state        TEXT    NOT NULL DEFAULT 'idle',
            group_queue_revision    INTEGER NOT NULL DEFAULT 0,
            round_queue_ids         TEXT    NOT NULL DEFAULT '[]',  -- JSON array
            prompt_tokens_total     INTEGER NOT NULL DEFAULT 0,
            completion_tokens_total INTEGER NOT NULL DEFAULT 0,
            created_at              TEXT    NOT NULL,
            updated_at              TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_conversations_space
            ON conversations(space_id, updated_at DESC);

        CREATE TABLE IF NOT EXISTS text_contents (
            id          TEXT    NOT NULL PRIMARY KEY,
            body        TEXT    NOT NULL,
            refcount    INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS messages (
            id                   TEXT    NOT NULL PRIMARY KEY,
            conversation_id      TEXT    NOT NULL REFERENCES conversations(id),
            seq                  INTEGER NOT NULL,
            role                 TEXT    NOT NULL,   -- user | assistant | system
            visibility           TEXT    NOT NULL DEFAULT 'normal',
            author_membership_id TEXT,
            text_content_id      TEXT    NOT NULL REFERENCES text_contents(id),
            active_swipe_id      TEXT,
            swipe_count          INTEGER NOT NULL DEFAULT 0,
            run_id               TEXT,
            created_at           TEXT    NOT NULL,
            updated_at           TEXT    NOT NULL,
            UNIQUE (conversation_id, seq)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, seq);

        CREATE TABLE IF NOT EXISTS message_swipes (
            id              TEXT    NOT NULL PRIMARY KEY,
            message_id      TEXT    NOT NULL REFERENCES messages(id),
            position        INTEGER NOT NULL,
            text_content_id TEXT    NOT NULL REFERENCES text_contents(id),
            run_id          TEXT,
            created_at      TEXT    NOT NULL,
            UNIQUE (message_id, position)
        ) STRICT;
        ",
    )?;
    Ok(())
}

#[cfg(test)]
pub fn open_test_db() -> Db {
    let conn = Connection::open_in_memory().expect("in-memory sqlite");
    init_db(&conn).expect("init schema");
    shared(conn)
}
