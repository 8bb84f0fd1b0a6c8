use rusqlite::Connection;
use tracing::instrument;

use troupe_core::ids::{new_id, now_rfc3339};

use crate::content;
use crate::db::Db;
use crate::error::{Result, StoreError};
use crate::rows::parse_col;
use crate::types::{Message, MessageSwipe, Role, Visibility};

/// Store for timeline messages and their swipes.
///
/// Content bookkeeping invariant: a message row and each of its swipe rows
/// hold one blob reference apiece. The message's `text_content_id` always
/// mirrors the active swipe's blob, so a swiped message contributes two
/// references to that blob (message + active swipe).
pub struct MessageStore {
    db: Db,
}

impl MessageStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Commit a user message to the timeline, allocating the next `seq`
    /// inside the transaction.
    #[instrument(skip(self, text), fields(conversation = %conversation_id))]
    pub fn commit_user_message(
        &self,
        conversation_id: &str,
        author_membership_id: Option<&str>,
        text: &str,
    ) -> Result<Message> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let message = tx_insert_message(
            &tx,
            conversation_id,
            Role::User,
            author_membership_id,
            text,
            None,
        )?;
        tx.commit()?;
        Ok(message)
    }

    pub fn get(&self, id: &str) -> Result<Message> {
        let db = self.db.lock().unwrap();
        get_message(&db, id)
    }

    /// The prompt window: the last `limit` non-hidden messages in seq order.
    pub fn history(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        tx_history(&db, conversation_id, limit)
    }

    /// The newest message that traverses the prompt window.
    pub fn prompt_visible_tail(&self, conversation_id: &str) -> Result<Option<Message>> {
        let db = self.db.lock().unwrap();
        tx_prompt_visible_tail(&db, conversation_id)
    }

    pub fn set_visibility(&self, message_id: &str, visibility: Visibility) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE messages SET visibility = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![visibility.as_str(), now_rfc3339(), message_id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                entity: "message",
                id: message_id.to_string(),
            });
        }
        Ok(())
    }

    /// Swipes of a message in position order.
    pub fn swipes(&self, message_id: &str) -> Result<Vec<MessageSwipe>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT s.id, s.message_id, s.position, s.text_content_id, tc.body,
                    s.run_id, s.created_at
             FROM message_swipes s
             JOIN text_contents tc ON tc.id = s.text_content_id
             WHERE s.message_id = ?1
             ORDER BY s.position",
        )?;
        let rows = stmt.query_map([message_id], row_to_swipe)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Point the message at a different swipe, re-mirroring its content.
    #[instrument(skip(self))]
    pub fn set_active_swipe(&self, message_id: &str, swipe_id: &str) -> Result<Message> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let message = get_message(&tx, message_id)?;
        let swipe_content: String = tx
            .query_row(
                "SELECT text_content_id FROM message_swipes WHERE id = ?1 AND message_id = ?2",
                rusqlite::params![swipe_id, message_id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                    entity: "swipe",
                    id: swipe_id.to_string(),
                },
                other => StoreError::Database(other),
            })?;

        if swipe_content != message.text_content_id {
            content::retain(&tx, &swipe_content)?;
            content::release(&tx, &message.text_content_id)?;
        }
        tx.execute(
            "UPDATE messages SET active_swipe_id = ?1, text_content_id = ?2, updated_at = ?3
             WHERE id = ?4",
            rusqlite::params![swipe_id, swipe_content, now_rfc3339(), message_id],
        )?;

        let updated = get_message(&tx, message_id)?;
        tx.commit()?;
        Ok(updated)
    }

    /// Edit a message's body with copy-on-write against shared blobs.
    ///
    /// For swiped messages the active swipe is edited through the same blob;
    /// the message/active-swipe pair counts as one logical owner, so an edit
    /// splits only when a *branch* (or another swipe) still references the
    /// blob.
    #[instrument(skip(self, new_text))]
    pub fn edit_content(&self, message_id: &str, new_text: &str) -> Result<Message> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let message = get_message(&tx, message_id)?;
        let now = now_rfc3339();

        match &message.active_swipe_id {
            None => {
                let kept = content::rewrite(&tx, &message.text_content_id, new_text)?;
                if kept != message.text_content_id {
                    tx.execute(
                        "UPDATE messages SET text_content_id = ?1, updated_at = ?2 WHERE id = ?3",
                        rusqlite::params![kept, now, message_id],
                    )?;
                }
            }
            Some(swipe_id) => {
                let refcount: i64 = tx.query_row(
                    "SELECT refcount FROM text_contents WHERE id = ?1",
                    [&message.text_content_id],
                    |row| row.get(0),
                )?;
                if refcount <= 2 {
                    // Sole owners: the message and its active swipe.
                    tx.execute(
                        "UPDATE text_contents SET body = ?1 WHERE id = ?2",
                        rusqlite::params![new_text, message.text_content_id],
                    )?;
                } else {
                    let fresh = content::insert(&tx, new_text)?;
                    content::retain(&tx, &fresh)?; // second ref for the swipe
                    content::release(&tx, &message.text_content_id)?;
                    content::release(&tx, &message.text_content_id)?;
                    tx.execute(
                        "UPDATE messages SET text_content_id = ?1 WHERE id = ?2",
                        rusqlite::params![fresh, message_id],
                    )?;
                    tx.execute(
                        "UPDATE message_swipes SET text_content_id = ?1 WHERE id = ?2",
                        rusqlite::params![fresh, swipe_id],
                    )?;
                }
                tx.execute(
                    "UPDATE messages SET updated_at = ?1 WHERE id = ?2",
                    rusqlite::params![now, message_id],
                )?;
            }
        }

        let updated = get_message(&tx, message_id)?;
        tx.commit()?;
        Ok(updated)
    }

    /// Remove a message and its swipes, releasing every blob reference.
    #[instrument(skip(self))]
    pub fn delete(&self, message_id: &str) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let message = get_message(&tx, message_id)?;

        let swipe_blobs: Vec<String> = {
            let mut stmt =
                tx.prepare("SELECT text_content_id FROM message_swipes WHERE message_id = ?1")?;
            let rows: Vec<String> = stmt
                .query_map([message_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };
        for blob in &swipe_blobs {
            content::release(&tx, blob)?;
        }
        tx.execute("DELETE FROM message_swipes WHERE message_id = ?1", [message_id])?;
        content::release(&tx, &message.text_content_id)?;
        tx.execute("DELETE FROM messages WHERE id = ?1", [message_id])?;
        tx.commit()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transaction-level helpers (compose inside a caller-owned transaction)
// ---------------------------------------------------------------------------

/// Insert a message row, allocating `seq = max(seq)+1` for the conversation.
///
/// User and system rows get a plain blob; assistant commits should go through
/// [`tx_insert_assistant_message`] so swipe #0 is created alongside.
pub fn tx_insert_message(
    conn: &Connection,
    conversation_id: &str,
    role: Role,
    author_membership_id: Option<&str>,
    text: &str,
    run_id: Option<&str>,
) -> Result<Message> {
    let id = new_id();
    let now = now_rfc3339();
    let seq = next_seq(conn, conversation_id)?;
    let content_id = content::insert(conn, text)?;
    conn.execute(
        "INSERT INTO messages
         (id, conversation_id, seq, role, visibility, author_membership_id,
          text_content_id, run_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'normal', ?5, ?6, ?7, ?8, ?8)",
        rusqlite::params![id, conversation_id, seq, role.as_str(), author_membership_id, content_id, run_id, now],
    )?;
    get_message(conn, &id)
}

/// Insert an assistant message with swipe #0 active, mirroring its content.
pub fn tx_insert_assistant_message(
    conn: &Connection,
    conversation_id: &str,
    author_membership_id: &str,
    text: &str,
    run_id: &str,
) -> Result<Message> {
    let message = tx_insert_message(
        conn,
        conversation_id,
        Role::Assistant,
        Some(author_membership_id),
        text,
        Some(run_id),
    )?;
    let swipe_id = new_id();
    content::retain(conn, &message.text_content_id)?;
    conn.execute(
        "INSERT INTO message_swipes (id, message_id, position, text_content_id, run_id, created_at)
         VALUES (?1, ?2, 0, ?3, ?4, ?5)",
        rusqlite::params![swipe_id, message.id, message.text_content_id, run_id, now_rfc3339()],
    )?;
    conn.execute(
        "UPDATE messages SET active_swipe_id = ?1, swipe_count = 1 WHERE id = ?2",
        rusqlite::params![swipe_id, message.id],
    )?;
    get_message(conn, &message.id)
}

/// Append a swipe to an existing assistant message and make it active.
pub fn tx_add_swipe(
    conn: &Connection,
    message_id: &str,
    text: &str,
    run_id: &str,
) -> Result<MessageSwipe> {
    let message = get_message(conn, message_id)?;
    let now = now_rfc3339();

    let swipe_id = new_id();
    let content_id = content::insert(conn, text)?;
    content::retain(conn, &content_id)?; // the message mirror's reference
    content::release(conn, &message.text_content_id)?;

    conn.execute(
        "INSERT INTO message_swipes (id, message_id, position, text_content_id, run_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![swipe_id, message_id, message.swipe_count, content_id, run_id, now],
    )?;
    conn.execute(
        "UPDATE messages
         SET active_swipe_id = ?1, text_content_id = ?2,
             swipe_count = swipe_count + 1, updated_at = ?3
         WHERE id = ?4",
        rusqlite::params![swipe_id, content_id, now, message_id],
    )?;

    conn.query_row(
        "SELECT s.id, s.message_id, s.position, s.text_content_id, tc.body, s.run_id, s.created_at
         FROM message_swipes s JOIN text_contents tc ON tc.id = s.text_content_id
         WHERE s.id = ?1",
        [&swipe_id],
        row_to_swipe,
    )
    .map_err(StoreError::Database)
}

/// Prompt-window history inside the caller's transaction: the last `limit`
/// non-hidden messages in seq order.
pub fn tx_history(conn: &Connection, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT m.id, m.conversation_id, m.seq, m.role, m.visibility,
                m.author_membership_id, m.text_content_id, tc.body,
                m.active_swipe_id, m.swipe_count, m.run_id, m.created_at, m.updated_at
         FROM messages m
         JOIN text_contents tc ON tc.id = m.text_content_id
         WHERE m.conversation_id = ?1 AND m.visibility != 'hidden'
         ORDER BY m.seq DESC
         LIMIT ?2",
    )?;
    let mut rows: Vec<Message> = stmt
        .query_map(rusqlite::params![conversation_id, limit as i64], row_to_message)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.reverse();
    Ok(rows)
}

/// The newest message with `visibility ∈ {normal, excluded}`.
pub fn tx_prompt_visible_tail(conn: &Connection, conversation_id: &str) -> Result<Option<Message>> {
    match conn.query_row(
        "SELECT m.id, m.conversation_id, m.seq, m.role, m.visibility,
                m.author_membership_id, m.text_content_id, tc.body,
                m.active_swipe_id, m.swipe_count, m.run_id, m.created_at, m.updated_at
         FROM messages m
         JOIN text_contents tc ON tc.id = m.text_content_id
         WHERE m.conversation_id = ?1 AND m.visibility != 'hidden'
         ORDER BY m.seq DESC
         LIMIT 1",
        [conversation_id],
        row_to_message,
    ) {
        Ok(m) => Ok(Some(m)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StoreError::Database(e)),
    }
}

pub fn get_message(conn: &Connection, id: &str) -> Result<Message> {
    conn.query_row(
        "SELECT m.id, m.conversation_id, m.seq, m.role, m.visibility,
                m.author_membership_id, m.text_content_id, tc.body,
                m.active_swipe_id, m.swipe_count, m.run_id, m.created_at, m.updated_at
         FROM messages m
         JOIN text_contents tc ON tc.id = m.text_content_id
         WHERE m.id = ?1",
        [id],
        row_to_message,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
            entity: "message",
            id: id.to_string(),
        },
        other => StoreError::Database(other),
    })
}

fn next_seq(conn: &Connection, conversation_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
        [conversation_id],
        |row| row.get(0),
    )?)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        seq: row.get(2)?,
        role: parse_col::<Role>(row, 3)?,
        visibility: parse_col::<Visibility>(row, 4)?,
        author_membership_id: row.get(5)?,
        text_content_id: row.get(6)?,
        content: row.get(7)?,
        active_swipe_id: row.get(8)?,
        swipe_count: row.get(9)?,
        run_id: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn row_to_swipe(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageSwipe> {
    Ok(MessageSwipe {
        id: row.get(0)?,
        message_id: row.get(1)?,
        position: row.get(2)?,
        text_content_id: row.get(3)?,
        content: row.get(4)?,
        run_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}
