use rusqlite::Connection;
use tracing::{info, instrument};

use troupe_core::ids::{new_id, now_rfc3339};

use crate::content;
use crate::db::Db;
use crate::error::{Result, StoreError};
use crate::rows::parse_col;
use crate::types::{Conversation, ConversationKind, SchedulingState};

/// Store for conversation timelines.
pub struct ConversationStore {
    db: Db,
}

impl ConversationStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create a fresh root conversation in a space.
    #[instrument(skip(self), fields(space = %space_id))]
    pub fn create(&self, space_id: &str) -> Result<Conversation> {
        let id = new_id();
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO conversations (id, space_id, kind, created_at, updated_at)
             VALUES (?1, ?2, 'root', ?3, ?3)",
            rusqlite::params![id, space_id, now],
        )?;
        get_conversation(&db, &id)
    }

    pub fn get(&self, id: &str) -> Result<Conversation> {
        let db = self.db.lock().unwrap();
        get_conversation(&db, id)
    }

    /// Conversations currently in the given scheduling state — the reaper's
    /// sweep query.
    pub fn list_in_state(&self, state: SchedulingState) -> Result<Vec<Conversation>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, space_id, kind, parent_conversation_id, forked_from_message_id,
                    scheduling_state, group_queue_revision, round_queue_ids,
                    prompt_tokens_total, completion_tokens_total, created_at, updated_at
             FROM conversations
             WHERE scheduling_state = ?1",
        )?;
        let rows = stmt.query_map([state.as_str()], row_to_conversation)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Conversations of a space, most recently updated first.
    pub fn list_for_space(&self, space_id: &str) -> Result<Vec<Conversation>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, space_id, kind, parent_conversation_id, forked_from_message_id,
                    scheduling_state, group_queue_revision, round_queue_ids,
                    prompt_tokens_total, completion_tokens_total, created_at, updated_at
             FROM conversations
             WHERE space_id = ?1
             ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([space_id], row_to_conversation)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Branch a conversation at a message.
    ///
    /// Copies every message up to and including `at_message_id` into a new
    /// `branch` conversation. Content blobs are shared, not copied — each
    /// copied row retains the source's `text_content_id` and bumps its
    /// refcount, so a branch is cheap regardless of history size. Swipes are
    /// carried over the same way.
    #[instrument(skip(self), fields(source = %source_id, at = %at_message_id))]
    pub fn fork(&self, source_id: &str, at_message_id: &str) -> Result<Conversation> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let now = now_rfc3339();

        let source = get_conversation(&tx, source_id)?;
        let fork_seq: i64 = tx
            .query_row(
                "SELECT seq FROM messages WHERE id = ?1 AND conversation_id = ?2",
                rusqlite::params![at_message_id, source_id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                    entity: "message",
                    id: at_message_id.to_string(),
                },
                other => StoreError::Database(other),
            })?;

        let branch_id = new_id();
        tx.execute(
            "INSERT INTO conversations
             (id, space_id, kind, parent_conversation_id, forked_from_message_id,
              prompt_tokens_total, completion_tokens_total, created_at, updated_at)
             VALUES (?1, ?2, 'branch', ?3, ?4, ?5, ?6, ?7, ?7)",
            rusqlite::params![
                branch_id,
                source.space_id,
                source_id,
                at_message_id,
                source.prompt_tokens_total,
                source.completion_tokens_total,
                now,
            ],
        )?;

        // Copy message rows in seq order, sharing content blobs.
        let sources: Vec<(String, i64, String, String, Option<String>, String, Option<String>)> = {
            let mut stmt = tx.prepare(
                "SELECT id, seq, role, visibility, author_membership_id,
                        text_content_id, run_id
                 FROM messages
                 WHERE conversation_id = ?1 AND seq <= ?2
                 ORDER BY seq",
            )?;
            let rows: Vec<_> = stmt
                .query_map(rusqlite::params![source_id, fork_seq], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                })?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        for (src_msg_id, seq, role, visibility, author, content_id, run_id) in sources {
            let new_msg_id = new_id();
            content::retain(&tx, &content_id)?;
            tx.execute(
                "INSERT INTO messages
                 (id, conversation_id, seq, role, visibility, author_membership_id,
                  text_content_id, run_id, created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?9)",
                rusqlite::params![new_msg_id, branch_id, seq, role, visibility, author, content_id, run_id, now],
            )?;

            // Carry swipes across, also by reference.
            let swipes: Vec<(i64, String, Option<String>, bool)> = {
                let mut stmt = tx.prepare(
                    "SELECT s.position, s.text_content_id, s.run_id,
                            s.id = m.active_swipe_id
                     FROM message_swipes s
                     JOIN messages m ON m.id = s.message_id
                     WHERE s.message_id = ?1
                     ORDER BY s.position",
                )?;
                let rows: Vec<_> = stmt
                    .query_map([&src_msg_id], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get::<_, Option<bool>>(3)?.unwrap_or(false),
                        ))
                    })?
                    .filter_map(|r| r.ok())
                    .collect();
                rows
            };

            let swipe_count = swipes.len() as i64;
            for (position, swipe_content_id, swipe_run_id, was_active) in swipes {
                let new_swipe_id = new_id();
                content::retain(&tx, &swipe_content_id)?;
                tx.execute(
                    "INSERT INTO message_swipes
                     (id, message_id, position, text_content_id, run_id, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    rusqlite::params![new_swipe_id, new_msg_id, position, swipe_content_id, swipe_run_id, now],
                )?;
                if was_active {
                    tx.execute(
                        "UPDATE messages SET active_swipe_id = ?1 WHERE id = ?2",
                        rusqlite::params![new_swipe_id, new_msg_id],
                    )?;
                }
            }
            if swipe_count > 0 {
                tx.execute(
                    "UPDATE messages SET swipe_count = ?1 WHERE id = ?2",
                    rusqlite::params![swipe_count, new_msg_id],
                )?;
            }
        }

        let branch = get_conversation(&tx, &branch_id)?;
        tx.commit()?;
        info!(branch = %branch.id, upto_seq = fork_seq, "conversation forked");
        Ok(branch)
    }
}

// ---------------------------------------------------------------------------
// Transaction-level helpers
// ---------------------------------------------------------------------------

pub fn get_conversation(conn: &Connection, id: &str) -> Result<Conversation> {
    conn.query_row(
        "SELECT id, space_id, kind, parent_conversation_id, forked_from_message_id,
                scheduling_state, group_queue_revision, round_queue_ids,
                prompt_tokens_total, completion_tokens_total, created_at, updated_at
         FROM conversations WHERE id = ?1",
        [id],
        row_to_conversation,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
            entity: "conversation",
            id: id.to_string(),
        },
        other => StoreError::Database(other),
    })
}

/// Set the cached scheduling state and bump the revision fence.
/// Returns the new revision for stamping outgoing events.
pub fn tx_set_scheduling_state(
    conn: &Connection,
    conversation_id: &str,
    state: SchedulingState,
) -> Result<i64> {
    conn.execute(
        "UPDATE conversations
         SET scheduling_state = ?1,
             group_queue_revision = group_queue_revision + 1,
             updated_at = ?2
         WHERE id = ?3",
        rusqlite::params![state.as_str(), now_rfc3339(), conversation_id],
    )?;
    revision(conn, conversation_id)
}

/// Bump the revision fence without changing state.
pub fn tx_bump_revision(conn: &Connection, conversation_id: &str) -> Result<i64> {
    conn.execute(
        "UPDATE conversations
         SET group_queue_revision = group_queue_revision + 1, updated_at = ?1
         WHERE id = ?2",
        rusqlite::params![now_rfc3339(), conversation_id],
    )?;
    revision(conn, conversation_id)
}

/// Replace the cached round queue projection (UI display only).
pub fn tx_set_round_queue(conn: &Connection, conversation_id: &str, member_ids: &[String]) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET round_queue_ids = ?1 WHERE id = ?2",
        rusqlite::params![serde_json::to_string(member_ids)?, conversation_id],
    )?;
    Ok(())
}

/// Add provider usage to the conversation's running totals.
pub fn tx_bump_conversation_tokens(
    conn: &Connection,
    conversation_id: &str,
    prompt: i64,
    completion: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE conversations
         SET prompt_tokens_total = prompt_tokens_total + ?1,
             completion_tokens_total = completion_tokens_total + ?2
         WHERE id = ?3",
        rusqlite::params![prompt, completion, conversation_id],
    )?;
    Ok(())
}

fn revision(conn: &Connection, conversation_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT group_queue_revision FROM conversations WHERE id = ?1",
        [conversation_id],
        |row| row.get(0),
    )?)
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let queue_json: String = row.get(7)?;
    Ok(Conversation {
        id: row.get(0)?,
        space_id: row.get(1)?,
        kind: parse_col::<ConversationKind>(row, 2)?,
        parent_conversation_id: row.get(3)?,
        forked_from_message_id: row.get(4)?,
        scheduling_state: parse_col::<SchedulingState>(row, 5)?,
        group_queue_revision: row.get(6)?,
        round_queue_ids: serde_json::from_str(&queue_json).unwrap_or_default(),
        prompt_tokens_total: row.get(8)?,
        completion_tokens_total: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_test_db;
    use crate::messages::MessageStore;
    use crate::spaces::{NewSpace, SpaceStore};

    #[test]
    fn scheduling_state_bumps_revision() {
        let db = open_test_db();
        let spaces = SpaceStore::new(db.clone());
        let conversations = ConversationStore::new(db.clone());
        let space = spaces.create(NewSpace::default()).unwrap();
        let conv = conversations.create(&space.id).unwrap();
        assert_eq!(conv.group_queue_revision, 0);

        {
            let conn = db.lock().unwrap();
            let rev = tx_set_scheduling_state(&conn, &conv.id, SchedulingState::AiGenerating).unwrap();
            assert_eq!(rev, 1);
            let rev = tx_bump_revision(&conn, &conv.id).unwrap();
            assert_eq!(rev, 2);
        }

        let conv = conversations.get(&conv.id).unwrap();
        assert_eq!(conv.scheduling_state, SchedulingState::AiGenerating);
        assert_eq!(conv.group_queue_revision, 2);
    }

    #[test]
    fn fork_shares_content_blobs() {
        let db = open_test_db();
        let spaces = SpaceStore::new(db.clone());
        let conversations = ConversationStore::new(db.clone());
        let messages = MessageStore::new(db.clone());

        let space = spaces.create(NewSpace::default()).unwrap();
        let conv = conversations.create(&space.id).unwrap();
        let m1 = messages.commit_user_message(&conv.id, None, "first").unwrap();
        let m2 = messages.commit_user_message(&conv.id, None, "second").unwrap();
        messages.commit_user_message(&conv.id, None, "third").unwrap();

        let branch = conversations.fork(&conv.id, &m2.id).unwrap();
        assert_eq!(branch.kind, ConversationKind::Branch);
        assert_eq!(branch.parent_conversation_id.as_deref(), Some(conv.id.as_str()));

        let copied = messages.history(&branch.id, 10).unwrap();
        assert_eq!(copied.len(), 2);
        assert_eq!(copied[0].content, "first");
        assert_eq!(copied[1].content, "second");
        // Blob is shared, not copied.
        assert_eq!(copied[0].text_content_id, m1.text_content_id);

        let conn = db.lock().unwrap();
        let refcount: i64 = conn
            .query_row(
                "SELECT refcount FROM text_contents WHERE id = ?1",
                [&m1.text_content_id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(refcount, 2);
    }

    #[test]
    fn editing_branch_message_splits_blob() {
        let db = open_test_db();
        let spaces = SpaceStore::new(db.clone());
        let conversations = ConversationStore::new(db.clone());
        let messages = MessageStore::new(db.clone());

        let space = spaces.create(NewSpace::default()).unwrap();
        let conv = conversations.create(&space.id).unwrap();
        let m1 = messages.commit_user_message(&conv.id, None, "original").unwrap();
        let branch = conversations.fork(&conv.id, &m1.id).unwrap();

        let branched = &messages.history(&branch.id, 10).unwrap()[0];
        messages.edit_content(&branched.id, "rewritten").unwrap();

        // Source kept its blob and is back to one reference.
        let source = messages.get(&m1.id).unwrap();
        assert_eq!(source.content, "original");
        let conn = db.lock().unwrap();
        let refcount: i64 = conn
            .query_row(
                "SELECT refcount FROM text_contents WHERE id = ?1",
                [&source.text_content_id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(refcount, 1);
    }
}
