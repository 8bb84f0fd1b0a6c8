use rusqlite::Connection;
use tracing::{info, instrument};

use troupe_core::ids::{new_id, now_rfc3339};

use crate::db::Db;
use crate::error::{Result, StoreError};
use crate::rows::parse_col;
use crate::types::{
    CopilotMode, InputPolicy, MemberStatus, MembershipKind, Participation, ReplyOrder, Space,
    SpaceMembership,
};

/// Creation parameters for a space. Everything has a sensible default so
/// tests and callers only set what they care about.
#[derive(Debug, Clone)]
pub struct NewSpace {
    pub name: String,
    pub reply_order: ReplyOrder,
    pub allow_self_responses: bool,
    pub input_policy: InputPolicy,
    pub auto_mode_delay_ms: u64,
    pub user_turn_debounce_ms: u64,
    pub relax_message_trim: bool,
    pub token_limit: Option<i64>,
}

impl Default for NewSpace {
    fn default() -> Self {
        Self {
            name: "space".to_string(),
            reply_order: ReplyOrder::Natural,
            allow_self_responses: false,
            input_policy: InputPolicy::Queue,
            auto_mode_delay_ms: 0,
            user_turn_debounce_ms: 0,
            relax_message_trim: false,
            token_limit: None,
        }
    }
}

/// Creation parameters for a membership slot.
#[derive(Debug, Clone)]
pub struct NewMembership {
    pub kind: MembershipKind,
    pub display_name: String,
    pub position: i64,
    pub talkativeness: Option<f64>,
    pub persona: Option<String>,
    pub avatar_url: Option<String>,
}

impl NewMembership {
    pub fn character(name: &str, position: i64) -> Self {
        Self {
            kind: MembershipKind::Character,
            display_name: name.to_string(),
            position,
            talkativeness: None,
            persona: None,
            avatar_url: None,
        }
    }

    pub fn human(name: &str, position: i64) -> Self {
        Self {
            kind: MembershipKind::Human,
            display_name: name.to_string(),
            position,
            talkativeness: None,
            persona: None,
            avatar_url: None,
        }
    }
}

/// Store for spaces and their participant slots.
pub struct SpaceStore {
    db: Db,
}

impl SpaceStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    #[instrument(skip(self, new), fields(name = %new.name))]
    pub fn create(&self, new: NewSpace) -> Result<Space> {
        let id = new_id();
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO spaces
             (id, name, reply_order, allow_self_responses, input_policy,
              auto_mode_delay_ms, user_turn_debounce_ms, relax_message_trim,
              token_limit, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?10)",
            rusqlite::params![
                id,
                new.name,
                new.reply_order.as_str(),
                new.allow_self_responses,
                new.input_policy.as_str(),
                new.auto_mode_delay_ms as i64,
                new.user_turn_debounce_ms as i64,
                new.relax_message_trim,
                new.token_limit,
                now,
            ],
        )?;
        get_space(&db, &id)
    }

    pub fn get(&self, id: &str) -> Result<Space> {
        let db = self.db.lock().unwrap();
        get_space(&db, id)
    }

    #[instrument(skip(self, new), fields(space = %space_id, name = %new.display_name))]
    pub fn add_member(&self, space_id: &str, new: NewMembership) -> Result<SpaceMembership> {
        let id = new_id();
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO space_memberships
             (id, space_id, kind, display_name, avatar_url, position,
              talkativeness, persona, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?9)",
            rusqlite::params![
                id,
                space_id,
                new.kind.as_str(),
                new.display_name,
                new.avatar_url,
                new.position,
                new.talkativeness,
                new.persona,
                now,
            ],
        )?;
        get_membership(&db, &id)
    }

    pub fn member(&self, id: &str) -> Result<SpaceMembership> {
        let db = self.db.lock().unwrap();
        get_membership(&db, id)
    }

    /// All memberships of a space in position order, regardless of status.
    pub fn members(&self, space_id: &str) -> Result<Vec<SpaceMembership>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, space_id, kind, display_name, avatar_url, bubble_class,
                    position, participation, status, talkativeness, copilot_mode,
                    copilot_remaining_steps, persona, created_at, updated_at
             FROM space_memberships WHERE space_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map([space_id], row_to_membership)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(Ok)
            .collect()
    }

    /// Memberships the scheduler may select as speakers, in position order.
    pub fn eligible_members(&self, space_id: &str) -> Result<Vec<SpaceMembership>> {
        Ok(self
            .members(space_id)?
            .into_iter()
            .filter(|m| m.is_eligible())
            .collect())
    }

    pub fn set_participation(&self, member_id: &str, participation: Participation) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE space_memberships SET participation = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![participation.as_str(), now_rfc3339(), member_id],
        )?;
        not_found_when_zero(n, "membership", member_id)
    }

    pub fn set_member_status(&self, member_id: &str, status: MemberStatus) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE space_memberships SET status = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![status.as_str(), now_rfc3339(), member_id],
        )?;
        not_found_when_zero(n, "membership", member_id)
    }

    /// Put a human membership into (or out of) full copilot mode.
    pub fn set_copilot(&self, member_id: &str, mode: CopilotMode, steps: u32) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE space_memberships
             SET copilot_mode = ?1, copilot_remaining_steps = ?2, updated_at = ?3
             WHERE id = ?4",
            rusqlite::params![mode.as_str(), steps as i64, now_rfc3339(), member_id],
        )?;
        not_found_when_zero(n, "membership", member_id)
    }

    /// Enable or disable auto-mode, setting the round budget.
    ///
    /// Enabling atomically drops every full-copilot membership back to `none`
    /// (auto-mode and copilot are mutually exclusive drivers of AI turns) and
    /// returns the ids of the memberships that were changed so the caller can
    /// broadcast the state change.
    #[instrument(skip(self), fields(space = %space_id, enabled, rounds))]
    pub fn set_auto_mode(&self, space_id: &str, enabled: bool, rounds: u32) -> Result<Vec<String>> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let now = now_rfc3339();

        let n = tx.execute(
            "UPDATE spaces
             SET auto_mode_enabled = ?1, auto_rounds_remaining = ?2, updated_at = ?3
             WHERE id = ?4",
            rusqlite::params![enabled, rounds as i64, now, space_id],
        )?;
        not_found_when_zero(n, "space", space_id)?;

        let mut demoted = Vec::new();
        if enabled {
            let mut stmt = tx.prepare(
                "SELECT id FROM space_memberships
                 WHERE space_id = ?1 AND copilot_mode = 'full'",
            )?;
            demoted = stmt
                .query_map([space_id], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .collect::<Vec<_>>();
            drop(stmt);
            tx.execute(
                "UPDATE space_memberships
                 SET copilot_mode = 'none', copilot_remaining_steps = 0, updated_at = ?1
                 WHERE space_id = ?2 AND copilot_mode = 'full'",
                rusqlite::params![now, space_id],
            )?;
        }

        tx.commit()?;
        if !demoted.is_empty() {
            info!(count = demoted.len(), "auto-mode enable demoted copilot members");
        }
        Ok(demoted)
    }
}

// ---------------------------------------------------------------------------
// Transaction-level helpers (compose inside a caller-owned transaction)
// ---------------------------------------------------------------------------

/// Add provider usage to the space's running totals.
pub fn tx_bump_space_tokens(conn: &Connection, space_id: &str, prompt: i64, completion: i64) -> Result<()> {
    conn.execute(
        "UPDATE spaces
         SET prompt_tokens_total = prompt_tokens_total + ?1,
             completion_tokens_total = completion_tokens_total + ?2
         WHERE id = ?3",
        rusqlite::params![prompt, completion, space_id],
    )?;
    Ok(())
}

/// Decrement a copilot membership's remaining steps, clamping at zero.
/// Returns the remaining count after the decrement.
pub fn tx_decrement_copilot_step(conn: &Connection, member_id: &str) -> Result<u32> {
    conn.execute(
        "UPDATE space_memberships
         SET copilot_remaining_steps = MAX(copilot_remaining_steps - 1, 0)
         WHERE id = ?1",
        [member_id],
    )?;
    let remaining: i64 = conn.query_row(
        "SELECT copilot_remaining_steps FROM space_memberships WHERE id = ?1",
        [member_id],
        |row| row.get(0),
    )?;
    Ok(remaining as u32)
}

/// Drop a membership out of copilot mode.
pub fn tx_disable_copilot(conn: &Connection, member_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE space_memberships SET copilot_mode = 'none' WHERE id = ?1",
        [member_id],
    )?;
    Ok(())
}

/// Flip the auto-mode flag without touching the budget (used when pooled
/// exhaustion terminates auto-mode).
pub fn tx_set_auto_enabled(conn: &Connection, space_id: &str, enabled: bool) -> Result<()> {
    conn.execute(
        "UPDATE spaces SET auto_mode_enabled = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![enabled, now_rfc3339(), space_id],
    )?;
    Ok(())
}

/// All memberships of a space in position order, inside the caller's
/// transaction.
pub fn tx_members(conn: &Connection, space_id: &str) -> Result<Vec<SpaceMembership>> {
    let mut stmt = conn.prepare(
        "SELECT id, space_id, kind, display_name, avatar_url, bubble_class,
                position, participation, status, talkativeness, copilot_mode,
                copilot_remaining_steps, persona, created_at, updated_at
         FROM space_memberships WHERE space_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map([space_id], row_to_membership)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Decrement the auto-mode round budget, clamping at zero.
/// Returns the rounds remaining after the decrement.
pub fn tx_decrement_auto_rounds(conn: &Connection, space_id: &str) -> Result<u32> {
    conn.execute(
        "UPDATE spaces SET auto_rounds_remaining = MAX(auto_rounds_remaining - 1, 0)
         WHERE id = ?1",
        [space_id],
    )?;
    let remaining: i64 = conn.query_row(
        "SELECT auto_rounds_remaining FROM spaces WHERE id = ?1",
        [space_id],
        |row| row.get(0),
    )?;
    Ok(remaining as u32)
}

pub fn get_space(conn: &Connection, id: &str) -> Result<Space> {
    conn.query_row(
        "SELECT id, name, reply_order, allow_self_responses, auto_mode_enabled,
                auto_mode_delay_ms, auto_rounds_remaining, input_policy,
                user_turn_debounce_ms, relax_message_trim, card_handling,
                token_limit, prompt_tokens_total, completion_tokens_total,
                created_at, updated_at
         FROM spaces WHERE id = ?1",
        [id],
        row_to_space,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
            entity: "space",
            id: id.to_string(),
        },
        other => StoreError::Database(other),
    })
}

pub fn get_membership(conn: &Connection, id: &str) -> Result<SpaceMembership> {
    conn.query_row(
        "SELECT id, space_id, kind, display_name, avatar_url, bubble_class,
                position, participation, status, talkativeness, copilot_mode,
                copilot_remaining_steps, persona, created_at, updated_at
         FROM space_memberships WHERE id = ?1",
        [id],
        row_to_membership,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
            entity: "membership",
            id: id.to_string(),
        },
        other => StoreError::Database(other),
    })
}

fn not_found_when_zero(n: usize, entity: &'static str, id: &str) -> Result<()> {
    if n == 0 {
        return Err(StoreError::NotFound {
            entity,
            id: id.to_string(),
        });
    }
    Ok(())
}

fn row_to_space(row: &rusqlite::Row<'_>) -> rusqlite::Result<Space> {
    Ok(Space {
        id: row.get(0)?,
        name: row.get(1)?,
        reply_order: parse_col(row, 2)?,
        allow_self_responses: row.get(3)?,
        auto_mode_enabled: row.get(4)?,
        auto_mode_delay_ms: row.get::<_, i64>(5)? as u64,
        auto_rounds_remaining: row.get::<_, i64>(6)? as u32,
        input_policy: parse_col(row, 7)?,
        user_turn_debounce_ms: row.get::<_, i64>(8)? as u64,
        relax_message_trim: row.get(9)?,
        card_handling: row.get(10)?,
        token_limit: row.get(11)?,
        prompt_tokens_total: row.get(12)?,
        completion_tokens_total: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn row_to_membership(row: &rusqlite::Row<'_>) -> rusqlite::Result<SpaceMembership> {
    Ok(SpaceMembership {
        id: row.get(0)?,
        space_id: row.get(1)?,
        kind: parse_col(row, 2)?,
        display_name: row.get(3)?,
        avatar_url: row.get(4)?,
        bubble_class: row.get(5)?,
        position: row.get(6)?,
        participation: parse_col(row, 7)?,
        status: parse_col(row, 8)?,
        talkativeness: row.get(9)?,
        copilot_mode: parse_col(row, 10)?,
        copilot_remaining_steps: row.get::<_, i64>(11)? as u32,
        persona: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_test_db;

    fn store() -> SpaceStore {
        SpaceStore::new(open_test_db())
    }

    #[test]
    fn create_and_fetch_space() {
        let store = store();
        let space = store
            .create(NewSpace {
                name: "tavern".into(),
                reply_order: ReplyOrder::List,
                ..NewSpace::default()
            })
            .unwrap();
        let fetched = store.get(&space.id).unwrap();
        assert_eq!(fetched.reply_order, ReplyOrder::List);
        assert_eq!(fetched.auto_rounds_remaining, 0);
        assert!(!fetched.auto_mode_enabled);
    }

    #[test]
    fn eligible_members_filters_muted_and_plain_humans() {
        let store = store();
        let space = store.create(NewSpace::default()).unwrap();
        let alice = store
            .add_member(&space.id, NewMembership::character("Alice", 0))
            .unwrap();
        let bob = store
            .add_member(&space.id, NewMembership::character("Bob", 1))
            .unwrap();
        store
            .add_member(&space.id, NewMembership::human("Sam", 2))
            .unwrap();
        store.set_participation(&bob.id, Participation::Muted).unwrap();

        let eligible = store.eligible_members(&space.id).unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, alice.id);
    }

    #[test]
    fn copilot_human_becomes_eligible() {
        let store = store();
        let space = store.create(NewSpace::default()).unwrap();
        let sam = store
            .add_member(&space.id, NewMembership::human("Sam", 0))
            .unwrap();
        store.set_copilot(&sam.id, CopilotMode::Full, 5).unwrap();

        let eligible = store.eligible_members(&space.id).unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].copilot_remaining_steps, 5);
    }

    #[test]
    fn enabling_auto_mode_demotes_copilots() {
        let store = store();
        let space = store.create(NewSpace::default()).unwrap();
        let sam = store
            .add_member(&space.id, NewMembership::human("Sam", 0))
            .unwrap();
        store.set_copilot(&sam.id, CopilotMode::Full, 5).unwrap();

        let demoted = store.set_auto_mode(&space.id, true, 3).unwrap();
        assert_eq!(demoted, vec![sam.id.clone()]);

        let sam = store.member(&sam.id).unwrap();
        assert_eq!(sam.copilot_mode, CopilotMode::None);
        assert_eq!(sam.copilot_remaining_steps, 0);

        let space = store.get(&space.id).unwrap();
        assert!(space.auto_mode_enabled);
        assert_eq!(space.auto_rounds_remaining, 3);
    }
}
