//! Shared text content blobs with reference counting.
//!
//! Message and swipe rows reference `text_contents` instead of embedding
//! bodies, so branching a conversation shares blobs instead of copying them.
//! The rules:
//!
//! - every referencing row holds exactly one reference;
//! - `retain` / `release` adjust the count; a count of zero deletes the row;
//! - editing a blob that is still shared splits it first (copy-on-write).
//!
//! All functions take `&Connection` so they compose inside the caller's
//! transaction.

use rusqlite::Connection;

use troupe_core::ids::{new_id, now_rfc3339};

use crate::error::{Result, StoreError};

/// Insert a new blob with refcount 1 and return its id.
pub fn insert(conn: &Connection, body: &str) -> Result<String> {
    let id = new_id();
    conn.execute(
        "INSERT INTO text_contents (id, body, refcount, created_at) VALUES (?1, ?2, 1, ?3)",
        rusqlite::params![id, body, now_rfc3339()],
    )?;
    Ok(id)
}

/// Increment the reference count of an existing blob.
pub fn retain(conn: &Connection, id: &str) -> Result<()> {
    let n = conn.execute(
        "UPDATE text_contents SET refcount = refcount + 1 WHERE id = ?1",
        [id],
    )?;
    if n == 0 {
        return Err(StoreError::NotFound {
            entity: "text_content",
            id: id.to_string(),
        });
    }
    Ok(())
}

/// Decrement the reference count; delete the row when it reaches zero.
pub fn release(conn: &Connection, id: &str) -> Result<()> {
    let n = conn.execute(
        "UPDATE text_contents SET refcount = refcount - 1 WHERE id = ?1",
        [id],
    )?;
    if n == 0 {
        return Err(StoreError::NotFound {
            entity: "text_content",
            id: id.to_string(),
        });
    }
    conn.execute("DELETE FROM text_contents WHERE id = ?1 AND refcount <= 0", [id])?;
    Ok(())
}

/// Read a blob body.
pub fn body(conn: &Connection, id: &str) -> Result<String> {
    conn.query_row("SELECT body FROM text_contents WHERE id = ?1", [id], |row| {
        row.get(0)
    })
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
            entity: "text_content",
            id: id.to_string(),
        },
        other => StoreError::Database(other),
    })
}

/// Write `new_body` for one referencing row, copy-on-write when shared.
///
/// Returns the content id the caller should now reference: the same id when
/// the blob had a single reference (updated in place), or a freshly inserted
/// id when the blob was shared (the old blob's count is decremented back to
/// its pre-share value).
pub fn rewrite(conn: &Connection, id: &str, new_body: &str) -> Result<String> {
    let refcount: i64 = conn
        .query_row("SELECT refcount FROM text_contents WHERE id = ?1", [id], |row| {
            row.get(0)
        })
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                entity: "text_content",
                id: id.to_string(),
            },
            other => StoreError::Database(other),
        })?;

    if refcount <= 1 {
        conn.execute(
            "UPDATE text_contents SET body = ?1 WHERE id = ?2",
            rusqlite::params![new_body, id],
        )?;
        return Ok(id.to_string());
    }

    let fresh = insert(conn, new_body)?;
    release(conn, id)?;
    Ok(fresh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_test_db;

    #[test]
    fn release_deletes_at_zero() {
        let db = open_test_db();
        let conn = db.lock().unwrap();
        let id = insert(&conn, "hello").unwrap();
        retain(&conn, &id).unwrap();
        release(&conn, &id).unwrap();
        assert_eq!(body(&conn, &id).unwrap(), "hello");
        release(&conn, &id).unwrap();
        assert!(body(&conn, &id).is_err());
    }

    #[test]
    fn rewrite_in_place_when_sole_owner() {
        let db = open_test_db();
        let conn = db.lock().unwrap();
        let id = insert(&conn, "v1").unwrap();
        let kept = rewrite(&conn, &id, "v2").unwrap();
        assert_eq!(kept, id);
        assert_eq!(body(&conn, &id).unwrap(), "v2");
    }

    #[test]
    fn rewrite_splits_when_shared() {
        let db = open_test_db();
        let conn = db.lock().unwrap();
        let id = insert(&conn, "shared").unwrap();
        retain(&conn, &id).unwrap();

        let fresh = rewrite(&conn, &id, "edited").unwrap();
        assert_ne!(fresh, id);
        assert_eq!(body(&conn, &id).unwrap(), "shared");
        assert_eq!(body(&conn, &fresh).unwrap(), "edited");

        // The original is back to a single reference.
        let refcount: i64 = conn
            .query_row("SELECT refcount FROM text_contents WHERE id = ?1", [&id], |r| r.get(0))
            .unwrap();
        assert_eq!(refcount, 1);
    }
}
