//! Chat table operations.
//!
//! These run against a borrowed connection so the same statements serve both
//! the public store methods and the per-entry apply transactions.

use rusqlite::params;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use serde::Deserialize;
use serde::Serialize;

/// A message in a user's inbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    /// Seconds since the epoch, as stamped by the leader that accepted the send.
    pub timestamp: i64,
    pub is_read: bool,
}

pub(crate) fn create_user(conn: &Connection, username: &str, password_hash: &str) -> rusqlite::Result<bool> {
    let res = conn.execute(
        "INSERT INTO users (username, password_hash) VALUES (?1, ?2)",
        params![username, password_hash],
    );
    match res {
        Ok(_) => Ok(true),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => Ok(false),
        Err(err) => Err(err),
    }
}

pub(crate) fn user_exists(conn: &Connection, username: &str) -> rusqlite::Result<bool> {
    let row: Option<i64> = conn
        .query_row("SELECT 1 FROM users WHERE username = ?1", params![username], |row| row.get(0))
        .optional()?;
    Ok(row.is_some())
}

pub(crate) fn authenticate_user(conn: &Connection, username: &str, password_hash: &str) -> rusqlite::Result<bool> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT password_hash FROM users WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )
        .optional()?;
    Ok(stored.map(|hash| hash == password_hash).unwrap_or(false))
}

/// List usernames, filtered to those containing `pattern` as a substring.
///
/// Matching goes through SQL `LIKE`, which is case-insensitive for ASCII.
pub(crate) fn list_users(conn: &Connection, pattern: Option<&str>) -> rusqlite::Result<Vec<String>> {
    let mut stmt;
    let rows: Vec<rusqlite::Result<String>> = match pattern {
        Some(p) if !p.is_empty() && p != "*" => {
            stmt = conn.prepare("SELECT username FROM users WHERE username LIKE '%' || ?1 || '%' ORDER BY username")?;
            stmt.query_map(params![p], |row| row.get(0))?.collect()
        }
        _ => {
            stmt = conn.prepare("SELECT username FROM users ORDER BY username")?;
            stmt.query_map([], |row| row.get(0))?.collect()
        }
    };
    rows.into_iter().collect()
}

/// Delete a user along with every message the user sent or received.
///
/// The caller supplies the enclosing transaction; these statements must not
/// be observable piecemeal.
pub(crate) fn delete_user(conn: &Connection, username: &str) -> rusqlite::Result<bool> {
    if !user_exists(conn, username)? {
        return Ok(false);
    }
    conn.execute(
        "DELETE FROM messages WHERE sender = ?1 OR recipient = ?1",
        params![username],
    )?;
    conn.execute("DELETE FROM users WHERE username = ?1", params![username])?;
    Ok(true)
}

/// Insert a message, returning its newly assigned id.
///
/// Existence of sender and recipient is the caller's concern; ids come from
/// the table's autoincrement, which only ever advances inside apply
/// transactions executed in log order, so replicas assign identical ids.
pub(crate) fn add_message(
    conn: &Connection,
    sender: &str,
    recipient: &str,
    content: &str,
    timestamp: i64,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO messages (sender, recipient, content, timestamp, is_read) VALUES (?1, ?2, ?3, ?4, 0)",
        params![sender, recipient, content, timestamp],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn get_messages(conn: &Connection, username: &str, include_read: bool) -> rusqlite::Result<Vec<Message>> {
    let sql = if include_read {
        "SELECT id, sender, recipient, content, timestamp, is_read FROM messages WHERE recipient = ?1 ORDER BY id"
    } else {
        "SELECT id, sender, recipient, content, timestamp, is_read FROM messages WHERE recipient = ?1 AND is_read = 0 ORDER BY id"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![username], |row| {
        Ok(Message {
            id: row.get(0)?,
            sender: row.get(1)?,
            recipient: row.get(2)?,
            content: row.get(3)?,
            timestamp: row.get(4)?,
            is_read: row.get::<_, i64>(5)? != 0,
        })
    })?;
    rows.collect()
}

/// Mark messages in `username`'s inbox as read. Ids that do not belong to
/// the inbox are silently ignored.
pub(crate) fn mark_read(conn: &Connection, username: &str, message_ids: &[i64]) -> rusqlite::Result<usize> {
    if message_ids.is_empty() {
        return Ok(0);
    }
    let placeholders = vec!["?"; message_ids.len()].join(",");
    let sql = format!(
        "UPDATE messages SET is_read = 1 WHERE recipient = ? AND id IN ({})",
        placeholders
    );
    let mut values: Vec<Value> = Vec::with_capacity(message_ids.len() + 1);
    values.push(Value::from(username.to_string()));
    values.extend(message_ids.iter().map(|id| Value::from(*id)));
    conn.execute(&sql, params_from_iter(values))
}

/// Delete messages from `username`'s inbox. Ids that do not belong to the
/// inbox are silently ignored.
pub(crate) fn delete_messages(conn: &Connection, username: &str, message_ids: &[i64]) -> rusqlite::Result<usize> {
    if message_ids.is_empty() {
        return Ok(0);
    }
    let placeholders = vec!["?"; message_ids.len()].join(",");
    let sql = format!("DELETE FROM messages WHERE recipient = ? AND id IN ({})", placeholders);
    let mut values: Vec<Value> = Vec::with_capacity(message_ids.len() + 1);
    values.push(Value::from(username.to_string()));
    values.extend(message_ids.iter().map(|id| Value::from(*id)));
    conn.execute(&sql, params_from_iter(values))
}

pub(crate) fn unread_count(conn: &Connection, username: &str) -> rusqlite::Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE recipient = ?1 AND is_read = 0",
        params![username],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}
