//! A SQLite implementation of the `chatraft::RaftStorage` trait.
//!
//! One database file per node holds everything durable: the chat tables
//! (`users`, `messages`), the Raft log (`raft_log`) and the Raft metadata
//! (`metadata`). Every write commits a SQLite transaction before returning,
//! so anything acknowledged to the consensus engine survives a crash.
//!
//! The chat state machine lives here too: applying a committed log entry
//! runs the command's handler and the `last_applied` bookkeeping in a single
//! transaction, which is what makes replay after a restart safe.

mod chat;
mod command;

use std::fmt::Debug;
use std::ops::Bound;
use std::ops::RangeBounds;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::params;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use tracing::info;

use chatraft::raft::Entry;
use chatraft::storage::HardState;
use chatraft::storage::InitialState;
use chatraft::LogId;
use chatraft::NodeId;
use chatraft::RaftStorage;

pub use chat::Message;
pub use command::ChatCommand;
pub use command::CommandDecodeError;
pub use command::CommandOutcome;

const META_CURRENT_TERM: &str = "current_term";
const META_VOTED_FOR: &str = "voted_for";
const META_COMMIT_INDEX: &str = "commit_index";
const META_LAST_APPLIED: &str = "last_applied";

/// The durable store of a single chat node.
///
/// Thread safety comes from the internal lock around the connection; every
/// operation is a short transaction, so contention is not a concern at chat
/// workloads.
pub struct SqlStore {
    conn: Mutex<Connection>,
}

impl SqlStore {
    /// Open (creating if needed) the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).with_context(|| format!("creating storage directory {}", dir.display()))?;
            }
        }
        info!("opening database at {}", path.display());
        let conn = Connection::open(path).with_context(|| format!("opening database at {}", path.display()))?;
        Self::init(conn)
    }

    /// Open a throwaway in-memory store. Only useful in tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                username      TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                sender    TEXT NOT NULL REFERENCES users(username),
                recipient TEXT NOT NULL REFERENCES users(username),
                content   TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                is_read   INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS raft_log (
                log_index    INTEGER PRIMARY KEY,
                term         INTEGER NOT NULL,
                command_type INTEGER NOT NULL,
                command_data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS metadata (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )
    }

    // ------------------------------------------------------------------
    // Chat operations.

    /// Create a user account. Returns false iff the name is already taken.
    pub fn create_user(&self, username: &str, password_hash: &str) -> Result<bool> {
        let conn = self.conn.lock();
        Ok(chat::create_user(&conn, username, password_hash)?)
    }

    /// Check a username/credential pair against the stored account.
    pub fn authenticate_user(&self, username: &str, password_hash: &str) -> Result<bool> {
        let conn = self.conn.lock();
        Ok(chat::authenticate_user(&conn, username, password_hash)?)
    }

    /// Whether an account with this name exists.
    pub fn user_exists(&self, username: &str) -> Result<bool> {
        let conn = self.conn.lock();
        Ok(chat::user_exists(&conn, username)?)
    }

    /// List usernames containing `pattern` as a substring (case-insensitive),
    /// or all usernames when no pattern is given.
    pub fn list_users(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        Ok(chat::list_users(&conn, pattern)?)
    }

    /// Delete a user and every message the user sent or received, in one
    /// transaction. Returns false iff the user did not exist.
    pub fn delete_user(&self, username: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let deleted = chat::delete_user(&tx, username)?;
        tx.commit()?;
        Ok(deleted)
    }

    /// Deliver a message, returning its newly assigned id.
    pub fn add_message(&self, sender: &str, recipient: &str, content: &str, timestamp: i64) -> Result<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let id = chat::add_message(&tx, sender, recipient, content, timestamp)?;
        tx.commit()?;
        Ok(id)
    }

    /// Fetch `username`'s inbox, optionally restricted to unread messages.
    pub fn get_messages(&self, username: &str, include_read: bool) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        Ok(chat::get_messages(&conn, username, include_read)?)
    }

    /// Mark inbox messages as read; ids outside the inbox are ignored.
    pub fn mark_read(&self, username: &str, message_ids: &[i64]) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        chat::mark_read(&tx, username, message_ids)?;
        tx.commit()?;
        Ok(true)
    }

    /// Delete inbox messages; ids outside the inbox are ignored.
    pub fn delete_messages(&self, username: &str, message_ids: &[i64]) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        chat::delete_messages(&tx, username, message_ids)?;
        tx.commit()?;
        Ok(true)
    }

    /// The number of unread messages in `username`'s inbox.
    pub fn get_unread_count(&self, username: &str) -> Result<u64> {
        let conn = self.conn.lock();
        Ok(chat::unread_count(&conn, username)?)
    }

    // ------------------------------------------------------------------
    // Internals shared by the trait impl.

    fn row_to_entry(log_index: i64, term: i64, command_type: i64, command_data: &str) -> Result<Entry<ChatCommand>> {
        let command = ChatCommand::from_parts(command_type, command_data)
            .with_context(|| format!("decoding log entry at index {}", log_index))?;
        Ok(Entry {
            log_id: LogId::new(term as u64, log_index as u64),
            command,
        })
    }

    fn insert_entries(conn: &Connection, entries: &[&Entry<ChatCommand>], overwrite: bool) -> Result<()> {
        let sql = if overwrite {
            "INSERT OR REPLACE INTO raft_log (log_index, term, command_type, command_data) VALUES (?1, ?2, ?3, ?4)"
        } else {
            "INSERT INTO raft_log (log_index, term, command_type, command_data) VALUES (?1, ?2, ?3, ?4)"
        };
        let mut stmt = conn.prepare(sql)?;
        for entry in entries {
            let data = entry.command.payload_json()?;
            stmt.execute(params![
                entry.log_id.index as i64,
                entry.log_id.term as i64,
                entry.command.type_tag(),
                data
            ])?;
        }
        Ok(())
    }

    fn last_log_id_inner(conn: &Connection) -> rusqlite::Result<LogId> {
        let row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT log_index, term FROM raft_log ORDER BY log_index DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(match row {
            Some((index, term)) => LogId::new(term as u64, index as u64),
            None => LogId::default(),
        })
    }

    fn get_metadata(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
        conn.query_row("SELECT value FROM metadata WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
    }

    fn save_metadata(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn metadata_u64(conn: &Connection, key: &str) -> Result<u64> {
        match Self::get_metadata(conn, key)? {
            Some(value) => value.parse::<u64>().with_context(|| format!("malformed metadata value for {}", key)),
            None => Ok(0),
        }
    }

    fn apply_command(conn: &Connection, command: &ChatCommand) -> Result<CommandOutcome> {
        let outcome = match command {
            ChatCommand::CreateAccount { username, password_hash } => {
                if chat::create_user(conn, username, password_hash)? {
                    CommandOutcome::ok()
                } else {
                    CommandOutcome::failed()
                }
            }
            ChatCommand::DeleteAccount { username } => {
                if chat::delete_user(conn, username)? {
                    CommandOutcome::ok()
                } else {
                    CommandOutcome::failed()
                }
            }
            ChatCommand::SendMessage {
                sender,
                recipient,
                content,
                timestamp,
            } => {
                // Both ends are re-verified here: either may have been
                // deleted by an earlier entry of the same batch.
                if chat::user_exists(conn, sender)? && chat::user_exists(conn, recipient)? {
                    let id = chat::add_message(conn, sender, recipient, content, *timestamp)?;
                    CommandOutcome::delivered(id)
                } else {
                    CommandOutcome::failed()
                }
            }
            ChatCommand::MarkRead { username, message_ids } => {
                chat::mark_read(conn, username, message_ids)?;
                CommandOutcome::ok()
            }
            ChatCommand::DeleteMessages { username, message_ids } => {
                chat::delete_messages(conn, username, message_ids)?;
                CommandOutcome::ok()
            }
        };
        Ok(outcome)
    }
}

#[async_trait]
impl RaftStorage<ChatCommand, CommandOutcome> for SqlStore {
    async fn get_initial_state(&self) -> Result<InitialState> {
        let conn = self.conn.lock();
        let last_log_id = Self::last_log_id_inner(&conn)?;
        let current_term = Self::metadata_u64(&conn, META_CURRENT_TERM)?;
        let voted_for: Option<NodeId> = match Self::get_metadata(&conn, META_VOTED_FOR)? {
            Some(value) => serde_json::from_str(&value).context("malformed metadata value for voted_for")?,
            None => None,
        };
        let commit_index = Self::metadata_u64(&conn, META_COMMIT_INDEX)?;
        let last_applied = Self::metadata_u64(&conn, META_LAST_APPLIED)?;
        Ok(InitialState {
            last_log_id,
            hard_state: HardState {
                current_term,
                voted_for,
            },
            commit_index,
            last_applied,
        })
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::save_metadata(&tx, META_CURRENT_TERM, &hs.current_term.to_string())?;
        Self::save_metadata(&tx, META_VOTED_FOR, &serde_json::to_string(&hs.voted_for)?)?;
        tx.commit()?;
        Ok(())
    }

    async fn save_commit_index(&self, commit_index: u64) -> Result<()> {
        let conn = self.conn.lock();
        Self::save_metadata(&conn, META_COMMIT_INDEX, &commit_index.to_string())?;
        Ok(())
    }

    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<ChatCommand>>> {
        let start = match range.start_bound() {
            Bound::Included(&v) => v,
            Bound::Excluded(&v) => v + 1,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&v) => Some(v),
            Bound::Excluded(&v) => v.checked_sub(1),
            Bound::Unbounded => None,
        };
        if let Some(end) = end {
            if end < start {
                return Ok(Vec::new());
            }
        }

        let conn = self.conn.lock();
        let mut out = Vec::new();
        let mut push_row = |log_index: i64, term: i64, command_type: i64, command_data: String| -> Result<()> {
            out.push(Self::row_to_entry(log_index, term, command_type, &command_data)?);
            Ok(())
        };
        match end {
            Some(end) => {
                let mut stmt = conn.prepare(
                    "SELECT log_index, term, command_type, command_data FROM raft_log
                     WHERE log_index >= ?1 AND log_index <= ?2 ORDER BY log_index ASC",
                )?;
                let mut rows = stmt.query(params![start as i64, end as i64])?;
                while let Some(row) = rows.next()? {
                    push_row(row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)?;
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT log_index, term, command_type, command_data FROM raft_log
                     WHERE log_index >= ?1 ORDER BY log_index ASC",
                )?;
                let mut rows = stmt.query(params![start as i64])?;
                while let Some(row) = rows.next()? {
                    push_row(row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)?;
                }
            }
        }
        Ok(out)
    }

    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<ChatCommand>>> {
        let conn = self.conn.lock();
        let row: Option<(i64, i64, i64, String)> = conn
            .query_row(
                "SELECT log_index, term, command_type, command_data FROM raft_log WHERE log_index = ?1",
                params![log_index as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        match row {
            Some((log_index, term, command_type, command_data)) => {
                Ok(Some(Self::row_to_entry(log_index, term, command_type, &command_data)?))
            }
            None => Ok(None),
        }
    }

    async fn get_last_log_id(&self) -> Result<LogId> {
        let conn = self.conn.lock();
        Ok(Self::last_log_id_inner(&conn)?)
    }

    async fn delete_logs_from(&self, log_index: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM raft_log WHERE log_index >= ?1", params![log_index as i64])?;
        Ok(())
    }

    async fn append_to_log(&self, entries: &[&Entry<ChatCommand>]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::insert_entries(&tx, entries, false)?;
        tx.commit()?;
        Ok(())
    }

    async fn overwrite_log(&self, entries: &[&Entry<ChatCommand>]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::insert_entries(&tx, entries, true)?;
        tx.commit()?;
        Ok(())
    }

    async fn apply_to_state_machine(&self, entries: &[&Entry<ChatCommand>]) -> Result<Vec<CommandOutcome>> {
        let mut conn = self.conn.lock();
        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            let tx = conn.transaction()?;
            let outcome = Self::apply_command(&tx, &entry.command)?;
            Self::save_metadata(&tx, META_LAST_APPLIED, &entry.log_id.index.to_string())?;
            tx.commit()?;
            if !outcome.success {
                tracing::warn!(index = entry.log_id.index, "command could not take effect, entry counted as applied");
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, index: u64, command: ChatCommand) -> Entry<ChatCommand> {
        Entry {
            log_id: LogId::new(term, index),
            command,
        }
    }

    fn create(username: &str) -> ChatCommand {
        ChatCommand::CreateAccount {
            username: username.into(),
            password_hash: format!("hash-{}", username),
        }
    }

    #[test]
    fn user_lifecycle() {
        let store = SqlStore::open_in_memory().unwrap();
        assert!(store.create_user("alice", "h1").unwrap());
        assert!(!store.create_user("alice", "h2").unwrap(), "duplicate create must fail");

        assert!(store.authenticate_user("alice", "h1").unwrap());
        assert!(!store.authenticate_user("alice", "wrong").unwrap());
        assert!(!store.authenticate_user("nobody", "h1").unwrap());

        assert!(store.delete_user("alice").unwrap());
        assert!(!store.delete_user("alice").unwrap());
        assert!(!store.authenticate_user("alice", "h1").unwrap(), "auth must fail after delete");
    }

    #[test]
    fn list_users_matches_substring_case_insensitively() {
        let store = SqlStore::open_in_memory().unwrap();
        for name in ["alice", "Alina", "bob"] {
            store.create_user(name, "h").unwrap();
        }
        assert_eq!(store.list_users(None).unwrap(), vec!["Alina", "alice", "bob"]);
        assert_eq!(store.list_users(Some("ali")).unwrap(), vec!["Alina", "alice"]);
        assert_eq!(store.list_users(Some("*")).unwrap().len(), 3);
        assert!(store.list_users(Some("zzz")).unwrap().is_empty());
    }

    #[test]
    fn delete_user_cascades_to_messages() {
        let store = SqlStore::open_in_memory().unwrap();
        store.create_user("alice", "h").unwrap();
        store.create_user("bob", "h").unwrap();
        store.add_message("alice", "bob", "hello", 1_700_000_000).unwrap();
        store.add_message("bob", "alice", "hi back", 1_700_000_001).unwrap();

        assert!(store.delete_user("alice").unwrap());
        assert!(store.get_messages("bob", true).unwrap().is_empty(), "messages sent by alice are gone");
        assert!(store.get_messages("alice", true).unwrap().is_empty());
    }

    #[test]
    fn unread_count_equals_unread_messages() {
        let store = SqlStore::open_in_memory().unwrap();
        store.create_user("alice", "h").unwrap();
        store.create_user("bob", "h").unwrap();
        let m1 = store.add_message("alice", "bob", "one", 1).unwrap();
        store.add_message("alice", "bob", "two", 2).unwrap();
        store.add_message("alice", "bob", "three", 3).unwrap();

        assert_eq!(store.get_unread_count("bob").unwrap(), 3);
        store.mark_read("bob", &[m1]).unwrap();
        assert_eq!(store.get_unread_count("bob").unwrap(), 2);
        assert_eq!(
            store.get_unread_count("bob").unwrap(),
            store.get_messages("bob", false).unwrap().len() as u64
        );
    }

    #[test]
    fn mark_and_delete_ignore_foreign_inboxes() {
        let store = SqlStore::open_in_memory().unwrap();
        store.create_user("alice", "h").unwrap();
        store.create_user("bob", "h").unwrap();
        let to_bob = store.add_message("alice", "bob", "for bob", 1).unwrap();

        // Alice cannot mark or delete a message from bob's inbox.
        store.mark_read("alice", &[to_bob]).unwrap();
        assert_eq!(store.get_unread_count("bob").unwrap(), 1);
        store.delete_messages("alice", &[to_bob]).unwrap();
        assert_eq!(store.get_messages("bob", true).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn log_primitives() {
        let store = SqlStore::open_in_memory().unwrap();
        assert_eq!(store.get_last_log_id().await.unwrap(), LogId::default());

        let e1 = entry(1, 1, create("alice"));
        let e2 = entry(1, 2, create("bob"));
        store.append_to_log(&[&e1, &e2]).await.unwrap();
        assert_eq!(store.get_last_log_id().await.unwrap(), LogId::new(1, 2));

        let got = store.get_log_entries(1..=2).await.unwrap();
        assert_eq!(got, vec![e1.clone(), e2.clone()]);
        assert_eq!(store.try_get_log_entry(2).await.unwrap(), Some(e2.clone()));
        assert_eq!(store.try_get_log_entry(3).await.unwrap(), None);

        // A follower overwriting an existing index with the same term is a no-op in effect.
        store.overwrite_log(&[&e2]).await.unwrap();
        assert_eq!(store.get_log_entries(1..).await.unwrap().len(), 2);

        // Overwriting with a different term replaces the entry.
        let e2b = entry(2, 2, create("carol"));
        store.overwrite_log(&[&e2b]).await.unwrap();
        assert_eq!(store.try_get_log_entry(2).await.unwrap(), Some(e2b));

        store.delete_logs_from(2).await.unwrap();
        assert_eq!(store.get_last_log_id().await.unwrap(), LogId::new(1, 1));
    }

    #[tokio::test]
    async fn hard_state_and_indices_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.db");
        {
            let store = SqlStore::open(&path).unwrap();
            store
                .save_hard_state(&HardState {
                    current_term: 7,
                    voted_for: Some(3),
                })
                .await
                .unwrap();
            store.save_commit_index(4).await.unwrap();
            let e = entry(7, 1, create("alice"));
            store.append_to_log(&[&e]).await.unwrap();
            store.apply_to_state_machine(&[&e]).await.unwrap();
        }

        let store = SqlStore::open(&path).unwrap();
        let state = store.get_initial_state().await.unwrap();
        assert_eq!(state.hard_state.current_term, 7);
        assert_eq!(state.hard_state.voted_for, Some(3));
        assert_eq!(state.commit_index, 4);
        assert_eq!(state.last_applied, 1);
        assert_eq!(state.last_log_id, LogId::new(7, 1));
        assert!(store.user_exists("alice").unwrap());
    }

    #[tokio::test]
    async fn pristine_store_reports_zeros() {
        let store = SqlStore::open_in_memory().unwrap();
        let state = store.get_initial_state().await.unwrap();
        assert_eq!(state.hard_state, HardState::default());
        assert_eq!(state.commit_index, 0);
        assert_eq!(state.last_applied, 0);
        assert_eq!(state.last_log_id, LogId::default());
    }

    #[tokio::test]
    async fn apply_is_deterministic_across_stores() {
        let log = vec![
            entry(1, 1, create("alice")),
            entry(1, 2, create("bob")),
            entry(
                1,
                3,
                ChatCommand::SendMessage {
                    sender: "alice".into(),
                    recipient: "bob".into(),
                    content: "hello".into(),
                    timestamp: 1_700_000_000,
                },
            ),
            entry(
                1,
                4,
                ChatCommand::MarkRead {
                    username: "bob".into(),
                    message_ids: vec![1],
                },
            ),
        ];

        let a = SqlStore::open_in_memory().unwrap();
        let b = SqlStore::open_in_memory().unwrap();
        for store in [&a, &b] {
            let refs: Vec<_> = log.iter().collect();
            store.apply_to_state_machine(&refs).await.unwrap();
        }

        let msgs_a = a.get_messages("bob", true).unwrap();
        let msgs_b = b.get_messages("bob", true).unwrap();
        assert_eq!(msgs_a, msgs_b);
        assert_eq!(msgs_a.len(), 1);
        assert_eq!(msgs_a[0].id, 1);
        assert_eq!(msgs_a[0].timestamp, 1_700_000_000);
        assert!(msgs_a[0].is_read);
    }

    #[tokio::test]
    async fn failed_apply_still_advances_last_applied() {
        let store = SqlStore::open_in_memory().unwrap();
        let e1 = entry(1, 1, create("alice"));
        // bob does not exist, so delivery cannot take effect.
        let e2 = entry(
            1,
            2,
            ChatCommand::SendMessage {
                sender: "alice".into(),
                recipient: "bob".into(),
                content: "into the void".into(),
                timestamp: 42,
            },
        );
        let outcomes = store.apply_to_state_machine(&[&e1, &e2]).await.unwrap();
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);

        let state = store.get_initial_state().await.unwrap();
        assert_eq!(state.last_applied, 2, "a failed command still counts as applied");
        assert!(store.get_messages("bob", true).unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_create_account_fails_cleanly() {
        let store = SqlStore::open_in_memory().unwrap();
        let e1 = entry(1, 1, create("alice"));
        let mut dup = create("alice");
        if let ChatCommand::CreateAccount { password_hash, .. } = &mut dup {
            *password_hash = "different".into();
        }
        let e2 = entry(1, 2, dup);
        let outcomes = store.apply_to_state_machine(&[&e1, &e2]).await.unwrap();
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        // The original credential is untouched.
        assert!(store.authenticate_user("alice", "hash-alice").unwrap());
    }
}
