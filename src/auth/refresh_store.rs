//! Refresh-token persistence.
//!
//! The stateful refresh design keeps one record per active session so that
//! logout can truly revoke it. `find` never returns an expired record: the
//! SQLite store filters on read and prunes the dead row, the in-memory store
//! checks on read.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RefreshRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token: String,
    /// Unix timestamp.
    pub expires_at: i64,
}

pub trait RefreshStore: Send + Sync {
    fn save(&self, user_id: Uuid, token: &str, expires_at: i64) -> Result<()>;
    /// Returns the live record for this token, or `None` when it is unknown
    /// or expired.
    fn find(&self, token: &str) -> Result<Option<RefreshRecord>>;
    /// Idempotent: deleting an unknown token is a no-op.
    fn delete(&self, token: &str) -> Result<()>;
}

pub struct SqliteRefreshStore {
    db_path: String,
}

impl SqliteRefreshStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let store = Self {
            db_path: db_path.to_string(),
        };
        store.init_db()?;
        Ok(store)
    }

    fn init_db(&self) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS refresh_tokens (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                token TEXT UNIQUE NOT NULL,
                expires_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }
}

impl RefreshStore for SqliteRefreshStore {
    fn save(&self, user_id: Uuid, token: &str, expires_at: i64) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "INSERT INTO refresh_tokens (id, user_id, token, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                Uuid::new_v4().to_string(),
                user_id.to_string(),
                token,
                expires_at,
            ],
        )
        .context("Failed to save refresh token")?;
        Ok(())
    }

    fn find(&self, token: &str) -> Result<Option<RefreshRecord>> {
        let conn = Connection::open(&self.db_path)?;
        let now = Utc::now().timestamp();

        // Lazy pruning: expired rows are dead weight once past expiry.
        conn.execute(
            "DELETE FROM refresh_tokens WHERE token = ?1 AND expires_at <= ?2",
            params![token, now],
        )?;

        let mut stmt = conn.prepare(
            "SELECT id, user_id, token, expires_at FROM refresh_tokens
             WHERE token = ?1 AND expires_at > ?2",
        )?;

        let result = stmt.query_row(params![token, now], |row| {
            let id: String = row.get(0)?;
            let user_id: String = row.get(1)?;
            Ok(RefreshRecord {
                id: Uuid::parse_str(&id).unwrap_or_default(),
                user_id: Uuid::parse_str(&user_id).unwrap_or_default(),
                token: row.get(2)?,
                expires_at: row.get(3)?,
            })
        });

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, token: &str) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "DELETE FROM refresh_tokens WHERE token = ?1",
            params![token],
        )
        .context("Failed to delete refresh token")?;
        Ok(())
    }
}

/// In-memory refresh store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryRefreshStore {
    records: Mutex<Vec<RefreshRecord>>,
}

impl MemoryRefreshStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RefreshStore for MemoryRefreshStore {
    fn save(&self, user_id: Uuid, token: &str, expires_at: i64) -> Result<()> {
        self.records.lock().push(RefreshRecord {
            id: Uuid::new_v4(),
            user_id,
            token: token.to_string(),
            expires_at,
        });
        Ok(())
    }

    fn find(&self, token: &str) -> Result<Option<RefreshRecord>> {
        let now = Utc::now().timestamp();
        let mut records = self.records.lock();
        records.retain(|r| r.expires_at > now);
        Ok(records.iter().find(|r| r.token == token).cloned())
    }

    fn delete(&self, token: &str) -> Result<()> {
        self.records.lock().retain(|r| r.token != token);
        Ok(())
    }
}
