//! Password-reset tokens and the mail-dispatch collaborator seam.
//!
//! The auth core issues single-use reset tokens and validates them when the
//! new password arrives. Actually delivering the token to the user is a
//! collaborator's job behind [`ResetMailer`]; the bundled implementation
//! only logs, since email delivery is out of scope.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rand::RngCore;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

pub const DEFAULT_RESET_TOKEN_TTL_SECS: i64 = 3600;

pub trait ResetTokenStore: Send + Sync {
    /// Issues a fresh single-use token for the user, valid for `ttl_secs`.
    fn issue(&self, user_id: Uuid, ttl_secs: i64) -> Result<String>;
    /// Redeems a token: returns the owning user and deletes the token so it
    /// can never be used twice. Unknown or expired tokens yield `None`.
    fn consume(&self, token: &str) -> Result<Option<Uuid>>;
}

/// Outbound delivery seam. Real deployments plug in an email sender.
pub trait ResetMailer: Send + Sync {
    fn send_reset(&self, email: &str, token: &str);
}

/// Stub mailer: records the dispatch in the log and nothing else.
pub struct LogMailer;

impl ResetMailer for LogMailer {
    fn send_reset(&self, email: &str, _token: &str) {
        info!(email = %email, "Password reset requested; dispatch delegated to mail collaborator");
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct SqliteResetStore {
    db_path: String,
}

impl SqliteResetStore {
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
            "CREATE TABLE IF NOT EXISTS reset_tokens (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }
}

impl ResetTokenStore for SqliteResetStore {
    fn issue(&self, user_id: Uuid, ttl_secs: i64) -> Result<String> {
        let token = generate_token();
        let expires_at = Utc::now().timestamp() + ttl_secs;

        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "INSERT INTO reset_tokens (token, user_id, expires_at) VALUES (?1, ?2, ?3)",
            params![token, user_id.to_string(), expires_at],
        )
        .context("Failed to store reset token")?;

        Ok(token)
    }

    fn consume(&self, token: &str) -> Result<Option<Uuid>> {
        let conn = Connection::open(&self.db_path)?;
        let now = Utc::now().timestamp();

        let result = conn.query_row(
            "SELECT user_id FROM reset_tokens WHERE token = ?1 AND expires_at > ?2",
            params![token, now],
            |row| row.get::<_, String>(0),
        );

        // Single use: the token row goes away whether it was live or stale.
        conn.execute(
            "DELETE FROM reset_tokens WHERE token = ?1",
            params![token],
        )?;

        match result {
            Ok(user_id) => Ok(Uuid::parse_str(&user_id).ok()),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory reset store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryResetStore {
    tokens: Mutex<HashMap<String, (Uuid, i64)>>,
}

impl MemoryResetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResetTokenStore for MemoryResetStore {
    fn issue(&self, user_id: Uuid, ttl_secs: i64) -> Result<String> {
        let token = generate_token();
        let expires_at = Utc::now().timestamp() + ttl_secs;
        self.tokens.lock().insert(token.clone(), (user_id, expires_at));
        Ok(token)
    }

    fn consume(&self, token: &str) -> Result<Option<Uuid>> {
        let now = Utc::now().timestamp();
        let entry = self.tokens.lock().remove(token);
        Ok(entry.and_then(|(user_id, expires_at)| (expires_at > now).then_some(user_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn stores() -> (Vec<Box<dyn ResetTokenStore>>, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let sqlite = SqliteResetStore::new(temp.path().to_str().unwrap()).unwrap();
        (
            vec![Box::new(sqlite), Box::new(MemoryResetStore::new())],
            temp,
        )
    }

    #[test]
    fn test_issue_and_consume() {
        let (stores, _temp) = stores();
        for store in stores {
            let user_id = Uuid::new_v4();
            let token = store.issue(user_id, 3600).unwrap();

            assert_eq!(store.consume(&token).unwrap(), Some(user_id));
        }
    }

    #[test]
    fn test_tokens_are_single_use() {
        let (stores, _temp) = stores();
        for store in stores {
            let token = store.issue(Uuid::new_v4(), 3600).unwrap();

            assert!(store.consume(&token).unwrap().is_some());
            assert!(store.consume(&token).unwrap().is_none());
        }
    }

    #[test]
    fn test_expired_token_rejected() {
        let (stores, _temp) = stores();
        for store in stores {
            let token = store.issue(Uuid::new_v4(), -1).unwrap();
            assert!(store.consume(&token).unwrap().is_none());
        }
    }

    #[test]
    fn test_unknown_token_rejected() {
        let (stores, _temp) = stores();
        for store in stores {
            assert!(store.consume("no-such-token").unwrap().is_none());
        }
    }

    #[test]
    fn test_tokens_are_unique() {
        let (stores, _temp) = stores();
        for store in stores {
            let user_id = Uuid::new_v4();
            let a = store.issue(user_id, 3600).unwrap();
            let b = store.issue(user_id, 3600).unwrap();
            assert_ne!(a, b);
        }
    }
}
