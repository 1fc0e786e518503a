//! User record store.
//!
//! The auth core's contract with user persistence is this trait; handlers
//! and tests inject an implementation instead of reaching for process-wide
//! state. Emails are compared case-insensitively: callers pass the
//! normalized (lowercased) form and implementations store it as-is.

use crate::auth::models::User;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use uuid::Uuid;

pub trait UserStore: Send + Sync {
    fn find_by_email(&self, email: &str) -> Result<Option<User>>;
    fn find_by_id(&self, id: &Uuid) -> Result<Option<User>>;
    /// Fails if the email is already taken.
    fn insert(&self, user: &User) -> Result<()>;
    /// Persists updated password fields for an existing user.
    fn update(&self, user: &User) -> Result<()>;
}

/// SQLite-backed user store. Opens a connection per call, which keeps the
/// store trivially shareable across request handlers.
pub struct SqliteUserStore {
    db_path: String,
}

impl SqliteUserStore {
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
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT UNIQUE NOT NULL,
                username TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                password_salt TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
        let id: String = row.get(0)?;
        Ok(User {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            email: row.get(1)?,
            username: row.get(2)?,
            password_hash: row.get(3)?,
            password_salt: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn find_where(&self, clause: &str, value: &str) -> Result<Option<User>> {
        let conn = Connection::open(&self.db_path)?;
        let sql = format!(
            "SELECT id, email, username, password_hash, password_salt, created_at
             FROM users WHERE {clause} = ?1"
        );
        let mut stmt = conn.prepare(&sql)?;

        match stmt.query_row(params![value], Self::row_to_user) {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl UserStore for SqliteUserStore {
    fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        self.find_where("email", email)
    }

    fn find_by_id(&self, id: &Uuid) -> Result<Option<User>> {
        self.find_where("id", &id.to_string())
    }

    fn insert(&self, user: &User) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "INSERT INTO users (id, email, username, password_hash, password_salt, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user.id.to_string(),
                user.email,
                user.username,
                user.password_hash,
                user.password_salt,
                user.created_at,
            ],
        )
        .context("Failed to insert user")?;
        Ok(())
    }

    fn update(&self, user: &User) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;
        let rows = conn
            .execute(
                "UPDATE users SET username = ?2, password_hash = ?3, password_salt = ?4
                 WHERE id = ?1",
                params![
                    user.id.to_string(),
                    user.username,
                    user.password_hash,
                    user.password_salt,
                ],
            )
            .context("Failed to update user")?;

        if rows == 0 {
            anyhow::bail!("User not found");
        }
        Ok(())
    }
}

/// In-memory user store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<Vec<User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserStore for MemoryUserStore {
    fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .lock()
            .iter()
            .find(|u| u.email == email)
            .cloned())
    }

    fn find_by_id(&self, id: &Uuid) -> Result<Option<User>> {
        Ok(self.users.lock().iter().find(|u| &u.id == id).cloned())
    }

    fn insert(&self, user: &User) -> Result<()> {
        let mut users = self.users.lock();
        if users.iter().any(|u| u.email == user.email) {
            anyhow::bail!("Email already registered");
        }
        users.push(user.clone());
        Ok(())
    }

    fn update(&self, user: &User) -> Result<()> {
        let mut users = self.users.lock();
        match users.iter_mut().find(|u| u.id == user.id) {
            Some(existing) => {
                existing.username = user.username.clone();
                existing.password_hash = user.password_hash.clone();
                existing.password_salt = user.password_salt.clone();
                Ok(())
            }
            None => anyhow::bail!("User not found"),
        }
    }
}
