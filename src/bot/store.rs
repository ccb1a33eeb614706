//! Persistent SQLite store for users, dialogs and usage counters.
//!
//! Dialog turns live in a single JSON column that callers read and replace
//! wholesale; there is no partial-append primitive. Per-user exclusivity in
//! the serializer keeps that read-modify-write safe.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::bot::dialog::Turn;
use crate::bot::usage::TokenUsage;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Registration must precede any other access.
    #[error("user {0} is not registered")]
    UnknownUser(i64),
    #[error("user {0} has no current dialog")]
    NoCurrentDialog(i64),
    #[error("dialog {0} not found")]
    UnknownDialog(String),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("corrupt turn data: {0}")]
    Json(#[from] serde_json::Error),
}

/// A registered user.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: i64,
    pub chat_id: i64,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub last_interaction: DateTime<Utc>,
    pub current_dialog_id: Option<String>,
    pub current_chat_mode: String,
    pub current_model: String,
    pub n_generated_images: u64,
    pub n_transcribed_seconds: f64,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// In-memory store, used by tests.
    pub fn new() -> Self {
        let conn = Connection::open_in_memory().expect("Failed to create in-memory database");
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema();
        store
    }

    pub fn load_or_new(path: &Path) -> Self {
        let conn = Connection::open(path).expect("Failed to open database");
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema();

        let n_users: i64 = store
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap_or(0);
        info!("Loaded store from {:?} ({} users)", path, n_users);

        store
    }

    fn init_schema(&self) {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                chat_id INTEGER NOT NULL,
                username TEXT,
                first_name TEXT NOT NULL,
                last_name TEXT,
                first_seen TEXT NOT NULL,
                last_interaction TEXT NOT NULL,
                current_dialog_id TEXT,
                current_chat_mode TEXT NOT NULL,
                current_model TEXT NOT NULL,
                n_generated_images INTEGER NOT NULL DEFAULT 0,
                n_transcribed_seconds REAL NOT NULL DEFAULT 0.0
            );

            CREATE TABLE IF NOT EXISTS usage (
                user_id INTEGER NOT NULL,
                model TEXT NOT NULL,
                n_input_tokens INTEGER NOT NULL DEFAULT 0,
                n_output_tokens INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, model)
            );

            CREATE TABLE IF NOT EXISTS dialogs (
                dialog_id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                chat_mode TEXT NOT NULL,
                model TEXT NOT NULL,
                start_time TEXT NOT NULL,
                turns TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_dialogs_user_id ON dialogs(user_id);
            "#,
        )
        .expect("Failed to initialize database schema");
    }

    pub fn user_exists(&self, user_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM users WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn ensure_user(conn: &Connection, user_id: i64) -> Result<(), StoreError> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM users WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        if found.is_some() {
            Ok(())
        } else {
            Err(StoreError::UnknownUser(user_id))
        }
    }

    /// Register a user on first contact. Returns true if the user was new.
    #[allow(clippy::too_many_arguments)]
    pub fn add_new_user(
        &self,
        user_id: i64,
        chat_id: i64,
        username: Option<&str>,
        first_name: &str,
        last_name: Option<&str>,
        chat_mode: &str,
        model: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users
                 (user_id, chat_id, username, first_name, last_name,
                  first_seen, last_interaction, current_chat_mode, current_model)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?8)",
            params![user_id, chat_id, username, first_name, last_name, now, chat_mode, model],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_user(&self, user_id: i64) -> Result<UserRecord, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT user_id, chat_id, username, first_name, last_name,
                    last_interaction, current_dialog_id, current_chat_mode,
                    current_model, n_generated_images, n_transcribed_seconds
             FROM users WHERE user_id = ?1",
            params![user_id],
            |row| {
                let last_interaction: String = row.get(5)?;
                Ok(UserRecord {
                    user_id: row.get(0)?,
                    chat_id: row.get(1)?,
                    username: row.get(2)?,
                    first_name: row.get(3)?,
                    last_name: row.get(4)?,
                    last_interaction: DateTime::parse_from_rfc3339(&last_interaction)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    current_dialog_id: row.get(6)?,
                    current_chat_mode: row.get(7)?,
                    current_model: row.get(8)?,
                    n_generated_images: row.get::<_, i64>(9)? as u64,
                    n_transcribed_seconds: row.get(10)?,
                })
            },
        )
        .optional()?
        .ok_or(StoreError::UnknownUser(user_id))
    }

    pub fn set_last_interaction(&self, user_id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_user(&conn, user_id)?;
        conn.execute(
            "UPDATE users SET last_interaction = ?2 WHERE user_id = ?1",
            params![user_id, at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_chat_mode(&self, user_id: i64, chat_mode: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_user(&conn, user_id)?;
        conn.execute(
            "UPDATE users SET current_chat_mode = ?2 WHERE user_id = ?1",
            params![user_id, chat_mode],
        )?;
        Ok(())
    }

    pub fn set_model(&self, user_id: i64, model: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_user(&conn, user_id)?;
        conn.execute(
            "UPDATE users SET current_model = ?2 WHERE user_id = ?1",
            params![user_id, model],
        )?;
        Ok(())
    }

    /// Create a fresh dialog snapshotting the user's current chat mode and
    /// model, and make it current.
    pub fn start_new_dialog(&self, user_id: i64) -> Result<String, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_user(&conn, user_id)?;

        let (chat_mode, model): (String, String) = conn.query_row(
            "SELECT current_chat_mode, current_model FROM users WHERE user_id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let dialog_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO dialogs (dialog_id, user_id, chat_mode, model, start_time, turns)
             VALUES (?1, ?2, ?3, ?4, ?5, '[]')",
            params![dialog_id, user_id, chat_mode, model, Utc::now().to_rfc3339()],
        )?;
        conn.execute(
            "UPDATE users SET current_dialog_id = ?2 WHERE user_id = ?1",
            params![user_id, dialog_id],
        )?;

        Ok(dialog_id)
    }

    fn resolve_dialog_id(
        conn: &Connection,
        user_id: i64,
        dialog_id: Option<&str>,
    ) -> Result<String, StoreError> {
        match dialog_id {
            Some(id) => Ok(id.to_string()),
            None => conn
                .query_row(
                    "SELECT current_dialog_id FROM users WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get::<_, Option<String>>(0),
                )?
                .ok_or(StoreError::NoCurrentDialog(user_id)),
        }
    }

    /// Read the full turn sequence of a dialog (current dialog by default).
    pub fn get_turns(&self, user_id: i64, dialog_id: Option<&str>) -> Result<Vec<Turn>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_user(&conn, user_id)?;
        let dialog_id = Self::resolve_dialog_id(&conn, user_id, dialog_id)?;

        let turns_json: String = conn
            .query_row(
                "SELECT turns FROM dialogs WHERE dialog_id = ?1 AND user_id = ?2",
                params![dialog_id, user_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::UnknownDialog(dialog_id))?;

        Ok(serde_json::from_str(&turns_json)?)
    }

    /// Replace the full turn sequence of a dialog (current dialog by default).
    pub fn replace_turns(
        &self,
        user_id: i64,
        dialog_id: Option<&str>,
        turns: &[Turn],
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_user(&conn, user_id)?;
        let dialog_id = Self::resolve_dialog_id(&conn, user_id, dialog_id)?;

        let turns_json = serde_json::to_string(turns)?;
        let updated = conn.execute(
            "UPDATE dialogs SET turns = ?3 WHERE dialog_id = ?1 AND user_id = ?2",
            params![dialog_id, user_id, turns_json],
        )?;
        if updated == 0 {
            return Err(StoreError::UnknownDialog(dialog_id));
        }
        Ok(())
    }

    /// Additively merge token counts into the per-model counters.
    pub fn record_usage(
        &self,
        user_id: i64,
        model: &str,
        usage: TokenUsage,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_user(&conn, user_id)?;
        conn.execute(
            "INSERT INTO usage (user_id, model, n_input_tokens, n_output_tokens)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, model) DO UPDATE SET
                n_input_tokens = n_input_tokens + excluded.n_input_tokens,
                n_output_tokens = n_output_tokens + excluded.n_output_tokens",
            params![
                user_id,
                model,
                usage.n_input_tokens as i64,
                usage.n_output_tokens as i64
            ],
        )?;
        Ok(())
    }

    /// Per-model usage totals, sorted by model key.
    pub fn usage_summary(&self, user_id: i64) -> Result<Vec<(String, TokenUsage)>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_user(&conn, user_id)?;
        let mut stmt = conn.prepare(
            "SELECT model, n_input_tokens, n_output_tokens FROM usage
             WHERE user_id = ?1 ORDER BY model",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                TokenUsage::new(row.get::<_, i64>(1)? as u64, row.get::<_, i64>(2)? as u64),
            ))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn add_generated_images(&self, user_id: i64, n: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_user(&conn, user_id)?;
        conn.execute(
            "UPDATE users SET n_generated_images = n_generated_images + ?2 WHERE user_id = ?1",
            params![user_id, n as i64],
        )?;
        Ok(())
    }

    pub fn add_transcribed_seconds(&self, user_id: i64, seconds: f64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_user(&conn, user_id)?;
        conn.execute(
            "UPDATE users SET n_transcribed_seconds = n_transcribed_seconds + ?2 WHERE user_id = ?1",
            params![user_id, seconds],
        )?;
        Ok(())
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
