use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::Username;

/// Local persistence for the authenticated session.
///
/// Only the token and username survive a restart; conversations, typing and
/// unread state are always rebuilt from the service.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub token: String,
    pub username: Username,
    pub saved_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url '{database_url}'"))?
            .create_if_missing(true);
        // A single connection keeps `sqlite::memory:` databases coherent.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open session database '{database_url}'"))?;
        let storage = Self { pool };
        storage.ensure_session_table().await?;
        Ok(storage)
    }

    async fn ensure_session_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS client_session (
                slot     INTEGER PRIMARY KEY CHECK (slot = 1),
                token    TEXT NOT NULL,
                username TEXT NOT NULL,
                saved_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure client_session table exists")?;
        Ok(())
    }

    pub async fn save_session(&self, token: &str, username: &Username) -> Result<()> {
        sqlx::query(
            "INSERT INTO client_session (slot, token, username, saved_at) VALUES (1, ?, ?, ?)
             ON CONFLICT(slot) DO UPDATE SET
                token = excluded.token,
                username = excluded.username,
                saved_at = excluded.saved_at",
        )
        .bind(token)
        .bind(username.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to persist session")?;
        Ok(())
    }

    pub async fn load_session(&self) -> Result<Option<StoredSession>> {
        let row = sqlx::query("SELECT token, username, saved_at FROM client_session WHERE slot = 1")
            .fetch_optional(&self.pool)
            .await
            .context("failed to load persisted session")?;
        row.map(|row| -> Result<StoredSession> {
            Ok(StoredSession {
                token: row.try_get("token")?,
                username: Username::new(row.try_get::<String, _>("username")?),
                saved_at: row.try_get("saved_at")?,
            })
        })
        .transpose()
    }

    pub async fn clear_session(&self) -> Result<()> {
        sqlx::query("DELETE FROM client_session")
            .execute(&self.pool)
            .await
            .context("failed to clear persisted session")?;
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
