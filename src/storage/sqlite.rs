use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{Pool, Row, Sqlite, sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous}};
use tracing::warn;

use super::{FileLinkStore, MessageStore};
use crate::models::{ChatMessage, FileLink, LinkId, NewFile, Role, SessionId};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct SqliteContextStore {
    pool: Pool<Sqlite>,
}

impl SqliteContextStore {
    /// Opens (creating if needed) the context database and brings its schema
    /// up to date. Without a URL the database lives under the user's data dir.
    pub async fn initialize(database_url: Option<String>) -> anyhow::Result<Self> {
        let options = match database_url {
            Some(url) => url.parse::<SqliteConnectOptions>()?,
            None => SqliteConnectOptions::new().filename(default_database_path()?),
        }
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(BUSY_TIMEOUT);

        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> { &self.pool }
}

// $XDG_DATA_HOME/chat_context/context.db, falling back to ~/.local/share.
fn default_database_path() -> anyhow::Result<PathBuf> {
    let data_home = match std::env::var_os("XDG_DATA_HOME") {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from(std::env::var_os("HOME").unwrap_or_else(|| ".".into())).join(".local/share"),
    };
    let dir = data_home.join("chat_context");
    std::fs::create_dir_all(&dir)?;
    Ok(dir.join("context.db"))
}

// Fixed-width UTC so lexical order matches time order.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl MessageStore for SqliteContextStore {
    async fn append_message(&self, session_id: SessionId, message: &ChatMessage) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO chat_messages (session_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)")
            .bind(session_id)
            .bind(message.role().as_str())
            .bind(message.content())
            .bind(format_ts(message.timestamp()))
            .execute(&self.pool).await?;
        Ok(())
    }

    async fn load_recent_messages(&self, session_id: SessionId, limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT role, content, created_at FROM (
                SELECT id, role, content, created_at FROM chat_messages
                WHERE session_id = ?1
                ORDER BY created_at DESC, id DESC
                LIMIT ?2
            ) ORDER BY created_at ASC, id ASC",
        )
        .bind(session_id)
        .bind(i64::try_from(limit)?)
        .fetch_all(&self.pool)
        .await?;

        let messages = rows.into_iter().filter_map(|r| {
            let role: String = r.get("role");
            let content: String = r.get("content");
            let created_at: String = r.get("created_at");
            match role.parse::<Role>() {
                Ok(role) => Some(ChatMessage::with_timestamp(role, content, parse_ts(&created_at))),
                Err(e) => {
                    warn!(session_id, error = %e, "skipping stored message");
                    None
                }
            }
        }).collect();
        Ok(messages)
    }
}

#[async_trait]
impl FileLinkStore for SqliteContextStore {
    async fn load_file_links(&self, session_id: SessionId) -> anyhow::Result<Vec<FileLink>> {
        let rows = sqlx::query(
            "SELECT cfl.id, cfl.display_name, cfl.use_summary, cfl.is_excluded, cfl.order_index,
                    fd.name AS original_name, fd.content, fd.summary
             FROM context_file_links cfl
             JOIN file_data fd ON cfl.file_id = fd.id
             WHERE cfl.context_session_id = ?1
             ORDER BY cfl.order_index, cfl.id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let links = rows.into_iter().map(|r| FileLink {
            link_id: r.get("id"),
            display_name: r.get("display_name"),
            original_name: r.get("original_name"),
            content: r.try_get("content").ok().flatten(),
            summary: r.try_get("summary").ok().flatten(),
            use_summary: r.get::<i64, _>("use_summary") != 0,
            excluded: r.get::<i64, _>("is_excluded") != 0,
            order_index: r.get("order_index"),
        }).collect();
        Ok(links)
    }

    async fn add_file(&self, session_id: SessionId, file: NewFile) -> anyhow::Result<LinkId> {
        let mut tx = self.pool.begin().await?;
        let file_id = sqlx::query("INSERT INTO file_data (name, content, summary, created_at) VALUES (?1, ?2, ?3, ?4)")
            .bind(&file.original_name)
            .bind(&file.content)
            .bind(&file.summary)
            .bind(format_ts(Utc::now()))
            .execute(&mut *tx).await?
            .last_insert_rowid();
        let row = sqlx::query("SELECT COALESCE(MAX(order_index), -1) + 1 AS next FROM context_file_links WHERE context_session_id = ?1")
            .bind(session_id)
            .fetch_one(&mut *tx).await?;
        let order_index: i64 = row.get("next");
        let link_id = sqlx::query(
            "INSERT INTO context_file_links (context_session_id, file_id, display_name, use_summary, is_excluded, order_index)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        )
        .bind(session_id)
        .bind(file_id)
        .bind(&file.display_name)
        .bind(i64::from(file.use_summary))
        .bind(order_index)
        .execute(&mut *tx).await?
        .last_insert_rowid();
        tx.commit().await?;
        Ok(link_id)
    }

    async fn set_excluded(&self, session_id: SessionId, link_id: LinkId, excluded: bool) -> anyhow::Result<bool> {
        let res = sqlx::query("UPDATE context_file_links SET is_excluded = ?1 WHERE id = ?2 AND context_session_id = ?3")
            .bind(i64::from(excluded))
            .bind(link_id)
            .bind(session_id)
            .execute(&self.pool).await?;
        Ok(res.rows_affected() > 0)
    }

    async fn set_use_summary(&self, session_id: SessionId, link_id: LinkId, use_summary: bool) -> anyhow::Result<bool> {
        let res = sqlx::query("UPDATE context_file_links SET use_summary = ?1 WHERE id = ?2 AND context_session_id = ?3")
            .bind(i64::from(use_summary))
            .bind(link_id)
            .bind(session_id)
            .execute(&self.pool).await?;
        Ok(res.rows_affected() > 0)
    }

    async fn rename(&self, session_id: SessionId, link_id: LinkId, display_name: &str) -> anyhow::Result<bool> {
        let res = sqlx::query("UPDATE context_file_links SET display_name = ?1 WHERE id = ?2 AND context_session_id = ?3")
            .bind(display_name)
            .bind(link_id)
            .bind(session_id)
            .execute(&self.pool).await?;
        Ok(res.rows_affected() > 0)
    }

    async fn remove_link(&self, session_id: SessionId, link_id: LinkId) -> anyhow::Result<bool> {
        let res = sqlx::query("DELETE FROM context_file_links WHERE id = ?1 AND context_session_id = ?2")
            .bind(link_id)
            .bind(session_id)
            .execute(&self.pool).await?;
        Ok(res.rows_affected() > 0)
    }
}
