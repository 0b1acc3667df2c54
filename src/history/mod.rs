//! Conversation histories keyed by session id.
//!
//! Mutations on one session are serialized; different sessions never wait on
//! each other. Storage is best-effort: an unreadable database file is moved
//! aside and replaced, and read failures surface as empty results.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::core::errors::ApiError;
use crate::core::locks::KeyedLocks;
use crate::llm::{ChatMessage, Role};

const TITLE_MAX_CHARS: usize = 50;
const PREVIEW_MAX_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn now(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

impl From<&ConversationMessage> for ChatMessage {
    fn from(message: &ConversationMessage) -> Self {
        ChatMessage::new(message.role, message.content.clone())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub message_count: usize,
    pub preview: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatSession {
    pub id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub messages: Vec<ConversationMessage>,
}

pub struct SessionStore {
    pool: SqlitePool,
    locks: KeyedLocks,
    persistent: bool,
}

impl SessionStore {
    /// Opens the store at `db_path`. A corrupt file is moved aside; if a fresh
    /// file cannot be created either, the store runs in memory.
    pub async fn open(db_path: PathBuf) -> Result<Self, ApiError> {
        match Self::connect_file(&db_path).await {
            Ok(store) => return Ok(store),
            Err(err) => tracing::warn!(
                "Session database at {} is unreadable: {}",
                db_path.display(),
                err
            ),
        }

        if db_path.exists() {
            let aside = sidecar(&db_path, ".corrupt");
            match std::fs::rename(&db_path, &aside) {
                Ok(()) => tracing::warn!("Moved unreadable session database to {}", aside.display()),
                Err(err) => tracing::warn!("Could not move session database aside: {}", err),
            }
            for suffix in ["-wal", "-shm"] {
                let _ = std::fs::remove_file(sidecar(&db_path, suffix));
            }
            match Self::connect_file(&db_path).await {
                Ok(store) => return Ok(store),
                Err(err) => tracing::warn!("Fresh session database failed too: {}", err),
            }
        }

        tracing::warn!("Falling back to in-memory session storage");
        Self::in_memory().await
    }

    pub async fn in_memory() -> Result<Self, ApiError> {
        let options = SqliteConnectOptions::new().in_memory(true).foreign_keys(true);
        // one connection: every connection would get its own private database
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, false).await
    }

    async fn connect_file(db_path: &Path) -> Result<Self, ApiError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(ApiError::internal)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, true).await
    }

    async fn with_pool(pool: SqlitePool, persistent: bool) -> Result<Self, ApiError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                title TEXT,
                created_at TEXT NOT NULL,
                last_message_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, seq)")
            .execute(&pool)
            .await?;

        Ok(Self {
            pool,
            locks: KeyedLocks::new(),
            persistent,
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub async fn create(&self, title: Option<String>) -> Result<String, ApiError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = timestamp(&Utc::now());
        let title = title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());

        sqlx::query("INSERT INTO sessions (id, title, created_at, last_message_at) VALUES (?1, ?2, ?3, ?3)")
            .bind(&id)
            .bind(title)
            .bind(&now)
            .execute(&self.pool)
            .await?;

        tracing::debug!(session_id = %id, "Session created");
        Ok(id)
    }

    pub async fn exists(&self, id: &str) -> Result<bool, ApiError> {
        let found: Option<String> = sqlx::query_scalar("SELECT id FROM sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn get(&self, id: &str) -> Result<ChatSession, ApiError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::SessionNotFound(id.to_string()))?;

        let rows = sqlx::query(
            "SELECT role, content, created_at FROM messages WHERE session_id = ?1 ORDER BY seq ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ChatSession {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?),
            last_message_at: parse_timestamp(&row.try_get::<String, _>("last_message_at")?),
            messages: rows.iter().filter_map(row_to_message).collect(),
        })
    }

    /// Most recently active first. Read failures yield an empty list.
    pub async fn list(&self) -> Vec<SessionSummary> {
        match self.try_list().await {
            Ok(sessions) => sessions,
            Err(err) => {
                tracing::warn!("Listing sessions failed, returning none: {}", err);
                Vec::new()
            }
        }
    }

    async fn try_list(&self) -> Result<Vec<SessionSummary>, ApiError> {
        let rows = sqlx::query(
            "SELECT s.id, s.title, s.created_at, s.last_message_at,
                    COUNT(m.seq) AS message_count,
                    (SELECT content FROM messages WHERE session_id = s.id ORDER BY seq DESC LIMIT 1) AS preview
             FROM sessions s
             LEFT JOIN messages m ON m.session_id = s.id
             GROUP BY s.id
             ORDER BY s.last_message_at DESC, s.created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<SessionSummary, ApiError> {
                let preview: Option<String> = row.try_get("preview")?;
                Ok(SessionSummary {
                    id: row.try_get("id")?,
                    title: row.try_get("title")?,
                    created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?),
                    last_message_at: parse_timestamp(&row.try_get::<String, _>("last_message_at")?),
                    message_count: row.try_get::<i64, _>("message_count")?.max(0) as usize,
                    preview: preview.map(|p| truncate_chars(&p, PREVIEW_MAX_CHARS)),
                })
            })
            .collect()
    }

    /// The last `limit` messages in order, as prompt history.
    pub async fn history(&self, id: &str, limit: Option<usize>) -> Result<Vec<ChatMessage>, ApiError> {
        if !self.exists(id).await? {
            return Err(ApiError::SessionNotFound(id.to_string()));
        }
        let limit = limit.map_or(-1, |l| l as i64);
        let rows = sqlx::query(
            "SELECT role, content, created_at FROM (
                SELECT seq, role, content, created_at FROM messages
                WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2
             ) ORDER BY seq ASC",
        )
        .bind(id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(row_to_message)
            .map(|m| ChatMessage::from(&m))
            .collect())
    }

    pub async fn append(&self, id: &str, message: ConversationMessage) -> Result<(), ApiError> {
        self.append_all(id, std::slice::from_ref(&message)).await
    }

    /// Appends `messages` contiguously. Nothing else can append to this
    /// session in between.
    pub async fn append_all(&self, id: &str, messages: &[ConversationMessage]) -> Result<(), ApiError> {
        if messages.is_empty() {
            return Ok(());
        }
        let _guard = self.locks.lock(id).await;
        let mut tx = self.pool.begin().await?;

        let title: Option<Option<String>> =
            sqlx::query_scalar("SELECT title FROM sessions WHERE id = ?1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(title) = title else {
            return Err(ApiError::SessionNotFound(id.to_string()));
        };

        let mut last = Utc::now();
        for message in messages {
            sqlx::query(
                "INSERT INTO messages (session_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(timestamp(&message.timestamp))
            .execute(&mut *tx)
            .await?;
            last = last.max(message.timestamp);
        }

        let derived = title
            .is_none()
            .then(|| messages.iter().find(|m| m.role == Role::User))
            .flatten()
            .map(|m| derive_title(&m.content))
            .filter(|t| !t.is_empty());

        sqlx::query(
            "UPDATE sessions SET last_message_at = ?2, title = COALESCE(title, ?3) WHERE id = ?1",
        )
        .bind(id)
        .bind(timestamp(&last))
        .bind(derived)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn rename(&self, id: &str, title: &str) -> Result<(), ApiError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ApiError::invalid("title must not be empty"));
        }
        let _guard = self.locks.lock(id).await;
        let result = sqlx::query("UPDATE sessions SET title = ?2 WHERE id = ?1")
            .bind(id)
            .bind(title)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), ApiError> {
        let _guard = self.locks.lock(id).await;
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::SessionNotFound(id.to_string()));
        }
        tracing::debug!(session_id = %id, "Session deleted");
        Ok(())
    }

    pub async fn clear_all(&self) -> Result<usize, ApiError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages").execute(&mut *tx).await?;
        let result = sqlx::query("DELETE FROM sessions").execute(&mut *tx).await?;
        tx.commit().await?;
        tracing::info!(removed = result.rows_affected(), "All sessions cleared");
        Ok(result.rows_affected() as usize)
    }

    /// Session to resume on reload. Read failures yield `None`.
    pub async fn most_recent(&self) -> Option<String> {
        let found: Result<Option<String>, sqlx::Error> = sqlx::query_scalar(
            "SELECT id FROM sessions ORDER BY last_message_at DESC, created_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await;
        found.unwrap_or_else(|err| {
            tracing::warn!("Looking up the most recent session failed: {}", err);
            None
        })
    }
}

fn row_to_message(row: &SqliteRow) -> Option<ConversationMessage> {
    let role: String = row.try_get("role").ok()?;
    Some(ConversationMessage {
        role: Role::parse(&role)?,
        content: row.try_get("content").ok()?,
        timestamp: parse_timestamp(&row.try_get::<String, _>("created_at").ok()?),
    })
}

fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_default()
}

fn sidecar(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn truncate_chars(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max).collect();
    out.push('…');
    out
}

fn derive_title(first_user_message: &str) -> String {
    let single_line = first_user_message
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    truncate_chars(&single_line, TITLE_MAX_CHARS)
}
