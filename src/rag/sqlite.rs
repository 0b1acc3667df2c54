//! SQLite-backed knowledge repository.
//!
//! Items and their embeddings share one row so an item is never visible
//! without its vector. Similarity is brute-force in `similarity::rank`.

use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use super::repository::KnowledgeRepository;
use super::types::{KnowledgeItem, StoredItem};
use crate::core::errors::ApiError;

const DIMENSION_KEY: &str = "embedding_dimension";

pub struct SqliteKnowledgeRepository {
    pool: SqlitePool,
}

impl SqliteKnowledgeRepository {
    pub async fn with_path(db_path: PathBuf) -> Result<Self, ApiError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(ApiError::internal)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await?;

        let repo = Self { pool };
        repo.init_schema().await?;
        tracing::info!("Knowledge database ready at {}", db_path.display());
        Ok(repo)
    }

    async fn init_schema(&self) -> Result<(), ApiError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS knowledge_items (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                category TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                embedding BLOB NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_knowledge_category ON knowledge_items(category)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_knowledge_created ON knowledge_items(created_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kb_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> Result<KnowledgeItem, ApiError> {
        let tags_text: String = row.try_get("tags")?;
        let tags: BTreeSet<String> = serde_json::from_str(&tags_text).unwrap_or_default();
        Ok(KnowledgeItem {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            content: row.try_get("content")?,
            category: row.try_get("category")?,
            tags,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
            updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
        })
    }

    fn row_to_stored(row: &sqlx::sqlite::SqliteRow) -> Result<StoredItem, ApiError> {
        let blob: Vec<u8> = row.try_get("embedding")?;
        Ok(StoredItem {
            item: Self::row_to_item(row)?,
            embedding: Self::deserialize_embedding(&blob),
        })
    }
}

/// Fixed-width UTC text so lexical order matches time order.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| ApiError::Internal(format!("bad timestamp '{text}': {e}")))
}

#[async_trait]
impl KnowledgeRepository for SqliteKnowledgeRepository {
    async fn put(&self, record: &StoredItem) -> Result<(), ApiError> {
        let item = &record.item;
        let tags = serde_json::to_string(&item.tags).map_err(ApiError::internal)?;

        sqlx::query(
            "INSERT INTO knowledge_items (id, title, content, category, tags, embedding, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                content = excluded.content,
                category = excluded.category,
                tags = excluded.tags,
                embedding = excluded.embedding,
                updated_at = excluded.updated_at",
        )
        .bind(&item.id)
        .bind(&item.title)
        .bind(&item.content)
        .bind(&item.category)
        .bind(&tags)
        .bind(Self::serialize_embedding(&record.embedding))
        .bind(format_timestamp(&item.created_at))
        .bind(format_timestamp(&item.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<StoredItem>, ApiError> {
        let row = sqlx::query("SELECT * FROM knowledge_items WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_stored).transpose()
    }

    async fn delete_many(&self, ids: &[String]) -> Result<usize, ApiError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut removed = 0usize;
        for id in ids {
            let result = sqlx::query("DELETE FROM knowledge_items WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn list(
        &self,
        category: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<KnowledgeItem>, usize), ApiError> {
        let columns = "id, title, content, category, tags, created_at, updated_at";
        let (rows, total) = match category {
            Some(category) => {
                let rows = sqlx::query(&format!(
                    "SELECT {columns} FROM knowledge_items WHERE category = ?1
                     ORDER BY created_at DESC, id ASC LIMIT ?2 OFFSET ?3"
                ))
                .bind(category)
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?;
                let total: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM knowledge_items WHERE category = ?1")
                        .bind(category)
                        .fetch_one(&self.pool)
                        .await?;
                (rows, total)
            }
            None => {
                let rows = sqlx::query(&format!(
                    "SELECT {columns} FROM knowledge_items
                     ORDER BY created_at DESC, id ASC LIMIT ?1 OFFSET ?2"
                ))
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?;
                let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM knowledge_items")
                    .fetch_one(&self.pool)
                    .await?;
                (rows, total)
            }
        };

        let items = rows
            .iter()
            .map(Self::row_to_item)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((items, total.max(0) as usize))
    }

    async fn scan(&self) -> Result<Vec<StoredItem>, ApiError> {
        let rows = sqlx::query("SELECT * FROM knowledge_items")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_stored).collect()
    }

    async fn items(&self) -> Result<Vec<KnowledgeItem>, ApiError> {
        let rows = sqlx::query(
            "SELECT id, title, content, category, tags, created_at, updated_at
             FROM knowledge_items ORDER BY created_at DESC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_item).collect()
    }

    async fn count(&self) -> Result<usize, ApiError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM knowledge_items")
            .fetch_one(&self.pool)
            .await?;
        Ok(total.max(0) as usize)
    }

    async fn embedding_dimension(&self) -> Result<Option<usize>, ApiError> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM kb_meta WHERE key = ?1")
            .bind(DIMENSION_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    async fn set_embedding_dimension(&self, dimension: usize) -> Result<(), ApiError> {
        sqlx::query(
            "INSERT INTO kb_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                updated_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')",
        )
        .bind(DIMENSION_KEY)
        .bind(dimension.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), ApiError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM knowledge_items")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM kb_meta WHERE key = ?1")
            .bind(DIMENSION_KEY)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(id: &str, category: &str, age_secs: i64, embedding: Vec<f32>) -> StoredItem {
        let created_at = Utc::now() - Duration::seconds(age_secs);
        StoredItem {
            item: KnowledgeItem {
                id: id.to_string(),
                title: format!("title {id}"),
                content: format!("content {id}"),
                category: category.to_string(),
                tags: ["a".to_string(), "b".to_string()].into_iter().collect(),
                created_at,
                updated_at: created_at,
            },
            embedding,
        }
    }

    async fn open_temp() -> (tempfile::TempDir, SqliteKnowledgeRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = SqliteKnowledgeRepository::with_path(dir.path().join("knowledge.db"))
            .await
            .unwrap();
        (dir, repo)
    }

    #[tokio::test]
    async fn put_get_roundtrips_embedding_and_tags() {
        let (_dir, repo) = open_temp().await;
        let original = record("k1", "faq", 0, vec![0.25, -1.5, 3.0]);
        repo.put(&original).await.unwrap();

        let loaded = repo.get("k1").await.unwrap().unwrap();
        assert_eq!(loaded.embedding, original.embedding);
        assert_eq!(loaded.item.tags, original.item.tags);
        assert_eq!(
            format_timestamp(&loaded.item.created_at),
            format_timestamp(&original.item.created_at)
        );
    }

    #[tokio::test]
    async fn put_replaces_content_but_keeps_created_at() {
        let (_dir, repo) = open_temp().await;
        let first = record("k1", "faq", 60, vec![1.0, 0.0]);
        repo.put(&first).await.unwrap();

        let mut second = record("k1", "faq", 0, vec![0.0, 1.0]);
        second.item.content = "new".to_string();
        repo.put(&second).await.unwrap();

        let loaded = repo.get("k1").await.unwrap().unwrap();
        assert_eq!(loaded.item.content, "new");
        assert_eq!(loaded.embedding, vec![0.0, 1.0]);
        assert_eq!(
            format_timestamp(&loaded.item.created_at),
            format_timestamp(&first.item.created_at)
        );
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_pages_newest_first_with_category_filter() {
        let (_dir, repo) = open_temp().await;
        repo.put(&record("old", "faq", 30, vec![1.0])).await.unwrap();
        repo.put(&record("mid", "policy", 20, vec![1.0])).await.unwrap();
        repo.put(&record("new", "faq", 10, vec![1.0])).await.unwrap();

        let (page, total) = repo.list(None, 0, 2).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(
            page.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            vec!["new", "mid"]
        );

        let (faq, faq_total) = repo.list(Some("faq"), 1, 10).await.unwrap();
        assert_eq!(faq_total, 2);
        assert_eq!(faq[0].id, "old");
    }

    #[tokio::test]
    async fn delete_many_counts_only_existing_rows() {
        let (_dir, repo) = open_temp().await;
        repo.put(&record("a", "faq", 0, vec![1.0])).await.unwrap();
        repo.put(&record("b", "faq", 0, vec![1.0])).await.unwrap();

        let removed = repo
            .delete_many(&["a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(repo.get("a").await.unwrap().is_none());
        assert_eq!(repo.scan().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dimension_is_recorded_and_cleared() {
        let (_dir, repo) = open_temp().await;
        assert_eq!(repo.embedding_dimension().await.unwrap(), None);

        repo.set_embedding_dimension(768).await.unwrap();
        assert_eq!(repo.embedding_dimension().await.unwrap(), Some(768));

        repo.put(&record("a", "faq", 0, vec![1.0])).await.unwrap();
        repo.clear().await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 0);
        assert_eq!(repo.embedding_dimension().await.unwrap(), None);
    }
}
