use async_trait::async_trait;

use super::types::{KnowledgeItem, StoredItem};
use crate::core::errors::ApiError;

/// Persistence seam under `KnowledgeStore`. Implementations only store and
/// fetch; embedding, validation and locking live in the store.
#[async_trait]
pub trait KnowledgeRepository: Send + Sync {
    /// Insert or replace the item and its embedding in one commit.
    async fn put(&self, record: &StoredItem) -> Result<(), ApiError>;

    async fn get(&self, id: &str) -> Result<Option<StoredItem>, ApiError>;

    /// Returns how many of `ids` existed.
    async fn delete_many(&self, ids: &[String]) -> Result<usize, ApiError>;

    /// Newest first, ties by id. Returns the page and the filtered total.
    async fn list(
        &self,
        category: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<KnowledgeItem>, usize), ApiError>;

    /// Every item with its embedding, for brute-force scoring.
    async fn scan(&self) -> Result<Vec<StoredItem>, ApiError>;

    async fn items(&self) -> Result<Vec<KnowledgeItem>, ApiError>;

    async fn count(&self) -> Result<usize, ApiError>;

    async fn embedding_dimension(&self) -> Result<Option<usize>, ApiError>;

    async fn set_embedding_dimension(&self, dimension: usize) -> Result<(), ApiError>;

    /// Drops every item and the recorded dimension.
    async fn clear(&self) -> Result<(), ApiError>;
}
