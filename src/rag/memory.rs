use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::repository::KnowledgeRepository;
use super::types::{KnowledgeItem, StoredItem};
use crate::core::errors::ApiError;

/// Process-local repository for tests and `knowledge.backend: memory`.
#[derive(Default)]
pub struct InMemoryKnowledgeRepository {
    items: RwLock<HashMap<String, StoredItem>>,
    dimension: RwLock<Option<usize>>,
}

impl InMemoryKnowledgeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted_items(&self, category: Option<&str>) -> Vec<KnowledgeItem> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        let mut selected: Vec<KnowledgeItem> = items
            .values()
            .filter(|stored| category.map_or(true, |c| stored.item.category == c))
            .map(|stored| stored.item.clone())
            .collect();
        selected.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        selected
    }
}

#[async_trait]
impl KnowledgeRepository for InMemoryKnowledgeRepository {
    async fn put(&self, record: &StoredItem) -> Result<(), ApiError> {
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        let mut record = record.clone();
        if let Some(existing) = items.get(&record.item.id) {
            record.item.created_at = existing.item.created_at;
        }
        items.insert(record.item.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<StoredItem>, ApiError> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        Ok(items.get(id).cloned())
    }

    async fn delete_many(&self, ids: &[String]) -> Result<usize, ApiError> {
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        Ok(ids.iter().filter(|id| items.remove(*id).is_some()).count())
    }

    async fn list(
        &self,
        category: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<KnowledgeItem>, usize), ApiError> {
        let all = self.sorted_items(category);
        let total = all.len();
        Ok((all.into_iter().skip(offset).take(limit).collect(), total))
    }

    async fn scan(&self) -> Result<Vec<StoredItem>, ApiError> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        Ok(items.values().cloned().collect())
    }

    async fn items(&self) -> Result<Vec<KnowledgeItem>, ApiError> {
        Ok(self.sorted_items(None))
    }

    async fn count(&self) -> Result<usize, ApiError> {
        Ok(self.items.read().unwrap_or_else(|e| e.into_inner()).len())
    }

    async fn embedding_dimension(&self) -> Result<Option<usize>, ApiError> {
        Ok(*self.dimension.read().unwrap_or_else(|e| e.into_inner()))
    }

    async fn set_embedding_dimension(&self, dimension: usize) -> Result<(), ApiError> {
        *self.dimension.write().unwrap_or_else(|e| e.into_inner()) = Some(dimension);
        Ok(())
    }

    async fn clear(&self) -> Result<(), ApiError> {
        self.items.write().unwrap_or_else(|e| e.into_inner()).clear();
        *self.dimension.write().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}
