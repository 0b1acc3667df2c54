use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use super::repository::KnowledgeRepository;
use super::similarity::rank;
use super::types::{
    KnowledgeDraft, KnowledgeItem, KnowledgePage, KnowledgePatch, KnowledgeStats,
    RetrievedPassage, StoredItem, TagCount, DEFAULT_CATEGORY,
};
use crate::core::errors::ApiError;
use crate::core::locks::KeyedLocks;
use crate::llm::EmbeddingGateway;

const POPULAR_TAG_LIMIT: usize = 10;
const MAX_PAGE_SIZE: usize = 200;

/// Read side of the corpus as the context assembler sees it.
#[async_trait]
pub trait PassageRetriever: Send + Sync {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedPassage>, ApiError>;
}

/// Owns the corpus. Every mutation goes through here so embeddings always
/// match content and writes on one id never overlap.
pub struct KnowledgeStore {
    repo: Arc<dyn KnowledgeRepository>,
    embedder: Arc<dyn EmbeddingGateway>,
    item_locks: KeyedLocks,
    configured_dimension: Option<usize>,
    committed_dimension: AsyncMutex<Option<usize>>,
}

impl KnowledgeStore {
    pub fn new(repo: Arc<dyn KnowledgeRepository>, embedder: Arc<dyn EmbeddingGateway>) -> Self {
        Self {
            repo,
            embedder,
            item_locks: KeyedLocks::new(),
            configured_dimension: None,
            committed_dimension: AsyncMutex::new(None),
        }
    }

    pub fn with_dimension(mut self, dimension: Option<usize>) -> Self {
        self.configured_dimension = dimension;
        self
    }

    /// New item with a generated id, or an upsert when the draft names one.
    pub async fn create(&self, draft: KnowledgeDraft) -> Result<KnowledgeItem, ApiError> {
        self.upsert(draft).await
    }

    pub async fn upsert(&self, draft: KnowledgeDraft) -> Result<KnowledgeItem, ApiError> {
        let title = required("title", &draft.title)?;
        let content = required("content", &draft.content)?;
        let id = match draft.id.as_deref().map(str::trim) {
            Some("") => return Err(ApiError::invalid("id must not be empty")),
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };

        let _guard = self.item_locks.lock(&id).await;
        let existing = self.repo.get(&id).await?;
        let now = Utc::now();

        let embedding = match &existing {
            Some(prior) if prior.item.content == content => prior.embedding.clone(),
            _ => self.embed_content(&content).await?,
        };

        let item = KnowledgeItem {
            id,
            title,
            content,
            category: normalize_category(draft.category.as_deref()),
            tags: draft.tags.normalize(),
            created_at: existing.as_ref().map_or(now, |prior| prior.item.created_at),
            updated_at: now,
        };
        self.commit(StoredItem { item, embedding }).await
    }

    pub async fn update(&self, id: &str, patch: KnowledgePatch) -> Result<KnowledgeItem, ApiError> {
        let _guard = self.item_locks.lock(id).await;
        let existing = self
            .repo
            .get(id)
            .await?
            .ok_or_else(|| ApiError::ItemNotFound(id.to_string()))?;

        let mut item = existing.item.clone();
        if let Some(title) = &patch.title {
            item.title = required("title", title)?;
        }
        if let Some(category) = &patch.category {
            item.category = normalize_category(Some(category));
        }
        if let Some(tags) = &patch.tags {
            item.tags = tags.normalize();
        }

        let mut embedding = existing.embedding;
        if let Some(content) = &patch.content {
            let content = required("content", content)?;
            if content != item.content {
                embedding = self.embed_content(&content).await?;
                item.content = content;
            }
        }
        item.updated_at = Utc::now();

        self.commit(StoredItem { item, embedding }).await
    }

    pub async fn get(&self, id: &str) -> Result<KnowledgeItem, ApiError> {
        self.repo
            .get(id)
            .await?
            .map(|stored| stored.item)
            .ok_or_else(|| ApiError::ItemNotFound(id.to_string()))
    }

    pub async fn delete(&self, id: &str) -> Result<usize, ApiError> {
        self.batch_delete(&[id.to_string()]).await
    }

    /// Returns how many of the ids were actually removed.
    pub async fn batch_delete(&self, ids: &[String]) -> Result<usize, ApiError> {
        let mut seen = HashSet::new();
        let unique: Vec<String> = ids
            .iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect();
        if unique.is_empty() {
            return Ok(0);
        }

        let _guards = self.item_locks.lock_many(&unique).await;
        let removed = self.repo.delete_many(&unique).await?;
        tracing::info!(requested = unique.len(), removed, "Deleted knowledge items");
        Ok(removed)
    }

    pub async fn list(
        &self,
        category: Option<&str>,
        page: usize,
        page_size: usize,
    ) -> Result<KnowledgePage, ApiError> {
        if page == 0 {
            return Err(ApiError::invalid("page must be at least 1"));
        }
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(ApiError::invalid(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        let category = category.map(str::trim).filter(|c| !c.is_empty());
        let offset = (page - 1) * page_size;
        let (items, total) = self.repo.list(category, offset, page_size).await?;
        Ok(KnowledgePage {
            items,
            total,
            page,
            page_size,
            total_pages: total.div_ceil(page_size),
        })
    }

    /// Top `top_k` items by cosine similarity to `query`.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedPassage>, ApiError> {
        if top_k < 1 {
            return Err(ApiError::invalid("top_k must be at least 1"));
        }
        let query = query.trim();
        if query.is_empty() {
            return Err(ApiError::invalid("query must not be empty"));
        }

        let candidates = self.repo.scan().await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let query_embedding = self.embedder.embed_one(query).await?;
        if let Some(expected) = self.expected_dimension().await? {
            if query_embedding.len() != expected {
                return Err(dimension_mismatch(expected, query_embedding.len()));
            }
        }

        let passages: Vec<RetrievedPassage> = rank(&query_embedding, &candidates, top_k)
            .into_iter()
            .map(|(stored, score)| RetrievedPassage::from_item(&stored.item, score))
            .collect();
        tracing::debug!(top_k, returned = passages.len(), "Knowledge search");
        Ok(passages)
    }

    pub async fn stats(&self) -> Result<KnowledgeStats, ApiError> {
        let items = self.repo.items().await?;

        let mut categories: BTreeMap<String, usize> = BTreeMap::new();
        let mut tag_counts: HashMap<&str, usize> = HashMap::new();
        let mut total_size_bytes = 0usize;
        for item in &items {
            total_size_bytes += item.title.len() + item.content.len();
            *categories.entry(item.category.clone()).or_default() += 1;
            for tag in &item.tags {
                *tag_counts.entry(tag.as_str()).or_default() += 1;
            }
        }

        let mut popular_tags: Vec<TagCount> = tag_counts
            .into_iter()
            .map(|(tag, count)| TagCount {
                tag: tag.to_string(),
                count,
            })
            .collect();
        popular_tags.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tag.cmp(&b.tag)));
        popular_tags.truncate(POPULAR_TAG_LIMIT);

        Ok(KnowledgeStats {
            total_count: items.len(),
            total_size_bytes,
            distinct_categories: categories.len(),
            categories,
            popular_tags,
        })
    }

    pub async fn categories(&self) -> Result<Vec<String>, ApiError> {
        Ok(self.stats().await?.categories.into_keys().collect())
    }

    /// Empties the corpus and forgets the committed dimension.
    pub async fn reset(&self) -> Result<(), ApiError> {
        let mut committed = self.committed_dimension.lock().await;
        self.repo.clear().await?;
        *committed = None;
        tracing::warn!("Knowledge corpus cleared");
        Ok(())
    }

    async fn embed_content(&self, content: &str) -> Result<Vec<f32>, ApiError> {
        let embedding = self.embedder.embed_one(content).await?;
        if embedding.is_empty() {
            return Err(ApiError::EmbeddingUnavailable("empty embedding".into()));
        }
        Ok(embedding)
    }

    async fn expected_dimension(&self) -> Result<Option<usize>, ApiError> {
        if self.configured_dimension.is_some() {
            return Ok(self.configured_dimension);
        }
        let mut committed = self.committed_dimension.lock().await;
        if committed.is_none() {
            *committed = self.repo.embedding_dimension().await?;
        }
        Ok(*committed)
    }

    /// Checks the vector width against the deployment's and writes the row.
    async fn commit(&self, record: StoredItem) -> Result<KnowledgeItem, ApiError> {
        let actual = record.embedding.len();
        {
            let mut committed = self.committed_dimension.lock().await;
            if committed.is_none() {
                *committed = self.repo.embedding_dimension().await?;
            }
            let expected = self.configured_dimension.or(*committed);
            match expected {
                Some(expected) if expected != actual => {
                    return Err(dimension_mismatch(expected, actual));
                }
                Some(_) => {}
                None => {
                    self.repo.set_embedding_dimension(actual).await?;
                    *committed = Some(actual);
                    tracing::info!(dimension = actual, "Embedding dimension locked in");
                }
            }
        }

        self.repo.put(&record).await?;
        tracing::debug!(id = %record.item.id, "Knowledge item committed");
        Ok(record.item)
    }
}

#[async_trait]
impl PassageRetriever for KnowledgeStore {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedPassage>, ApiError> {
        self.search(query, top_k).await
    }
}

fn required(field: &str, value: &str) -> Result<String, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::invalid(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

fn normalize_category(category: Option<&str>) -> String {
    match category.map(str::trim) {
        Some(c) if !c.is_empty() => c.to_string(),
        _ => DEFAULT_CATEGORY.to_string(),
    }
}

fn dimension_mismatch(expected: usize, actual: usize) -> ApiError {
    ApiError::EmbeddingUnavailable(format!(
        "embedding dimension {actual} does not match the corpus dimension {expected}"
    ))
}
