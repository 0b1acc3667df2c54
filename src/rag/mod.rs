pub mod memory;
pub mod repository;
pub mod similarity;
pub mod sqlite;
pub mod store;
pub mod types;

pub use memory::InMemoryKnowledgeRepository;
pub use repository::KnowledgeRepository;
pub use sqlite::SqliteKnowledgeRepository;
pub use store::{KnowledgeStore, PassageRetriever};
pub use types::{
    KnowledgeDraft, KnowledgeItem, KnowledgePage, KnowledgePatch, KnowledgeStats,
    RetrievedPassage, TagsInput,
};
