use std::sync::Arc;

use crate::bots::BotRegistry;
use crate::chat::{ChatService, EngineConfig, Sampling};
use crate::context::{AssemblerConfig, ContextAssembler};
use crate::core::config::{AppPaths, AppSettings, ConfigService, KnowledgeBackend};
use crate::history::SessionStore;
use crate::llm::{EmbeddingGateway, Gateways, GenerationGateway};
use crate::rag::{
    InMemoryKnowledgeRepository, KnowledgeRepository, KnowledgeStore, PassageRetriever,
    SqliteKnowledgeRepository,
};
use crate::rules::RuleLibrary;

pub mod error;

use error::InitializationError;

/// Application state shared by every route.
///
/// Settings are read once at startup; configuration edits made through the
/// API apply on the next start.
#[derive(Clone)]
pub struct AppState {
    pub config: ConfigService,
    pub settings: Arc<AppSettings>,
    pub generation: Arc<dyn GenerationGateway>,
    pub embedding: Arc<dyn EmbeddingGateway>,
    pub knowledge: Arc<KnowledgeStore>,
    pub bots: BotRegistry,
    pub rules: RuleLibrary,
    pub sessions: Arc<SessionStore>,
    pub chat: Arc<ChatService>,
}

impl AppState {
    /// Opens the stores and wires the chat pipeline around `gateways`.
    pub async fn build(
        paths: Arc<AppPaths>,
        config: ConfigService,
        settings: AppSettings,
        gateways: Gateways,
    ) -> Result<Arc<Self>, InitializationError> {
        let repo: Arc<dyn KnowledgeRepository> = match settings.knowledge.backend {
            KnowledgeBackend::Sqlite => Arc::new(
                SqliteKnowledgeRepository::with_path(paths.knowledge_db_path.clone())
                    .await
                    .map_err(|e| InitializationError::Knowledge(e.into()))?,
            ),
            KnowledgeBackend::Memory => Arc::new(InMemoryKnowledgeRepository::new()),
        };
        let knowledge = Arc::new(
            KnowledgeStore::new(repo, gateways.embedding.clone())
                .with_dimension(settings.knowledge.embedding_dimension),
        );

        let sessions = Arc::new(
            SessionStore::open(paths.sessions_db_path.clone())
                .await
                .map_err(|e| InitializationError::Sessions(e.into()))?,
        );
        let bots = BotRegistry::with_path(paths.bots_path.clone());
        let rules = RuleLibrary::with_path(paths.rules_path.clone());

        let retriever: Arc<dyn PassageRetriever> = knowledge.clone();
        let assembler = Arc::new(ContextAssembler::new(
            retriever,
            AssemblerConfig::from(&settings.retrieval),
        ));
        let chat = Arc::new(
            ChatService::new(
                bots.clone(),
                sessions.clone(),
                assembler,
                gateways.generation.clone(),
                EngineConfig::from(&settings.chat),
            )
            .with_sampling(Sampling {
                temperature: settings.llm.temperature,
                max_tokens: settings.llm.max_tokens,
            })
            .with_rules(rules.clone()),
        );

        Ok(Arc::new(AppState {
            config,
            settings: Arc::new(settings),
            generation: gateways.generation,
            embedding: gateways.embedding,
            knowledge,
            bots,
            rules,
            sessions,
            chat,
        }))
    }
}
