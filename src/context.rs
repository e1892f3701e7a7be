//! Engine assembly: one [`Context`] owns every component, built once
//! at startup and threaded from the top-level handlers. No
//! module-scoped mutable state anywhere.

use std::sync::Arc;

use crate::config::Config;
use crate::convo::ConversationEngine;
use crate::extract::Extractor;
use crate::oracle::ollama::{OllamaEmbedder, OllamaGenerator};
use crate::oracle::{Embedder, Generator};
use crate::outbox::reconcile::Reconciler;
use crate::outbox::{Drainer, Processor};
use crate::ratelimit::RateLimiter;
use crate::retrieval::RetrievalEngine;
use crate::store::graph::GraphStore;
use crate::store::relational::RelationalStore;
use crate::store::vector::VectorStore;
use crate::store::StoreError;

/// Everything a handler needs, wired once.
pub struct Context {
    /// Loaded configuration.
    pub config: Config,
    /// Relational adapter.
    pub relational: RelationalStore,
    /// Vector adapter.
    pub vector: VectorStore,
    /// Graph adapter.
    pub graph: GraphStore,
    /// The conversation engine.
    pub engine: Arc<ConversationEngine>,
    /// The outbox drainer (run it with a shutdown receiver).
    pub drainer: Arc<Drainer>,
    /// Per-client request limiter.
    pub limiter: Arc<RateLimiter>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

impl Context {
    /// Build the full engine from configuration, using the Ollama
    /// oracle implementations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub async fn build(config: Config) -> Result<Self, StoreError> {
        let embedder: Arc<dyn Embedder> = Arc::new(OllamaEmbedder::with_base_url(
            &config.oracles.embed_model,
            &config.oracles.base_url,
            config.stores.embedding_dim,
            config.oracles.embed_timeout(),
        ));
        let generator: Arc<dyn Generator> = Arc::new(OllamaGenerator::with_base_url(
            &config.oracles.generate_model,
            &config.oracles.base_url,
            config.oracles.generate_timeout(),
        ));
        Self::build_with_oracles(config, embedder, generator).await
    }

    /// Build the full engine with caller-supplied oracles (tests
    /// inject mocks here).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub async fn build_with_oracles(
        config: Config,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Result<Self, StoreError> {
        let pool = crate::store::open_pool(
            &config.stores.database_path,
            config.stores.max_connections,
        )
        .await?;

        let relational = RelationalStore::new(pool.clone());
        let vector = VectorStore::new(pool.clone(), config.stores.embedding_dim);
        let graph = GraphStore::new(pool);

        let extractor = Extractor::new(
            Some(Arc::clone(&generator)),
            config.oracles.extract_timeout(),
            config.extraction.strict,
        );

        let processor = Arc::new(Processor::new(
            relational.clone(),
            vector.clone(),
            graph.clone(),
            Arc::clone(&embedder),
            extractor,
            config.extraction.commit_threshold,
        ));
        let drainer = Arc::new(Drainer::new(
            relational.clone(),
            processor,
            config.outbox.clone(),
        ));

        let retrieval = RetrievalEngine::new(
            relational.clone(),
            vector.clone(),
            graph.clone(),
            Arc::clone(&embedder),
            Some(Arc::clone(&generator)),
            config.retrieval.clone(),
        );

        let engine = Arc::new(ConversationEngine::new(
            relational.clone(),
            retrieval,
            generator,
            Some(Arc::clone(&drainer)),
            config.conversation.clone(),
        ));

        let limiter = Arc::new(RateLimiter::new(
            config.ratelimit.requests_per_minute,
            config.ratelimit.max_clients,
        ));

        Ok(Self {
            config,
            relational,
            vector,
            graph,
            engine,
            drainer,
            limiter,
        })
    }

    /// A reconciler bound to this context's stores.
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.relational.clone(),
            self.graph.clone(),
            self.config.outbox.clone(),
        )
    }
}
