//! Hybrid retrieval: dense vector recall fused with symbolic graph
//! traversal.
//!
//! The two branches run as a structured fork-join with independent
//! deadlines; a slow or failing branch degrades to empty rather than
//! failing the turn. Both channels honor memory status: deprecated
//! memories are dropped from the vector hits, and graph facts whose
//! only evidence is a deprecated memory are dropped with them, so a
//! superseded opinion disappears from the whole read path at once.

pub mod query;
pub mod rerank;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::oracle::{Embedder, Generator};
use crate::store::graph::GraphStore;
use crate::store::relational::{MemoryStatus, RelationalStore};
use crate::store::vector::{VectorHit, VectorStore};
use crate::types::GraphFact;

pub use self::rerank::RankedMemory;

/// What retrieval produced for one query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalResult {
    /// Ranked memories for the prompt's memory section.
    pub memories: Vec<RankedMemory>,
    /// Structured graph facts for the prompt's facts section.
    pub facts: Vec<GraphFact>,
    /// Raw vector hit count before filtering (observability).
    pub vector_hits: usize,
}

/// Hybrid retrieval engine over the three stores and the two oracles.
pub struct RetrievalEngine {
    relational: RelationalStore,
    vector: VectorStore,
    graph: GraphStore,
    embedder: Arc<dyn Embedder>,
    generator: Option<Arc<dyn Generator>>,
    config: RetrievalConfig,
}

impl std::fmt::Debug for RetrievalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetrievalEngine {
    /// Assemble the engine.
    pub fn new(
        relational: RelationalStore,
        vector: VectorStore,
        graph: GraphStore,
        embedder: Arc<dyn Embedder>,
        generator: Option<Arc<dyn Generator>>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            relational,
            vector,
            graph,
            embedder,
            generator,
            config,
        }
    }

    /// Hybrid retrieve: vector recall and graph traversal in parallel,
    /// fused by the unified rerank.
    ///
    /// Branch failures and timeouts degrade to empty results. For the
    /// graph-only context budget, call [`retrieve_entity_facts`]
    /// instead; it never touches the embedding oracle.
    ///
    /// [`retrieve_entity_facts`]: RetrievalEngine::retrieve_entity_facts
    pub async fn hybrid_retrieve(
        &self,
        user_id: &str,
        query_text: &str,
        affinity_score: f64,
        now: DateTime<Utc>,
    ) -> RetrievalResult {
        let is_question = crate::extract::rules::is_question(query_text);
        let branch_timeout = self.config.branch_timeout();

        let vector_branch = async {
            match tokio::time::timeout(branch_timeout, self.vector_search(user_id, query_text))
                .await
            {
                Ok(hits) => hits,
                Err(_) => {
                    warn!("vector branch timed out");
                    Vec::new()
                }
            }
        };

        let graph_branch = async {
            match tokio::time::timeout(branch_timeout, self.graph_facts(user_id, query_text, now))
                .await
            {
                Ok(facts) => facts,
                Err(_) => {
                    warn!("graph branch timed out");
                    Vec::new()
                }
            }
        };

        let (hits, facts) = tokio::join!(vector_branch, graph_branch);
        let vector_hits = hits.len();

        let hits = self.filter_retrievable(user_id, hits).await;
        let memories = rerank::rerank(&hits, &facts, affinity_score, is_question, now, &self.config);

        debug!(
            user = user_id,
            vector_hits,
            graph_facts = facts.len(),
            ranked = memories.len(),
            "hybrid retrieval complete"
        );

        RetrievalResult {
            memories,
            facts,
            vector_hits,
        }
    }

    /// Graph-only entity facts for a query (the prompt's facts list).
    ///
    /// This is the whole retrieval step for graph-only turns: no query
    /// embedding, no vector search, just the bounded traversal under
    /// the branch deadline.
    pub async fn retrieve_entity_facts(
        &self,
        user_id: &str,
        query_text: &str,
        now: DateTime<Utc>,
    ) -> Vec<GraphFact> {
        match tokio::time::timeout(
            self.config.branch_timeout(),
            self.graph_facts(user_id, query_text, now),
        )
        .await
        {
            Ok(facts) => facts,
            Err(_) => {
                warn!("entity fact retrieval timed out");
                Vec::new()
            }
        }
    }

    async fn vector_search(&self, user_id: &str, query_text: &str) -> Vec<VectorHit> {
        let query_vector = match self.embedder.embed(query_text).await {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "query embedding failed");
                return Vec::new();
            }
        };
        match self
            .vector
            .search(user_id, &query_vector, self.config.top_k_vec)
            .await
        {
            Ok(hits) => hits,
            Err(err) => {
                warn!(error = %err, "vector search failed");
                Vec::new()
            }
        }
    }

    async fn graph_facts(&self, user_id: &str, query_text: &str, now: DateTime<Utc>) -> Vec<GraphFact> {
        let mut anchors = query::extract_entities(query_text);
        if anchors.is_empty() {
            if let Some(generator) = &self.generator {
                match query::extract_entities_oracle(
                    generator.as_ref(),
                    query_text,
                    self.config.branch_timeout(),
                )
                .await
                {
                    Ok(oracle_anchors) => anchors = oracle_anchors,
                    Err(err) => {
                        warn!(error = %err, "oracle query-entity extraction failed");
                    }
                }
            }
        }
        anchors.extend(query::semantic_expansions(query_text));

        if anchors.is_empty() {
            return Vec::new();
        }

        let facts = match self
            .graph
            .query_paths(user_id, &anchors, self.config.max_hops, now)
            .await
        {
            Ok(facts) => facts,
            Err(err) => {
                warn!(error = %err, "graph traversal failed");
                return Vec::new();
            }
        };
        self.filter_live_facts(user_id, facts).await
    }

    /// Drop facts whose only evidence has been deprecated or deleted.
    ///
    /// Conflict supersession deprecates the losing memory row; its
    /// edges keep their provenance, so this is where the superseded
    /// opinion stops reaching the prompt. Facts with no provenance at
    /// all (seeded or synthesized edges) are kept, as is anything
    /// still backed by at least one live memory.
    async fn filter_live_facts(&self, user_id: &str, facts: Vec<GraphFact>) -> Vec<GraphFact> {
        let unique: HashSet<Uuid> = facts
            .iter()
            .flat_map(|f| f.provenance.iter().copied())
            .collect();
        if unique.is_empty() {
            return facts;
        }
        let ids: Vec<Uuid> = unique.into_iter().collect();
        let records = match self.relational.get_memories(user_id, &ids).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "fact provenance lookup failed; keeping all facts");
                return facts;
            }
        };
        let live: HashSet<Uuid> = records
            .iter()
            .filter(|m| matches!(m.status, MemoryStatus::Pending | MemoryStatus::Committed))
            .map(|m| m.id)
            .collect();
        facts
            .into_iter()
            .filter(|f| f.provenance.is_empty() || f.provenance.iter().any(|id| live.contains(id)))
            .collect()
    }

    /// Drop hits whose memory has been deprecated or deleted, so the
    /// conflict-resolution outcome is visible on the read path.
    async fn filter_retrievable(&self, user_id: &str, hits: Vec<VectorHit>) -> Vec<VectorHit> {
        if hits.is_empty() {
            return hits;
        }
        let ids: Vec<Uuid> = hits.iter().map(|h| h.memory_id).collect();
        let records = match self.relational.get_memories(user_id, &ids).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "memory status lookup failed; keeping all hits");
                return hits;
            }
        };
        let retrievable: HashSet<Uuid> = records
            .iter()
            .filter(|m| {
                matches!(m.status, MemoryStatus::Pending | MemoryStatus::Committed)
            })
            .map(|m| m.id)
            .collect();
        hits.into_iter()
            .filter(|h| retrievable.contains(&h.memory_id))
            .collect()
    }
}
