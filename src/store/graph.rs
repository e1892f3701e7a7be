//! Graph store adapter: typed entities and decaying weighted edges.
//!
//! Entities are keyed by `(user_id, id)` and edges by
//! `(user_id, source_id, target_id, kind)`. Merge semantics follow the
//! write path contract: repeated upserts are idempotent, weights take
//! the max, provenance accumulates. Traversal is a bounded BFS that
//! treats edges as bidirectional and scores them by effective
//! (time-decayed) weight at read time.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{EntityKind, GraphFact, Ir, IrEntity, IrRelation, RelationKind};

use super::{parse_ts, ts, StoreError};

/// Weights never decay below this floor.
pub const MIN_WEIGHT_FLOOR: f64 = 0.01;

/// Default per-day exponential decay constant for new edges.
pub const DEFAULT_DECAY_RATE: f64 = 0.03;

/// Maximum node expansions per BFS hop.
const MAX_EXPANSIONS_PER_HOP: usize = 50;

/// A stored entity row.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRow {
    /// Entity id (slug or hashed).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Closed entity kind.
    pub kind: EntityKind,
    /// How many memories mentioned this entity.
    pub mention_count: i64,
    /// First mention time; never overwritten by merges.
    pub first_mentioned_at: DateTime<Utc>,
    /// Most recent mention time.
    pub last_mentioned_at: DateTime<Utc>,
    /// Type-specific attributes.
    pub attrs: serde_json::Map<String, serde_json::Value>,
}

/// A stored edge row.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationRow {
    /// Source entity id.
    pub source_id: String,
    /// Target entity id.
    pub target_id: String,
    /// Edge kind.
    pub kind: RelationKind,
    /// Stored (undecayed) weight in `(0, 1]`.
    pub weight: f64,
    /// Per-day exponential decay constant.
    pub decay_rate: f64,
    /// Extraction confidence in `[0, 1]`.
    pub confidence: f64,
    /// Memory ids that evidenced this edge.
    pub provenance: Vec<Uuid>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write or refresh time; decay is measured from here.
    pub updated_at: DateTime<Utc>,
}

/// Compute an edge's effective weight at `at` without mutating it.
///
/// `max(floor, weight × exp(−decay_rate × days_since(updated_at)))`,
/// with fractional days so the value is continuous and monotone.
pub fn effective_weight(
    weight: f64,
    decay_rate: f64,
    updated_at: DateTime<Utc>,
    at: DateTime<Utc>,
) -> f64 {
    let elapsed = at.signed_duration_since(updated_at);
    if elapsed <= Duration::zero() {
        return weight.max(MIN_WEIGHT_FLOOR);
    }
    #[allow(clippy::cast_precision_loss)] // millisecond counts fit f64 comfortably
    let days = elapsed.num_milliseconds() as f64 / 86_400_000.0;
    (weight * (-decay_rate * days).exp()).max(MIN_WEIGHT_FLOOR)
}

type RelationSqlRow = (
    String,
    String,
    String,
    f64,
    f64,
    f64,
    String,
    String,
    String,
);

fn row_to_relation(row: RelationSqlRow) -> Result<RelationRow, StoreError> {
    let (source_id, target_id, kind, weight, decay_rate, confidence, provenance, created, updated) =
        row;
    let kind = RelationKind::parse(&kind).ok_or_else(|| StoreError::InvalidEnum {
        field: "relation_kind",
        value: kind.clone(),
    })?;
    let provenance: Vec<String> =
        serde_json::from_str(&provenance).map_err(|source| StoreError::CorruptJson {
            column: "provenance",
            source,
        })?;
    Ok(RelationRow {
        source_id,
        target_id,
        kind,
        weight,
        decay_rate,
        confidence,
        provenance: provenance
            .iter()
            .filter_map(|s| Uuid::parse_str(s).ok())
            .collect(),
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
    })
}

/// Narrow adapter over the `graph_entities` and `graph_relations`
/// tables.
#[derive(Debug, Clone)]
pub struct GraphStore {
    pool: SqlitePool,
}

impl GraphStore {
    /// Wrap an open pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Merge a whole IR for one user inside a single transaction.
    ///
    /// Entities go first so every relation endpoint exists; relations
    /// carry `memory_id` in their provenance. Self-loops are skipped
    /// defensively even though the critic already drops them.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub async fn merge_ir(
        &self,
        user_id: &str,
        ir: &Ir,
        memory_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for entity in &ir.entities {
            merge_entity_on(&mut tx, user_id, entity, now).await?;
        }
        for relation in &ir.relations {
            if relation.source_id == relation.target_id {
                warn!(
                    source = %relation.source_id,
                    "skipping self-loop relation at merge"
                );
                continue;
            }
            merge_relation_on(&mut tx, user_id, relation, memory_id, now).await?;
        }
        tx.commit().await?;
        debug!(
            user = user_id,
            entities = ir.entities.len(),
            relations = ir.relations.len(),
            "graph merge committed"
        );
        Ok(())
    }

    /// Merge a single entity (outside any transaction).
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub async fn merge_entity(
        &self,
        user_id: &str,
        entity: &IrEntity,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        merge_entity_on(&mut conn, user_id, entity, now).await
    }

    /// Merge a single relation (outside any transaction).
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub async fn merge_relation(
        &self,
        user_id: &str,
        relation: &IrRelation,
        memory_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        merge_relation_on(&mut conn, user_id, relation, memory_id, now).await
    }

    /// Fetch one entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row is corrupt.
    pub async fn get_entity(
        &self,
        user_id: &str,
        id: &str,
    ) -> Result<Option<EntityRow>, StoreError> {
        let row: Option<(String, String, String, i64, String, String, String)> = sqlx::query_as(
            "SELECT id, name, kind, mention_count, first_mentioned_at, last_mentioned_at, attrs \
             FROM graph_entities WHERE user_id = ?1 AND id = ?2",
        )
        .bind(user_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(id, name, kind, mention_count, first, last, attrs)| {
            let kind = EntityKind::parse(&kind).ok_or_else(|| StoreError::InvalidEnum {
                field: "entity_kind",
                value: kind.clone(),
            })?;
            Ok(EntityRow {
                id,
                name,
                kind,
                mention_count,
                first_mentioned_at: parse_ts(&first)?,
                last_mentioned_at: parse_ts(&last)?,
                attrs: serde_json::from_str(&attrs).map_err(|source| StoreError::CorruptJson {
                    column: "attrs",
                    source,
                })?,
            })
        })
        .transpose()
    }

    /// All edges touching an entity, in either direction.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub async fn neighbors(
        &self,
        user_id: &str,
        entity_id: &str,
    ) -> Result<Vec<RelationRow>, StoreError> {
        let rows: Vec<RelationSqlRow> = sqlx::query_as(
            "SELECT source_id, target_id, kind, weight, decay_rate, confidence, provenance, \
                    created_at, updated_at \
             FROM graph_relations \
             WHERE user_id = ?1 AND (source_id = ?2 OR target_id = ?2)",
        )
        .bind(user_id)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_relation).collect()
    }

    /// Bounded multi-hop traversal from name-matched anchor entities.
    ///
    /// Anchors match entities whose name equals or contains the query
    /// token (ASCII case-insensitive; exact containment for CJK).
    /// Edges are walked in both directions, expansion is capped per
    /// hop, node visits are deduplicated, and each surfaced fact
    /// carries the edge's effective weight at `now`. Facts are ordered
    /// hop-first, then by descending weight.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails or a row is corrupt.
    pub async fn query_paths(
        &self,
        user_id: &str,
        anchors: &[String],
        max_hops: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<GraphFact>, StoreError> {
        let mut frontier: Vec<String> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut names: HashMap<String, String> = HashMap::new();

        for anchor in anchors {
            let token = anchor.trim();
            if token.is_empty() {
                continue;
            }
            // A name matches when it contains the anchor (English
            // queries name the entity) or the anchor contains the name
            // (CJK queries arrive as unsegmented clauses). LIKE is
            // ASCII-case-insensitive; CJK compares exactly.
            let pattern = format!("%{token}%");
            let rows: Vec<(String, String)> = sqlx::query_as(
                "SELECT id, name FROM graph_entities \
                 WHERE user_id = ?1 \
                   AND (name LIKE ?2 OR ?3 LIKE '%' || name || '%')",
            )
            .bind(user_id)
            .bind(&pattern)
            .bind(token)
            .fetch_all(&self.pool)
            .await?;
            for (id, name) in rows {
                if visited.insert(id.clone()) {
                    names.insert(id.clone(), name);
                    frontier.push(id);
                }
            }
        }

        if frontier.is_empty() {
            return Ok(Vec::new());
        }

        let mut facts: Vec<GraphFact> = Vec::new();
        let mut seen_edges: HashSet<(String, String, RelationKind)> = HashSet::new();

        for hop in 1..=max_hops {
            let mut next: Vec<String> = Vec::new();
            for node in frontier.iter().take(MAX_EXPANSIONS_PER_HOP) {
                let mut edges = self.neighbors(user_id, node).await?;
                // Strongest edges first so the expansion cap keeps the
                // most relevant paths.
                edges.sort_by(|a, b| {
                    let wa = effective_weight(a.weight, a.decay_rate, a.updated_at, now);
                    let wb = effective_weight(b.weight, b.decay_rate, b.updated_at, now);
                    wb.partial_cmp(&wa).unwrap_or(std::cmp::Ordering::Equal)
                });

                for edge in edges {
                    let key = (edge.source_id.clone(), edge.target_id.clone(), edge.kind);
                    if !seen_edges.insert(key) {
                        continue;
                    }
                    let other = if &edge.source_id == node {
                        edge.target_id.clone()
                    } else {
                        edge.source_id.clone()
                    };
                    let source_name = self.entity_name(user_id, &edge.source_id, &mut names).await?;
                    let target_name = self.entity_name(user_id, &edge.target_id, &mut names).await?;
                    facts.push(GraphFact {
                        entity_id: edge.source_id.clone(),
                        entity_name: source_name,
                        relation: edge.kind,
                        target_id: edge.target_id.clone(),
                        target_name,
                        hop,
                        weight: effective_weight(edge.weight, edge.decay_rate, edge.updated_at, now),
                        provenance: edge.provenance.clone(),
                    });
                    if visited.insert(other.clone()) {
                        next.push(other);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        facts.sort_by(|a, b| {
            a.hop.cmp(&b.hop).then(
                b.weight
                    .partial_cmp(&a.weight)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });
        Ok(facts)
    }

    /// Apply decay to every edge untouched for at least one day.
    ///
    /// Pages through the table (`page_size` rows at a time), writes the
    /// decayed weight back, and touches `updated_at` so a row is
    /// processed at most once per run. Returns the number of edges
    /// updated.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails.
    pub async fn apply_decay(&self, page_size: usize, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = now
            .checked_sub_signed(Duration::days(1))
            .unwrap_or(now);
        let page = i64::try_from(page_size).unwrap_or(1000);
        let mut total: u64 = 0;

        loop {
            let rows: Vec<(String, String, String, String, f64, f64, String)> = sqlx::query_as(
                "SELECT user_id, source_id, target_id, kind, weight, decay_rate, updated_at \
                 FROM graph_relations WHERE updated_at < ?1 LIMIT ?2",
            )
            .bind(ts(cutoff))
            .bind(page)
            .fetch_all(&self.pool)
            .await?;
            if rows.is_empty() {
                break;
            }

            for (user_id, source_id, target_id, kind, weight, decay_rate, updated_at) in rows {
                let updated_at = parse_ts(&updated_at)?;
                let decayed = effective_weight(weight, decay_rate, updated_at, now);
                sqlx::query(
                    "UPDATE graph_relations SET weight = ?1, updated_at = ?2 \
                     WHERE user_id = ?3 AND source_id = ?4 AND target_id = ?5 AND kind = ?6",
                )
                .bind(decayed)
                .bind(ts(now))
                .bind(&user_id)
                .bind(&source_id)
                .bind(&target_id)
                .bind(&kind)
                .execute(&self.pool)
                .await?;
                total = total.saturating_add(1);
            }
        }

        debug!(updated = total, "edge decay pass complete");
        Ok(total)
    }

    /// Number of edges stored for a user (test helper).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count_relations(&self, user_id: &str) -> Result<u64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM graph_relations WHERE user_id = ?1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.cast_unsigned())
    }

    /// Number of entities stored for a user (test helper).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count_entities(&self, user_id: &str) -> Result<u64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM graph_entities WHERE user_id = ?1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.cast_unsigned())
    }

    async fn entity_name(
        &self,
        user_id: &str,
        id: &str,
        cache: &mut HashMap<String, String>,
    ) -> Result<String, StoreError> {
        if let Some(name) = cache.get(id) {
            return Ok(name.clone());
        }
        let row: Option<(String,)> =
            sqlx::query_as("SELECT name FROM graph_entities WHERE user_id = ?1 AND id = ?2")
                .bind(user_id)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        let name = row.map_or_else(|| id.to_owned(), |(n,)| n);
        cache.insert(id.to_owned(), name.clone());
        Ok(name)
    }
}

async fn merge_entity_on(
    conn: &mut SqliteConnection,
    user_id: &str,
    entity: &IrEntity,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let attrs = serde_json::Value::Object(entity.attrs.clone()).to_string();
    sqlx::query(
        "INSERT INTO graph_entities \
         (user_id, id, name, kind, mention_count, first_mentioned_at, last_mentioned_at, attrs) \
         VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5, ?6) \
         ON CONFLICT(user_id, id) DO UPDATE SET \
             mention_count = graph_entities.mention_count + 1, \
             last_mentioned_at = excluded.last_mentioned_at, \
             attrs = json_patch(graph_entities.attrs, excluded.attrs)",
    )
    .bind(user_id)
    .bind(&entity.id)
    .bind(&entity.name)
    .bind(entity.kind.as_str())
    .bind(ts(now))
    .bind(attrs)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn merge_relation_on(
    conn: &mut SqliteConnection,
    user_id: &str,
    relation: &IrRelation,
    memory_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let weight = relation.weight.unwrap_or(1.0).clamp(MIN_WEIGHT_FLOOR, 1.0);

    let existing: Option<(f64, f64, String)> = sqlx::query_as(
        "SELECT weight, confidence, provenance FROM graph_relations \
         WHERE user_id = ?1 AND source_id = ?2 AND target_id = ?3 AND kind = ?4",
    )
    .bind(user_id)
    .bind(&relation.source_id)
    .bind(&relation.target_id)
    .bind(relation.kind.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    match existing {
        Some((old_weight, old_confidence, provenance)) => {
            let mut ids: Vec<String> =
                serde_json::from_str(&provenance).map_err(|source| StoreError::CorruptJson {
                    column: "provenance",
                    source,
                })?;
            if let Some(memory_id) = memory_id {
                let id = memory_id.to_string();
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            sqlx::query(
                "UPDATE graph_relations \
                 SET weight = ?1, confidence = ?2, provenance = ?3, updated_at = ?4 \
                 WHERE user_id = ?5 AND source_id = ?6 AND target_id = ?7 AND kind = ?8",
            )
            .bind(old_weight.max(weight))
            .bind(old_confidence.max(relation.confidence))
            .bind(serde_json::to_string(&ids).unwrap_or_else(|_| "[]".to_owned()))
            .bind(ts(now))
            .bind(user_id)
            .bind(&relation.source_id)
            .bind(&relation.target_id)
            .bind(relation.kind.as_str())
            .execute(&mut *conn)
            .await?;
        }
        None => {
            let ids: Vec<String> = memory_id.map(|id| id.to_string()).into_iter().collect();
            let provenance = serde_json::to_string(&ids).unwrap_or_else(|_| "[]".to_owned());
            sqlx::query(
                "INSERT INTO graph_relations \
                 (user_id, source_id, target_id, kind, weight, decay_rate, confidence, \
                  provenance, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            )
            .bind(user_id)
            .bind(&relation.source_id)
            .bind(&relation.target_id)
            .bind(relation.kind.as_str())
            .bind(weight)
            .bind(DEFAULT_DECAY_RATE)
            .bind(relation.confidence)
            .bind(provenance)
            .bind(ts(now))
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}
