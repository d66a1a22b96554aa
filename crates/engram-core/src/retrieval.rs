//! Context, similarity, and associative retrieval over the tier stores

use crate::store::{MemoryStore, TierStores};
use crate::types::{MemoryId, MemoryItem, MemoryQuery, MemoryTier, RetrievalContext};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Per-tier result limit when the retrieval context leaves it unset
const DEFAULT_CONTEXT_LIMIT: usize = 50;

/// Per-tier, per-hop result limit for associative expansion
const ASSOCIATION_HOP_LIMIT: usize = 50;

/// Tokens shorter than this are not harvested as concepts
const MIN_CONCEPT_TOKEN_LEN: usize = 3;

/// Similarity weights: tag overlap, token overlap, temporal proximity
const TAG_WEIGHT: f32 = 0.4;
const TOKEN_WEIGHT: f32 = 0.4;
const TEMPORAL_WEIGHT: f32 = 0.2;

/// Days after which temporal proximity reaches zero
const TEMPORAL_WINDOW_DAYS: f64 = 30.0;

/// A record of one context retrieval, kept for observability
#[derive(Debug, Clone)]
pub struct RetrievalRecord {
    /// When the retrieval ran
    pub timestamp: DateTime<Utc>,
    /// The context it ran with
    pub context: RetrievalContext,
    /// Tiers it queried
    pub tiers: Vec<MemoryTier>,
    /// Number of items returned
    pub result_count: usize,
}

/// Retrieval engine over the tier stores
pub struct RetrievalEngine {
    stores: TierStores,
    history: Arc<RwLock<Vec<RetrievalRecord>>>,
}

impl RetrievalEngine {
    /// Create a new retrieval engine
    pub fn new(stores: TierStores) -> Self {
        Self {
            stores,
            history: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Retrieve memories relevant to a context
    ///
    /// Every returned item is touched: its access count is bumped and its
    /// last-accessed time refreshed, persisted through the store. Touch
    /// writes racing each other are last-writer-wins on the two counters,
    /// which is accepted; a failed touch is logged and the item is still
    /// returned. Results are merged across tiers and sorted by
    /// `(importance desc, access_count desc)`.
    pub async fn retrieve_by_context(
        &self,
        context: &RetrievalContext,
        tiers: Option<&[MemoryTier]>,
    ) -> Vec<MemoryItem> {
        let tiers: Vec<MemoryTier> = tiers.unwrap_or(&MemoryTier::ALL).to_vec();
        let query = build_context_query(context);

        let mut all_results = Vec::new();
        for &tier in &tiers {
            let store = self.stores.get(tier);
            let results = match store.search(&query).await {
                Ok(results) => results,
                Err(e) => {
                    warn!(tier = tier.name(), error = %e, "context search failed");
                    continue;
                }
            };

            for mut item in results {
                item.touch();
                if let Err(e) = store.update(item.clone()).await {
                    warn!(id = %item.id, error = %e, "failed to persist access touch");
                }
                all_results.push(item);
            }
        }

        all_results.sort_by(|a, b| {
            b.importance()
                .partial_cmp(&a.importance())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.access_count.cmp(&a.access_count))
        });

        let record = RetrievalRecord {
            timestamp: Utc::now(),
            context: context.clone(),
            tiers,
            result_count: all_results.len(),
        };
        debug!(
            results = record.result_count,
            keywords = ?context.keywords,
            "context retrieval"
        );
        self.history.write().await.push(record);

        all_results
    }

    /// Retrieve items of the reference's tier similar to it
    ///
    /// Similarity is a weighted blend of tag overlap, token overlap (when
    /// both contents are text), and temporal proximity of creation times.
    pub async fn retrieve_similar(
        &self,
        reference: &MemoryItem,
        threshold: f32,
    ) -> Vec<MemoryItem> {
        let store = self.stores.get(reference.tier());
        let candidates = match store.list(0, usize::MAX).await {
            Ok(items) => items,
            Err(e) => {
                warn!(tier = reference.tier().name(), error = %e, "similarity scan failed");
                return Vec::new();
            }
        };

        let mut scored: Vec<(MemoryItem, f32)> = candidates
            .into_iter()
            .filter(|item| item.id != reference.id)
            .filter_map(|item| {
                let score = similarity(reference, &item);
                (score >= threshold).then_some((item, score))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(item, _)| item).collect()
    }

    /// Retrieve memories by associative expansion from seed concepts
    ///
    /// Breadth-first: each hop searches every tier for items tagged with
    /// any concept in the current frontier, then harvests the results'
    /// tags and long text tokens as the next frontier, minus everything
    /// already visited. Each hop keeps at most [`ASSOCIATION_HOP_LIMIT`]
    /// items per tier, most important first. Stops when the frontier
    /// empties or after `max_depth` hops.
    pub async fn retrieve_by_association(
        &self,
        seed_concepts: &[String],
        max_depth: usize,
    ) -> Vec<MemoryItem> {
        let mut visited: HashSet<String> = seed_concepts.iter().cloned().collect();
        let mut frontier: HashSet<String> = visited.clone();
        let mut collected: Vec<MemoryItem> = Vec::new();

        for _ in 0..max_depth {
            if frontier.is_empty() {
                break;
            }

            let mut hop_results = Vec::new();
            for (tier, store) in self.stores.iter() {
                // Any frontier concept may match, so query per concept and
                // merge; a store query ANDs its tags together.
                let mut tier_results = Vec::new();
                for concept in &frontier {
                    let query = MemoryQuery::new().tag(concept.clone()).limit(ASSOCIATION_HOP_LIMIT);
                    match store.search(&query).await {
                        Ok(results) => tier_results.extend(results),
                        Err(e) => {
                            warn!(tier = tier.name(), error = %e, "association search failed")
                        }
                    }
                }

                // The merged per-concept results share one per-tier hop
                // budget; keep the most important ones.
                let mut seen_ids: HashSet<MemoryId> = HashSet::new();
                tier_results.retain(|item| seen_ids.insert(item.id.clone()));
                tier_results.sort_by(|a, b| {
                    b.importance()
                        .partial_cmp(&a.importance())
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                tier_results.truncate(ASSOCIATION_HOP_LIMIT);
                hop_results.extend(tier_results);
            }

            let mut harvested: HashSet<String> = HashSet::new();
            for item in &hop_results {
                harvested.extend(item.tags.iter().cloned());
                if let Some(text) = item.content.as_text() {
                    harvested.extend(
                        text.to_lowercase()
                            .split_whitespace()
                            .filter(|w| w.len() > MIN_CONCEPT_TOKEN_LEN)
                            .map(String::from),
                    );
                }
            }

            frontier = harvested.difference(&visited).cloned().collect();
            visited.extend(harvested);
            collected.extend(hop_results);
        }

        // Dedupe by id, keep the highest-importance ordering
        let mut seen: HashSet<MemoryId> = HashSet::new();
        let mut unique: Vec<MemoryItem> = collected
            .into_iter()
            .filter(|item| seen.insert(item.id.clone()))
            .collect();
        unique.sort_by(|a, b| {
            b.importance()
                .partial_cmp(&a.importance())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        unique
    }

    /// Snapshot of the recorded retrievals
    pub async fn history(&self) -> Vec<RetrievalRecord> {
        self.history.read().await.clone()
    }
}

/// Map a retrieval context onto a store query
fn build_context_query(context: &RetrievalContext) -> MemoryQuery {
    let mut query = MemoryQuery::new();

    if !context.keywords.is_empty() {
        query = query.tags(context.keywords.iter().cloned());
    }
    if let Some(range) = &context.time_range {
        if let Some(start) = range.start {
            query = query.created_after(start);
        }
    }
    if let Some(threshold) = context.importance_threshold {
        query = query.min_importance(threshold);
    }
    query.limit(context.limit.unwrap_or(DEFAULT_CONTEXT_LIMIT))
}

/// Weighted similarity between two items, within [0, 1]
fn similarity(a: &MemoryItem, b: &MemoryItem) -> f32 {
    let mut score = 0.0;

    if !a.tags.is_empty() && !b.tags.is_empty() {
        let intersection = a.tags.intersection(&b.tags).count();
        let union = a.tags.union(&b.tags).count();
        score += TAG_WEIGHT * intersection as f32 / union as f32;
    }

    if let (Some(ta), Some(tb)) = (a.content.as_text(), b.content.as_text()) {
        score += TOKEN_WEIGHT * token_jaccard(ta, tb);
    }

    let delta_days =
        (a.created_at - b.created_at).num_seconds().abs() as f64 / 86_400.0;
    let temporal = (1.0 - delta_days / TEMPORAL_WINDOW_DAYS).max(0.0) as f32;
    score += TEMPORAL_WEIGHT * temporal;

    score.min(1.0)
}

/// Jaccard overlap of lowercase whitespace tokens
fn token_jaccard(a: &str, b: &str) -> f32 {
    let a_lower = a.to_lowercase();
    let b_lower = b.to_lowercase();
    let a_words: HashSet<&str> = a_lower.split_whitespace().collect();
    let b_words: HashSet<&str> = b_lower.split_whitespace().collect();

    if a_words.is_empty() || b_words.is_empty() {
        return 0.0;
    }

    let intersection = a_words.intersection(&b_words).count();
    let union = a_words.union(&b_words).count();
    intersection as f32 / union as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemoryContent, TierPayload};
    use chrono::Duration;

    fn engine() -> RetrievalEngine {
        RetrievalEngine::new(TierStores::in_memory())
    }

    fn semantic(text: &str, tags: &[&str], importance: f32) -> MemoryItem {
        MemoryItem::new(MemoryContent::text(text), TierPayload::semantic("c"))
            .with_tags(tags.iter().copied())
            .with_importance(importance)
    }

    #[tokio::test]
    async fn test_retrieve_by_context_touches_items() {
        let engine = engine();
        let stores = engine.stores.clone();

        let item = semantic("tagged fact", &["research"], 0.6);
        let id = item.id.clone();
        stores
            .get(MemoryTier::Semantic)
            .store(item)
            .await
            .unwrap();

        let ctx = RetrievalContext::new().keyword("research");
        let results = engine.retrieve_by_context(&ctx, None).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].access_count, 1);

        // The touch was persisted
        let stored = stores
            .get(MemoryTier::Semantic)
            .retrieve(&id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.access_count, 1);
    }

    #[tokio::test]
    async fn test_retrieve_by_context_tier_filter_and_order() {
        let engine = engine();
        let stores = engine.stores.clone();

        stores
            .get(MemoryTier::Semantic)
            .store(semantic("high", &["x"], 0.9))
            .await
            .unwrap();
        stores
            .get(MemoryTier::Semantic)
            .store(semantic("low", &["x"], 0.2))
            .await
            .unwrap();
        stores
            .get(MemoryTier::Episodic)
            .store(
                MemoryItem::new(MemoryContent::text("episode"), TierPayload::episodic())
                    .with_tags(["x"]),
            )
            .await
            .unwrap();

        let ctx = RetrievalContext::new().keyword("x");
        let all = engine.retrieve_by_context(&ctx, None).await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].content.as_text(), Some("high"));

        let semantic_only = engine
            .retrieve_by_context(&ctx, Some(&[MemoryTier::Semantic]))
            .await;
        assert_eq!(semantic_only.len(), 2);
    }

    #[tokio::test]
    async fn test_retrieval_history_recorded() {
        let engine = engine();
        let ctx = RetrievalContext::new().keyword("anything");
        engine.retrieve_by_context(&ctx, None).await;
        engine
            .retrieve_by_context(&ctx, Some(&[MemoryTier::Working]))
            .await;

        let history = engine.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].tiers.len(), 3);
        assert_eq!(history[1].tiers, vec![MemoryTier::Working]);
        assert_eq!(history[0].result_count, 0);
    }

    #[tokio::test]
    async fn test_retrieve_similar_shared_tags_and_tokens() {
        let engine = engine();
        let store = engine.stores.get(MemoryTier::Semantic);

        let reference = semantic("rust agents are autonomous", &["rust", "agents"], 0.5);
        store.store(reference.clone()).await.unwrap();
        store
            .store(semantic("rust agents are fast", &["rust", "agents"], 0.5))
            .await
            .unwrap();
        store
            .store(semantic("unrelated gardening notes", &["plants"], 0.5))
            .await
            .unwrap();

        let similar = engine.retrieve_similar(&reference, 0.7).await;
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].content.as_text(), Some("rust agents are fast"));
    }

    #[tokio::test]
    async fn test_retrieve_similar_excludes_reference() {
        let engine = engine();
        let store = engine.stores.get(MemoryTier::Semantic);
        let reference = semantic("only item", &["solo"], 0.5);
        store.store(reference.clone()).await.unwrap();

        let similar = engine.retrieve_similar(&reference, 0.0).await;
        assert!(similar.is_empty());
    }

    #[tokio::test]
    async fn test_similarity_floor_no_overlap_distant_in_time() {
        let engine = engine();
        let store = engine.stores.get(MemoryTier::Semantic);

        let reference = semantic("alpha beta gamma", &["one"], 0.5);
        let mut distant = semantic("delta epsilon zeta", &["two"], 0.5);
        distant.created_at = reference.created_at - Duration::days(45);

        store.store(reference.clone()).await.unwrap();
        store.store(distant).await.unwrap();

        let similar = engine.retrieve_similar(&reference, 0.9).await;
        assert!(similar.is_empty());
    }

    #[test]
    fn test_similarity_weights() {
        let a = semantic("shared words here", &["t1", "t2"], 0.5);
        let mut b = semantic("shared words here", &["t1", "t2"], 0.5);
        b.created_at = a.created_at;

        // Identical tags, tokens, and creation time: full score
        assert!((similarity(&a, &b) - 1.0).abs() < 1e-5);

        let mut c = semantic("completely other text", &["t3"], 0.5);
        c.created_at = a.created_at;
        // Only the temporal component contributes
        let s = similarity(&a, &c);
        assert!((s - TEMPORAL_WEIGHT).abs() < 1e-5);
    }

    #[test]
    fn test_temporal_proximity_window() {
        let a = semantic("x", &[], 0.5);
        let mut b = semantic("y", &[], 0.5);
        b.created_at = a.created_at - Duration::days(15);

        // Half the window left: 0.2 * 0.5
        let s = similarity(&a, &b);
        assert!((s - TEMPORAL_WEIGHT * 0.5).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_association_expands_through_tags() {
        let engine = engine();
        let store = engine.stores.get(MemoryTier::Semantic);

        // seed "graphs" -> item tagged graphs carrying tag "embeddings"
        // -> second hop finds the item tagged embeddings
        store
            .store(semantic("structured note", &["graphs", "embeddings"], 0.9))
            .await
            .unwrap();
        store
            .store(semantic("vector note", &["embeddings"], 0.4))
            .await
            .unwrap();
        store
            .store(semantic("unrelated", &["cooking"], 0.8))
            .await
            .unwrap();

        let results = engine
            .retrieve_by_association(&["graphs".to_string()], 3)
            .await;

        assert_eq!(results.len(), 2);
        // Sorted by importance descending
        assert_eq!(results[0].content.as_text(), Some("structured note"));
        assert_eq!(results[1].content.as_text(), Some("vector note"));
    }

    #[tokio::test]
    async fn test_association_depth_limit() {
        let engine = engine();
        let store = engine.stores.get(MemoryTier::Semantic);

        store
            .store(semantic("first", &["a", "b"], 0.5))
            .await
            .unwrap();
        store
            .store(semantic("second", &["b", "c"], 0.5))
            .await
            .unwrap();
        store
            .store(semantic("third", &["c"], 0.5))
            .await
            .unwrap();

        // Depth 1: only the direct tag match
        let shallow = engine.retrieve_by_association(&["a".to_string()], 1).await;
        assert_eq!(shallow.len(), 1);

        // Depth 3: the chain a -> b -> c is reachable
        let deep = engine.retrieve_by_association(&["a".to_string()], 3).await;
        assert_eq!(deep.len(), 3);
    }

    #[tokio::test]
    async fn test_association_hop_capped_per_tier() {
        let engine = engine();
        let store = engine.stores.get(MemoryTier::Semantic);

        // Two seed concepts whose combined matches exceed the hop budget
        for i in 0..35 {
            store
                .store(semantic(&format!("note {i}"), &["alpha"], 0.5))
                .await
                .unwrap();
        }
        for i in 0..35 {
            store
                .store(semantic(&format!("memo {i}"), &["beta"], 0.5))
                .await
                .unwrap();
        }
        store
            .store(semantic("keeper", &["alpha"], 0.95))
            .await
            .unwrap();

        let results = engine
            .retrieve_by_association(&["alpha".to_string(), "beta".to_string()], 1)
            .await;

        assert_eq!(results.len(), ASSOCIATION_HOP_LIMIT);
        // Truncation keeps the most important items
        assert_eq!(results[0].content.as_text(), Some("keeper"));
    }

    #[tokio::test]
    async fn test_association_no_seeds_no_results() {
        let engine = engine();
        let results = engine.retrieve_by_association(&[], 3).await;
        assert!(results.is_empty());
    }

    #[test]
    fn test_build_context_query_mapping() {
        let start = Utc::now() - Duration::days(7);
        let ctx = RetrievalContext::new()
            .keywords(["k1", "k2"])
            .after(start)
            .importance_threshold(0.4);

        let query = build_context_query(&ctx);
        assert_eq!(query.tags, vec!["k1", "k2"]);
        assert_eq!(query.created_after, Some(start));
        assert_eq!(query.min_importance, Some(0.4));
        assert_eq!(query.limit, Some(DEFAULT_CONTEXT_LIMIT));
    }
}
