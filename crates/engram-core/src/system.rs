//! Memory system facade: tier stores, engines, and the consolidation schedule

use crate::config::MemoryConfig;
use crate::consolidation::{ConsolidationEngine, ConsolidationStats};
use crate::error::{MemoryError, MemoryResult};
use crate::retrieval::RetrievalEngine;
use crate::scheduler::ConsolidationScheduler;
use crate::store::{MemoryStore, TierStores, DEFAULT_SEARCH_LIMIT};
use crate::types::{
    MemoryContent, MemoryId, MemoryItem, MemoryQuery, MemoryTier, RetrievalContext, TierPayload,
    DEFAULT_WORKING_PRIORITY, DEFAULT_WORKING_TTL_SECS,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Attributes accepted by the facade's `store` operation
///
/// Base attributes apply to every tier; the tier-specific ones are read
/// only for their tier and validated there.
#[derive(Debug, Clone, Default)]
pub struct StoreAttributes {
    /// Initial importance (default 0.5, clamped)
    pub importance_score: Option<f32>,
    /// Tags
    pub tags: BTreeSet<String>,
    /// Metadata
    pub metadata: HashMap<String, Value>,

    /// Working: owning task
    pub task_id: Option<String>,
    /// Working: expiry (default now + working TTL)
    pub expiry_time: Option<DateTime<Utc>>,
    /// Working: priority, 1–10 (default 5)
    pub priority: Option<u8>,

    /// Episodic: event context
    pub context: HashMap<String, Value>,
    /// Episodic: participants
    pub participants: Vec<String>,
    /// Episodic: outcome
    pub outcome: Option<String>,
    /// Episodic: lessons learned
    pub lessons_learned: Vec<String>,

    /// Semantic: the concept (required)
    pub concept: Option<String>,
    /// Semantic: relation name to related concepts
    pub relationships: HashMap<String, Vec<String>>,
    /// Semantic: confidence (default 1.0, clamped)
    pub confidence_score: Option<f32>,
    /// Semantic: source
    pub source: Option<String>,
}

impl StoreAttributes {
    /// Create empty attributes
    pub fn new() -> Self {
        Self::default()
    }

    /// Set importance
    pub fn importance(mut self, score: f32) -> Self {
        self.importance_score = Some(score);
        self
    }

    /// Add a tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Add several tags
    pub fn tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags.extend(tags.into_iter().map(|t| t.into()));
        self
    }

    /// Add a metadata entry
    pub fn metadata_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Set the owning task (working)
    pub fn task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Set the expiry time (working)
    pub fn expiry_time(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry_time = Some(expiry);
        self
    }

    /// Set the priority (working)
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Add a context entry (episodic)
    pub fn context_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Add a participant (episodic)
    pub fn participant(mut self, participant: impl Into<String>) -> Self {
        self.participants.push(participant.into());
        self
    }

    /// Set the outcome (episodic)
    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    /// Add a lesson learned (episodic)
    pub fn lesson(mut self, lesson: impl Into<String>) -> Self {
        self.lessons_learned.push(lesson.into());
        self
    }

    /// Set the concept (semantic)
    pub fn concept(mut self, concept: impl Into<String>) -> Self {
        self.concept = Some(concept.into());
        self
    }

    /// Add a relationship (semantic)
    pub fn relationship(
        mut self,
        relation: impl Into<String>,
        targets: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.relationships
            .insert(relation.into(), targets.into_iter().map(|t| t.into()).collect());
        self
    }

    /// Set the confidence (semantic)
    pub fn confidence(mut self, confidence: f32) -> Self {
        self.confidence_score = Some(confidence);
        self
    }

    /// Set the source (semantic)
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Per-tier statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierStats {
    /// Number of items in the tier
    pub count: usize,
    /// Average importance across the tier
    pub avg_importance: f32,
    /// Sum of access counts
    pub total_access_count: u64,
    /// Creation time of the oldest item
    pub oldest_created_at: Option<DateTime<Utc>>,
    /// Creation time of the newest item
    pub newest_created_at: Option<DateTime<Utc>>,
}

/// The memory system facade
///
/// Owns one store per tier, the retrieval and consolidation engines, and
/// the background consolidation schedule. All collaborators go through the
/// operations here; no caller mutates store state directly.
pub struct MemorySystem {
    config: MemoryConfig,
    stores: TierStores,
    retrieval: RetrievalEngine,
    consolidation: Arc<ConsolidationEngine>,
    scheduler: Mutex<Option<ConsolidationScheduler>>,
}

impl MemorySystem {
    /// Create a memory system and start its consolidation schedule
    pub async fn new(config: MemoryConfig) -> MemoryResult<Self> {
        let stores = match &config.storage_dir {
            Some(dir) => TierStores::file_backed(dir).await?,
            None => TierStores::in_memory(),
        };
        Ok(Self::with_stores(config, stores))
    }

    /// Create a memory system over prepared tier stores
    ///
    /// Ignores `config.storage_dir`; the given stores are used as-is.
    pub fn with_stores(config: MemoryConfig, stores: TierStores) -> Self {
        let retrieval = RetrievalEngine::new(stores.clone());
        let consolidation = Arc::new(ConsolidationEngine::new(stores.clone(), config.clone()));

        let scheduler = if config.consolidation_enabled {
            Some(ConsolidationScheduler::start(
                Arc::clone(&consolidation),
                config.consolidation_interval,
            ))
        } else {
            None
        };

        Self {
            config,
            stores,
            retrieval,
            consolidation,
            scheduler: Mutex::new(scheduler),
        }
    }

    /// Store a new memory item, returning its id
    ///
    /// Tier-specific attributes are validated before any store call; a
    /// persistence fault is logged and returned as an error.
    pub async fn store(
        &self,
        content: MemoryContent,
        tier: MemoryTier,
        attrs: StoreAttributes,
    ) -> MemoryResult<MemoryId> {
        let item = self.build_item(content, tier, attrs)?;
        let id = item.id.clone();

        match self.stores.get(tier).store(item).await {
            Ok(()) => {
                info!(id = %id, tier = tier.name(), "stored memory item");
                Ok(id)
            }
            Err(e) => {
                error!(id = %id, tier = tier.name(), error = %e, "failed to store memory item");
                Err(e)
            }
        }
    }

    /// Retrieve an item by id, probing Working, Episodic, Semantic in order
    ///
    /// A tier whose lookup fails is logged and skipped, so a fault in one
    /// store cannot hide an item held by another. An error is returned
    /// only when every tier failed.
    pub async fn retrieve(&self, id: &MemoryId) -> MemoryResult<Option<MemoryItem>> {
        let mut failed = 0;
        let mut last_err = None;
        for (tier, store) in self.stores.iter() {
            match store.retrieve(id).await {
                Ok(Some(item)) => return Ok(Some(item)),
                Ok(None) => {}
                Err(e) => {
                    warn!(tier = tier.name(), id = %id, error = %e, "tier retrieve failed");
                    failed += 1;
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if failed == MemoryTier::ALL.len() => Err(e),
            _ => Ok(None),
        }
    }

    /// Search across tiers
    ///
    /// Fans out to the named tiers (default all), merges, sorts by
    /// `(importance desc, last_accessed desc)`, and applies the query's
    /// limit globally. A failing tier is logged and skipped.
    pub async fn search(
        &self,
        query: &MemoryQuery,
        tiers: Option<&[MemoryTier]>,
    ) -> Vec<MemoryItem> {
        let tiers = tiers.unwrap_or(&MemoryTier::ALL);

        let mut all_results = Vec::new();
        for &tier in tiers {
            match self.stores.get(tier).search(query).await {
                Ok(results) => all_results.extend(results),
                Err(e) => warn!(tier = tier.name(), error = %e, "tier search failed"),
            }
        }

        all_results.sort_by(|a, b| {
            b.importance()
                .partial_cmp(&a.importance())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.last_accessed.cmp(&a.last_accessed))
        });
        all_results.truncate(query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT));
        all_results
    }

    /// Delete an item wherever it lives
    pub async fn delete(&self, id: &MemoryId) -> MemoryResult<()> {
        for (_, store) in self.stores.iter() {
            store.delete(id).await?;
        }
        Ok(())
    }

    /// Retrieve memories relevant to a context (see [`RetrievalEngine`])
    pub async fn retrieve_by_context(
        &self,
        context: &RetrievalContext,
        tiers: Option<&[MemoryTier]>,
    ) -> Vec<MemoryItem> {
        self.retrieval.retrieve_by_context(context, tiers).await
    }

    /// Retrieve items similar to a reference item
    pub async fn retrieve_similar(
        &self,
        reference: &MemoryItem,
        threshold: f32,
    ) -> Vec<MemoryItem> {
        self.retrieval.retrieve_similar(reference, threshold).await
    }

    /// Retrieve memories by associative expansion from seed concepts
    pub async fn retrieve_by_association(
        &self,
        seed_concepts: &[String],
        max_depth: usize,
    ) -> Vec<MemoryItem> {
        self.retrieval
            .retrieve_by_association(seed_concepts, max_depth)
            .await
    }

    /// Per-tier statistics
    pub async fn get_stats(&self) -> HashMap<MemoryTier, TierStats> {
        let mut stats = HashMap::new();

        for (tier, store) in self.stores.iter() {
            let items = match store.list(0, usize::MAX).await {
                Ok(items) => items,
                Err(e) => {
                    warn!(tier = tier.name(), error = %e, "stats sweep failed");
                    stats.insert(tier, TierStats::default());
                    continue;
                }
            };

            let count = items.len();
            let tier_stats = TierStats {
                count,
                avg_importance: if count == 0 {
                    0.0
                } else {
                    items.iter().map(|m| m.importance()).sum::<f32>() / count as f32
                },
                total_access_count: items.iter().map(|m| u64::from(m.access_count)).sum(),
                oldest_created_at: items.iter().map(|m| m.created_at).min(),
                newest_created_at: items.iter().map(|m| m.created_at).max(),
            };
            stats.insert(tier, tier_stats);
        }

        stats
    }

    /// Run one consolidation pass immediately
    pub async fn consolidate_now(&self) -> ConsolidationStats {
        self.consolidation.run().await
    }

    /// History of context retrievals
    pub async fn retrieval_history(&self) -> Vec<crate::retrieval::RetrievalRecord> {
        self.retrieval.history().await
    }

    /// Cancel the consolidation schedule
    ///
    /// An in-flight run finishes its current item-level step; no new run
    /// starts afterwards. Safe to call more than once.
    pub async fn shutdown(&self) {
        if let Some(scheduler) = self.scheduler.lock().await.take() {
            scheduler.shutdown().await;
        }
    }

    /// Validate attributes and build the item for a tier
    fn build_item(
        &self,
        content: MemoryContent,
        tier: MemoryTier,
        attrs: StoreAttributes,
    ) -> MemoryResult<MemoryItem> {
        let payload = match tier {
            MemoryTier::Working => {
                let priority = attrs.priority.unwrap_or(DEFAULT_WORKING_PRIORITY);
                if !(1..=10).contains(&priority) {
                    return Err(MemoryError::validation(format!(
                        "working memory priority must be 1-10, got {priority}"
                    )));
                }
                let ttl = chrono::Duration::from_std(self.config.working_ttl)
                    .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_WORKING_TTL_SECS));
                TierPayload::Working {
                    task_id: attrs.task_id,
                    expiry_time: attrs.expiry_time.unwrap_or_else(|| Utc::now() + ttl),
                    priority,
                }
            }
            MemoryTier::Episodic => TierPayload::Episodic {
                context: attrs.context,
                participants: attrs.participants,
                outcome: attrs.outcome,
                lessons_learned: attrs.lessons_learned,
            },
            MemoryTier::Semantic => {
                let concept = attrs
                    .concept
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| {
                        MemoryError::validation("semantic memory requires a concept")
                    })?;
                TierPayload::Semantic {
                    concept,
                    relationships: attrs.relationships,
                    confidence_score: attrs.confidence_score.unwrap_or(1.0).clamp(0.0, 1.0),
                    source: attrs.source,
                }
            }
        };

        Ok(MemoryItem::new(content, payload)
            .with_importance(attrs.importance_score.unwrap_or(0.5))
            .with_tags(attrs.tags)
            .with_metadata(attrs.metadata))
    }
}
