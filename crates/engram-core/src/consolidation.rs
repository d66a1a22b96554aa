//! Background consolidation: expiry, promotion, re-scoring, deduplication

use crate::config::MemoryConfig;
use crate::store::{MemoryStore, TierStores};
use crate::types::{MemoryItem, MemoryTier, TierPayload};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, warn};

/// Metadata `type` values that mark an item as experiential: promoted
/// working items with one of these go to the episodic tier, everything
/// else becomes semantic.
const EXPERIENTIAL_TYPES: [&str; 6] = [
    "task_execution",
    "user_interaction",
    "decision_made",
    "problem_solved",
    "error_encountered",
    "learning_event",
];

/// Aggregate counters for one consolidation run
///
/// Counters reflect only items successfully processed; partial progress
/// within a run is retained even when later items fail.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ConsolidationStats {
    /// Working items promoted to the episodic tier
    pub working_to_episodic: usize,
    /// Working items promoted to the semantic tier
    pub working_to_semantic: usize,
    /// Expired working items removed (promoted or not)
    pub expired_removed: usize,
    /// Duplicate items folded into a primary and deleted
    pub duplicates_merged: usize,
    /// Items whose recomputed importance was persisted
    pub importance_updated: usize,
}

/// Consolidation engine over the tier stores
///
/// Runs three ordered, individually idempotent steps; a failure inside one
/// step is logged and never aborts the remaining steps or items. No lock is
/// held across a sweep: each item's mutation is its own store transaction.
pub struct ConsolidationEngine {
    stores: TierStores,
    config: MemoryConfig,
}

impl ConsolidationEngine {
    /// Create a new consolidation engine
    pub fn new(stores: TierStores, config: MemoryConfig) -> Self {
        Self { stores, config }
    }

    /// Execute one full consolidation run
    pub async fn run(&self) -> ConsolidationStats {
        info!("starting memory consolidation");
        let mut stats = ConsolidationStats::default();

        self.consolidate_working(&mut stats).await;
        self.recompute_importance(&mut stats).await;
        self.merge_duplicates(&mut stats).await;

        info!(
            to_episodic = stats.working_to_episodic,
            to_semantic = stats.working_to_semantic,
            expired = stats.expired_removed,
            merged = stats.duplicates_merged,
            rescored = stats.importance_updated,
            "memory consolidation completed"
        );
        stats
    }

    /// Step 1: expire working memory, promoting what is worth keeping
    async fn consolidate_working(&self, stats: &mut ConsolidationStats) {
        let working = self.stores.get(MemoryTier::Working);
        let items = match working.list(0, usize::MAX).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "working memory sweep failed");
                return;
            }
        };

        let now = Utc::now();
        for item in items {
            if !item.is_expired(now) {
                continue;
            }

            if self.should_consolidate(&item) {
                let target = promotion_target(&item);
                let replacement = build_replacement(&item, target);
                match self.stores.get(target).store(replacement).await {
                    Ok(()) => match target {
                        MemoryTier::Episodic => stats.working_to_episodic += 1,
                        MemoryTier::Semantic => stats.working_to_semantic += 1,
                        MemoryTier::Working => {}
                    },
                    Err(e) => {
                        warn!(id = %item.id, tier = target.name(), error = %e,
                            "failed to store promoted item");
                    }
                }
            }

            // The original goes away whether or not it was promoted
            match working.delete(&item.id).await {
                Ok(()) => stats.expired_removed += 1,
                Err(e) => warn!(id = %item.id, error = %e, "failed to remove expired item"),
            }
        }
    }

    /// Whether an expired working item is worth keeping long-term
    fn should_consolidate(&self, item: &MemoryItem) -> bool {
        if item.importance() >= self.config.promotion_importance_threshold {
            return true;
        }
        if item.access_count >= self.config.promotion_access_threshold {
            return true;
        }
        // Character count, not byte length
        matches!(item.content.as_text(), Some(text) if text.chars().count() > self.config.promotion_content_length)
    }

    /// Step 2: recompute importance for every non-working item
    async fn recompute_importance(&self, stats: &mut ConsolidationStats) {
        for tier in [MemoryTier::Episodic, MemoryTier::Semantic] {
            let store = self.stores.get(tier);
            let items = match store.list(0, usize::MAX).await {
                Ok(items) => items,
                Err(e) => {
                    warn!(tier = tier.name(), error = %e, "importance sweep failed");
                    continue;
                }
            };

            for mut item in items {
                let new_score = calculate_importance(&item);
                if (new_score - item.importance()).abs() > self.config.importance_write_threshold {
                    item.set_importance(new_score);
                    match store.update(item.clone()).await {
                        Ok(()) => stats.importance_updated += 1,
                        Err(e) => {
                            warn!(id = %item.id, error = %e, "failed to persist importance")
                        }
                    }
                }
            }
        }
    }

    /// Step 3: merge items with identical canonical content, per tier
    async fn merge_duplicates(&self, stats: &mut ConsolidationStats) {
        for (tier, store) in self.stores.iter() {
            let items = match store.list(0, usize::MAX).await {
                Ok(items) => items,
                Err(e) => {
                    warn!(tier = tier.name(), error = %e, "duplicate sweep failed");
                    continue;
                }
            };

            let mut groups: HashMap<String, Vec<MemoryItem>> = HashMap::new();
            for item in items {
                groups.entry(item.content_hash()).or_default().push(item);
            }

            for (_, mut group) in groups {
                if group.len() < 2 {
                    continue;
                }

                group.sort_by(|a, b| {
                    b.importance()
                        .partial_cmp(&a.importance())
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                let mut primary = group.remove(0);
                let mut merged_any = false;

                for duplicate in group {
                    if let Err(e) = store.delete(&duplicate.id).await {
                        warn!(id = %duplicate.id, error = %e, "failed to delete duplicate");
                        continue;
                    }

                    fold_duplicate(&mut primary, &duplicate);
                    stats.duplicates_merged += 1;
                    merged_any = true;
                }

                if merged_any {
                    if let Err(e) = store.update(primary.clone()).await {
                        warn!(id = %primary.id, error = %e, "failed to persist merged item");
                    }
                }
            }
        }
    }
}

/// Which long-term tier an expired working item belongs in
fn promotion_target(item: &MemoryItem) -> MemoryTier {
    let is_experiential = item
        .metadata
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| EXPERIENTIAL_TYPES.contains(&t));

    if is_experiential {
        MemoryTier::Episodic
    } else {
        MemoryTier::Semantic
    }
}

/// Build the long-term replacement for a promoted working item
///
/// Base fields carry over unchanged; tier-specific fields are recovered
/// from the item's metadata, defaulting to empty or neutral values.
fn build_replacement(item: &MemoryItem, target: MemoryTier) -> MemoryItem {
    let payload = match target {
        MemoryTier::Episodic => TierPayload::Episodic {
            context: metadata_map(&item.metadata, "context"),
            participants: metadata_string_list(&item.metadata, "participants"),
            outcome: metadata_string(&item.metadata, "outcome"),
            lessons_learned: metadata_string_list(&item.metadata, "lessons_learned"),
        },
        _ => TierPayload::Semantic {
            concept: metadata_string(&item.metadata, "concept").unwrap_or_default(),
            relationships: metadata_relationships(&item.metadata),
            confidence_score: item
                .metadata
                .get("confidence_score")
                .and_then(Value::as_f64)
                .map_or(1.0, |v| v as f32)
                .clamp(0.0, 1.0),
            source: metadata_string(&item.metadata, "source"),
        },
    };

    let mut replacement = MemoryItem::new(item.content.clone(), payload);
    replacement.created_at = item.created_at;
    replacement.last_accessed = item.last_accessed;
    replacement.access_count = item.access_count;
    replacement.set_importance(item.importance());
    replacement.tags = item.tags.clone();
    replacement.metadata = item.metadata.clone();
    replacement
}

/// Importance formula: base 0.5 plus access, recency, content, tag, and
/// metadata richness factors, clamped to [0, 1]
fn calculate_importance(item: &MemoryItem) -> f32 {
    let access_factor = (item.access_count as f32 / 10.0).min(1.0);

    let days_since_access = (Utc::now() - item.last_accessed).num_days() as f32;
    let recency_factor = (1.0 - days_since_access / 365.0).max(0.0);

    let content_factor = item
        .content
        .as_text()
        .map_or(0.0, |text| (text.len() as f32 / 1000.0).min(1.0));

    let tag_factor = (item.tags.len() as f32 / 10.0).min(1.0);
    let metadata_factor = (item.metadata.len() as f32 / 5.0).min(1.0);

    (0.5 + access_factor * 0.3
        + recency_factor * 0.2
        + content_factor * 0.2
        + tag_factor * 0.1
        + metadata_factor * 0.2)
        .clamp(0.0, 1.0)
}

/// Fold a duplicate into the primary: counters sum, tags union, metadata
/// union with the primary winning conflicting keys, newest access wins
fn fold_duplicate(primary: &mut MemoryItem, duplicate: &MemoryItem) {
    primary.access_count = primary.access_count.saturating_add(duplicate.access_count);
    primary.tags.extend(duplicate.tags.iter().cloned());
    for (key, value) in &duplicate.metadata {
        primary
            .metadata
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
    if duplicate.last_accessed > primary.last_accessed {
        primary.last_accessed = duplicate.last_accessed;
    }
}

fn metadata_string(metadata: &HashMap<String, Value>, key: &str) -> Option<String> {
    metadata.get(key).and_then(Value::as_str).map(String::from)
}

fn metadata_string_list(metadata: &HashMap<String, Value>, key: &str) -> Vec<String> {
    metadata
        .get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn metadata_map(metadata: &HashMap<String, Value>, key: &str) -> HashMap<String, Value> {
    metadata
        .get(key)
        .and_then(Value::as_object)
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

fn metadata_relationships(metadata: &HashMap<String, Value>) -> HashMap<String, Vec<String>> {
    metadata
        .get("relationships")
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .map(|(relation, targets)| {
                    let names = targets
                        .as_array()
                        .map(|values| {
                            values
                                .iter()
                                .filter_map(Value::as_str)
                                .map(String::from)
                                .collect()
                        })
                        .unwrap_or_default();
                    (relation.clone(), names)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemoryContent, MemoryQuery};
    use chrono::Duration;
    use serde_json::json;

    fn engine() -> ConsolidationEngine {
        ConsolidationEngine::new(TierStores::in_memory(), MemoryConfig::default())
    }

    fn expired_working(importance: f32, text: &str) -> MemoryItem {
        let mut item = MemoryItem::new(MemoryContent::text(text), TierPayload::working())
            .with_importance(importance);
        item.payload = TierPayload::Working {
            task_id: None,
            expiry_time: Utc::now() - Duration::hours(1),
            priority: 5,
        };
        item
    }

    #[tokio::test]
    async fn test_expired_low_value_item_discarded() {
        let engine = engine();
        let item = expired_working(0.2, "short");
        let id = item.id.clone();
        engine
            .stores
            .get(MemoryTier::Working)
            .store(item)
            .await
            .unwrap();

        let stats = engine.run().await;
        assert_eq!(stats.expired_removed, 1);
        assert_eq!(stats.working_to_episodic + stats.working_to_semantic, 0);

        // Gone from every tier
        for (_, store) in engine.stores.iter() {
            assert!(store.retrieve(&id).await.unwrap().is_none());
            assert_eq!(store.count().await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_important_item_promoted_to_semantic() {
        let engine = engine();
        let mut item = expired_working(0.9, "a durable fact");
        item.metadata
            .insert("concept".into(), json!("durable facts"));
        item.metadata.insert(
            "relationships".into(),
            json!({"related_to": ["knowledge", "storage"]}),
        );
        item.metadata.insert("source".into(), json!("unit test"));
        let tags = item.tags.clone();
        engine
            .stores
            .get(MemoryTier::Working)
            .store(item.clone())
            .await
            .unwrap();

        let stats = engine.run().await;
        assert_eq!(stats.working_to_semantic, 1);
        assert_eq!(stats.working_to_episodic, 0);
        assert_eq!(stats.expired_removed, 1);

        assert_eq!(
            engine
                .stores
                .get(MemoryTier::Working)
                .count()
                .await
                .unwrap(),
            0
        );

        let promoted = engine
            .stores
            .get(MemoryTier::Semantic)
            .list(0, 10)
            .await
            .unwrap();
        assert_eq!(promoted.len(), 1);
        let promoted = &promoted[0];
        assert_eq!(promoted.content.as_text(), Some("a durable fact"));
        assert_eq!(promoted.created_at, item.created_at);
        assert_eq!(promoted.tags, tags);
        match &promoted.payload {
            TierPayload::Semantic {
                concept,
                relationships,
                confidence_score,
                source,
            } => {
                assert_eq!(concept, "durable facts");
                assert_eq!(
                    relationships.get("related_to"),
                    Some(&vec!["knowledge".to_string(), "storage".to_string()])
                );
                assert_eq!(*confidence_score, 1.0);
                assert_eq!(source.as_deref(), Some("unit test"));
            }
            other => panic!("expected semantic payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_experiential_item_promoted_to_episodic() {
        let engine = engine();
        let mut item = expired_working(0.9, "handled the user request");
        item.metadata.insert("type".into(), json!("user_interaction"));
        item.metadata
            .insert("context".into(), json!({"channel": "chat"}));
        item.metadata
            .insert("participants".into(), json!(["user", "agent"]));
        item.metadata.insert("outcome".into(), json!("success"));
        item.metadata
            .insert("lessons_learned".into(), json!(["answer promptly"]));
        engine
            .stores
            .get(MemoryTier::Working)
            .store(item)
            .await
            .unwrap();

        let stats = engine.run().await;
        assert_eq!(stats.working_to_episodic, 1);

        let promoted = engine
            .stores
            .get(MemoryTier::Episodic)
            .list(0, 10)
            .await
            .unwrap();
        match &promoted[0].payload {
            TierPayload::Episodic {
                context,
                participants,
                outcome,
                lessons_learned,
            } => {
                assert_eq!(context.get("channel"), Some(&json!("chat")));
                assert_eq!(participants, &["user", "agent"]);
                assert_eq!(outcome.as_deref(), Some("success"));
                assert_eq!(lessons_learned, &["answer promptly"]);
            }
            other => panic!("expected episodic payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unexpired_working_item_untouched() {
        let engine = engine();
        let item = MemoryItem::new(MemoryContent::text("still fresh"), TierPayload::working())
            .with_importance(0.9);
        engine
            .stores
            .get(MemoryTier::Working)
            .store(item)
            .await
            .unwrap();

        let stats = engine.run().await;
        assert_eq!(stats.expired_removed, 0);
        assert_eq!(
            engine
                .stores
                .get(MemoryTier::Working)
                .count()
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_promotion_predicate() {
        let engine = engine();

        assert!(engine.should_consolidate(&expired_working(0.7, "x")));
        assert!(!engine.should_consolidate(&expired_working(0.69, "x")));

        let mut accessed = expired_working(0.1, "x");
        accessed.access_count = 5;
        assert!(engine.should_consolidate(&accessed));

        let long_text = expired_working(0.1, &"y".repeat(101));
        assert!(engine.should_consolidate(&long_text));

        // Multi-byte text is measured in characters, not bytes
        let multibyte_short = expired_working(0.1, &"é".repeat(60));
        assert!(!engine.should_consolidate(&multibyte_short));
        let multibyte_long = expired_working(0.1, &"é".repeat(101));
        assert!(engine.should_consolidate(&multibyte_long));

        let structured = MemoryItem::new(
            MemoryContent::structured(json!({"big": "z".repeat(500)})),
            TierPayload::working(),
        )
        .with_importance(0.1);
        assert!(!engine.should_consolidate(&structured));
    }

    #[tokio::test]
    async fn test_importance_recompute_persists_large_changes() {
        let engine = engine();
        let store = engine.stores.get(MemoryTier::Semantic);

        // Heavily accessed, rich item stored with a low score
        let mut item = MemoryItem::new(
            MemoryContent::text(&"t".repeat(1000)),
            TierPayload::semantic("c"),
        )
        .with_importance(0.1)
        .with_tags(["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"]);
        item.access_count = 10;
        for i in 0..5 {
            item.metadata.insert(format!("k{i}"), json!(i));
        }
        let id = item.id.clone();
        store.store(item).await.unwrap();

        let stats = engine.run().await;
        assert_eq!(stats.importance_updated, 1);

        let rescored = store.retrieve(&id).await.unwrap().unwrap();
        // All factors saturated: 0.5 + 0.3 + 0.2 + 0.2 + 0.1 + 0.2, clamped
        assert_eq!(rescored.importance(), 1.0);
    }

    #[tokio::test]
    async fn test_importance_recompute_skips_small_changes() {
        let engine = engine();
        let store = engine.stores.get(MemoryTier::Semantic);

        // Fresh bare item: formula gives ~0.7 (base + full recency)
        let item = MemoryItem::new(MemoryContent::structured(json!(null)), TierPayload::semantic("c"))
            .with_importance(0.65);
        store.store(item).await.unwrap();

        let stats = engine.run().await;
        assert_eq!(stats.importance_updated, 0);
    }

    #[tokio::test]
    async fn test_working_tier_skipped_by_recompute() {
        let engine = engine();
        let item = MemoryItem::new(MemoryContent::text("working"), TierPayload::working())
            .with_importance(0.05);
        let id = item.id.clone();
        engine
            .stores
            .get(MemoryTier::Working)
            .store(item)
            .await
            .unwrap();

        engine.recompute_importance(&mut ConsolidationStats::default()).await;

        let unchanged = engine
            .stores
            .get(MemoryTier::Working)
            .retrieve(&id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unchanged.importance(), 0.05);
    }

    #[tokio::test]
    async fn test_duplicate_merge_folds_group() {
        let engine = engine();
        let store = engine.stores.get(MemoryTier::Semantic);

        let mut a = MemoryItem::new(MemoryContent::text("same content"), TierPayload::semantic("c"))
            .with_importance(0.9)
            .with_tags(["a"]);
        a.access_count = 3;
        a.metadata.insert("origin".into(), json!("first"));

        let mut b = MemoryItem::new(MemoryContent::text("same content"), TierPayload::semantic("c"))
            .with_importance(0.4)
            .with_tags(["b"]);
        b.access_count = 2;
        b.metadata.insert("origin".into(), json!("second"));
        b.metadata.insert("extra".into(), json!(true));
        b.last_accessed = Utc::now() + Duration::seconds(30);

        let primary_id = a.id.clone();
        let b_last_accessed = b.last_accessed;
        store.store(a).await.unwrap();
        store.store(b).await.unwrap();

        let stats = engine.run().await;
        assert_eq!(stats.duplicates_merged, 1);
        assert_eq!(store.count().await.unwrap(), 1);

        let merged = store.retrieve(&primary_id).await.unwrap().unwrap();
        assert_eq!(merged.access_count, 5);
        assert!(merged.has_tag("a") && merged.has_tag("b"));
        // Primary wins conflicting metadata keys; missing keys are copied
        assert_eq!(merged.metadata.get("origin"), Some(&json!("first")));
        assert_eq!(merged.metadata.get("extra"), Some(&json!(true)));
        assert_eq!(merged.last_accessed, b_last_accessed);
    }

    #[tokio::test]
    async fn test_distinct_content_not_merged() {
        let engine = engine();
        let store = engine.stores.get(MemoryTier::Episodic);

        store
            .store(MemoryItem::new(
                MemoryContent::text("one"),
                TierPayload::episodic(),
            ))
            .await
            .unwrap();
        store
            .store(MemoryItem::new(
                MemoryContent::text("two"),
                TierPayload::episodic(),
            ))
            .await
            .unwrap();

        let stats = engine.run().await;
        assert_eq!(stats.duplicates_merged, 0);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_run_is_idempotent() {
        let engine = engine();
        let mut item = expired_working(0.9, "promote me");
        item.metadata.insert("concept".into(), json!("idempotence"));
        engine
            .stores
            .get(MemoryTier::Working)
            .store(item)
            .await
            .unwrap();

        let first = engine.run().await;
        assert_eq!(first.working_to_semantic, 1);

        let second = engine.run().await;
        assert_eq!(second.working_to_semantic, 0);
        assert_eq!(second.expired_removed, 0);
        assert_eq!(second.duplicates_merged, 0);
        assert_eq!(
            engine
                .stores
                .get(MemoryTier::Semantic)
                .count()
                .await
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_promotion_target_from_metadata() {
        let mut item = MemoryItem::new(MemoryContent::text("x"), TierPayload::working());
        assert_eq!(promotion_target(&item), MemoryTier::Semantic);

        item.metadata.insert("type".into(), json!("decision_made"));
        assert_eq!(promotion_target(&item), MemoryTier::Episodic);

        item.metadata.insert("type".into(), json!("unknown_kind"));
        assert_eq!(promotion_target(&item), MemoryTier::Semantic);
    }

    #[test]
    fn test_calculate_importance_floor() {
        // Stale, empty item: base plus nothing but a shrunken recency factor
        let mut item = MemoryItem::new(
            MemoryContent::structured(json!(null)),
            TierPayload::semantic("c"),
        );
        item.last_accessed = Utc::now() - Duration::days(400);
        let score = calculate_importance(&item);
        assert!((score - 0.5).abs() < 1e-5);
    }
}
