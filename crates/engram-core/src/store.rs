//! Tier-scoped memory storage backends

use crate::error::{MemoryError, MemoryResult};
use crate::types::{MemoryId, MemoryItem, MemoryQuery, MemoryTier};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Default result limit for `search` when the query leaves it unset
pub const DEFAULT_SEARCH_LIMIT: usize = 100;

/// Storage for one memory tier
///
/// Every operation is a single-item transaction: the backing lock is held
/// for one item's read or write only, never across a sweep.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// The tier this store holds
    fn tier(&self) -> MemoryTier;

    /// Upsert an item by id (idempotent)
    async fn store(&self, item: MemoryItem) -> MemoryResult<()>;

    /// Get an item by id
    async fn retrieve(&self, id: &MemoryId) -> MemoryResult<Option<MemoryItem>>;

    /// Full replace of an existing or new item (same as `store`)
    ///
    /// Upsert semantics: an update racing a delete of the same id
    /// re-inserts the item rather than failing. Callers that must not
    /// resurrect a deleted item check presence first.
    async fn update(&self, item: MemoryItem) -> MemoryResult<()>;

    /// Delete an item by id
    async fn delete(&self, id: &MemoryId) -> MemoryResult<()>;

    /// Search with filters, ordered by `(importance desc, last_accessed desc)`
    async fn search(&self, query: &MemoryQuery) -> MemoryResult<Vec<MemoryItem>>;

    /// List all items (paginated), newest created first
    async fn list(&self, offset: usize, limit: usize) -> MemoryResult<Vec<MemoryItem>>;

    /// Count stored items
    async fn count(&self) -> MemoryResult<usize>;

    /// Remove all items
    async fn clear(&self) -> MemoryResult<()>;
}

/// Check that an item belongs to this store's tier
fn check_tier(store_tier: MemoryTier, item: &MemoryItem) -> MemoryResult<()> {
    if item.tier() != store_tier {
        return Err(MemoryError::TierMismatch {
            expected: store_tier,
            actual: item.tier(),
        });
    }
    Ok(())
}

/// Check if an item matches a query's filters
///
/// Tag filtering uses AND semantics: every tag listed in the query must be
/// present on the item.
fn matches_query(item: &MemoryItem, query: &MemoryQuery) -> bool {
    if let Some(min) = query.min_importance {
        if item.importance() < min {
            return false;
        }
    }

    if !query.tags.iter().all(|t| item.has_tag(t)) {
        return false;
    }

    if let Some(after) = query.created_after {
        if item.created_at <= after {
            return false;
        }
    }

    true
}

/// Sort matched items: importance descending, then last accessed descending
fn sort_results(items: &mut [MemoryItem]) {
    items.sort_by(|a, b| {
        b.importance()
            .partial_cmp(&a.importance())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.last_accessed.cmp(&a.last_accessed))
    });
}

fn run_search(items: &HashMap<MemoryId, MemoryItem>, query: &MemoryQuery) -> Vec<MemoryItem> {
    let mut results: Vec<MemoryItem> = items
        .values()
        .filter(|item| matches_query(item, query))
        .cloned()
        .collect();

    sort_results(&mut results);
    results.truncate(query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT));
    results
}

/// In-memory tier store
#[derive(Debug)]
pub struct InMemoryStore {
    tier: MemoryTier,
    items: Arc<RwLock<HashMap<MemoryId, MemoryItem>>>,
}

impl InMemoryStore {
    /// Create a new in-memory store for a tier
    pub fn new(tier: MemoryTier) -> Self {
        Self {
            tier,
            items: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    fn tier(&self) -> MemoryTier {
        self.tier
    }

    async fn store(&self, item: MemoryItem) -> MemoryResult<()> {
        check_tier(self.tier, &item)?;
        self.items.write().await.insert(item.id.clone(), item);
        Ok(())
    }

    async fn retrieve(&self, id: &MemoryId) -> MemoryResult<Option<MemoryItem>> {
        Ok(self.items.read().await.get(id).cloned())
    }

    async fn update(&self, item: MemoryItem) -> MemoryResult<()> {
        self.store(item).await
    }

    async fn delete(&self, id: &MemoryId) -> MemoryResult<()> {
        self.items.write().await.remove(id);
        Ok(())
    }

    async fn search(&self, query: &MemoryQuery) -> MemoryResult<Vec<MemoryItem>> {
        Ok(run_search(&*self.items.read().await, query))
    }

    async fn list(&self, offset: usize, limit: usize) -> MemoryResult<Vec<MemoryItem>> {
        let items = self.items.read().await;
        let mut all: Vec<MemoryItem> = items.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&self) -> MemoryResult<usize> {
        Ok(self.items.read().await.len())
    }

    async fn clear(&self) -> MemoryResult<()> {
        self.items.write().await.clear();
        Ok(())
    }
}

/// File snapshot format
#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    tier: MemoryTier,
    items: Vec<MemoryItem>,
}

/// File-backed tier store: a versioned JSON snapshot per tier
#[derive(Debug)]
pub struct FileStore {
    tier: MemoryTier,
    path: PathBuf,
    items: Arc<RwLock<HashMap<MemoryId, MemoryItem>>>,
}

impl FileStore {
    /// Open (or create) a file store for a tier
    pub async fn open(tier: MemoryTier, path: impl AsRef<Path>) -> MemoryResult<Self> {
        let path = path.as_ref().to_path_buf();
        let items = if path.exists() {
            Self::load(&path, tier).await?
        } else {
            HashMap::new()
        };

        Ok(Self {
            tier,
            path,
            items: Arc::new(RwLock::new(items)),
        })
    }

    async fn load(path: &Path, tier: MemoryTier) -> MemoryResult<HashMap<MemoryId, MemoryItem>> {
        let content = tokio::fs::read_to_string(path).await?;
        let file: StoreFile = serde_json::from_str(&content)?;
        if file.tier != tier {
            return Err(MemoryError::corrupted(format!(
                "store file {} holds {} items, expected {}",
                path.display(),
                file.tier,
                tier
            )));
        }
        Ok(file.items.into_iter().map(|m| (m.id.clone(), m)).collect())
    }

    async fn save(&self) -> MemoryResult<()> {
        let snapshot = {
            let items = self.items.read().await;
            StoreFile {
                version: 1,
                tier: self.tier,
                items: items.values().cloned().collect(),
            }
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }

    /// Force save to disk
    pub async fn flush(&self) -> MemoryResult<()> {
        self.save().await
    }

    /// Snapshot path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MemoryStore for FileStore {
    fn tier(&self) -> MemoryTier {
        self.tier
    }

    async fn store(&self, item: MemoryItem) -> MemoryResult<()> {
        check_tier(self.tier, &item)?;
        self.items.write().await.insert(item.id.clone(), item);
        self.save().await
    }

    async fn retrieve(&self, id: &MemoryId) -> MemoryResult<Option<MemoryItem>> {
        Ok(self.items.read().await.get(id).cloned())
    }

    async fn update(&self, item: MemoryItem) -> MemoryResult<()> {
        self.store(item).await
    }

    async fn delete(&self, id: &MemoryId) -> MemoryResult<()> {
        self.items.write().await.remove(id);
        self.save().await
    }

    async fn search(&self, query: &MemoryQuery) -> MemoryResult<Vec<MemoryItem>> {
        Ok(run_search(&*self.items.read().await, query))
    }

    async fn list(&self, offset: usize, limit: usize) -> MemoryResult<Vec<MemoryItem>> {
        let items = self.items.read().await;
        let mut all: Vec<MemoryItem> = items.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&self) -> MemoryResult<usize> {
        Ok(self.items.read().await.len())
    }

    async fn clear(&self) -> MemoryResult<()> {
        self.items.write().await.clear();
        self.save().await
    }
}

/// One store per tier, shared by the engines and the facade
#[derive(Clone)]
pub struct TierStores {
    working: Arc<dyn MemoryStore>,
    episodic: Arc<dyn MemoryStore>,
    semantic: Arc<dyn MemoryStore>,
}

impl TierStores {
    /// Build from three tier stores
    pub fn new(
        working: Arc<dyn MemoryStore>,
        episodic: Arc<dyn MemoryStore>,
        semantic: Arc<dyn MemoryStore>,
    ) -> Self {
        Self {
            working,
            episodic,
            semantic,
        }
    }

    /// All tiers in-memory
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryStore::new(MemoryTier::Working)),
            Arc::new(InMemoryStore::new(MemoryTier::Episodic)),
            Arc::new(InMemoryStore::new(MemoryTier::Semantic)),
        )
    }

    /// All tiers file-backed under a directory (`working.json` etc.)
    pub async fn file_backed(dir: impl AsRef<Path>) -> MemoryResult<Self> {
        let dir = dir.as_ref();
        let open = |tier: MemoryTier| FileStore::open(tier, dir.join(format!("{}.json", tier.name())));
        Ok(Self::new(
            Arc::new(open(MemoryTier::Working).await?),
            Arc::new(open(MemoryTier::Episodic).await?),
            Arc::new(open(MemoryTier::Semantic).await?),
        ))
    }

    /// The store for a tier
    pub fn get(&self, tier: MemoryTier) -> &Arc<dyn MemoryStore> {
        match tier {
            MemoryTier::Working => &self.working,
            MemoryTier::Episodic => &self.episodic,
            MemoryTier::Semantic => &self.semantic,
        }
    }

    /// Stores in facade probe order
    pub fn iter(&self) -> impl Iterator<Item = (MemoryTier, &Arc<dyn MemoryStore>)> {
        MemoryTier::ALL.iter().map(move |&tier| (tier, self.get(tier)))
    }
}
