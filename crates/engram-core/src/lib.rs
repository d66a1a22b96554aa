//! Engram Core Library
//!
//! Hierarchical memory subsystem for AI agents: a multi-tier store
//! (working, episodic, semantic), a retrieval layer (context, similarity,
//! association), and a background consolidation process that promotes,
//! re-scores, merges, and expires entries.
//!
//! The outward surface is [`MemorySystem`]: collaborators store and fetch
//! memories through it and never touch tier state directly.
//!
//! ```no_run
//! use engram_core::{MemoryConfig, MemoryContent, MemorySystem, MemoryTier, StoreAttributes};
//!
//! # async fn example() -> Result<(), engram_core::MemoryError> {
//! let memory = MemorySystem::new(MemoryConfig::default()).await?;
//!
//! let id = memory
//!     .store(
//!         MemoryContent::text("AI agents are autonomous"),
//!         MemoryTier::Semantic,
//!         StoreAttributes::new().concept("AI agents").tags(["AI", "agents"]),
//!     )
//!     .await?;
//!
//! let item = memory.retrieve(&id).await?;
//! assert!(item.is_some());
//! memory.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consolidation;
pub mod error;
pub mod retrieval;
pub mod scheduler;
pub mod store;
pub mod system;
pub mod types;

// Re-export commonly used types
pub use config::MemoryConfig;
pub use consolidation::{ConsolidationEngine, ConsolidationStats};
pub use error::{MemoryError, MemoryResult};
pub use retrieval::{RetrievalEngine, RetrievalRecord};
pub use scheduler::ConsolidationScheduler;
pub use store::{FileStore, InMemoryStore, MemoryStore, TierStores};
pub use system::{MemorySystem, StoreAttributes, TierStats};
pub use types::{
    MemoryContent, MemoryId, MemoryItem, MemoryQuery, MemoryTier, RetrievalContext, TierPayload,
    TimeRange,
};
