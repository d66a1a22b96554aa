//! Memory types and data structures

use crate::error::{MemoryError, MemoryResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};

/// Default working-memory lifetime when no expiry is given
pub const DEFAULT_WORKING_TTL_SECS: i64 = 3600;

/// Default priority for working memory items (valid range 1..=10)
pub const DEFAULT_WORKING_PRIORITY: u8 = 5;

/// Unique memory identifier
///
/// Ids carry a tier prefix for readability (`working_1a2b3c4d`) but are
/// unique across all tiers: the suffix comes from a v4 UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryId(pub String);

impl MemoryId {
    /// Create a new random memory ID for a tier
    pub fn new(tier: MemoryTier) -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}_{}", tier.name(), &hex[..8]))
    }

    /// Create from string
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Memory tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTier {
    /// Short-lived, in-flight context
    Working,
    /// Records of specific past events and interactions
    Episodic,
    /// Durable facts and knowledge
    Semantic,
}

impl MemoryTier {
    /// All tiers, in facade probe order
    pub const ALL: [MemoryTier; 3] = [Self::Working, Self::Episodic, Self::Semantic];

    /// Lowercase tier name, as used in ids and the wire representation
    pub fn name(&self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
        }
    }
}

impl std::fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Memory content: plain text or a structured record
///
/// The wire form is a tagged JSON object (`{"kind": "text", "value": ...}`)
/// so content round-trips across languages without native serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum MemoryContent {
    /// Free text
    Text(String),
    /// Structured JSON record
    Structured(Value),
}

impl MemoryContent {
    /// Create text content
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }

    /// Create structured content
    pub fn structured(value: Value) -> Self {
        Self::Structured(value)
    }

    /// Get the text, if this is text content
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Structured(_) => None,
        }
    }

    /// Canonical JSON bytes, used for content hashing
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // JSON values never contain non-serializable data (no NaN, string
        // keys only), so this cannot fail in practice.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Encode as a length-prefixed JSON frame (u32 big-endian length + JSON)
    pub fn encode(&self) -> MemoryResult<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let mut buf = Vec::with_capacity(4 + json.len());
        buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
        buf.extend_from_slice(&json);
        Ok(buf)
    }

    /// Decode from a length-prefixed JSON frame
    pub fn decode(bytes: &[u8]) -> MemoryResult<Self> {
        if bytes.len() < 4 {
            return Err(MemoryError::corrupted("truncated content frame"));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        let body = bytes
            .get(4..4 + len)
            .ok_or_else(|| MemoryError::corrupted("content frame shorter than its length prefix"))?;
        Ok(serde_json::from_slice(body)?)
    }
}

/// Tier-specific fields of a memory item
///
/// Serialized internally tagged on `tier`, so the flattened item carries a
/// plain `tier` field next to the tier-specific ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "lowercase")]
pub enum TierPayload {
    /// Short-lived context tied to an in-flight task
    Working {
        #[serde(default)]
        task_id: Option<String>,
        expiry_time: DateTime<Utc>,
        priority: u8,
    },
    /// A record of a specific past event
    Episodic {
        #[serde(default)]
        context: HashMap<String, Value>,
        #[serde(default)]
        participants: Vec<String>,
        #[serde(default)]
        outcome: Option<String>,
        #[serde(default)]
        lessons_learned: Vec<String>,
    },
    /// A durable fact or concept
    Semantic {
        concept: String,
        #[serde(default)]
        relationships: HashMap<String, Vec<String>>,
        confidence_score: f32,
        #[serde(default)]
        source: Option<String>,
    },
}

impl TierPayload {
    /// Working payload with defaults (expiry = now + 1h, priority 5)
    pub fn working() -> Self {
        Self::Working {
            task_id: None,
            expiry_time: Utc::now() + Duration::seconds(DEFAULT_WORKING_TTL_SECS),
            priority: DEFAULT_WORKING_PRIORITY,
        }
    }

    /// Episodic payload with empty fields
    pub fn episodic() -> Self {
        Self::Episodic {
            context: HashMap::new(),
            participants: Vec::new(),
            outcome: None,
            lessons_learned: Vec::new(),
        }
    }

    /// Semantic payload for a concept, confidence 1.0
    pub fn semantic(concept: impl Into<String>) -> Self {
        Self::Semantic {
            concept: concept.into(),
            relationships: HashMap::new(),
            confidence_score: 1.0,
            source: None,
        }
    }

    /// The tier this payload belongs to
    pub fn tier(&self) -> MemoryTier {
        match self {
            Self::Working { .. } => MemoryTier::Working,
            Self::Episodic { .. } => MemoryTier::Episodic,
            Self::Semantic { .. } => MemoryTier::Semantic,
        }
    }
}

/// A memory item: base fields shared by every tier plus the tier payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Unique identifier (unique across all tiers)
    pub id: MemoryId,
    /// The stored content
    pub content: MemoryContent,
    /// Tier-specific fields; yields the `tier` field in the wire form
    #[serde(flatten)]
    pub payload: TierPayload,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last accessed timestamp
    pub last_accessed: DateTime<Utc>,
    /// Access count
    pub access_count: u32,
    /// Importance score, always within [0, 1]
    importance_score: f32,
    /// Tags
    pub tags: BTreeSet<String>,
    /// String-keyed metadata
    pub metadata: HashMap<String, Value>,
}

impl MemoryItem {
    /// Create a new memory item with a fresh id for the payload's tier
    pub fn new(content: MemoryContent, payload: TierPayload) -> Self {
        let now = Utc::now();
        Self {
            id: MemoryId::new(payload.tier()),
            content,
            payload,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            importance_score: 0.5,
            tags: BTreeSet::new(),
            metadata: HashMap::new(),
        }
    }

    /// Set importance (clamped)
    pub fn with_importance(mut self, score: f32) -> Self {
        self.set_importance(score);
        self
    }

    /// Set tags
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(|t| t.into()).collect();
        self
    }

    /// Set metadata
    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// The item's tier
    pub fn tier(&self) -> MemoryTier {
        self.payload.tier()
    }

    /// Importance score, guaranteed within [0, 1]
    pub fn importance(&self) -> f32 {
        self.importance_score
    }

    /// Set the importance score, clamping to [0, 1]
    pub fn set_importance(&mut self, score: f32) {
        self.importance_score = score.clamp(0.0, 1.0);
    }

    /// Mark as accessed: refresh `last_accessed` and bump `access_count`
    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
        self.access_count = self.access_count.saturating_add(1);
    }

    /// Check whether the item carries a tag
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Hex SHA-256 of the canonical content encoding
    pub fn content_hash(&self) -> String {
        format!("{:x}", Sha256::digest(self.content.canonical_bytes()))
    }

    /// Whether a working item's expiry time has passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match &self.payload {
            TierPayload::Working { expiry_time, .. } => *expiry_time < now,
            _ => false,
        }
    }
}

/// Query for a tier store's `search`
///
/// Tag filtering uses AND semantics: every listed tag must be present on
/// the item.
#[derive(Debug, Clone, Default)]
pub struct MemoryQuery {
    /// Minimum importance score
    pub min_importance: Option<f32>,
    /// Required tags (all must be present)
    pub tags: Vec<String>,
    /// Only items created after this time
    pub created_after: Option<DateTime<Utc>>,
    /// Maximum results (stores default to 100 when unset)
    pub limit: Option<usize>,
}

impl MemoryQuery {
    /// Create an empty query
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum importance
    pub fn min_importance(mut self, score: f32) -> Self {
        self.min_importance = Some(score);
        self
    }

    /// Require a tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Require several tags
    pub fn tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags.extend(tags.into_iter().map(|t| t.into()));
        self
    }

    /// Only items created after a time
    pub fn created_after(mut self, time: DateTime<Utc>) -> Self {
        self.created_after = Some(time);
        self
    }

    /// Limit results
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Time range for context-based retrieval
#[derive(Debug, Clone, Default)]
pub struct TimeRange {
    /// Range start (maps to `created_after`)
    pub start: Option<DateTime<Utc>>,
    /// Range end (informational; not used for filtering)
    pub end: Option<DateTime<Utc>>,
}

/// Context describing what a caller is currently doing, used to pull
/// relevant memories before composing a model request
#[derive(Debug, Clone, Default)]
pub struct RetrievalContext {
    /// Keywords, matched against item tags
    pub keywords: Vec<String>,
    /// Restrict to a time window
    pub time_range: Option<TimeRange>,
    /// Minimum importance
    pub importance_threshold: Option<f32>,
    /// Per-tier result limit (engine defaults to 50 when unset)
    pub limit: Option<usize>,
}

impl RetrievalContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a keyword
    pub fn keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keywords.push(keyword.into());
        self
    }

    /// Add several keywords
    pub fn keywords(mut self, keywords: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.keywords.extend(keywords.into_iter().map(|k| k.into()));
        self
    }

    /// Restrict to items created after a time
    pub fn after(mut self, start: DateTime<Utc>) -> Self {
        self.time_range = Some(TimeRange {
            start: Some(start),
            end: None,
        });
        self
    }

    /// Set the importance threshold
    pub fn importance_threshold(mut self, threshold: f32) -> Self {
        self.importance_threshold = Some(threshold);
        self
    }

    /// Set the per-tier limit
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
