//! Core types for Meridian

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a chunk (`chunk-<YYYYMMDD>-<hex>`)
pub type ChunkId = String;

/// Prefix every chunk id carries
pub const CHUNK_ID_PREFIX: &str = "chunk-";

/// Maximum chunk id length
pub const MAX_CHUNK_ID_LENGTH: usize = 96;

/// Chunk id validation error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkIdError {
    Empty,
    TooLong,
    PathTraversal,
    MissingPrefix,
    InvalidChars,
}

impl ChunkIdError {
    /// Path-like ids are a security concern, the rest are plain format errors
    pub fn is_path_like(&self) -> bool {
        matches!(self, ChunkIdError::PathTraversal)
    }
}

impl std::fmt::Display for ChunkIdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkIdError::Empty => write!(f, "Chunk id cannot be empty"),
            ChunkIdError::TooLong => {
                write!(f, "Chunk id exceeds {} characters", MAX_CHUNK_ID_LENGTH)
            }
            ChunkIdError::PathTraversal => {
                write!(f, "Chunk id contains path separators or traversal sequences")
            }
            ChunkIdError::MissingPrefix => {
                write!(f, "Chunk id must start with '{}'", CHUNK_ID_PREFIX)
            }
            ChunkIdError::InvalidChars => write!(
                f,
                "Chunk id can only contain letters, numbers, hyphens, and underscores"
            ),
        }
    }
}

impl std::error::Error for ChunkIdError {}

/// Validate a chunk id before it is used as a lookup key
///
/// Rules:
/// - Not empty, at most 96 characters
/// - No `/`, `\`, `..`, NUL, and no leading `~` or `.`
/// - Starts with `chunk-`
/// - Only `[A-Za-z0-9_-]`
pub fn validate_chunk_id(s: &str) -> Result<&str, ChunkIdError> {
    if s.is_empty() {
        return Err(ChunkIdError::Empty);
    }

    if s.contains('/')
        || s.contains('\\')
        || s.contains("..")
        || s.contains('\0')
        || s.starts_with('~')
        || s.starts_with('.')
    {
        return Err(ChunkIdError::PathTraversal);
    }

    if s.len() > MAX_CHUNK_ID_LENGTH {
        return Err(ChunkIdError::TooLong);
    }

    if !s.starts_with(CHUNK_ID_PREFIX) || s.len() == CHUNK_ID_PREFIX.len() {
        return Err(ChunkIdError::MissingPrefix);
    }

    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ChunkIdError::InvalidChars);
    }

    Ok(s)
}

/// Generate a fresh chunk id for a chunk created at `created_at`
pub fn generate_chunk_id(created_at: DateTime<Utc>) -> ChunkId {
    format!(
        "{}{}-{}",
        CHUNK_ID_PREFIX,
        created_at.format("%Y%m%d"),
        uuid::Uuid::new_v4().simple()
    )
}

/// Coarse time partition (`YYYY-MM`) a chunk record is filed under
pub fn partition_for(created_at: DateTime<Utc>) -> String {
    created_at.format("%Y-%m").to_string()
}

/// Chunk type classification
///
/// The known variants cover what the remember pipeline produces; anything
/// else is carried as `Other` so the set stays open.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChunkType {
    Fact,
    Preference,
    Pattern,
    #[default]
    Note,
    Decision,
    Context,
    Learning,
    Other(String),
}

impl ChunkType {
    pub fn as_str(&self) -> &str {
        match self {
            ChunkType::Fact => "fact",
            ChunkType::Preference => "preference",
            ChunkType::Pattern => "pattern",
            ChunkType::Note => "note",
            ChunkType::Decision => "decision",
            ChunkType::Context => "context",
            ChunkType::Learning => "learning",
            ChunkType::Other(name) => name.as_str(),
        }
    }
}

impl std::fmt::Display for ChunkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChunkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        match normalized.as_str() {
            "" => Err("Chunk type cannot be empty".to_string()),
            "fact" => Ok(ChunkType::Fact),
            "preference" => Ok(ChunkType::Preference),
            "pattern" => Ok(ChunkType::Pattern),
            "note" => Ok(ChunkType::Note),
            "decision" => Ok(ChunkType::Decision),
            "context" => Ok(ChunkType::Context),
            "learning" => Ok(ChunkType::Learning),
            other => {
                if other
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
                {
                    Ok(ChunkType::Other(other.to_string()))
                } else {
                    Err(format!("Invalid chunk type: {}", s))
                }
            }
        }
    }
}

impl TryFrom<String> for ChunkType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChunkType> for String {
    fn from(value: ChunkType) -> Self {
        value.as_str().to_string()
    }
}

/// Types of links between chunks
///
/// `ContextOf`, `Follows` and `RelatedTo` are derived by the auto-linker;
/// `Supports` and `Contradicts` are asserted by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    ContextOf,
    Follows,
    RelatedTo,
    Supports,
    Contradicts,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::ContextOf => "context_of",
            LinkType::Follows => "follows",
            LinkType::RelatedTo => "related_to",
            LinkType::Supports => "supports",
            LinkType::Contradicts => "contradicts",
        }
    }

    /// Name of the reverse edge kept in the incoming index
    pub fn reverse_name(&self) -> String {
        format!("{}_reverse", self.as_str())
    }

    pub fn all() -> &'static [LinkType] {
        &[
            LinkType::ContextOf,
            LinkType::Follows,
            LinkType::RelatedTo,
            LinkType::Supports,
            LinkType::Contradicts,
        ]
    }

    /// Derived from chunk metadata at creation time
    pub fn is_auto(&self) -> bool {
        matches!(
            self,
            LinkType::ContextOf | LinkType::Follows | LinkType::RelatedTo
        )
    }

    /// Creating the link records it on both endpoints
    pub fn is_bidirectional(&self) -> bool {
        matches!(self, LinkType::ContextOf | LinkType::RelatedTo)
    }
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LinkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "context_of" | "context" => Ok(LinkType::ContextOf),
            "follows" => Ok(LinkType::Follows),
            "related_to" | "related" => Ok(LinkType::RelatedTo),
            "supports" => Ok(LinkType::Supports),
            "contradicts" => Ok(LinkType::Contradicts),
            _ => Err(format!("Unknown link type: {}", s)),
        }
    }
}

/// How a link came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkOrigin {
    #[default]
    Auto,
    Manual,
}

impl LinkOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkOrigin::Auto => "auto",
            LinkOrigin::Manual => "manual",
        }
    }
}

/// A directed, typed relation between two chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub from_id: ChunkId,
    pub to_id: ChunkId,
    pub link_type: LinkType,
    /// Strength of the relation (0.0 - 1.0)
    pub strength: f32,
    #[serde(default)]
    pub origin: LinkOrigin,
    /// Why a manual link was asserted
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Forward links of one chunk, denormalized from the link graph
///
/// Target lists keep insertion order and never hold duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkLinks(BTreeMap<LinkType, Vec<ChunkId>>);

impl ChunkLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a target; returns false when it was already present
    pub fn insert(&mut self, link_type: LinkType, target: &str) -> bool {
        let targets = self.0.entry(link_type).or_default();
        if targets.iter().any(|t| t == target) {
            return false;
        }
        targets.push(target.to_string());
        true
    }

    pub fn get(&self, link_type: LinkType) -> &[ChunkId] {
        self.0.get(&link_type).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, link_type: LinkType, target: &str) -> bool {
        self.get(link_type).iter().any(|t| t == target)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LinkType, &Vec<ChunkId>)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    /// Total number of forward edges
    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn as_map(&self) -> &BTreeMap<LinkType, Vec<ChunkId>> {
        &self.0
    }
}

impl From<BTreeMap<LinkType, Vec<ChunkId>>> for ChunkLinks {
    fn from(map: BTreeMap<LinkType, Vec<ChunkId>>) -> Self {
        Self(map)
    }
}

/// Bookkeeping attached to every chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Confidence score (0.0 - 1.0)
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    /// Where the content came from (e.g. "conversation", "import")
    #[serde(default = "default_source")]
    pub source: String,
    /// Conversation the chunk was remembered in
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub access_count: u64,
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// `sha256:<hex>` of the content, checked on every load
    pub content_hash: String,
    /// Set when the chunk is soft-deleted
    pub deleted_at: Option<DateTime<Utc>>,
}

fn default_confidence() -> f32 {
    0.7
}

fn default_source() -> String {
    "conversation".to_string()
}

/// The atomic memory unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub content: String,
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
    pub metadata: ChunkMetadata,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub links: ChunkLinks,
}

impl Chunk {
    pub fn is_active(&self) -> bool {
        self.metadata.deleted_at.is_none()
    }

    /// Tags shared with another chunk
    pub fn shared_tags(&self, other: &Chunk) -> usize {
        self.tags.iter().filter(|t| other.tags.contains(t)).count()
    }
}

/// Outcome of looking a chunk up during traversal
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkLookup {
    Found(Box<Chunk>),
    /// Soft-deleted; links pointing to it are retained
    Inactive(ChunkId),
    Missing(ChunkId),
}

impl ChunkLookup {
    pub fn found(self) -> Option<Chunk> {
        match self {
            ChunkLookup::Found(chunk) => Some(*chunk),
            _ => None,
        }
    }
}

/// Normalize a tag list: trim, lowercase, drop empties, dedupe, sort
pub fn normalize_tags<S: AsRef<str>>(tags: &[S]) -> Vec<String> {
    let mut normalized: Vec<String> = tags
        .iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}

/// Input for creating a new chunk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateChunkInput {
    pub content: String,
    #[serde(default, alias = "type")]
    pub chunk_type: ChunkType,
    #[serde(default)]
    pub tags: Vec<String>,
    pub confidence: Option<f32>,
    pub source: Option<String>,
    pub conversation_id: Option<String>,
    /// Explicit creation time (imports and backfills); defaults to now
    pub created_at: Option<DateTime<Utc>>,
}

impl CreateChunkInput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, chunk_type: ChunkType) -> Self {
        self.chunk_type = chunk_type;
        self
    }

    pub fn with_tags<S: AsRef<str>>(mut self, tags: &[S]) -> Self {
        self.tags = tags.iter().map(|t| t.as_ref().to_string()).collect();
        self
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// Input for updating a chunk; identity and links are never touched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateChunkInput {
    pub content: Option<String>,
    #[serde(alias = "type")]
    pub chunk_type: Option<ChunkType>,
    pub tags: Option<Vec<String>>,
    pub confidence: Option<f32>,
    pub source: Option<String>,
}

/// Validate a confidence value
pub fn validate_confidence(confidence: f32) -> Result<f32, String> {
    if confidence.is_nan() || !(0.0..=1.0).contains(&confidence) {
        return Err(format!(
            "Confidence must be within [0.0, 1.0], got {}",
            confidence
        ));
    }
    Ok(confidence)
}

/// How multiple tags combine in a tag listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TagMatch {
    /// Chunks carrying at least one of the tags
    #[default]
    Any,
    /// Chunks carrying every tag
    All,
}

/// Visiting order for graph traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TraversalOrder {
    #[default]
    BreadthFirst,
    DepthFirst,
}

impl std::str::FromStr for TraversalOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bfs" | "breadth_first" | "breadth-first" => Ok(TraversalOrder::BreadthFirst),
            "dfs" | "depth_first" | "depth-first" => Ok(TraversalOrder::DepthFirst),
            _ => Err(format!("Unknown traversal order: {}", s)),
        }
    }
}

/// Statistics about the chunk store
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreStats {
    pub active_chunks: i64,
    pub deleted_chunks: i64,
    pub total_links: i64,
    pub total_tags: i64,
    pub db_size_bytes: i64,
    pub storage_mode: String,
    pub schema_version: i32,
    /// Chunk count per `YYYY-MM` partition
    pub partitions: BTreeMap<String, i64>,
    pub type_counts: BTreeMap<String, i64>,
}
