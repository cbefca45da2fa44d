// Core data structures for the yeoul pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a content item.
///
/// The pipeline is linear; every forward transition is conditioned on the
/// immediately preceding status, so an item cannot skip or regress a stage
/// except through [`ContentStatus::Failed`] or an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentStatus {
    /// Known to the pipeline, nothing fetched yet
    Discovered,
    /// Metadata fetch in progress
    Initializing,
    /// Metadata stored, waiting for the readiness scan
    MetadataReady,
    /// Chunk plan computed, insight tasks fanned out
    InsightsQueued,
    /// All planned chunk insights stored
    InsightsGathered,
    /// Terminal failure, `last_error` carries the reason
    Failed,
}

impl ContentStatus {
    /// Get string representation (stored in the database)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Initializing => "initializing",
            Self::MetadataReady => "metadata_ready",
            Self::InsightsQueued => "insights_queued",
            Self::InsightsGathered => "insights_gathered",
            Self::Failed => "failed",
        }
    }

    /// Create from string representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discovered" => Some(Self::Discovered),
            "initializing" => Some(Self::Initializing),
            "metadata_ready" => Some(Self::MetadataReady),
            "insights_queued" => Some(Self::InsightsQueued),
            "insights_gathered" => Some(Self::InsightsGathered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Check if this status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed)
    }

    /// The single legal forward successor, if any
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Discovered => Some(Self::Initializing),
            Self::Initializing => Some(Self::MetadataReady),
            Self::MetadataReady => Some(Self::InsightsQueued),
            Self::InsightsQueued => Some(Self::InsightsGathered),
            Self::InsightsGathered | Self::Failed => None,
        }
    }

    /// Check whether `to` is a legal transition target from this status.
    ///
    /// Legal moves are the single forward step, `Failed` from any
    /// non-terminal state, and the metadata-stage revert
    /// (`Initializing` back to `Discovered`).
    pub fn can_transition_to(&self, to: Self) -> bool {
        if to == Self::Failed {
            return !self.is_terminal();
        }
        if *self == Self::Initializing && to == Self::Discovered {
            return true;
        }
        self.next() == Some(to)
    }
}

impl std::fmt::Display for ContentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A content item moving through the pipeline.
///
/// Owned exclusively by the pipeline; mutated only through status-guarded
/// repository updates. Never deleted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    /// Internal identifier
    pub id: String,

    /// External source identifier (video id)
    pub source_id: String,

    /// Title from the metadata provider
    pub title: Option<String>,

    /// Description from the metadata provider
    pub description: Option<String>,

    /// Total duration in seconds
    pub duration_secs: Option<u32>,

    /// View count at metadata-fetch time
    pub view_count: Option<u64>,

    /// Publish timestamp from the metadata provider
    pub published_at: Option<DateTime<Utc>>,

    /// Current pipeline status
    pub status: ContentStatus,

    /// When the item entered the pipeline
    pub discovered_at: DateTime<Utc>,

    /// When metadata was stored
    pub metadata_at: Option<DateTime<Utc>>,

    /// When insight tasks were fanned out
    pub insights_queued_at: Option<DateTime<Utc>>,

    /// When the last planned chunk insight landed
    pub insights_gathered_at: Option<DateTime<Utc>>,

    /// Number of chunks in the fan-out plan
    pub chunk_count: Option<u32>,

    /// Most recent error message
    pub last_error: Option<String>,
}

impl ContentItem {
    /// Create a freshly discovered item
    pub fn discovered(source_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_id: source_id.into(),
            title: None,
            description: None,
            duration_secs: None,
            view_count: None,
            published_at: None,
            status: ContentStatus::Discovered,
            discovered_at: Utc::now(),
            metadata_at: None,
            insights_queued_at: None,
            insights_gathered_at: None,
            chunk_count: None,
            last_error: None,
        }
    }
}

/// Metadata payload fetched from the external metadata provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentMetadata {
    pub title: String,
    pub description: String,
    pub duration_secs: u32,
    pub view_count: u64,
    pub published_at: Option<DateTime<Utc>>,
}

/// One fixed-duration slice of a content item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpec {
    /// Zero-based chunk index
    pub index: u32,

    /// Inclusive start offset in seconds
    pub start_secs: u32,

    /// Exclusive end offset in seconds
    pub end_secs: u32,
}

/// Fixed-duration chunk plan for a content item.
///
/// Chunks are contiguous, non-overlapping `[start, end)` ranges covering
/// the full duration; the final chunk may be shorter than the chunk length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    chunks: Vec<ChunkSpec>,
}

impl ChunkPlan {
    /// Compute the plan: `ceil(duration / chunk_len)` chunks
    pub fn compute(duration_secs: u32, chunk_len_secs: u32) -> Self {
        let mut chunks = Vec::new();
        if duration_secs == 0 || chunk_len_secs == 0 {
            return Self { chunks };
        }

        let mut start = 0u32;
        let mut index = 0u32;
        while start < duration_secs {
            let end = (start + chunk_len_secs).min(duration_secs);
            chunks.push(ChunkSpec {
                index,
                start_secs: start,
                end_secs: end,
            });
            start = end;
            index += 1;
        }

        Self { chunks }
    }

    /// Number of chunks in the plan
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Check if the plan is empty
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunk specs in order
    pub fn chunks(&self) -> &[ChunkSpec] {
        &self.chunks
    }
}

/// The rate-limit dimension a quota decision or violation refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuotaKind {
    /// Requests per minute
    Rpm,
    /// Tokens per minute
    Tpm,
    /// Requests per day
    Rpd,
    /// Could not be classified from the provider payload
    Unknown,
}

impl QuotaKind {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rpm => "RPM",
            Self::Tpm => "TPM",
            Self::Rpd => "RPD",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Create from string representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RPM" => Some(Self::Rpm),
            "TPM" => Some(Self::Tpm),
            "RPD" => Some(Self::Rpd),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audit record for a quota violation.
///
/// Written both when admission is denied proactively and when the provider
/// itself rejects a call after admission; both paths share this shape.
/// Append-only, expired after seven days.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaViolation {
    /// Record identifier
    pub id: String,

    /// Model the violation applies to
    pub model: String,

    /// Raw provider error payload (absent for proactive denials)
    pub raw_payload: Option<String>,

    /// Parsed quota identifier, when recoverable from the payload
    pub quota_id: Option<String>,

    /// Violated dimension
    pub kind: QuotaKind,

    /// Tier label parsed from the quota id
    pub tier_label: String,

    /// Provider-suggested retry delay in seconds
    pub retry_delay_secs: u64,

    /// When the violation was recorded
    pub created_at: DateTime<Utc>,

    /// When the audit record expires
    pub expires_at: DateTime<Utc>,
}

impl QuotaViolation {
    /// Retention period for audit records
    pub const RETENTION_DAYS: i64 = 7;

    /// Build a record for a proactive admission denial
    pub fn from_denial(model: &str, kind: QuotaKind, tier_label: &str, wait_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            model: model.to_string(),
            raw_payload: None,
            quota_id: None,
            kind,
            tier_label: tier_label.to_string(),
            retry_delay_secs: wait_secs,
            created_at: now,
            expires_at: now + chrono::Duration::days(Self::RETENTION_DAYS),
        }
    }

    /// Build a record for a provider rejection whose payload resisted parsing
    pub fn unparsed(model: &str, raw_payload: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            model: model.to_string(),
            raw_payload: Some(raw_payload),
            quota_id: None,
            kind: QuotaKind::Unknown,
            tier_label: "Unknown".to_string(),
            retry_delay_secs: 0,
            created_at: now,
            expires_at: now + chrono::Duration::days(Self::RETENTION_DAYS),
        }
    }

    /// Whether the violated dimension is requests-per-minute
    pub fn is_rpm(&self) -> bool {
        self.kind == QuotaKind::Rpm
    }

    /// Whether the violated dimension is requests-per-day
    pub fn is_rpd(&self) -> bool {
        self.kind == QuotaKind::Rpd
    }

    /// Whether the violated dimension is tokens-per-minute
    pub fn is_tpm(&self) -> bool {
        self.kind == QuotaKind::Tpm
    }
}

/// One chunk-level insight produced by the inference provider.
///
/// At most one non-superseded record exists per (content, chunk) pair;
/// the store enforces this with an upsert on the composite key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightRecord {
    pub content_id: String,
    pub chunk_index: u32,
    pub start_secs: u32,
    pub end_secs: u32,

    /// Model that produced the insight
    pub model: String,

    /// Insight body; structured JSON when the provider honored the
    /// response schema, raw text otherwise
    pub insight: String,

    /// Whether `insight` is structured JSON
    pub structured: bool,

    pub created_at: DateTime<Utc>,
}

/// One research output per (content, prompt) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchResult {
    pub content_id: String,
    pub prompt_id: String,
    pub model: String,
    pub output: String,
    pub structured: bool,
    pub created_at: DateTime<Utc>,
}
