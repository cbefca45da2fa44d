//! Persistent store for pipeline entities and quota accounting
//!
//! This module provides trait-based repository abstractions to decouple
//! pipeline logic from storage implementations, enabling:
//! - Easy testing with in-memory implementations
//! - Swappable storage backends
//! - Clear separation of concerns
//!
//! The quota repository exposes the one primitive the admission controller
//! depends on: an atomic increment-or-create on a keyed counter row. All
//! quota mutation goes through it; there is no read-modify-write path.

pub mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{
    ContentItem, ContentMetadata, ContentStatus, InsightRecord, QuotaViolation, ResearchResult,
};

/// Errors from the persistent store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database errors
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored value could not be interpreted
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Counters of one (model, minute-bucket) quota window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowUsage {
    /// Requests recorded in the window
    pub requests: u32,

    /// Tokens recorded in the window
    pub tokens: u64,
}

/// Repository for quota windows and violation audit records
pub trait QuotaRepository: Send + Sync {
    /// Atomically increment-or-create the minute window row and the
    /// parallel day counter for `model`, refreshing the rows' expiry.
    ///
    /// This must be a single atomic upsert per row at the store; callers
    /// never read-modify-write quota counters.
    fn increment_usage(
        &self,
        model: &str,
        minute_key: &str,
        day_key: &str,
        tokens: u64,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Read the counters of one minute window (zero if absent)
    fn window_usage(&self, model: &str, minute_key: &str) -> StoreResult<WindowUsage>;

    /// Read the day counter (zero if absent)
    fn daily_usage(&self, model: &str, day_key: &str) -> StoreResult<u32>;

    /// Append a quota violation audit record
    fn record_violation(&self, violation: &QuotaViolation) -> StoreResult<()>;

    /// Most recent violations, newest first
    fn recent_violations(&self, limit: usize) -> StoreResult<Vec<QuotaViolation>>;

    /// Delete quota rows and violations whose expiry has passed.
    /// Returns the number of rows removed.
    fn sweep_expired(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}

/// Repository for content items and their child records.
///
/// Every status write is a compare-and-set against the caller's expected
/// current status; a `false` return means the precondition no longer holds
/// (a concurrent or duplicate delivery won the race).
pub trait ContentRepository: Send + Sync {
    /// Insert a freshly discovered item. Returns `false` if an item with
    /// the same source id already exists.
    fn insert_discovered(&self, item: &ContentItem) -> StoreResult<bool>;

    /// Fetch by internal id
    fn get(&self, id: &str) -> StoreResult<Option<ContentItem>>;

    /// Fetch by external source id
    fn get_by_source(&self, source_id: &str) -> StoreResult<Option<ContentItem>>;

    /// Items currently at `status`, oldest first, bounded page
    fn list_by_status(&self, status: ContentStatus, limit: usize) -> StoreResult<Vec<ContentItem>>;

    /// All items, newest first, bounded page
    fn list_all(&self, limit: usize) -> StoreResult<Vec<ContentItem>>;

    /// Compare-and-set the status. Returns `false` if the current status
    /// is not `from`.
    fn cas_status(&self, id: &str, from: ContentStatus, to: ContentStatus) -> StoreResult<bool>;

    /// Store metadata and advance `Initializing` to `MetadataReady`
    fn store_metadata(&self, id: &str, meta: &ContentMetadata) -> StoreResult<bool>;

    /// Record the fan-out and advance `MetadataReady` to `InsightsQueued`
    fn mark_insights_queued(&self, id: &str, chunk_count: u32) -> StoreResult<bool>;

    /// Advance `InsightsQueued` to `InsightsGathered`
    fn mark_insights_gathered(&self, id: &str) -> StoreResult<bool>;

    /// Mark the item failed and store the error message
    fn mark_failed(&self, id: &str, error: &str) -> StoreResult<()>;

    /// Return the item to `MetadataReady` and purge its insight and
    /// research child records. Only legal once metadata has been stored;
    /// returns `false` otherwise.
    fn reset_to_metadata_ready(&self, id: &str) -> StoreResult<bool>;

    /// Upsert a chunk insight (unique per content + chunk index)
    fn store_insight(&self, record: &InsightRecord) -> StoreResult<()>;

    /// Check whether a chunk insight exists
    fn insight_exists(&self, content_id: &str, chunk_index: u32) -> StoreResult<bool>;

    /// Count stored chunk insights for an item
    fn insight_count(&self, content_id: &str) -> StoreResult<u32>;

    /// All insights for an item, by chunk index
    fn list_insights(&self, content_id: &str) -> StoreResult<Vec<InsightRecord>>;

    /// Upsert a research result (unique per content + prompt id)
    fn store_research(&self, record: &ResearchResult) -> StoreResult<()>;

    /// Check whether a research result exists
    fn research_exists(&self, content_id: &str, prompt_id: &str) -> StoreResult<bool>;

    /// All research results for an item
    fn list_research(&self, content_id: &str) -> StoreResult<Vec<ResearchResult>>;
}
