//! Work-queue collaborator interface
//!
//! The pipeline talks to its scheduler through the [`WorkQueue`] trait:
//! at-least-once delivery, retry-on-error with exponential backoff, delayed
//! one-shots, dedupe keys, and repeating tasks registered by stable key.
//! [`memory::InMemoryQueue`] provides the in-process implementation used by
//! the composition root and tests.
//!
//! Task and schedule identities are typed; the string form is produced by
//! one pure function per key so collisions cannot arise from ad-hoc
//! formatting at call sites.

pub mod memory;

pub use memory::{InMemoryQueue, QueueRunner, QueueSnapshot, QueueStats, RunnerConfig};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::ChunkSpec;

/// Errors from the work queue
#[derive(Error, Debug)]
pub enum QueueError {
    /// The queue is shut down
    #[error("queue is closed")]
    Closed,

    /// A repeating pattern could not be interpreted
    #[error("invalid schedule pattern: {0}")]
    InvalidPattern(String),
}

/// One unit of pipeline work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    /// Bring a new source id into the pipeline
    Discover { source_id: String },

    /// Fetch metadata for a discovered item
    FetchMetadata { content_id: String },

    /// Batch-poll metadata-ready items and fan out insight tasks
    ReadinessScan,

    /// Gather the insight for one chunk
    GatherInsight { content_id: String, chunk: ChunkSpec },

    /// Run one research prompt over a gathered item
    Research {
        content_id: String,
        prompt_id: String,
    },

    /// Clear an expired overload entry for one model
    OverloadSweep { model: String },

    /// Sweep expired quota windows and old violations
    DailyCleanup,
}

/// Stage a task routes to (one worker pool per stage)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Discovery,
    Metadata,
    Readiness,
    Insight,
    Research,
    Housekeeping,
}

impl Task {
    /// The stage this task belongs to
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Discover { .. } => TaskKind::Discovery,
            Self::FetchMetadata { .. } => TaskKind::Metadata,
            Self::ReadinessScan => TaskKind::Readiness,
            Self::GatherInsight { .. } => TaskKind::Insight,
            Self::Research { .. } => TaskKind::Research,
            Self::OverloadSweep { .. } | Self::DailyCleanup => TaskKind::Housekeeping,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Discovery => "discovery",
            Self::Metadata => "metadata",
            Self::Readiness => "readiness",
            Self::Insight => "insight",
            Self::Research => "research",
            Self::Housekeeping => "housekeeping",
        };
        write!(f, "{name}")
    }
}

/// Dedupe key for one chunk's insight task
pub fn insight_dedupe_key(content_id: &str, chunk_index: u32) -> String {
    format!("insight:{content_id}:{chunk_index}")
}

/// Dedupe key for one research task
pub fn research_dedupe_key(content_id: &str, prompt_id: &str) -> String {
    format!("research:{content_id}:{prompt_id}")
}

/// Exponential backoff specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    /// Base delay in milliseconds; attempt n waits `base * 2^(n-1)`
    pub base_delay_ms: u64,
}

impl Backoff {
    /// Delay cap so late attempts do not wait unboundedly
    pub const MAX_DELAY_MS: u64 = 300_000;

    /// Delay before the given retry attempt (attempt 1 is the first retry)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << (attempt - 1).min(16));
        Duration::from_millis(exp.min(Self::MAX_DELAY_MS))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
        }
    }
}

/// Options for one enqueue
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Priority hint; the in-memory queue delivers FIFO and ignores it
    pub priority: Option<u8>,

    /// Deliver no earlier than this far in the future
    pub delay: Option<Duration>,

    /// Maximum delivery attempts (0 means the default)
    pub attempts: u32,

    /// Retry backoff
    pub backoff: Backoff,

    /// Suppress the enqueue if a task with this key is already active
    pub dedupe_key: Option<String>,
}

impl EnqueueOptions {
    /// Default attempts when none are given
    pub const DEFAULT_ATTEMPTS: u32 = 5;

    /// Effective attempts cap
    pub fn effective_attempts(&self) -> u32 {
        if self.attempts == 0 {
            Self::DEFAULT_ATTEMPTS
        } else {
            self.attempts
        }
    }

    /// Options with a dedupe key
    pub fn deduped(key: String) -> Self {
        Self {
            dedupe_key: Some(key),
            ..Self::default()
        }
    }

    /// Options with a delivery delay
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }
}

/// Stable identity of a repeating schedule.
///
/// The string form is produced here and nowhere else.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScheduleKey {
    /// The daily cleanup schedule
    DailyCleanup,

    /// Delayed overload sweep for one model
    OverloadSweep { model: String },

    /// The recurring readiness scan
    ReadinessScan,
}

impl ScheduleKey {
    /// Produce the stable string form
    pub fn as_key(&self) -> String {
        match self {
            Self::DailyCleanup => "daily-cleanup".to_string(),
            Self::OverloadSweep { model } => format!("overload-sweep:{model}"),
            Self::ReadinessScan => "readiness-scan".to_string(),
        }
    }
}

/// When a repeating task fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepeatPattern {
    /// Once a day at a fixed local time ("HH:MM")
    Daily { time: String },

    /// Every fixed number of seconds
    Every { secs: u64 },
}

impl RepeatPattern {
    /// Validate the pattern
    pub fn validate(&self) -> Result<(), QueueError> {
        match self {
            Self::Daily { time } => {
                NaiveTime::parse_from_str(time, "%H:%M")
                    .map_err(|_| QueueError::InvalidPattern(format!("bad time '{time}'")))?;
                Ok(())
            }
            Self::Every { secs } => {
                if *secs == 0 {
                    return Err(QueueError::InvalidPattern("interval of 0s".to_string()));
                }
                Ok(())
            }
        }
    }

    /// Time until the next firing, measured from `now`
    pub fn wait_from(&self, now: DateTime<Local>) -> Duration {
        match self {
            Self::Every { secs } => Duration::from_secs((*secs).max(1)),
            Self::Daily { time } => {
                let Ok(target_time) = NaiveTime::parse_from_str(time, "%H:%M") else {
                    return Duration::from_secs(3_600);
                };

                let today = now.date_naive().and_time(target_time);
                let candidate = if today > now.naive_local() {
                    today
                } else {
                    match now.date_naive().succ_opt() {
                        Some(tomorrow) => tomorrow.and_time(target_time),
                        None => return Duration::from_secs(86_400),
                    }
                };

                (candidate - now.naive_local())
                    .to_std()
                    .unwrap_or(Duration::from_secs(86_400))
            }
        }
    }
}

/// The work-queue collaborator
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue one task
    async fn enqueue(&self, task: Task, opts: EnqueueOptions) -> Result<(), QueueError>;

    /// Register (or replace) a repeating task under a stable key.
    /// Re-registration with the same key never creates duplicates.
    async fn register_repeating(
        &self,
        key: ScheduleKey,
        pattern: RepeatPattern,
        task: Task,
    ) -> Result<(), QueueError>;

    /// Remove a repeating task by key
    async fn remove_repeating(&self, key: ScheduleKey) -> Result<(), QueueError>;
}

/// Consumer side: the pipeline implements this and the queue drives it
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Process one delivered task.
    ///
    /// Returning a recoverable error re-delivers the task after backoff, up
    /// to the attempts cap; any other return completes the delivery.
    async fn handle(&self, task: &Task) -> crate::error::Result<()>;
}
