//! Readiness scan: `METADATA_READY` → `INSIGHTS_QUEUED`, with fan-out
//!
//! Instead of enqueueing a follow-on task per item, the upstream metadata
//! stage leaves items parked at `METADATA_READY` and this scan converts
//! them in batches: it computes a fixed-duration chunk plan per item, fans
//! out one insight task per chunk, then advances the item. Decoupling the
//! scan from metadata completion lets chunk counts be recomputed
//! independently of when metadata became available.
//!
//! Fan-out tasks carry dedupe keys, so a rescan after a partial failure
//! cannot double-enqueue a chunk.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result, YeoulErrorTrait};
use crate::metrics;
use crate::models::{ChunkPlan, ContentItem, ContentStatus};
use crate::queue::{insight_dedupe_key, EnqueueOptions, Task, WorkQueue};
use crate::storage::ContentRepository;

/// Worker for the readiness scan
pub struct ReadinessWorker {
    content: Arc<dyn ContentRepository>,
    queue: Arc<dyn WorkQueue>,
    chunk_seconds: u32,
    page_size: usize,
    enqueue_opts: EnqueueOptions,
}

impl ReadinessWorker {
    pub fn new(
        content: Arc<dyn ContentRepository>,
        queue: Arc<dyn WorkQueue>,
        chunk_seconds: u32,
        page_size: usize,
        enqueue_opts: EnqueueOptions,
    ) -> Self {
        Self {
            content,
            queue,
            chunk_seconds,
            page_size,
            enqueue_opts,
        }
    }

    /// Run one scan pass over a bounded page of ready items.
    ///
    /// Per-item validation failures mark that item failed and do not stop
    /// the pass; the first recoverable error is rethrown at the end so the
    /// scheduler retries the scan (dedupe keys make the rescan safe).
    pub async fn handle(&self) -> Result<()> {
        let ready = self
            .content
            .list_by_status(ContentStatus::MetadataReady, self.page_size)?;

        if ready.is_empty() {
            return Ok(());
        }
        debug!(count = ready.len(), "readiness scan picked up items");

        let mut first_recoverable: Option<Error> = None;

        for item in ready {
            if let Err(err) = self.fan_out(&item).await {
                if err.is_recoverable() {
                    warn!(content_id = %item.id, error = %err, "fan-out failed, will rescan");
                    first_recoverable.get_or_insert(err);
                } else {
                    warn!(content_id = %item.id, error = %err, "fan-out failed terminally");
                    self.content.mark_failed(&item.id, &err.to_string())?;
                    metrics::record_stage_transition(ContentStatus::Failed.as_str());
                }
            }
        }

        match first_recoverable {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn fan_out(&self, item: &ContentItem) -> Result<()> {
        let duration = item
            .duration_secs
            .ok_or_else(|| Error::validation(format!("item {} has no duration", item.id)))?;

        let plan = ChunkPlan::compute(duration, self.chunk_seconds);
        if plan.is_empty() {
            return Err(Error::validation(format!(
                "item {} yields an empty chunk plan (duration {duration}s)",
                item.id
            )));
        }

        for chunk in plan.chunks() {
            self.queue
                .enqueue(
                    Task::GatherInsight {
                        content_id: item.id.clone(),
                        chunk: *chunk,
                    },
                    EnqueueOptions {
                        dedupe_key: Some(insight_dedupe_key(&item.id, chunk.index)),
                        ..self.enqueue_opts.clone()
                    },
                )
                .await?;
        }

        if self
            .content
            .mark_insights_queued(&item.id, plan.len() as u32)?
        {
            debug!(content_id = %item.id, chunks = plan.len(), "insight tasks fanned out");
            metrics::record_stage_transition(ContentStatus::InsightsQueued.as_str());
        } else {
            // A concurrent scan advanced the item first; its fan-out won
            debug!(content_id = %item.id, "fan-out mark skipped, status moved on");
        }

        Ok(())
    }
}
