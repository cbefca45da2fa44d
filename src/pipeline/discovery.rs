//! Discovery stage: bring a source id into the pipeline
//!
//! Creates the content item at `DISCOVERED` and enqueues the metadata
//! fetch. A source id that is already known is a duplicate delivery; the
//! worker re-enqueues the metadata task only when the item is still waiting
//! on it, so a crash between insert and enqueue heals on redelivery.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::metrics;
use crate::models::{ContentItem, ContentStatus};
use crate::queue::{EnqueueOptions, Task, WorkQueue};
use crate::storage::ContentRepository;

/// Worker for the discovery stage
pub struct DiscoveryWorker {
    content: Arc<dyn ContentRepository>,
    queue: Arc<dyn WorkQueue>,
    enqueue_opts: EnqueueOptions,
}

impl DiscoveryWorker {
    pub fn new(
        content: Arc<dyn ContentRepository>,
        queue: Arc<dyn WorkQueue>,
        enqueue_opts: EnqueueOptions,
    ) -> Self {
        Self {
            content,
            queue,
            enqueue_opts,
        }
    }

    /// Process one discovery task
    pub async fn handle(&self, source_id: &str) -> Result<()> {
        if source_id.trim().is_empty() {
            // Nothing to mark failed; the payload itself is invalid
            warn!("discovery task with empty source id, dropping");
            return Ok(());
        }

        if let Some(existing) = self.content.get_by_source(source_id)? {
            debug!(source_id, status = %existing.status, "source already known");
            if existing.status == ContentStatus::Discovered {
                self.enqueue_metadata(&existing.id).await?;
            }
            return Ok(());
        }

        let item = ContentItem::discovered(source_id);
        if !self.content.insert_discovered(&item)? {
            // Lost a race with a concurrent discovery of the same source
            debug!(source_id, "concurrent discovery won the insert");
            return Ok(());
        }

        debug!(source_id, content_id = %item.id, "content item discovered");
        metrics::record_stage_transition(ContentStatus::Discovered.as_str());

        self.enqueue_metadata(&item.id).await
    }

    async fn enqueue_metadata(&self, content_id: &str) -> Result<()> {
        self.queue
            .enqueue(
                Task::FetchMetadata {
                    content_id: content_id.to_string(),
                },
                self.enqueue_opts.clone(),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;
    use crate::storage::SqliteStore;

    fn fixture() -> (
        Arc<SqliteStore>,
        Arc<InMemoryQueue>,
        DiscoveryWorker,
        crate::queue::QueueRunner,
    ) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        // The runner is held (not run) so enqueued tasks stay pending
        let (queue, runner) = InMemoryQueue::new();
        let worker = DiscoveryWorker::new(store.clone(), queue.clone(), EnqueueOptions::default());
        (store, queue, worker, runner)
    }

    #[tokio::test]
    async fn test_creates_item_and_enqueues_metadata() {
        let (store, queue, worker, _runner) = fixture();

        worker.handle("vid-1").await.unwrap();

        let item = store.get_by_source("vid-1").unwrap().unwrap();
        assert_eq!(item.status, ContentStatus::Discovered);
        assert_eq!(queue.stats().enqueued, 1);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_safe() {
        let (store, _queue, worker, _runner) = fixture();

        worker.handle("vid-1").await.unwrap();
        worker.handle("vid-1").await.unwrap();

        // One item, not two
        let items = store.list_by_status(ContentStatus::Discovered, 10).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_source_id_is_dropped() {
        let (store, queue, worker, _runner) = fixture();

        worker.handle("  ").await.unwrap();

        assert!(store.list_all(10).unwrap().is_empty());
        assert_eq!(queue.stats().enqueued, 0);
    }
}
