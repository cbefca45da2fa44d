//! Metadata stage: `DISCOVERED` → `INITIALIZING` → `METADATA_READY`
//!
//! The only stage that takes an in-progress marker. The CAS to
//! `INITIALIZING` claims the item; on a transient provider failure the
//! worker reverts the claim so a later redelivery re-enters the stage
//! cleanly, then rethrows for the scheduler's backoff.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::metrics;
use crate::models::ContentStatus;
use crate::provider::MetadataProvider;
use crate::storage::ContentRepository;

use super::fail_or_retry;

/// Worker for the metadata stage
pub struct MetadataWorker {
    content: Arc<dyn ContentRepository>,
    provider: Arc<dyn MetadataProvider>,
}

impl MetadataWorker {
    pub fn new(content: Arc<dyn ContentRepository>, provider: Arc<dyn MetadataProvider>) -> Self {
        Self { content, provider }
    }

    /// Process one metadata task
    pub async fn handle(&self, content_id: &str) -> Result<()> {
        let Some(item) = self.content.get(content_id)? else {
            warn!(content_id, "metadata task for missing entity, dropping");
            return Ok(());
        };

        match item.status {
            ContentStatus::Discovered => {
                if !self.content.cas_status(
                    content_id,
                    ContentStatus::Discovered,
                    ContentStatus::Initializing,
                )? {
                    debug!(content_id, "claim lost, stale delivery");
                    return Ok(());
                }
                metrics::record_stage_transition(ContentStatus::Initializing.as_str());
            }
            // A prior delivery claimed the item but never settled (crash or
            // missed revert); resume the fetch under the existing claim.
            ContentStatus::Initializing => {
                debug!(content_id, "resuming in-flight metadata fetch");
            }
            status => {
                debug!(content_id, %status, "stale metadata delivery, no-op");
                return Ok(());
            }
        }

        match self.provider.fetch(&item.source_id).await {
            Ok(meta) => {
                if self.content.store_metadata(content_id, &meta)? {
                    debug!(
                        content_id,
                        duration_secs = meta.duration_secs,
                        "metadata stored"
                    );
                    metrics::record_stage_transition(ContentStatus::MetadataReady.as_str());
                } else {
                    debug!(content_id, "metadata store skipped, status moved on");
                }
                Ok(())
            }
            Err(err) => fail_or_retry(
                self.content.as_ref(),
                content_id,
                Some((ContentStatus::Initializing, ContentStatus::Discovered)),
                err.into(),
            ),
        }
    }
}
