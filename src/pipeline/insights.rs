//! Insight stage: per-chunk model calls, `INSIGHTS_QUEUED` → `INSIGHTS_GATHERED`
//!
//! Each task covers one chunk of one item. The insight is requested as
//! structured JSON; when the provider does not honor the schema the raw
//! text is stored instead (parse failures degrade, they do not fail the
//! chunk). The worker that lands the final planned chunk performs the
//! content-level transition and fans out the research prompts.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::models::{ChunkSpec, ContentItem, ContentStatus, InsightRecord};
use crate::queue::{research_dedupe_key, EnqueueOptions, Task, WorkQueue};
use crate::storage::ContentRepository;

use super::{fail_or_retry, ModelGateway};

/// Worker for the insight-gathering stage
pub struct InsightWorker {
    content: Arc<dyn ContentRepository>,
    gateway: Arc<ModelGateway>,
    queue: Arc<dyn WorkQueue>,
    research_prompt_ids: Vec<String>,
    streaming: bool,
    enqueue_opts: EnqueueOptions,
}

/// Response schema the provider is asked to honor for chunk insights
fn insight_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "summary": { "type": "string" },
            "topics": { "type": "array", "items": { "type": "string" } },
            "notable_moments": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["summary"]
    })
}

fn build_prompt(item: &ContentItem, chunk: &ChunkSpec) -> String {
    format!(
        "You are analyzing a segment of a video.\n\n\
         ## Video\nTitle: {}\nDescription: {}\n\n\
         ## Segment\nSeconds {} to {} (chunk {} of the video)\n\n\
         ## Task\nDescribe what this segment covers: a summary, the topics \
         touched, and any notable moments. Respond as JSON.",
        item.title.as_deref().unwrap_or("(untitled)"),
        item.description.as_deref().unwrap_or(""),
        chunk.start_secs,
        chunk.end_secs,
        chunk.index,
    )
}

impl InsightWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        content: Arc<dyn ContentRepository>,
        gateway: Arc<ModelGateway>,
        queue: Arc<dyn WorkQueue>,
        research_prompt_ids: Vec<String>,
        streaming: bool,
        enqueue_opts: EnqueueOptions,
    ) -> Self {
        Self {
            content,
            gateway,
            queue,
            research_prompt_ids,
            streaming,
            enqueue_opts,
        }
    }

    /// Process one chunk task
    pub async fn handle(&self, content_id: &str, chunk: &ChunkSpec) -> Result<()> {
        let Some(item) = self.content.get(content_id)? else {
            warn!(content_id, "insight task for missing entity, dropping");
            return Ok(());
        };

        match item.status {
            ContentStatus::InsightsQueued => {}
            // The fan-out enqueues chunk tasks before committing the
            // status; a fast delivery can arrive early. Retry rather than
            // no-op, or the chunk would be lost.
            ContentStatus::MetadataReady => {
                return Err(Error::other(format!(
                    "fan-out for {content_id} not committed yet"
                )));
            }
            status => {
                debug!(content_id, %status, "stale insight delivery, no-op");
                return Ok(());
            }
        }

        if self.content.insight_exists(content_id, chunk.index)? {
            // Duplicate delivery after the insight landed; the final
            // transition may still be owed if the earlier worker died.
            debug!(content_id, chunk = chunk.index, "insight already stored");
            return self.finalize(content_id).await;
        }

        let prompt = build_prompt(&item, chunk);
        let (model, response) = match self
            .gateway
            .generate(prompt, Some(insight_schema()), self.streaming)
            .await
        {
            Ok(result) => result,
            Err(err) => return fail_or_retry(self.content.as_ref(), content_id, None, err),
        };

        // Parse failures degrade to raw text storage
        let structured = serde_json::from_str::<serde_json::Value>(&response.text).is_ok();
        if !structured {
            debug!(content_id, chunk = chunk.index, "unstructured insight stored as raw text");
        }

        self.content.store_insight(&InsightRecord {
            content_id: content_id.to_string(),
            chunk_index: chunk.index,
            start_secs: chunk.start_secs,
            end_secs: chunk.end_secs,
            model,
            insight: response.text,
            structured,
            created_at: Utc::now(),
        })?;

        self.finalize(content_id).await
    }

    /// Advance to `INSIGHTS_GATHERED` once every planned chunk is stored,
    /// then fan out the research prompts. The CAS guarantees the research
    /// fan-out runs exactly once even when chunk workers race here.
    async fn finalize(&self, content_id: &str) -> Result<()> {
        let Some(item) = self.content.get(content_id)? else {
            return Ok(());
        };

        if item.status != ContentStatus::InsightsQueued {
            return Ok(());
        }
        let Some(expected) = item.chunk_count else {
            return Ok(());
        };

        let stored = self.content.insight_count(content_id)?;
        if stored < expected {
            debug!(content_id, stored, expected, "chunks still outstanding");
            return Ok(());
        }

        if !self.content.mark_insights_gathered(content_id)? {
            debug!(content_id, "gathered transition already applied");
            return Ok(());
        }
        debug!(content_id, chunks = stored, "all insights gathered");
        metrics::record_stage_transition(ContentStatus::InsightsGathered.as_str());

        for prompt_id in &self.research_prompt_ids {
            self.queue
                .enqueue(
                    Task::Research {
                        content_id: content_id.to_string(),
                        prompt_id: prompt_id.clone(),
                    },
                    EnqueueOptions {
                        dedupe_key: Some(research_dedupe_key(content_id, prompt_id)),
                        ..self.enqueue_opts.clone()
                    },
                )
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::ContentMetadata;
    use crate::provider::{
        GenerateRequest, GenerateResponse, InferenceProvider, ProviderError,
    };
    use crate::queue::InMemoryQueue;
    use crate::quota::{AdmissionLedger, ModelSelector, OverloadTracker, Tier};
    use crate::storage::{QuotaRepository, SqliteStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    enum Script {
        Json,
        RawText,
        QuotaRejected,
        Overloaded,
    }

    struct ScriptedInference {
        calls: AtomicU32,
        script: Script,
    }

    #[async_trait]
    impl InferenceProvider for ScriptedInference {
        async fn generate(
            &self,
            _request: &GenerateRequest,
        ) -> std::result::Result<GenerateResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script {
                Script::Json => Ok(GenerateResponse {
                    text: r#"{"summary":"a segment","topics":["x"]}"#.to_string(),
                    total_tokens: Some(321),
                }),
                Script::RawText => Ok(GenerateResponse {
                    text: "just prose, no JSON".to_string(),
                    total_tokens: None,
                }),
                Script::QuotaRejected => Err(ProviderError::QuotaRejected {
                    payload: serde_json::json!({
                        "error": {
                            "details": [{
                                "@type": "type.googleapis.com/google.rpc.QuotaFailure",
                                "violations": [{
                                    "quotaId": "GenerateRequestsPerMinutePerProjectPerModel-FreeTier"
                                }]
                            }]
                        }
                    }),
                }),
                Script::Overloaded => Err(ProviderError::Overloaded {
                    message: "the model is overloaded".to_string(),
                }),
            }
        }
    }

    struct Fixture {
        store: Arc<SqliteStore>,
        queue: Arc<InMemoryQueue>,
        tracker: Arc<OverloadTracker>,
        provider: Arc<ScriptedInference>,
        worker: InsightWorker,
        _runner: crate::queue::QueueRunner,
    }

    fn fixture(script: Script) -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let (queue, runner) = InMemoryQueue::new();
        let tracker = Arc::new(OverloadTracker::new());
        let ledger = Arc::new(AdmissionLedger::new(store.clone(), Tier::Free));
        let selector = Arc::new(ModelSelector::new(
            ledger.clone(),
            tracker.clone(),
            "gemini-2.0-flash",
        ));
        let provider = Arc::new(ScriptedInference {
            calls: AtomicU32::new(0),
            script,
        });
        let gateway = Arc::new(ModelGateway::new(
            selector,
            ledger,
            tracker.clone(),
            provider.clone(),
            store.clone(),
            queue.clone(),
        ));
        let config = Config::from_env().unwrap();
        let worker = InsightWorker::new(
            store.clone(),
            gateway,
            queue.clone(),
            config
                .pipeline
                .research_prompts
                .iter()
                .map(|p| p.id.clone())
                .collect(),
            false,
            EnqueueOptions::default(),
        );

        Fixture {
            store,
            queue,
            tracker,
            provider,
            worker,
            _runner: runner,
        }
    }

    fn queued_item(store: &SqliteStore, chunks: u32) -> ContentItem {
        let item = ContentItem::discovered("vid-1");
        store.insert_discovered(&item).unwrap();
        store
            .cas_status(&item.id, ContentStatus::Discovered, ContentStatus::Initializing)
            .unwrap();
        store
            .store_metadata(
                &item.id,
                &ContentMetadata {
                    title: "t".into(),
                    description: "d".into(),
                    duration_secs: chunks * 300,
                    view_count: 0,
                    published_at: None,
                },
            )
            .unwrap();
        store.mark_insights_queued(&item.id, chunks).unwrap();
        item
    }

    fn chunk(index: u32) -> ChunkSpec {
        ChunkSpec {
            index,
            start_secs: index * 300,
            end_secs: (index + 1) * 300,
        }
    }

    #[tokio::test]
    async fn test_final_chunk_advances_and_fans_out_research() {
        let f = fixture(Script::Json);
        let item = queued_item(&f.store, 2);

        f.worker.handle(&item.id, &chunk(0)).await.unwrap();
        assert_eq!(
            f.store.get(&item.id).unwrap().unwrap().status,
            ContentStatus::InsightsQueued
        );

        f.worker.handle(&item.id, &chunk(1)).await.unwrap();
        let done = f.store.get(&item.id).unwrap().unwrap();
        assert_eq!(done.status, ContentStatus::InsightsGathered);
        assert!(done.insights_gathered_at.is_some());

        // One research task per configured prompt
        assert_eq!(f.queue.stats().enqueued, 2);
        assert_eq!(f.store.insight_count(&item.id).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_chunk_delivery_calls_provider_once() {
        let f = fixture(Script::Json);
        let item = queued_item(&f.store, 2);

        f.worker.handle(&item.id, &chunk(0)).await.unwrap();
        f.worker.handle(&item.id, &chunk(0)).await.unwrap();

        assert_eq!(f.provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.insight_count(&item.id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unstructured_response_degrades_to_raw_text() {
        let f = fixture(Script::RawText);
        let item = queued_item(&f.store, 1);

        f.worker.handle(&item.id, &chunk(0)).await.unwrap();

        let insights = f.store.list_insights(&item.id).unwrap();
        assert_eq!(insights.len(), 1);
        assert!(!insights[0].structured);
        assert_eq!(insights[0].insight, "just prose, no JSON");
    }

    #[tokio::test]
    async fn test_quota_rejection_audited_and_retried() {
        let f = fixture(Script::QuotaRejected);
        let item = queued_item(&f.store, 1);

        let result = f.worker.handle(&item.id, &chunk(0)).await;
        assert!(result.is_err());

        // Still queued (no terminal failure), violation audited
        assert_eq!(
            f.store.get(&item.id).unwrap().unwrap().status,
            ContentStatus::InsightsQueued
        );
        let violations = f.store.recent_violations(10).unwrap();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].is_rpm());
        assert_eq!(violations[0].tier_label, "FreeTier");
    }

    #[tokio::test]
    async fn test_overload_marks_model_and_schedules_sweep() {
        let f = fixture(Script::Overloaded);
        let item = queued_item(&f.store, 1);

        let result = f.worker.handle(&item.id, &chunk(0)).await;
        assert!(result.is_err());

        assert!(f.tracker.is_overloaded("gemini-2.0-flash"));
        // Delayed sweep one-shot was accepted
        assert_eq!(f.queue.stats().enqueued, 1);
    }

    #[tokio::test]
    async fn test_early_delivery_before_fanout_commit_retries() {
        let f = fixture(Script::Json);
        // Item still at METADATA_READY: chunk task raced ahead of the CAS
        let item = ContentItem::discovered("vid-early");
        f.store.insert_discovered(&item).unwrap();
        f.store
            .cas_status(&item.id, ContentStatus::Discovered, ContentStatus::Initializing)
            .unwrap();
        f.store
            .store_metadata(
                &item.id,
                &ContentMetadata {
                    title: "t".into(),
                    description: "d".into(),
                    duration_secs: 300,
                    view_count: 0,
                    published_at: None,
                },
            )
            .unwrap();

        let result = f.worker.handle(&item.id, &chunk(0)).await;
        assert!(result.is_err());
        assert_eq!(f.provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_delivery_after_gathered_is_noop() {
        let f = fixture(Script::Json);
        let item = queued_item(&f.store, 1);

        f.worker.handle(&item.id, &chunk(0)).await.unwrap();
        assert_eq!(
            f.store.get(&item.id).unwrap().unwrap().status,
            ContentStatus::InsightsGathered
        );

        // Redelivery after the transition: no provider call, no error
        f.worker.handle(&item.id, &chunk(0)).await.unwrap();
        assert_eq!(f.provider.calls.load(Ordering::SeqCst), 1);
    }
}
