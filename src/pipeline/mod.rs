//! Pipeline state machine and stage workers
//!
//! One worker per stage, each bound to a single status-to-status
//! transition:
//!
//! ```text
//! DISCOVERED ─▶ INITIALIZING ─▶ METADATA_READY ─▶ INSIGHTS_QUEUED ─▶ INSIGHTS_GATHERED
//!   discovery      metadata       readiness scan      insights           research
//!                                  (fan-out)                           (per prompt)
//! ```
//!
//! Every transition is a compare-and-set against the precondition status,
//! which makes duplicate deliveries no-ops and keeps forward progress
//! monotonic. `FAILED` is reachable from any non-terminal state; the
//! explicit reset returns an item to `METADATA_READY` and purges its child
//! records.

pub mod discovery;
pub mod insights;
pub mod metadata;
pub mod readiness;
pub mod research;

pub use discovery::DiscoveryWorker;
pub use insights::InsightWorker;
pub use metadata::MetadataWorker;
pub use readiness::ReadinessWorker;
pub use research::ResearchWorker;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result, YeoulErrorTrait};
use crate::metrics;
use crate::models::{ContentStatus, QuotaViolation};
use crate::provider::{
    GenerateRequest, GenerateResponse, InferenceProvider, MetadataProvider, ProviderError,
};
use crate::queue::{
    EnqueueOptions, RepeatPattern, ScheduleKey, Task, TaskHandler, WorkQueue,
};
use crate::quota::{
    parse_quota_error, AdmissionLedger, ModelSelector, OverloadTracker, QuotaError,
    SelectionOutcome,
};
use crate::storage::{ContentRepository, QuotaRepository};

/// Rough token estimate used for admission: prompt characters / 4 plus
/// response headroom. The ledger is reconciled with the provider's actual
/// count after the call.
pub(crate) fn estimate_tokens(prompt: &str) -> u64 {
    (prompt.len() as u64 / 4) + 1_024
}

/// Terminal-or-retry disposition shared by all stage workers.
///
/// A non-recoverable error marks the entity failed and completes the task
/// (no scheduler retry). A recoverable one restores the pre-stage status,
/// when the stage took an in-progress marker, and rethrows so the
/// scheduler's backoff owns the retry cadence.
pub(crate) fn fail_or_retry(
    content: &dyn ContentRepository,
    content_id: &str,
    revert: Option<(ContentStatus, ContentStatus)>,
    err: Error,
) -> Result<()> {
    if err.is_recoverable() {
        if let Some((from, to)) = revert {
            match content.cas_status(content_id, from, to) {
                Ok(true) => debug!(content_id, %from, %to, "reverted to pre-stage status"),
                Ok(false) => debug!(content_id, "pre-stage revert skipped, status moved on"),
                Err(store_err) => {
                    warn!(content_id, error = %store_err, "pre-stage revert failed")
                }
            }
        }
        Err(err)
    } else {
        warn!(content_id, error = %err, "terminal failure, marking entity failed");
        content.mark_failed(content_id, &err.to_string())?;
        metrics::record_stage_transition(ContentStatus::Failed.as_str());
        Ok(())
    }
}

/// Quota-guarded path to the inference provider.
///
/// Composes selection, admission, the provider call, usage recording and
/// violation auditing so the insight and research workers share one
/// behavior. Proactive denials and provider-side rejections converge on the
/// same audit record shape.
pub struct ModelGateway {
    selector: Arc<ModelSelector>,
    ledger: Arc<AdmissionLedger>,
    tracker: Arc<OverloadTracker>,
    provider: Arc<dyn InferenceProvider>,
    quota_store: Arc<dyn QuotaRepository>,
    queue: Arc<dyn WorkQueue>,
}

impl ModelGateway {
    pub fn new(
        selector: Arc<ModelSelector>,
        ledger: Arc<AdmissionLedger>,
        tracker: Arc<OverloadTracker>,
        provider: Arc<dyn InferenceProvider>,
        quota_store: Arc<dyn QuotaRepository>,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        Self {
            selector,
            ledger,
            tracker,
            provider,
            quota_store,
            queue,
        }
    }

    /// Select a model, execute the request on it, and settle the books.
    ///
    /// On success the ledger is charged exactly once with the actual token
    /// cost (falling back to the estimate when the provider omits it).
    pub async fn generate(
        &self,
        prompt: String,
        response_schema: Option<serde_json::Value>,
        stream: bool,
    ) -> Result<(String, GenerateResponse)> {
        let estimated = estimate_tokens(&prompt);

        let model = match self.selector.select(estimated, &HashSet::new())? {
            SelectionOutcome::Selected { model } => model,
            SelectionOutcome::Denied(denied) => {
                if let Some((model, kind)) = &denied.last_denial {
                    metrics::record_admission(model, false);
                    metrics::record_quota_denial(model, kind.as_str());
                    let violation = QuotaViolation::from_denial(
                        model,
                        *kind,
                        self.ledger.tier().as_str(),
                        denied.min_wait_secs.unwrap_or(0),
                    );
                    self.quota_store.record_violation(&violation)?;
                }
                return Err(QuotaError::NoModelAvailable(denied).into());
            }
        };

        metrics::record_admission(&model, true);

        let mut request = GenerateRequest::text(&model, prompt);
        if let Some(schema) = response_schema {
            request = request.with_schema(schema);
        }
        if stream {
            request = request.streaming();
        }

        match self.provider.generate(&request).await {
            Ok(response) => {
                let actual = response.total_tokens.unwrap_or(estimated);
                self.ledger.record_usage(&model, actual)?;
                metrics::record_provider_call(&model, "ok");
                Ok((model, response))
            }
            Err(ProviderError::QuotaRejected { payload }) => {
                metrics::record_provider_call(&model, "quota_rejected");
                let violation = match parse_quota_error(&payload) {
                    Some(parsed) => {
                        metrics::record_quota_denial(&model, parsed.kind.as_str());
                        parsed.into_violation(&model, &payload)
                    }
                    None => QuotaViolation::unparsed(&model, payload.to_string()),
                };
                self.quota_store.record_violation(&violation)?;
                Err(Error::Provider(ProviderError::QuotaRejected { payload }))
            }
            Err(ProviderError::Overloaded { message }) => {
                metrics::record_provider_call(&model, "overloaded");
                metrics::record_overload_mark(&model);
                self.tracker.mark(&model);
                metrics::set_overloaded_models(self.tracker.len());

                // Delayed one-shot sweep keyed per model so memory does not
                // grow between reads; dedupe keeps re-marks from piling up.
                let sweep = Task::OverloadSweep {
                    model: model.clone(),
                };
                let opts = EnqueueOptions {
                    delay: Some(self.tracker.timeout()),
                    dedupe_key: Some(
                        ScheduleKey::OverloadSweep {
                            model: model.clone(),
                        }
                        .as_key(),
                    ),
                    ..Default::default()
                };
                if let Err(err) = self.queue.enqueue(sweep, opts).await {
                    warn!(model = %model, error = %err, "could not schedule overload sweep");
                }

                Err(Error::Provider(ProviderError::Overloaded { message }))
            }
            Err(err) => {
                metrics::record_provider_call(&model, "error");
                Err(err.into())
            }
        }
    }
}

/// The assembled pipeline: all stage workers behind one task handler
pub struct Pipeline {
    content: Arc<dyn ContentRepository>,
    quota_store: Arc<dyn QuotaRepository>,
    tracker: Arc<OverloadTracker>,
    queue: Arc<dyn WorkQueue>,
    config: Config,
    enqueue_opts: EnqueueOptions,

    discovery: DiscoveryWorker,
    metadata: MetadataWorker,
    readiness: ReadinessWorker,
    insights: InsightWorker,
    research: ResearchWorker,
}

impl Pipeline {
    /// Wire the pipeline from its collaborators.
    ///
    /// All dependencies arrive through this constructor; the workers get
    /// narrow clones of exactly what they use.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        content: Arc<dyn ContentRepository>,
        quota_store: Arc<dyn QuotaRepository>,
        ledger: Arc<AdmissionLedger>,
        tracker: Arc<OverloadTracker>,
        provider: Arc<dyn InferenceProvider>,
        metadata_provider: Arc<dyn MetadataProvider>,
        queue: Arc<dyn WorkQueue>,
        config: Config,
    ) -> Self {
        let selector = Arc::new(ModelSelector::new(
            ledger.clone(),
            tracker.clone(),
            config.quota.default_model.clone(),
        ));

        let gateway = Arc::new(ModelGateway::new(
            selector,
            ledger,
            tracker.clone(),
            provider,
            quota_store.clone(),
            queue.clone(),
        ));

        let enqueue_opts = EnqueueOptions {
            attempts: config.pipeline.max_attempts,
            backoff: crate::queue::Backoff {
                base_delay_ms: config.pipeline.backoff_base_ms,
            },
            ..Default::default()
        };

        let discovery = DiscoveryWorker::new(content.clone(), queue.clone(), enqueue_opts.clone());
        let metadata = MetadataWorker::new(content.clone(), metadata_provider);
        let readiness = ReadinessWorker::new(
            content.clone(),
            queue.clone(),
            config.pipeline.chunk_seconds,
            config.pipeline.scan_page_size,
            enqueue_opts.clone(),
        );
        let insights = InsightWorker::new(
            content.clone(),
            gateway.clone(),
            queue.clone(),
            config
                .pipeline
                .research_prompts
                .iter()
                .map(|p| p.id.clone())
                .collect(),
            config.provider.streaming,
            enqueue_opts.clone(),
        );
        let research = ResearchWorker::new(
            content.clone(),
            gateway,
            config.pipeline.research_prompts.clone(),
            config.provider.streaming,
        );

        Self {
            content,
            quota_store,
            tracker,
            queue,
            config,
            enqueue_opts,
            discovery,
            metadata,
            readiness,
            insights,
            research,
        }
    }

    /// Register the recurring readiness scan and the daily cleanup.
    ///
    /// Registration is idempotent by schedule key; calling this again
    /// replaces rather than duplicates the schedules.
    pub async fn register_housekeeping(&self) -> Result<()> {
        self.queue
            .register_repeating(
                ScheduleKey::ReadinessScan,
                RepeatPattern::Every {
                    secs: self.config.pipeline.scan_interval_secs,
                },
                Task::ReadinessScan,
            )
            .await?;

        self.queue
            .register_repeating(
                ScheduleKey::DailyCleanup,
                RepeatPattern::Daily {
                    time: self.config.housekeeping.daily_cleanup_time.clone(),
                },
                Task::DailyCleanup,
            )
            .await?;

        Ok(())
    }

    /// Re-enqueue metadata tasks for items whose fetch never completed.
    ///
    /// Run at startup: at-least-once delivery means a crash can strand an
    /// item at `Discovered` or `Initializing` with no task in flight.
    pub async fn recover_stranded(&self) -> Result<usize> {
        let mut recovered = 0;

        for status in [ContentStatus::Discovered, ContentStatus::Initializing] {
            let items = self
                .content
                .list_by_status(status, self.config.pipeline.scan_page_size)?;
            for item in items {
                self.queue
                    .enqueue(
                        Task::FetchMetadata {
                            content_id: item.id.clone(),
                        },
                        self.enqueue_opts.clone(),
                    )
                    .await?;
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!(recovered, "re-enqueued stranded metadata fetches");
        }
        Ok(recovered)
    }

    /// Explicit reset: return an item to `METADATA_READY`, purging its
    /// insight and research records. Returns `false` when the item does
    /// not exist or has no stored metadata to return to.
    pub fn reset(&self, content_id: &str) -> Result<bool> {
        let reset = self.content.reset_to_metadata_ready(content_id)?;
        if reset {
            info!(content_id, "reset to metadata_ready, child records purged");
            metrics::record_stage_transition(ContentStatus::MetadataReady.as_str());
        }
        Ok(reset)
    }

    async fn handle_housekeeping(&self, task: &Task) -> Result<()> {
        match task {
            Task::OverloadSweep { model } => {
                self.tracker.sweep(model);
                metrics::set_overloaded_models(self.tracker.len());
                Ok(())
            }
            Task::DailyCleanup => {
                let removed = self.quota_store.sweep_expired(Utc::now())?;
                info!(removed, "daily cleanup swept expired quota rows");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl TaskHandler for Pipeline {
    async fn handle(&self, task: &Task) -> Result<()> {
        match task {
            Task::Discover { source_id } => self.discovery.handle(source_id).await,
            Task::FetchMetadata { content_id } => self.metadata.handle(content_id).await,
            Task::ReadinessScan => self.readiness.handle().await,
            Task::GatherInsight { content_id, chunk } => {
                self.insights.handle(content_id, chunk).await
            }
            Task::Research {
                content_id,
                prompt_id,
            } => self.research.handle(content_id, prompt_id).await,
            Task::OverloadSweep { .. } | Task::DailyCleanup => {
                self.handle_housekeeping(task).await
            }
        }
    }
}
