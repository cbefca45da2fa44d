//! Shared fixtures: scripted provider doubles and a running pipeline harness

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use yeoul::config::Config;
use yeoul::models::ContentMetadata;
use yeoul::pipeline::Pipeline;
use yeoul::provider::{
    GenerateRequest, GenerateResponse, InferenceProvider, MetadataProvider, ProviderError,
};
use yeoul::queue::{InMemoryQueue, RunnerConfig};
use yeoul::quota::{AdmissionLedger, OverloadTracker, Tier};
use yeoul::storage::SqliteStore;

/// Inference double: fails the first `fail_first` calls, then returns a
/// structured insight payload
pub struct ScriptedInference {
    pub calls: AtomicU32,
    pub fail_first: u32,
    pub failure: fn() -> ProviderError,
}

impl ScriptedInference {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_first: 0,
            failure: || ProviderError::Timeout,
        })
    }

    pub fn failing_first(times: u32, failure: fn() -> ProviderError) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_first: times,
            failure,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceProvider for ScriptedInference {
    async fn generate(
        &self,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            return Err((self.failure)());
        }
        Ok(GenerateResponse {
            text: format!(
                r#"{{"summary":"insight from {} (call {})"}}"#,
                request.model,
                n + 1
            ),
            total_tokens: Some(256),
        })
    }
}

/// Metadata double: fails the first `fail_first` calls, then returns fixed
/// metadata with the configured duration
pub struct ScriptedMetadata {
    pub calls: AtomicU32,
    pub fail_first: u32,
    pub failure: fn() -> ProviderError,
    pub duration_secs: u32,
}

impl ScriptedMetadata {
    pub fn with_duration(duration_secs: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_first: 0,
            failure: || ProviderError::Timeout,
            duration_secs,
        })
    }

    pub fn failing_first(times: u32, failure: fn() -> ProviderError, duration_secs: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_first: times,
            failure,
            duration_secs,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataProvider for ScriptedMetadata {
    async fn fetch(&self, source_id: &str) -> Result<ContentMetadata, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            return Err((self.failure)());
        }
        Ok(ContentMetadata {
            title: format!("Video {source_id}"),
            description: "fixture description".to_string(),
            duration_secs: self.duration_secs,
            view_count: 1_000,
            published_at: None,
        })
    }
}

/// Configuration tuned for fast tests: short backoff, 1s readiness scans,
/// a paid tier so quota never interferes unless a test arranges it
pub fn test_config() -> Config {
    let mut config = Config::from_env().unwrap();
    config.quota.tier = Tier::Tier1;
    config.quota.default_model = "gemini-2.5-flash".to_string();
    config.pipeline.backoff_base_ms = 20;
    config.pipeline.max_attempts = 4;
    config.pipeline.scan_interval_secs = 1;
    config
}

/// A running pipeline over in-memory collaborators
pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub queue: Arc<InMemoryQueue>,
    pub pipeline: Arc<Pipeline>,
    pub tracker: Arc<OverloadTracker>,
    runner_handle: JoinHandle<()>,
}

impl Harness {
    pub async fn start(
        inference: Arc<dyn InferenceProvider>,
        metadata: Arc<dyn MetadataProvider>,
    ) -> Self {
        Self::start_with_config(inference, metadata, test_config()).await
    }

    pub async fn start_with_config(
        inference: Arc<dyn InferenceProvider>,
        metadata: Arc<dyn MetadataProvider>,
        config: Config,
    ) -> Self {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let tracker = Arc::new(OverloadTracker::new());
        let ledger = Arc::new(AdmissionLedger::new(store.clone(), config.quota.tier));
        let (queue, runner) = InMemoryQueue::with_config(RunnerConfig::default());

        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            store.clone(),
            ledger,
            tracker.clone(),
            inference,
            metadata,
            queue.clone(),
            config,
        ));

        let runner_handle = tokio::spawn(runner.run(pipeline.clone()));
        pipeline.register_housekeeping().await.unwrap();

        Self {
            store,
            queue,
            pipeline,
            tracker,
            runner_handle,
        }
    }

    pub fn stop(&self) {
        self.queue.shutdown();
        self.runner_handle.abort();
    }
}

/// Poll until the condition holds, panicking after ten seconds
pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..1_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}
