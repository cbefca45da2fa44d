//! CLI command implementations
//!
//! `run` is the composition root: it wires the store, quota components,
//! provider clients, queue and pipeline together and runs until
//! interrupted. The remaining commands are operational tooling over the
//! same store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::metrics;
use crate::models::ContentItem;
use crate::pipeline::Pipeline;
use crate::provider::{GeminiClient, HttpMetadataClient};
use crate::queue::{EnqueueOptions, InMemoryQueue, RunnerConfig, Task, WorkQueue};
use crate::quota::{models_for, AdmissionLedger, OverloadTracker};
use crate::storage::{ContentRepository, QuotaRepository, SqliteStore};

/// Run the pipeline until Ctrl-C
pub async fn run(config: Config, sources: Vec<String>) -> Result<()> {
    config.validate()?;

    if let Err(err) = metrics::init_metrics() {
        warn!(error = %err, "metrics initialization failed, continuing without");
    }

    let store = Arc::new(
        SqliteStore::open(&config.storage.sqlite_path).context("Failed to open store")?,
    );
    let tracker = Arc::new(OverloadTracker::with_timeout(Duration::from_secs(
        config.quota.overload_timeout_secs,
    )));
    let ledger = Arc::new(AdmissionLedger::new(store.clone(), config.quota.tier));
    let provider = Arc::new(GeminiClient::new(&config.provider)?);
    let metadata_provider = Arc::new(HttpMetadataClient::new(&config.metadata)?);

    let (queue, runner) = InMemoryQueue::with_config(RunnerConfig {
        metadata_workers: config.pipeline.metadata_workers,
        insight_workers: config.pipeline.insight_workers,
        research_workers: config.pipeline.research_workers,
        channel_buffer_size: config.pipeline.channel_buffer_size,
    });

    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        store.clone(),
        ledger,
        tracker,
        provider,
        metadata_provider,
        queue.clone(),
        config,
    ));

    let runner_handle = tokio::spawn(runner.run(pipeline.clone()));

    pipeline.register_housekeeping().await?;
    let recovered = pipeline.recover_stranded().await?;
    if recovered > 0 {
        info!(recovered, "recovered stranded items at startup");
    }

    for source_id in sources {
        queue
            .enqueue(Task::Discover { source_id }, EnqueueOptions::default())
            .await?;
    }

    info!("pipeline running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    queue.shutdown();
    runner_handle.abort();

    let stats = queue.stats();
    println!(
        "Processed: {} completed, {} retried, {} failed, {} deduped",
        stats.completed, stats.retried, stats.failed, stats.deduped
    );

    Ok(())
}

/// Register source ids without running the pipeline.
///
/// Items are created at `discovered`; the next `run` picks them up through
/// its startup recovery pass.
pub fn discover(config: &Config, sources: &[String]) -> Result<()> {
    let store = SqliteStore::open(&config.storage.sqlite_path).context("Failed to open store")?;

    for source_id in sources {
        let item = ContentItem::discovered(source_id.clone());
        if store.insert_discovered(&item)? {
            println!("{source_id}: discovered as {}", item.id);
        } else {
            println!("{source_id}: already known");
        }
    }

    Ok(())
}

/// Show item statuses
pub fn status(config: &Config, content_id: Option<&str>) -> Result<()> {
    let store = SqliteStore::open(&config.storage.sqlite_path).context("Failed to open store")?;

    let items = match content_id {
        Some(id) => store.get(id)?.into_iter().collect(),
        None => store.list_all(100)?,
    };

    if items.is_empty() {
        println!("No content items found");
        return Ok(());
    }

    for item in items {
        let title = item.title.as_deref().unwrap_or("-");
        println!(
            "{}  {:18}  {}  {}",
            item.id, item.status, item.source_id, title
        );
        if let Some(chunks) = item.chunk_count {
            let stored = store.insight_count(&item.id)?;
            println!("    insights: {stored}/{chunks}");
        }
        if let Some(error) = &item.last_error {
            println!("    last error: {error}");
        }
    }

    Ok(())
}

/// Show quota usage for the active tier's models
pub fn usage(config: &Config, model: Option<&str>) -> Result<()> {
    let store = Arc::new(
        SqliteStore::open(&config.storage.sqlite_path).context("Failed to open store")?,
    );
    let ledger = AdmissionLedger::new(store, config.quota.tier);

    let models: Vec<&str> = match model {
        Some(m) => vec![m],
        None => models_for(config.quota.tier),
    };

    println!("Tier: {}", config.quota.tier);
    for model in models {
        let snapshot = ledger.usage(model)?;
        match snapshot.limits {
            Some(limits) => {
                let rpd = limits
                    .rpd
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:28} {:>4}/{} rpm  {:>8}/{} tpm  {:>5}/{} rpd",
                    model,
                    snapshot.window.requests,
                    limits.rpm,
                    snapshot.window.tokens,
                    limits.tpm,
                    snapshot.requests_today,
                    rpd
                );
            }
            None => println!("{model:28} not available in this tier"),
        }
    }

    Ok(())
}

/// Show recent quota violations
pub fn violations(config: &Config, limit: usize) -> Result<()> {
    let store = SqliteStore::open(&config.storage.sqlite_path).context("Failed to open store")?;

    let violations = store.recent_violations(limit)?;
    if violations.is_empty() {
        println!("No recorded quota violations");
        return Ok(());
    }

    for v in violations {
        println!(
            "{}  {}  {:7}  {:8}  retry {}s  {}",
            v.created_at.format("%Y-%m-%d %H:%M:%S"),
            v.model,
            v.kind,
            v.tier_label,
            v.retry_delay_secs,
            v.quota_id.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}

/// Reset an item to `metadata_ready`, purging insight and research records
pub fn reset(config: &Config, content_id: &str) -> Result<()> {
    let store = SqliteStore::open(&config.storage.sqlite_path).context("Failed to open store")?;

    if store.reset_to_metadata_ready(content_id)? {
        println!("{content_id}: reset to metadata_ready, child records purged");
    } else {
        println!("{content_id}: not reset (unknown id or no stored metadata)");
    }

    Ok(())
}
