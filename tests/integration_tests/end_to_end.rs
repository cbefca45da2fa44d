//! End-to-end pipeline tests
//!
//! Drive a content item through the complete workflow over the in-process
//! queue: discovery, metadata fetch, readiness fan-out, chunked insight
//! gathering and research prompts.

use yeoul::models::ContentStatus;
use yeoul::queue::{EnqueueOptions, Task, WorkQueue};
use yeoul::storage::ContentRepository;

use super::fixtures::{wait_until, Harness, ScriptedInference, ScriptedMetadata};

#[tokio::test]
async fn test_full_flow_discover_to_research() {
    let inference = ScriptedInference::ok();
    let metadata = ScriptedMetadata::with_duration(1_200);
    let harness = Harness::start(inference.clone(), metadata.clone()).await;

    harness
        .queue
        .enqueue(
            Task::Discover {
                source_id: "vid-e2e".into(),
            },
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    let store = harness.store.clone();
    wait_until("item reaches insights_gathered", || {
        store
            .get_by_source("vid-e2e")
            .unwrap()
            .map(|i| i.status == ContentStatus::InsightsGathered)
            .unwrap_or(false)
    })
    .await;

    let item = harness.store.get_by_source("vid-e2e").unwrap().unwrap();
    assert_eq!(item.chunk_count, Some(4));
    assert!(item.metadata_at.is_some());
    assert!(item.insights_queued_at.is_some());
    assert!(item.insights_gathered_at.is_some());

    // 1200s at 300s per chunk: four contiguous [start, end) insights
    let insights = harness.store.list_insights(&item.id).unwrap();
    assert_eq!(insights.len(), 4);
    let mut covered = 0;
    for insight in &insights {
        assert_eq!(insight.start_secs, covered);
        covered = insight.end_secs;
        assert!(insight.structured);
    }
    assert_eq!(covered, 1_200);

    let store = harness.store.clone();
    let item_id = item.id.clone();
    wait_until("both research results stored", || {
        store.list_research(&item_id).unwrap().len() == 2
    })
    .await;

    let research = harness.store.list_research(&item.id).unwrap();
    let mut prompt_ids: Vec<_> = research.iter().map(|r| r.prompt_id.as_str()).collect();
    prompt_ids.sort_unstable();
    assert_eq!(prompt_ids, ["key-topics", "summary"]);

    harness.stop();
}

#[tokio::test]
async fn test_duplicate_deliveries_do_not_disturb_final_state() {
    let inference = ScriptedInference::ok();
    let metadata = ScriptedMetadata::with_duration(600);
    let harness = Harness::start(inference.clone(), metadata.clone()).await;

    harness
        .queue
        .enqueue(
            Task::Discover {
                source_id: "vid-dup".into(),
            },
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    let store = harness.store.clone();
    wait_until("item gathered", || {
        store
            .get_by_source("vid-dup")
            .unwrap()
            .map(|i| i.status == ContentStatus::InsightsGathered)
            .unwrap_or(false)
    })
    .await;

    let item = harness.store.get_by_source("vid-dup").unwrap().unwrap();
    let store = harness.store.clone();
    let item_id = item.id.clone();
    wait_until("research done", || {
        store.list_research(&item_id).unwrap().len() == 2
    })
    .await;

    let calls_before = inference.calls();
    let metadata_calls_before = metadata.calls();

    // Replay already-applied stage tasks: stale deliveries must no-op
    harness
        .queue
        .enqueue(
            Task::FetchMetadata {
                content_id: item.id.clone(),
            },
            EnqueueOptions::default(),
        )
        .await
        .unwrap();
    harness
        .queue
        .enqueue(
            Task::GatherInsight {
                content_id: item.id.clone(),
                chunk: yeoul::models::ChunkSpec {
                    index: 0,
                    start_secs: 0,
                    end_secs: 300,
                },
            },
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    let queue = harness.queue.clone();
    let settled_target = queue.stats().settled() + 2;
    wait_until("stale deliveries settle", || {
        queue.stats().settled() >= settled_target
    })
    .await;

    let unchanged = harness.store.get(&item.id).unwrap().unwrap();
    assert_eq!(unchanged.status, ContentStatus::InsightsGathered);
    assert_eq!(inference.calls(), calls_before);
    assert_eq!(metadata.calls(), metadata_calls_before);
    assert_eq!(harness.store.insight_count(&item.id).unwrap(), 2);

    harness.stop();
}

#[tokio::test]
async fn test_reset_purges_and_reprocesses() {
    let inference = ScriptedInference::ok();
    let metadata = ScriptedMetadata::with_duration(600);
    let harness = Harness::start(inference.clone(), metadata.clone()).await;

    harness
        .queue
        .enqueue(
            Task::Discover {
                source_id: "vid-reset".into(),
            },
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    let store = harness.store.clone();
    wait_until("first pass gathered", || {
        store
            .get_by_source("vid-reset")
            .unwrap()
            .map(|i| i.status == ContentStatus::InsightsGathered)
            .unwrap_or(false)
    })
    .await;

    let item = harness.store.get_by_source("vid-reset").unwrap().unwrap();
    let store = harness.store.clone();
    let item_id = item.id.clone();
    wait_until("first research pass done", || {
        store.list_research(&item_id).unwrap().len() == 2
    })
    .await;

    // Reset: back to metadata_ready with children purged
    assert!(harness.pipeline.reset(&item.id).unwrap());
    let after_reset = harness.store.get(&item.id).unwrap().unwrap();
    assert_eq!(after_reset.status, ContentStatus::MetadataReady);
    assert_eq!(after_reset.chunk_count, None);
    assert_eq!(harness.store.insight_count(&item.id).unwrap(), 0);
    assert!(harness.store.list_research(&item.id).unwrap().is_empty());

    // The recurring readiness scan picks the item up again
    let store = harness.store.clone();
    let item_id = item.id.clone();
    wait_until("second pass gathered", || {
        store
            .get(&item_id)
            .unwrap()
            .map(|i| i.status == ContentStatus::InsightsGathered)
            .unwrap_or(false)
    })
    .await;

    assert_eq!(harness.store.insight_count(&item.id).unwrap(), 2);

    harness.stop();
}
