//! In-process work queue
//!
//! Producer-Consumer scheduling over tokio mpsc channels: a dispatcher
//! routes tasks to per-stage worker pools, failed deliveries are retried
//! with exponential backoff up to the attempts cap, and repeating tasks
//! fire from their own timer loops. Delivery is at-least-once; handlers are
//! expected to be idempotent under duplicate delivery.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use rand::Rng;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::YeoulErrorTrait;

use super::{
    EnqueueOptions, QueueError, RepeatPattern, ScheduleKey, Task, TaskHandler, TaskKind, WorkQueue,
};

// ============================================================================
// Statistics
// ============================================================================

/// Queue statistics (thread-safe)
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Tasks accepted for delivery
    pub enqueued: AtomicU64,

    /// Deliveries that completed (handler returned, terminally or not)
    pub completed: AtomicU64,

    /// Deliveries re-scheduled after a recoverable failure
    pub retried: AtomicU64,

    /// Deliveries dropped after exhausting attempts or failing terminally
    pub failed: AtomicU64,

    /// Enqueues suppressed by an active dedupe key
    pub deduped: AtomicU64,
}

impl QueueStats {
    /// Get snapshot of current stats
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            deduped: self.deduped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of queue statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueSnapshot {
    pub enqueued: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub deduped: u64,
}

impl QueueSnapshot {
    /// Deliveries no longer in flight
    pub fn settled(&self) -> u64 {
        self.completed + self.failed
    }
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Debug)]
struct Envelope {
    task: Task,
    opts: EnqueueOptions,
    attempt: u32,
}

/// Worker pool sizing for the runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub metadata_workers: usize,
    pub insight_workers: usize,
    pub research_workers: usize,
    pub channel_buffer_size: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            metadata_workers: 2,
            insight_workers: 4,
            research_workers: 2,
            channel_buffer_size: 256,
        }
    }
}

/// In-process work queue handle.
///
/// Priority hints are accepted for interface compatibility but delivery is
/// FIFO per stage.
pub struct InMemoryQueue {
    tx: mpsc::UnboundedSender<Envelope>,
    dedupe: Arc<StdMutex<HashSet<String>>>,
    repeating: StdMutex<HashMap<String, JoinHandle<()>>>,
    stats: Arc<QueueStats>,
}

impl InMemoryQueue {
    /// Create a queue and its runner with default worker sizing
    pub fn new() -> (Arc<Self>, QueueRunner) {
        Self::with_config(RunnerConfig::default())
    }

    /// Create a queue and its runner with explicit worker sizing
    pub fn with_config(config: RunnerConfig) -> (Arc<Self>, QueueRunner) {
        let (tx, rx) = mpsc::unbounded_channel();

        let queue = Arc::new(Self {
            tx,
            dedupe: Arc::new(StdMutex::new(HashSet::new())),
            repeating: StdMutex::new(HashMap::new()),
            stats: Arc::new(QueueStats::default()),
        });

        let runner = QueueRunner {
            rx,
            queue: queue.clone(),
            config,
        };

        (queue, runner)
    }

    /// Queue statistics
    pub fn stats(&self) -> QueueSnapshot {
        self.stats.snapshot()
    }

    /// Abort all repeating schedules
    pub fn shutdown(&self) {
        let mut repeating = self.repeating.lock().unwrap();
        for (key, handle) in repeating.drain() {
            debug!(key = %key, "aborting repeating schedule");
            handle.abort();
        }
    }

    fn release_dedupe(&self, envelope: &Envelope) {
        if let Some(key) = &envelope.opts.dedupe_key {
            self.dedupe.lock().unwrap().remove(key);
        }
    }

    fn requeue_after(&self, envelope: Envelope, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(envelope).is_err() {
                debug!("queue closed before retry fired");
            }
        });
    }
}

impl Drop for InMemoryQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Claim a dedupe key and send, shared by direct and repeating enqueues
fn claim_and_send(
    tx: &mpsc::UnboundedSender<Envelope>,
    dedupe: &Arc<StdMutex<HashSet<String>>>,
    stats: &Arc<QueueStats>,
    task: Task,
    opts: EnqueueOptions,
) -> Result<(), QueueError> {
    if let Some(key) = &opts.dedupe_key {
        if !dedupe.lock().unwrap().insert(key.clone()) {
            stats.deduped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
    }
    stats.enqueued.fetch_add(1, Ordering::Relaxed);

    let envelope = Envelope {
        task,
        opts,
        attempt: 0,
    };
    tx.send(envelope).map_err(|_| QueueError::Closed)
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn enqueue(&self, task: Task, opts: EnqueueOptions) -> Result<(), QueueError> {
        match opts.delay {
            Some(delay) if delay > Duration::ZERO => {
                // Claim the dedupe key now so duplicates arriving during
                // the delay are suppressed, then deliver later.
                if let Some(key) = &opts.dedupe_key {
                    if !self.dedupe.lock().unwrap().insert(key.clone()) {
                        self.stats.deduped.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                }
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);

                let tx = self.tx.clone();
                let envelope = Envelope {
                    task,
                    opts,
                    attempt: 0,
                };
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if tx.send(envelope).is_err() {
                        debug!("queue closed before delayed task fired");
                    }
                });
                Ok(())
            }
            _ => claim_and_send(&self.tx, &self.dedupe, &self.stats, task, opts),
        }
    }

    async fn register_repeating(
        &self,
        key: ScheduleKey,
        pattern: RepeatPattern,
        task: Task,
    ) -> Result<(), QueueError> {
        pattern.validate()?;

        let key_string = key.as_key();
        let mut repeating = self.repeating.lock().unwrap();

        // Idempotent by key: re-registration replaces the old schedule
        if let Some(old) = repeating.remove(&key_string) {
            old.abort();
        }

        let tx = self.tx.clone();
        let dedupe = self.dedupe.clone();
        let stats = self.stats.clone();
        let loop_key = key_string.clone();

        let handle = tokio::spawn(async move {
            loop {
                let wait = pattern.wait_from(Local::now());
                tokio::time::sleep(wait).await;

                let opts = EnqueueOptions::deduped(loop_key.clone());
                if claim_and_send(&tx, &dedupe, &stats, task.clone(), opts).is_err() {
                    debug!(key = %loop_key, "queue closed, stopping repeating schedule");
                    break;
                }
            }
        });

        repeating.insert(key_string, handle);
        Ok(())
    }

    async fn remove_repeating(&self, key: ScheduleKey) -> Result<(), QueueError> {
        let mut repeating = self.repeating.lock().unwrap();
        if let Some(handle) = repeating.remove(&key.as_key()) {
            handle.abort();
        }
        Ok(())
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Consumes the queue and drives a [`TaskHandler`] with per-stage pools
pub struct QueueRunner {
    rx: mpsc::UnboundedReceiver<Envelope>,
    queue: Arc<InMemoryQueue>,
    config: RunnerConfig,
}

impl QueueRunner {
    /// Run until the queue is dropped.
    ///
    /// Spawns one worker pool per stage and dispatches incoming tasks by
    /// stage; call from a spawned task.
    pub async fn run(mut self, handler: Arc<dyn TaskHandler>) {
        let stages: [(TaskKind, usize); 6] = [
            (TaskKind::Discovery, 1),
            (TaskKind::Metadata, self.config.metadata_workers.max(1)),
            (TaskKind::Readiness, 1),
            (TaskKind::Insight, self.config.insight_workers.max(1)),
            (TaskKind::Research, self.config.research_workers.max(1)),
            (TaskKind::Housekeeping, 1),
        ];

        let mut stage_txs: HashMap<TaskKind, mpsc::Sender<Envelope>> = HashMap::new();

        for (kind, workers) in stages {
            let (stage_tx, stage_rx) = mpsc::channel::<Envelope>(self.config.channel_buffer_size);
            let stage_rx = Arc::new(TokioMutex::new(stage_rx));

            for worker_id in 0..workers {
                let stage_rx = stage_rx.clone();
                let handler = handler.clone();
                let queue = self.queue.clone();

                tokio::spawn(async move {
                    loop {
                        let envelope = { stage_rx.lock().await.recv().await };
                        match envelope {
                            Some(envelope) => {
                                process_delivery(&queue, handler.as_ref(), envelope).await;
                            }
                            None => {
                                debug!(stage = %kind, worker_id, "stage channel closed");
                                break;
                            }
                        }
                    }
                });
            }

            stage_txs.insert(kind, stage_tx);
        }

        while let Some(envelope) = self.rx.recv().await {
            let kind = envelope.task.kind();
            if let Some(stage_tx) = stage_txs.get(&kind) {
                if stage_tx.send(envelope).await.is_err() {
                    warn!(stage = %kind, "stage workers gone, dropping task");
                }
            }
        }
    }
}

fn retry_jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..250))
}

async fn process_delivery(queue: &Arc<InMemoryQueue>, handler: &dyn TaskHandler, envelope: Envelope) {
    let kind = envelope.task.kind();

    match handler.handle(&envelope.task).await {
        Ok(()) => {
            queue.release_dedupe(&envelope);
            queue.stats.completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            let next_attempt = envelope.attempt + 1;
            let max_attempts = envelope.opts.effective_attempts();

            if err.is_recoverable() && next_attempt < max_attempts {
                let delay = envelope.opts.backoff.delay_for(next_attempt) + retry_jitter();
                warn!(
                    stage = %kind,
                    attempt = next_attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "task failed, scheduling retry"
                );
                queue.stats.retried.fetch_add(1, Ordering::Relaxed);
                queue.requeue_after(
                    Envelope {
                        attempt: next_attempt,
                        ..envelope
                    },
                    delay,
                );
            } else {
                error!(
                    stage = %kind,
                    attempts = next_attempt,
                    error = %err,
                    "task failed terminally"
                );
                queue.release_dedupe(&envelope);
                queue.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
