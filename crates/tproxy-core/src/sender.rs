//! The sender-task pool: takes batches off a handler's ring channel, submits
//! them, and spools what it can't deliver right now.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::warn;
use tproxy_spool::{LocalFsStorage, QueueingReason, SpoolError, SpoolStorage, SubmissionTask, TaskQueue};

use crate::backend_client::BackendClient;
use crate::entities::EntityBatch;
use crate::errors::SendError;
use crate::handler::HandlerMetrics;

/// Atomic slots a running pipeline's sender tasks read on every flush, and
/// the check-in tunable-apply path writes into whenever the backend pushes a
/// new batch size or disables an entity type outright — per-handler-pipeline
/// state that outlives any single `SenderTask`.
#[derive(Debug)]
pub struct SenderTunables {
    batch_size: AtomicUsize,
    feature_disabled: AtomicBool,
}

impl SenderTunables {
    pub fn new(default_batch_size: usize) -> Self {
        Self {
            batch_size: AtomicUsize::new(default_batch_size),
            feature_disabled: AtomicBool::new(false),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.load(AtomicOrdering::Relaxed)
    }

    pub fn set_batch_size(&self, size: usize) {
        self.batch_size.store(size.max(1), AtomicOrdering::Relaxed);
    }

    pub fn is_feature_disabled(&self) -> bool {
        self.feature_disabled.load(AtomicOrdering::Relaxed)
    }

    pub fn set_feature_disabled(&self, disabled: bool) {
        self.feature_disabled.store(disabled, AtomicOrdering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SenderPoolConfig {
    /// Points/histograms/spans per outbound batch under normal conditions.
    pub batch_size: usize,
    /// Largest batch adaptive batching will grow to when the backlog is deep.
    pub max_batch_size: usize,
    pub batch_timeout: Duration,
    pub max_attempts: u32,
    pub max_queue_age: Duration,
    /// Lower bound below which a pushback-split batch is sent as-is instead
    /// of being split further.
    pub min_split_weight: u64,
    pub max_split_weight: u64,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// When `false`, batches that can't be delivered immediately are dropped
    /// at flush time instead of spooled (the "feature disabled" mode).
    pub spooling_enabled: bool,
    /// When `true`, a batch rejected with HTTP 406 is split into smaller
    /// parts and resubmitted; when `false` it's spooled whole. Splitting
    /// only ever kicks in above twice the minimum split weight, so a batch
    /// already near the floor goes straight to the spool instead of being
    /// cut into parts too small to be worth the extra HTTP calls.
    pub split_push_when_rate_limited: bool,
}

impl Default for SenderPoolConfig {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            max_batch_size: 40_000,
            batch_timeout: Duration::from_millis(500),
            max_attempts: 16,
            max_queue_age: Duration::from_secs(4 * 3600),
            min_split_weight: 10,
            max_split_weight: 1_000,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            spooling_enabled: true,
            split_push_when_rate_limited: true,
        }
    }
}

/// Scales the target batch size up as the spool backlog grows, so a proxy
/// that's fallen behind catches up with fewer, larger HTTP calls instead of
/// the same trickle of small ones.
pub fn adaptive_batch_size(config: &SenderPoolConfig, queue_depth: u64) -> usize {
    if queue_depth == 0 {
        return config.batch_size;
    }
    let scale = 1 + (queue_depth / 10_000).min(39);
    (config.batch_size * scale as usize).min(config.max_batch_size)
}

fn backoff_with_jitter(config: &SenderPoolConfig, attempts: u32) -> Duration {
    let exp = config.initial_backoff.as_secs_f64() * 2f64.powi(attempts.min(10) as i32);
    let capped = exp.min(config.max_backoff.as_secs_f64());
    let jitter = rand::thread_rng().gen_range(0.0..=capped * 0.2);
    Duration::from_secs_f64((capped + jitter).min(config.max_backoff.as_secs_f64()))
}

/// One sender task: owns (a share of) a handler's backend client, spool, and
/// delivery metrics.
pub struct SenderTask<C, S = LocalFsStorage> {
    client: Arc<C>,
    queue: Arc<TaskQueue<EntityBatch, S>>,
    metrics: Arc<HandlerMetrics>,
    config: SenderPoolConfig,
    tunables: Arc<SenderTunables>,
}

impl<C: BackendClient, S: SpoolStorage> SenderTask<C, S> {
    pub fn new(
        client: Arc<C>,
        queue: Arc<TaskQueue<EntityBatch, S>>,
        metrics: Arc<HandlerMetrics>,
        config: SenderPoolConfig,
    ) -> Self {
        Self {
            client,
            queue,
            metrics,
            config,
            tunables: Arc::new(SenderTunables::new(config.batch_size)),
        }
    }

    /// Shares `tunables` with another `SenderTask` in the same pipeline, so a
    /// tunable flip (batch size, feature-disabled) applies uniformly across
    /// every sender task draining the same handler's ring.
    pub fn with_tunables(mut self, tunables: Arc<SenderTunables>) -> Self {
        self.tunables = tunables;
        self
    }

    pub fn tunables(&self) -> &Arc<SenderTunables> {
        &self.tunables
    }

    /// Submits `task`, recursively splitting on HTTP 406 pushback and
    /// spooling whatever can't go out right now. Never panics or blocks
    /// indefinitely: every branch either delivers, drops, or spools.
    pub async fn submit_or_spool(&self, handle: &str, task: SubmissionTask<EntityBatch>) {
        if self.tunables.is_feature_disabled() {
            self.metrics
                .blocked
                .fetch_add(task.payload.len() as u64, AtomicOrdering::Relaxed);
            return;
        }

        let mut work: VecDeque<SubmissionTask<EntityBatch>> = VecDeque::new();
        work.push_back(task);

        while let Some(mut current) = work.pop_front() {
            if !self.config.spooling_enabled && current.attempts > 0 {
                // Spooling is disabled and this task already failed once —
                // there is nowhere else for it to go but the floor.
                continue;
            }

            current.attempts += 1;
            let weight = current.payload.len() as u64;

            match self.client.submit(handle, &current.payload).await {
                Ok(()) => {
                    self.metrics.delivered.fetch_add(weight, std::sync::atomic::Ordering::Relaxed);
                }
                Err(SendError::PayloadTooLarge) => {
                    let can_split = self.config.split_push_when_rate_limited
                        && weight >= self.config.min_split_weight * 2;
                    let parts = if can_split {
                        current
                            .clone()
                            .split_task(self.config.min_split_weight, self.config.max_split_weight)
                    } else {
                        Vec::new()
                    };
                    if parts.len() <= 1 {
                        self.spool(current, QueueingReason::ServerError).await;
                    } else {
                        for part in parts {
                            work.push_back(part);
                        }
                    }
                }
                Err(SendError::Retryable { status }) => {
                    warn!(status, handle, "backend returned a retryable error, spooling");
                    self.spool(current, QueueingReason::ServerError).await;
                }
                Err(SendError::Network(reason)) => {
                    warn!(reason, handle, "network error submitting batch, spooling");
                    self.spool(current, QueueingReason::ServerError).await;
                }
                Err(SendError::Rejected { status }) => {
                    warn!(status, handle, weight, "backend rejected batch, dropping");
                    self.metrics.rejected.fetch_add(weight, std::sync::atomic::Ordering::Relaxed);
                }
                Err(SendError::ShuttingDown) => {
                    self.spool(current, QueueingReason::ProxyShutdown).await;
                }
            }
        }
    }

    async fn spool(&self, task: SubmissionTask<EntityBatch>, reason: QueueingReason) {
        if !self.config.spooling_enabled {
            self.metrics.blocked.fetch_add(
                task.payload.len() as u64,
                std::sync::atomic::Ordering::Relaxed,
            );
            return;
        }
        if let Err(e) = self.queue.add(task, reason).await {
            warn!(error = %e, "failed to spool submission task to disk");
        }
    }

    /// Pulls one task from the spool, backs off according to its attempt
    /// count, and resubmits it. Returns `false` when the spool is empty so
    /// the caller's poll loop can back off on its own cadence.
    pub async fn drain_one(&self, handle: &str) -> Result<bool, SpoolError> {
        let Some(task) = self
            .queue
            .remove_if_alive(self.config.max_attempts, self.config.max_queue_age)
            .await?
        else {
            return Ok(false);
        };
        let delay = backoff_with_jitter(&self.config, task.attempts);
        tokio::time::sleep(delay).await;
        self.submit_or_spool(handle, task).await;
        Ok(true)
    }

    pub fn queue(&self) -> &Arc<TaskQueue<EntityBatch, S>> {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_client::{CannedResponse, RecordingBackendClient};
    use crate::handler::HandlerMetrics;
    use tproxy_spool::InMemoryStorage;

    fn points_task(n: usize) -> SubmissionTask<EntityBatch> {
        let points = (0..n)
            .map(|i| crate::entities::Point {
                metric: "cpu.load".into(),
                value: i as f64,
                timestamp_ms: 0,
                source: "host-1".into(),
                tags: Default::default(),
            })
            .collect();
        SubmissionTask::new(EntityBatch::Points(points), "h1")
    }

    async fn queue() -> Arc<TaskQueue<EntityBatch, InMemoryStorage>> {
        Arc::new(
            TaskQueue::open_with_storage("h1", InMemoryStorage::new())
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn successful_submit_records_delivered() {
        let client = Arc::new(RecordingBackendClient::always_ok());
        let metrics = Arc::new(HandlerMetrics::default());
        let task = SenderTask::new(client.clone(), queue().await, metrics.clone(), SenderPoolConfig::default());

        task.submit_or_spool("h1", points_task(5)).await;
        assert_eq!(metrics.snapshot().delivered, 5);
        assert_eq!(client.submitted().len(), 1);
    }

    #[tokio::test]
    async fn too_large_response_splits_and_resubmits() {
        let client = Arc::new(RecordingBackendClient::new(vec![
            CannedResponse::TooLarge,
            CannedResponse::Ok,
            CannedResponse::Ok,
        ]));
        let metrics = Arc::new(HandlerMetrics::default());
        let config = SenderPoolConfig {
            min_split_weight: 2,
            ..SenderPoolConfig::default()
        };
        let task = SenderTask::new(client.clone(), queue().await, metrics.clone(), config);

        task.submit_or_spool("h1", points_task(8)).await;
        assert_eq!(metrics.snapshot().delivered, 8);
        assert_eq!(client.submitted().len(), 3);
    }

    #[tokio::test]
    async fn retryable_error_spools_the_task() {
        let client = Arc::new(RecordingBackendClient::new(vec![CannedResponse::Retryable(503)]));
        let metrics = Arc::new(HandlerMetrics::default());
        let q = queue().await;
        let task = SenderTask::new(client, q.clone(), metrics, SenderPoolConfig::default());

        task.submit_or_spool("h1", points_task(3)).await;
        assert_eq!(q.size(), 1);
    }

    #[tokio::test]
    async fn rejected_drops_without_spooling() {
        let client = Arc::new(RecordingBackendClient::new(vec![CannedResponse::Rejected(400)]));
        let metrics = Arc::new(HandlerMetrics::default());
        let q = queue().await;
        let task = SenderTask::new(client, q.clone(), metrics.clone(), SenderPoolConfig::default());

        task.submit_or_spool("h1", points_task(3)).await;
        assert_eq!(q.size(), 0);
        assert_eq!(metrics.snapshot().rejected, 3);
        assert_eq!(metrics.snapshot().delivered, 0);
    }

    // With spooling disabled in the pool config, a retryable backend error
    // drops the batch on the floor and counts it as blocked rather than
    // spooling it or rejecting it as malformed.
    #[tokio::test]
    async fn spooling_disabled_drops_retryable_batches_as_blocked_without_spooling() {
        let client = Arc::new(RecordingBackendClient::new(vec![CannedResponse::Retryable(503)]));
        let metrics = Arc::new(HandlerMetrics::default());
        let q = queue().await;
        let config = SenderPoolConfig {
            spooling_enabled: false,
            ..SenderPoolConfig::default()
        };
        let task = SenderTask::new(client.clone(), q.clone(), metrics.clone(), config);

        task.submit_or_spool("h1", points_task(100)).await;

        assert_eq!(q.size(), 0);
        assert_eq!(client.submitted().len(), 1);
        assert_eq!(metrics.snapshot().blocked, 100);
        assert_eq!(metrics.snapshot().rejected, 0);
        assert_eq!(metrics.snapshot().delivered, 0);
    }

    // Scenario 3: the backend disables an entity type via check-in. Every
    // reported item is counted blocked and nothing reaches the backend at
    // all — not even the first attempt.
    #[tokio::test]
    async fn feature_disabled_tunable_blocks_everything_with_zero_http_calls() {
        let client = Arc::new(RecordingBackendClient::always_ok());
        let metrics = Arc::new(HandlerMetrics::default());
        let q = queue().await;
        let task = SenderTask::new(client.clone(), q.clone(), metrics.clone(), SenderPoolConfig::default());
        task.tunables().set_feature_disabled(true);

        task.submit_or_spool("h1", points_task(100)).await;

        assert!(client.submitted().is_empty());
        assert_eq!(q.size(), 0);
        assert_eq!(metrics.snapshot().blocked, 100);
        assert_eq!(metrics.snapshot().delivered, 0);
    }

    #[tokio::test]
    async fn too_large_split_is_skipped_below_twice_the_minimum_split_weight() {
        let client = Arc::new(RecordingBackendClient::new(vec![CannedResponse::TooLarge]));
        let metrics = Arc::new(HandlerMetrics::default());
        let q = queue().await;
        let config = SenderPoolConfig {
            min_split_weight: 10,
            ..SenderPoolConfig::default()
        };
        let task = SenderTask::new(client.clone(), q.clone(), metrics, config);

        // Weight 15 is below 2x the minimum split weight (20), so the batch
        // is spooled whole instead of being split further.
        task.submit_or_spool("h1", points_task(15)).await;

        assert_eq!(client.submitted().len(), 1);
        assert_eq!(q.size(), 1);
    }
}
