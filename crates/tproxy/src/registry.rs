//! Wires a `HandlerKey` to its running pipeline: an [`EntityHandler`] ring
//! channel feeding a pool of sender tasks, each draining its own dedicated
//! ring and spooling what the backend won't take right now. Every spawned
//! task holds a `oneshot` shutdown receiver in a `tokio::select!` beside its
//! work loop, the same shape as the teacher's `AsyncSpanCollector::shutdown`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;

use tproxy_core::{
    default_channel_config, AgentConfiguration, BackendClient, EntityBatch, EntityHandler, EntityType,
    HandlerKey, Histogram, Point, SenderPoolConfig, SenderTask, SenderTunables, SourceTag, Span, SpanLogs,
};
use tproxy_ring::Channel;
use tproxy_spool::{SubmissionTask, TaskQueue};

use crate::config::ProxyConfig;

const SPOOL_DRAIN_IDLE_BACKOFF: Duration = Duration::from_millis(250);
const SHUTDOWN_JOIN_DEADLINE: Duration = Duration::from_secs(10);

/// One entity type's full running pipeline for one handle: the handler
/// listeners report into, the sender-task pool draining its ring, and the
/// spool-drain task, plus everything needed to shut them down in order.
pub struct HandlerPipeline<T> {
    pub handler: Arc<EntityHandler<T>>,
    /// Shared across every `SenderTask` spawned for this handle, so a
    /// check-in tunable flip (batch size, feature-disabled) applies
    /// uniformly no matter which ring or the spool-drain task picks up the
    /// next batch.
    pub tunables: Arc<SenderTunables>,
    shutdown_txs: Vec<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T> HandlerPipeline<T>
where
    T: Send + Sync + 'static,
{
    /// Builds the ring channel, the handler, the spool queue, and spawns one
    /// consumer task per sender plus one spool-drain task.
    pub async fn spawn<C, F>(
        key: HandlerKey,
        sender_count: usize,
        client: Arc<C>,
        spool_root: &Path,
        pool_config: SenderPoolConfig,
        to_batch: F,
    ) -> anyhow::Result<Self>
    where
        C: BackendClient + Send + Sync + 'static,
        F: Fn(Vec<T>) -> EntityBatch + Send + Sync + 'static,
    {
        let channel = Arc::new(Channel::<T>::new(default_channel_config(sender_count)));
        let handler = Arc::new(EntityHandler::new(key.clone(), channel.clone(), sender_count));

        let dir = spool_root.join(key.spool_dir_name());
        let queue = Arc::new(TaskQueue::<EntityBatch>::open(dir).await?);
        let to_batch = Arc::new(to_batch);
        let tunables = Arc::new(SenderTunables::new(pool_config.batch_size));

        let mut shutdown_txs = Vec::with_capacity(sender_count + 1);
        let mut tasks = Vec::with_capacity(sender_count + 1);

        for ring_id in 0..sender_count {
            let sender = SenderTask::new(client.clone(), queue.clone(), handler.metrics(), pool_config)
                .with_tunables(tunables.clone());
            let channel = channel.clone();
            let to_batch = to_batch.clone();
            let handle = key.handle.clone();
            let tunables = tunables.clone();
            let (tx, mut shutdown_rx) = oneshot::channel();
            shutdown_txs.push(tx);

            let task = tokio::spawn(async move {
                let mut interval = tokio::time::interval(pool_config.batch_timeout);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            drain_ring(&channel, ring_id, tunables.batch_size(), to_batch.as_ref(), &sender, &handle).await;
                        }
                        _ = &mut shutdown_rx => {
                            drain_ring(&channel, ring_id, usize::MAX, to_batch.as_ref(), &sender, &handle).await;
                            break;
                        }
                    }
                }
            });
            tasks.push(task);
        }

        // One spool-drain task per handler: round-robins `drain_one` across
        // the shared queue, idling between empty polls.
        {
            let sender = SenderTask::new(client.clone(), queue.clone(), handler.metrics(), pool_config)
                .with_tunables(tunables.clone());
            let handle = key.handle.clone();
            let (tx, mut shutdown_rx) = oneshot::channel();
            shutdown_txs.push(tx);

            let task = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        drained = sender.drain_one(&handle) => {
                            match drained {
                                Ok(true) => {}
                                Ok(false) => tokio::time::sleep(SPOOL_DRAIN_IDLE_BACKOFF).await,
                                Err(e) => {
                                    warn!(error = %e, handle = %handle, "spool drain failed");
                                    tokio::time::sleep(Duration::from_secs(1)).await;
                                }
                            }
                        }
                        _ = &mut shutdown_rx => break,
                    }
                }
            });
            tasks.push(task);
        }

        Ok(Self {
            handler,
            tunables,
            shutdown_txs,
            tasks,
        })
    }

    /// Signals every spawned task to drain and stop, then joins them with a
    /// deadline so a wedged backend connection can't hang shutdown forever.
    pub async fn shutdown(self) {
        for tx in self.shutdown_txs {
            let _ = tx.send(());
        }
        for task in self.tasks {
            if tokio::time::timeout(SHUTDOWN_JOIN_DEADLINE, task).await.is_err() {
                warn!("pipeline task did not stop within the shutdown deadline");
            }
        }
    }
}

async fn drain_ring<T, C, F>(
    channel: &Channel<T>,
    ring_id: usize,
    max_items: usize,
    to_batch: &F,
    sender: &SenderTask<C>,
    handle: &str,
) where
    T: Send + 'static,
    C: BackendClient,
    F: Fn(Vec<T>) -> EntityBatch,
{
    let Some(ring) = channel.get_ring(ring_id) else {
        return;
    };
    let mut items = Vec::new();
    ring.consume_up_to_owned(max_items, |item| items.push(item));
    if items.is_empty() {
        return;
    }
    let batch = to_batch(items);
    sender.submit_or_spool(handle, SubmissionTask::new(batch, handle)).await;
}

/// Every running pipeline, keyed by handle, for every entity type the config
/// names. A listener implementation looks up the handler for the handle it's
/// bound to and calls [`EntityHandler::report`] on decoded entities — this
/// crate stops at constructing and owning that handler.
pub struct Registry {
    pub points: BTreeMap<String, HandlerPipeline<Point>>,
    pub histograms: BTreeMap<String, HandlerPipeline<Histogram>>,
    pub spans: BTreeMap<String, HandlerPipeline<Span>>,
    pub span_logs: BTreeMap<String, HandlerPipeline<SpanLogs>>,
    pub source_tags: BTreeMap<String, HandlerPipeline<SourceTag>>,
}

impl Registry {
    /// Builds every configured handle's pipeline against a shared backend
    /// client. A `spans` handle gets both a `Span` and a `SpanLogs` pipeline,
    /// since both share a listener port on the wire.
    pub async fn build<C>(config: &ProxyConfig, client: Arc<C>) -> anyhow::Result<Self>
    where
        C: BackendClient + Send + Sync + 'static,
    {
        let pool_config = SenderPoolConfig::default();
        let mut points = BTreeMap::new();
        for handle in &config.points {
            let key = HandlerKey::new(EntityType::Point, handle.handle.clone());
            let pipeline = HandlerPipeline::spawn(
                key,
                handle.sender_count,
                client.clone(),
                &config.spool_dir,
                pool_config,
                EntityBatch::Points,
            )
            .await?;
            points.insert(handle.handle.clone(), pipeline);
        }

        let mut histograms = BTreeMap::new();
        for handle in &config.histograms {
            let key = HandlerKey::new(EntityType::Histogram, handle.handle.clone());
            let pipeline = HandlerPipeline::spawn(
                key,
                handle.sender_count,
                client.clone(),
                &config.spool_dir,
                pool_config,
                EntityBatch::Histograms,
            )
            .await?;
            histograms.insert(handle.handle.clone(), pipeline);
        }

        let mut spans = BTreeMap::new();
        let mut span_logs = BTreeMap::new();
        for handle in &config.spans {
            let span_key = HandlerKey::new(EntityType::Span, handle.handle.clone());
            let span_pipeline = HandlerPipeline::spawn(
                span_key,
                handle.sender_count,
                client.clone(),
                &config.spool_dir,
                pool_config,
                EntityBatch::Spans,
            )
            .await?;
            spans.insert(handle.handle.clone(), span_pipeline);

            let log_key = HandlerKey::new(EntityType::SpanLogs, handle.handle.clone());
            let log_pipeline = HandlerPipeline::spawn(
                log_key,
                handle.sender_count,
                client.clone(),
                &config.spool_dir,
                pool_config,
                EntityBatch::SpanLogs,
            )
            .await?;
            span_logs.insert(handle.handle.clone(), log_pipeline);
        }

        let mut source_tags = BTreeMap::new();
        for handle in &config.source_tags {
            let key = HandlerKey::new(EntityType::SourceTag, handle.handle.clone());
            let pipeline = HandlerPipeline::spawn(
                key,
                handle.sender_count,
                client.clone(),
                &config.spool_dir,
                pool_config,
                EntityBatch::SourceTags,
            )
            .await?;
            source_tags.insert(handle.handle.clone(), pipeline);
        }

        Ok(Self {
            points,
            histograms,
            spans,
            span_logs,
            source_tags,
        })
    }

    /// Applies a check-in's tunables to every pipeline: batch size, and
    /// feature-disabled keyed by the entity type's name (`"points"`,
    /// `"histograms"`, `"spans"`, `"spanLogs"`, `"sourceTags"`). Pipelines for
    /// handles this proxy never configured are simply absent from the maps,
    /// so a backend-side flag for an entity type this proxy doesn't run is a
    /// no-op here.
    pub fn apply_checkin_outcome(&self, config: &AgentConfiguration) {
        self.apply_to(&self.points, EntityType::Point, config);
        self.apply_to(&self.histograms, EntityType::Histogram, config);
        self.apply_to(&self.spans, EntityType::Span, config);
        self.apply_to(&self.span_logs, EntityType::SpanLogs, config);
        self.apply_to(&self.source_tags, EntityType::SourceTag, config);
    }

    fn apply_to<T>(
        &self,
        pipelines: &BTreeMap<String, HandlerPipeline<T>>,
        entity_type: EntityType,
        config: &AgentConfiguration,
    ) {
        let feature_disabled = config
            .feature_disabled
            .get(entity_type.as_str())
            .copied()
            .unwrap_or(false);
        for pipeline in pipelines.values() {
            if let Some(items_per_batch) = config.items_per_batch {
                pipeline.tunables.set_batch_size(items_per_batch);
            }
            pipeline.tunables.set_feature_disabled(feature_disabled);
        }
    }

    /// Shuts down every pipeline's background tasks, handle by handle.
    pub async fn shutdown(self) {
        for (_, pipeline) in self.points {
            pipeline.shutdown().await;
        }
        for (_, pipeline) in self.histograms {
            pipeline.shutdown().await;
        }
        for (_, pipeline) in self.spans {
            pipeline.shutdown().await;
        }
        for (_, pipeline) in self.span_logs {
            pipeline.shutdown().await;
        }
        for (_, pipeline) in self.source_tags {
            pipeline.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tproxy_core::backend_client::RecordingBackendClient;
    use tproxy_core::entities::EntityType;

    #[tokio::test]
    async fn reported_points_reach_the_backend_client() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(RecordingBackendClient::always_ok());
        let key = HandlerKey::new(EntityType::Point, "2878".to_string());

        let pipeline = HandlerPipeline::spawn(
            key,
            2,
            client.clone(),
            dir.path(),
            SenderPoolConfig {
                batch_timeout: Duration::from_millis(20),
                ..SenderPoolConfig::default()
            },
            EntityBatch::Points,
        )
        .await
        .unwrap();

        let point = tproxy_core::entities::Point {
            metric: "cpu.load".into(),
            value: 1.0,
            timestamp_ms: tproxy_core::validation::now_millis(),
            source: "host-1".into(),
            tags: Default::default(),
        };
        pipeline.handler.report(point).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.submitted().len(), 1);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn registry_builds_one_pipeline_per_configured_handle() {
        use crate::config::{BackendConfig, HandleConfig, ProxyConfig, ProxyIdentityConfig};

        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(RecordingBackendClient::always_ok());
        let config = ProxyConfig {
            proxy: ProxyIdentityConfig {
                id: "proxy-1".into(),
                hostname: "host-a".into(),
                ephemeral: false,
            },
            backend: BackendConfig {
                url: "https://example.invalid".into(),
                token: "tok".into(),
            },
            points: vec![HandleConfig {
                handle: "2878".into(),
                sender_count: 1,
            }],
            histograms: vec![],
            spans: vec![HandleConfig {
                handle: "30001".into(),
                sender_count: 1,
            }],
            source_tags: vec![],
            spool_dir: dir.path().to_path_buf(),
            preprocessor_rules: Default::default(),
            resilience: Default::default(),
        };

        let registry = Registry::build(&config, client).await.unwrap();
        assert!(registry.points.contains_key("2878"));
        assert!(registry.spans.contains_key("30001"));
        assert!(registry.span_logs.contains_key("30001"));
        assert!(registry.histograms.is_empty());
        assert!(registry.source_tags.is_empty());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn checkin_outcome_retunes_batch_size_and_feature_disabled_live() {
        use crate::config::{BackendConfig, HandleConfig, ProxyConfig, ProxyIdentityConfig};
        use std::collections::BTreeMap;
        use tproxy_core::AgentConfiguration;

        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(RecordingBackendClient::always_ok());
        let config = ProxyConfig {
            proxy: ProxyIdentityConfig {
                id: "proxy-1".into(),
                hostname: "host-a".into(),
                ephemeral: false,
            },
            backend: BackendConfig {
                url: "https://example.invalid".into(),
                token: "tok".into(),
            },
            points: vec![HandleConfig {
                handle: "2878".into(),
                sender_count: 1,
            }],
            histograms: vec![],
            spans: vec![],
            source_tags: vec![],
            spool_dir: dir.path().to_path_buf(),
            preprocessor_rules: Default::default(),
            resilience: Default::default(),
        };

        let registry = Registry::build(&config, client).await.unwrap();
        let mut feature_disabled = BTreeMap::new();
        feature_disabled.insert("points".to_string(), true);

        registry.apply_checkin_outcome(&AgentConfiguration {
            shut_off_agents: false,
            current_time: None,
            rate_limit: None,
            items_per_batch: Some(7),
            sampling_probability: None,
            feature_disabled,
        });

        let pipeline = registry.points.get("2878").unwrap();
        assert_eq!(pipeline.tunables.batch_size(), 7);
        assert!(pipeline.tunables.is_feature_disabled());

        registry.shutdown().await;
    }
}
