//! Telemetry ingestion proxy daemon: loads configuration, builds the
//! handler/pool/queue registry for every configured handle, and drives the
//! check-in loop until told to shut down.

mod config;
mod listener;
mod registry;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::oneshot;
use tproxy_core::{
    CheckinConfig, CheckinController, CheckinOutcome, ReqwestBackendClient, ReqwestCheckinClient,
    ResilientSenderBuilder, TunableRateLimiter, CHECKIN_INTERVAL, METRICS_SNAPSHOT_INTERVAL,
};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Args;
use crate::registry::Registry;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Folds every handler's metrics snapshot into the JSON document the
/// check-in request carries, keyed `<entity_type>.<handle>.<counter>`.
fn collect_metrics_document(registry: &Registry) -> serde_json::Value {
    let mut doc = serde_json::Map::new();
    let mut add = |prefix: &str, handle: &str, snapshot: tproxy_core::HandlerMetricsSnapshot| {
        doc.insert(format!("{prefix}.{handle}.received"), snapshot.received.into());
        doc.insert(format!("{prefix}.{handle}.sent"), snapshot.sent.into());
        doc.insert(format!("{prefix}.{handle}.delivered"), snapshot.delivered.into());
        doc.insert(format!("{prefix}.{handle}.blocked"), snapshot.blocked.into());
        doc.insert(format!("{prefix}.{handle}.rejected"), snapshot.rejected.into());
    };
    for (handle, pipeline) in &registry.points {
        add("points", handle, pipeline.handler.metrics().snapshot());
    }
    for (handle, pipeline) in &registry.histograms {
        add("histograms", handle, pipeline.handler.metrics().snapshot());
    }
    for (handle, pipeline) in &registry.spans {
        add("spans", handle, pipeline.handler.metrics().snapshot());
    }
    for (handle, pipeline) in &registry.span_logs {
        add("spanLogs", handle, pipeline.handler.metrics().snapshot());
    }
    for (handle, pipeline) in &registry.source_tags {
        add("sourceTags", handle, pipeline.handler.metrics().snapshot());
    }
    serde_json::Value::Object(doc)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let args = Args::parse();
    let config = config::load(&args)?;
    info!(proxy_id = %config.proxy.id, "starting up");

    let rate_limiter = TunableRateLimiter::new(
        config.resilience.rate_limit_per_sec,
        config.resilience.rate_limit_burst,
    );
    let rate_limiter_handle = rate_limiter.handle();
    let backend_client = Arc::new(
        ResilientSenderBuilder::new(ReqwestBackendClient::new(
            config.backend.url.clone(),
            config.backend.token.clone(),
        ))
        .with_retry(config.resilience.retry)
        .with_circuit_breaker(config.resilience.circuit_breaker)
        .with_rate_limiter(rate_limiter)
        .build_full(),
    );

    let registry = Registry::build(&config, backend_client).await?;
    let registry = Arc::new(tokio::sync::Mutex::new(Some(registry)));

    let checkin_client = ReqwestCheckinClient::new(config.backend.url.clone());
    let checkin = Arc::new(CheckinController::new(
        checkin_client,
        CheckinConfig {
            proxy_id: config.proxy.id.clone(),
            token: config.backend.token.clone(),
            hostname: config.proxy.hostname.clone(),
            build_version: build_version().to_string(),
            ephemeral: config.proxy.ephemeral,
        },
    ));

    let (metrics_shutdown_tx, mut metrics_shutdown_rx) = oneshot::channel();
    let (checkin_shutdown_tx, mut checkin_shutdown_rx) = oneshot::channel();

    let metrics_task = {
        let checkin = checkin.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(METRICS_SNAPSHOT_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let guard = registry.lock().await;
                        if let Some(registry) = guard.as_ref() {
                            checkin.capture_metrics(collect_metrics_document(registry));
                        }
                    }
                    _ = &mut metrics_shutdown_rx => break,
                }
            }
        })
    };

    let checkin_task = {
        let checkin = checkin.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CHECKIN_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match checkin.tick().await {
                            CheckinOutcome::Applied(agent_config) => {
                                if let Some(rate) = agent_config.rate_limit {
                                    rate_limiter_handle.set_rate(rate);
                                }
                                let guard = registry.lock().await;
                                if let Some(registry) = guard.as_ref() {
                                    registry.apply_checkin_outcome(&agent_config);
                                }
                            }
                            CheckinOutcome::ShutOff => {
                                warn!("backend requested shutdown via check-in, exiting");
                                std::process::exit(1);
                            }
                            CheckinOutcome::Retrying => {}
                            CheckinOutcome::AbortStartup => {
                                error!("check-in failed on startup even after the /api/ URL autofix, aborting");
                                std::process::exit(-5);
                            }
                        }
                    }
                    _ = &mut checkin_shutdown_rx => break,
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining pipelines");

    let _ = metrics_shutdown_tx.send(());
    let _ = checkin_shutdown_tx.send(());
    let _ = metrics_task.await;
    let _ = checkin_task.await;

    if let Some(registry) = registry.lock().await.take() {
        registry.shutdown().await;
    }

    info!("shutdown complete");
    Ok(())
}
