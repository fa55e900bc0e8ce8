//! Scaling agent - vertical scaling control loop
//!
//! Runs the periodic scale check, the deferred dispatch loop that executes
//! due resize schedules, and the HTTP API for manual scheduling.

use anyhow::{Context, Result};
use scaler_lib::{
    health::{components, HealthRegistry},
    window::parse_utc_offset,
    DispatchConfig, DispatchLoop, Notifier, ResizeExecutor, ResizeScheduler, ScaleCheck,
    ScalerMetrics, ScheduleStore, StructuredLogger,
};
use scaling_agent::{api, config::AgentConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting scaling-agent");

    let config = AgentConfig::load()?;
    info!(
        agent_name = %config.agent_name,
        instances = config.instances.len(),
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    for name in components::ALL {
        health_registry.register(name).await;
    }

    let metrics = ScalerMetrics::new();
    let logger = StructuredLogger::new(&config.agent_name);
    logger.log_startup(AGENT_VERSION, config.instances.len());

    let store = ScheduleStore::open(Path::new(&config.store_path))
        .with_context(|| format!("Failed to open schedule store at {}", config.store_path))?;
    let platform = config.platform.build();
    let source = config.metrics_source.build()?;
    let transport = config.notifier.build()?;
    let default_offset = parse_utc_offset(&config.default_utc_offset)
        .map_err(|e| anyhow::anyhow!("default_utc_offset: {}", e))?;

    let scheduler = ResizeScheduler::new(
        store.clone(),
        platform.clone(),
        config.instance_ids(),
        default_offset,
    )
    .with_logger(logger.clone())
    .with_metrics(metrics.clone())
    .with_health(health_registry.clone());

    let notifier = Notifier::new(transport)
        .with_metrics(metrics.clone())
        .with_health(health_registry.clone());
    let executor = ResizeExecutor::new(
        platform.clone(),
        store.clone(),
        notifier,
        config.executor.executor_config(),
    )
    .with_channels(config.channels())
    .with_logger(logger.clone())
    .with_metrics(metrics.clone());

    let check = ScaleCheck::new(platform, source, scheduler.clone())
        .with_min_lead(chrono::Duration::seconds(config.min_lead_secs as i64))
        .with_logger(logger.clone())
        .with_metrics(metrics.clone())
        .with_health(health_registry.clone());

    let dispatch = DispatchLoop::new(
        executor,
        store,
        DispatchConfig {
            interval: Duration::from_secs(config.dispatch_interval_secs),
            shutdown_grace: Duration::from_secs(config.executor.shutdown_grace_secs),
        },
    )
    .with_metrics(metrics.clone())
    .with_health(health_registry.clone());

    let (shutdown_tx, _) = broadcast::channel(1);

    let dispatch_handle = tokio::spawn(dispatch.run(shutdown_tx.subscribe()));
    let check_handle = tokio::spawn(check.clone().run_periodic(
        config.instances.clone(),
        Duration::from_secs(config.check_interval_secs),
        shutdown_tx.subscribe(),
    ));

    let app_state = Arc::new(
        api::AppState::new(
            health_registry.clone(),
            scheduler,
            check,
            config.instances.clone(),
        )
        .with_api_token(config.api_token.clone()),
    );

    // Mark agent as ready after initialization
    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            logger.log_shutdown("SIGINT received");
        }
        served = api_handle => {
            match served {
                Ok(Ok(())) => logger.log_shutdown("API server stopped"),
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
            }
        }
    }

    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    if let Err(e) = dispatch_handle.await {
        error!(error = %e, "Dispatch loop task panicked");
    }
    if let Err(e) = check_handle.await {
        error!(error = %e, "Scale check task panicked");
    }
    info!("Shutting down");

    Ok(())
}
