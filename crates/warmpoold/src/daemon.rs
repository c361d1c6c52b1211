//! Replica lifecycle: start every subsystem, wait for Ctrl-C, stop them.

use std::fmt::Write as _;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};
use warmpool_core::WarmpoolConfig;
use warmpool_manager::{Manager, ManagerSettings, PurgerSettings};
use warmpool_metrics::{Metrics, Value};
use warmpool_outbox::{OutboxProcessor, ScaleHandler, Scaler, SetupInstanceHandler};
use warmpool_predict::EmaWeekendPredictor;
use warmpool_scheduler::{
    HistoryCleanupJob, OutboxCleanupJob, OutboxProcessorJob, ScalerTriggerJob, Scheduler,
    UtilizationTrackerJob,
};

use crate::wiring;

pub async fn run(config: WarmpoolConfig) -> anyhow::Result<()> {
    info!(
        runner = %config.runner.name,
        mode = ?config.runner.mode,
        pools = config.pools.len(),
        "warmpool daemon starting"
    );

    // ── Collaborators ──────────────────────────────────────────
    let stores = wiring::open_stores(&config).await?;
    let registry = wiring::build_registry(&config.pools)?;
    let agent = wiring::agent_for(&config);
    let metrics = Metrics::new();
    let manager = Manager::new(
        ManagerSettings::from_config(&config),
        registry,
        stores.clone(),
        agent,
        metrics.clone(),
    );

    manager.ping_drivers().await?;
    info!("drivers reachable");

    if let Err(e) = manager.build_pools().await {
        warn!(error = %e, "initial pool build incomplete");
    }

    // ── Background tasks ───────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let purger_handle = if config.purger.enabled {
        let settings = PurgerSettings::from_config(&config.purger);
        Some(manager.start_instance_purger(settings, shutdown_rx.clone())?)
    } else {
        info!("instance purger disabled");
        None
    };

    let scheduler = build_scheduler(&config, &manager).await?;
    scheduler.start().await;

    // ── Wait for shutdown ──────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    scheduler.stop().await;
    if let Some(handle) = purger_handle {
        let _ = handle.await;
    }

    log_metrics(&metrics);
    info!("warmpool daemon stopped");
    Ok(())
}

/// Register the periodic jobs this config enables.
async fn build_scheduler(config: &WarmpoolConfig, manager: &Manager) -> anyhow::Result<Scheduler> {
    let stores = manager.stores();
    let predictor = Arc::new(EmaWeekendPredictor::new(
        stores.utilization.clone(),
        config.predictor.clone(),
    ));
    let processor = Arc::new(
        OutboxProcessor::new(
            stores.outbox.clone(),
            &config.runner.name,
            config.outbox.clone(),
            manager.metrics().clone(),
        )
        .with_handler(Arc::new(SetupInstanceHandler::new(manager.clone())))
        .with_handler(Arc::new(ScaleHandler::new(Scaler::new(
            manager.clone(),
            predictor,
        )))),
    );

    let scheduler = Scheduler::new();
    scheduler
        .register(Arc::new(OutboxProcessorJob::new(processor.clone())))
        .await?;
    scheduler
        .register(Arc::new(OutboxCleanupJob::new(processor)))
        .await?;
    scheduler
        .register(Arc::new(HistoryCleanupJob::new(
            stores.utilization.clone(),
            config.history.interval,
            config.history.retention_days,
        )))
        .await?;
    if config.utilization.enabled {
        scheduler
            .register(Arc::new(UtilizationTrackerJob::new(
                manager.clone(),
                config.utilization.interval,
            )))
            .await?;
    }
    if config.scaler.enabled {
        scheduler
            .register(Arc::new(ScalerTriggerJob::new(
                manager.clone(),
                config.scaler.clone(),
            )))
            .await?;
    }
    Ok(scheduler)
}

fn log_metrics(metrics: &Metrics) {
    for sample in metrics.snapshot() {
        let value = match sample.value {
            Value::Counter(v) => v as i64,
            Value::Gauge(v) => v,
        };
        info!(
            metric = sample.name,
            pool = %sample.pool,
            variant = %sample.variant,
            value,
            "final metric"
        );
    }
}

/// Human-readable summary of a validated config.
pub fn describe(config: &WarmpoolConfig) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "runner {} ({:?}), {} pool(s)",
        config.runner.name,
        config.runner.mode,
        config.pools.len()
    );
    let _ = writeln!(
        out,
        "{:<24} {:<8} {:<16} {:>4} {:>4}  VARIANTS",
        "POOL", "DRIVER", "PLATFORM", "MIN", "MAX"
    );
    for pool in &config.pools {
        let platform = format!("{}/{}", pool.platform.os, pool.platform.arch);
        let variants: Vec<String> = pool
            .variants
            .iter()
            .map(|v| format!("{}(min {})", v.variant_id, v.min_size))
            .collect();
        let _ = writeln!(
            out,
            "{:<24} {:<8} {:<16} {:>4} {:>4}  {}",
            pool.name,
            pool.driver,
            platform,
            pool.min_size,
            pool.max_size,
            if variants.is_empty() {
                "-".to_string()
            } else {
                variants.join(", ")
            }
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[runner]
name = "replica-1"

[database]
path = "/tmp/warmpool-test.redb"

[[pool]]
name = "linux-amd64"
driver = "fake"
min_size = 2
max_size = 10

[pool.platform]
os = "linux"
arch = "amd64"

[pool.spec]
image = "ubuntu-22.04"
size = "small"

[[pool.variant]]
variant_id = "large"
machine_type = "large"
min_size = 1
"#;

    #[test]
    fn describe_lists_pools_and_variants() {
        let config = WarmpoolConfig::from_toml_str(CONFIG).unwrap();
        let text = describe(&config);
        assert!(text.starts_with("runner replica-1 (Local), 1 pool(s)"));
        let row = text.lines().nth(2).unwrap();
        assert!(row.starts_with("linux-amd64"));
        assert!(row.contains("linux/amd64"));
        assert!(row.ends_with("large(min 1)"));
    }

    #[tokio::test]
    async fn scheduler_registers_enabled_jobs() {
        let mut config = WarmpoolConfig::from_toml_str(CONFIG).unwrap();
        config.scaler.enabled = false;
        let manager = Manager::new(
            ManagerSettings::from_config(&config),
            wiring::build_registry(&config.pools).unwrap(),
            warmpool_state::Stores::from_backend(
                warmpool_state::StateStore::open_in_memory().unwrap(),
            ),
            Arc::new(wiring::AssumeHealthyAgent),
            Metrics::new(),
        );
        let scheduler = build_scheduler(&config, &manager).await.unwrap();
        scheduler.start().await;
        assert_eq!(
            scheduler.running_jobs().await,
            vec![
                "history-cleanup".to_string(),
                "outbox-cleanup".to_string(),
                "outbox-processor".to_string(),
                "utilization-tracker".to_string(),
            ]
        );
        scheduler.stop().await;
    }
}
