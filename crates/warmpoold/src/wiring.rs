//! Turn config sections into live collaborators.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{info, warn};
use warmpool_agent::{AgentClient, AgentResult, TlsAgentClient};
use warmpool_core::{PoolSpec, RunnerMode, WarmpoolConfig};
use warmpool_drivers::{Driver, FAKE_DRIVER, FakeDriver};
use warmpool_manager::PoolRegistry;
use warmpool_state::{Instance, PgStore, StateStore, Stores};

/// Open the store the runner mode calls for.
pub async fn open_stores(config: &WarmpoolConfig) -> anyhow::Result<Stores> {
    match config.runner.mode {
        RunnerMode::Local => {
            let path = config
                .database
                .path
                .as_deref()
                .context("database.path is required in local mode")?;
            let store = StateStore::open(path)?;
            info!(path = ?path, "state store opened");
            Ok(Stores::from_backend(store))
        }
        RunnerMode::Distributed => {
            let url = config
                .database
                .url
                .as_deref()
                .context("database.url is required in distributed mode")?;
            let store = PgStore::connect(url, config.database.max_connections).await?;
            store.run_migrations().await?;
            info!(max_connections = config.database.max_connections, "postgres store connected");
            Ok(Stores::from_backend(store))
        }
    }
}

/// The adapter for a pool's `driver` tag.
///
/// Only the in-memory `fake` cloud ships in this repository.
pub fn driver_for(spec: &PoolSpec) -> anyhow::Result<Arc<dyn Driver>> {
    match spec.driver.as_str() {
        FAKE_DRIVER => {
            let mut driver = FakeDriver::new();
            if !spec.spec.zones.is_empty() {
                let zones: Vec<&str> = spec.spec.zones.iter().map(String::as_str).collect();
                driver = driver.with_zones(&zones);
            }
            Ok(Arc::new(driver))
        }
        other => anyhow::bail!("pool {}: unknown driver {other:?}", spec.name),
    }
}

pub fn build_registry(pools: &[PoolSpec]) -> anyhow::Result<PoolRegistry> {
    let mut registry = PoolRegistry::new();
    for spec in pools {
        let driver = driver_for(spec)?;
        registry.add(spec.clone(), driver)?;
        info!(pool = %spec.name, driver = %spec.driver, min = spec.min_size, max = spec.max_size, "pool registered");
    }
    Ok(registry)
}

/// Stands in for the guest agent on VMs that only exist in memory.
pub struct AssumeHealthyAgent;

#[async_trait]
impl AgentClient for AssumeHealthyAgent {
    async fn health(&self, _instance: &Instance) -> AgentResult<()> {
        Ok(())
    }

    async fn suspend(&self, _instance: &Instance) -> AgentResult<()> {
        Ok(())
    }
}

/// Fake clouds have no guest agent to talk to.
pub fn agent_for(config: &WarmpoolConfig) -> Arc<dyn AgentClient> {
    let all_fake = !config.pools.is_empty() && config.pools.iter().all(|p| p.driver == FAKE_DRIVER);
    if all_fake {
        warn!("all pools use the fake driver, skipping guest agent probes");
        Arc::new(AssumeHealthyAgent)
    } else {
        Arc::new(TlsAgentClient::new(
            config.agent.probe_timeout,
            config.agent.suspend_timeout,
        ))
    }
}
