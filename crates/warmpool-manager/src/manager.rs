//! The pool manager handle and its read-side operations.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use warmpool_agent::AgentClient;
use warmpool_core::{Platform, RunnerMode, WarmpoolConfig, epoch_secs};
use warmpool_metrics::{Metrics, names};
use warmpool_state::{Instance, InstancePatch, InstanceQuery, InstanceState, Stores};

use crate::allocator::{Allocator, DistributedAllocator, LocalAllocator};
use crate::error::{ManagerError, ManagerResult};
use crate::registry::{PoolEntry, PoolRegistry};

/// Knobs the manager needs from the daemon configuration.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub runner_name: String,
    pub mode: RunnerMode,
    pub agent_port: u16,
    /// How long a new VM's agent may take to answer its first health probe.
    pub connectivity_deadline: Duration,
    /// Hibernate retries after the first failed attempt.
    pub hibernate_retries: u32,
    /// Retry `n` waits `n * hibernate_backoff_step`.
    pub hibernate_backoff_step: Duration,
    /// Bound on each driver hibernate call.
    pub hibernate_attempt_timeout: Duration,
}

impl ManagerSettings {
    pub fn from_config(config: &WarmpoolConfig) -> Self {
        Self {
            runner_name: config.runner.name.clone(),
            mode: config.runner.mode,
            agent_port: config.agent.port,
            connectivity_deadline: config.agent.connectivity_deadline,
            hibernate_retries: config.hibernate.retries,
            hibernate_backoff_step: config.hibernate.backoff_step,
            hibernate_attempt_timeout: config.hibernate.attempt_timeout,
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&WarmpoolConfig::default())
    }
}

/// What `inspect` reports about a pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolInfo {
    pub name: String,
    pub platform: Platform,
    pub driver_name: String,
    pub root_dir: PathBuf,
    pub min_size: u32,
    pub max_size: u32,
    pub variants: Vec<String>,
}

/// Instance counts for one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    /// `created`, including hibernated ones.
    pub free: u32,
    pub hibernating: u32,
    pub busy: u32,
    pub terminating: u32,
}

/// Owns the lifecycle of every VM in every configured pool.
///
/// Cheap to clone; clones share the registry, stores, and allocator.
///
/// # Architecture
///
/// ```text
/// Manager
///   ├── PoolRegistry (pool → spec + driver, read-only)
///   ├── Allocator    (local mutex or distributed claim)
///   ├── Stores       (instances, stage owners, reservations, outbox)
///   ├── AgentClient  (health probes, suspend)
///   └── Metrics
/// ```
#[derive(Clone)]
pub struct Manager {
    pub(crate) settings: Arc<ManagerSettings>,
    pub(crate) registry: Arc<PoolRegistry>,
    pub(crate) stores: Stores,
    pub(crate) allocator: Arc<dyn Allocator>,
    pub(crate) agent: Arc<dyn AgentClient>,
    pub(crate) metrics: Arc<Metrics>,
}

impl Manager {
    /// Create a manager; the allocator follows `settings.mode`.
    pub fn new(
        settings: ManagerSettings,
        registry: PoolRegistry,
        stores: Stores,
        agent: Arc<dyn AgentClient>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let allocator: Arc<dyn Allocator> = match settings.mode {
            RunnerMode::Local => Arc::new(LocalAllocator::new(stores.instances.clone())),
            RunnerMode::Distributed => {
                Arc::new(DistributedAllocator::new(stores.instances.clone()))
            }
        };
        info!(
            runner = %settings.runner_name,
            mode = ?settings.mode,
            pools = registry.len(),
            "pool manager created"
        );
        Self {
            settings: Arc::new(settings),
            registry: Arc::new(registry),
            stores,
            allocator,
            agent,
            metrics,
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn registry(&self) -> &PoolRegistry {
        &self.registry
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn is_distributed(&self) -> bool {
        self.settings.mode == RunnerMode::Distributed
    }

    pub(crate) fn entry(&self, pool: &str) -> ManagerResult<Arc<PoolEntry>> {
        self.registry.get(pool)
    }

    pub fn exists(&self, pool: &str) -> bool {
        self.registry.contains(pool)
    }

    /// Platform, root directory and driver of a pool.
    pub fn inspect(&self, pool: &str) -> ManagerResult<PoolInfo> {
        let entry = self.entry(pool)?;
        Ok(PoolInfo {
            name: entry.spec.name.clone(),
            platform: entry.spec.platform.clone(),
            driver_name: entry.driver.driver_name().to_string(),
            root_dir: entry.driver.root_dir().to_path_buf(),
            min_size: entry.spec.min_size,
            max_size: entry.spec.max_size,
            variants: entry.spec.variant_ids(),
        })
    }

    pub async fn find(&self, instance_id: &str) -> ManagerResult<Instance> {
        self.stores
            .instances
            .find(instance_id)
            .await?
            .ok_or_else(|| ManagerError::InstanceNotFound(instance_id.to_string()))
    }

    /// Instances of `pool` matching `query`, oldest first.
    pub async fn list(&self, pool: &str, query: &InstanceQuery) -> ManagerResult<Vec<Instance>> {
        self.entry(pool)?;
        let mut query = query.clone();
        query.pool = Some(pool.to_string());
        Ok(self.stores.instances.list(&query).await?)
    }

    /// The live instance bound to `stage_id` in `pool`, if any.
    pub async fn get_instance_by_stage_id(
        &self,
        pool: &str,
        stage_id: &str,
    ) -> ManagerResult<Option<Instance>> {
        if stage_id.is_empty() {
            return Err(ManagerError::BadRequest("stage id is required".to_string()));
        }
        let query = InstanceQuery {
            stage: Some(stage_id.to_string()),
            ..InstanceQuery::default()
        };
        Ok(self
            .list(pool, &query)
            .await?
            .into_iter()
            .find(|i| i.state != InstanceState::Terminating))
    }

    pub async fn pool_counts(&self, pool: &str) -> ManagerResult<PoolCounts> {
        let mut counts = PoolCounts::default();
        for instance in self.list(pool, &InstanceQuery::default()).await? {
            match instance.state {
                InstanceState::Created => counts.free += 1,
                InstanceState::Hibernating => counts.hibernating += 1,
                InstanceState::InUse => counts.busy += 1,
                InstanceState::Terminating => counts.terminating += 1,
                InstanceState::Stopped => {}
            }
        }
        Ok(counts)
    }

    /// Refresh the free/busy gauges of every pool.
    pub async fn record_gauges(&self) -> ManagerResult<()> {
        for name in self.registry.names() {
            let counts = self.pool_counts(&name).await?;
            self.metrics.set_gauge(
                names::FREE_INSTANCES,
                &name,
                "",
                i64::from(counts.free + counts.hibernating),
            );
            self.metrics
                .set_gauge(names::BUSY_INSTANCES, &name, "", i64::from(counts.busy));
        }
        Ok(())
    }

    /// Apply tags on the VM and mirror them into the instance labels.
    pub async fn set_tags(
        &self,
        pool: &str,
        instance_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> ManagerResult<Instance> {
        let entry = self.entry(pool)?;
        let instance = self.find(instance_id).await?;
        entry
            .driver
            .set_tags(&instance, tags)
            .await
            .map_err(|e| ManagerError::driver("set tags", e))?;
        let patch = InstancePatch {
            labels: tags.clone(),
            ..InstancePatch::at(epoch_secs())
        };
        let tagged = self
            .allocator
            .patch(pool, instance_id, &[], &patch)
            .await?
            .ok_or_else(|| ManagerError::InstanceNotFound(instance_id.to_string()))?;
        debug!(%pool, instance = %instance_id, tags = tags.len(), "tags applied");
        Ok(tagged)
    }

    /// Serial console output of a VM.
    pub async fn instance_logs(&self, pool: &str, instance_id: &str) -> ManagerResult<String> {
        let entry = self.entry(pool)?;
        entry
            .driver
            .logs(instance_id)
            .await
            .map_err(|e| ManagerError::driver("logs", e))
    }

    /// Ping every distinct driver. Fails on the first unreachable one.
    pub async fn ping_drivers(&self) -> ManagerResult<()> {
        for entry in self.registry.distinct_drivers() {
            if let Err(e) = entry.driver.ping().await {
                warn!(pool = %entry.name(), driver = %entry.driver.driver_name(), error = %e, "driver ping failed");
                return Err(ManagerError::driver("ping", e));
            }
            debug!(driver = %entry.driver.driver_name(), "driver reachable");
        }
        Ok(())
    }
}
