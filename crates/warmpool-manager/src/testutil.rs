//! Shared fixtures for manager tests.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use warmpool_agent::{AgentClient, AgentError, AgentResult};
use warmpool_core::{MachineSpec, Platform, PoolSpec, RunnerMode};
use warmpool_drivers::FakeDriver;
use warmpool_metrics::Metrics;
use warmpool_state::*;

use crate::manager::{Manager, ManagerSettings};
use crate::registry::PoolRegistry;

/// Agent whose health can be toggled.
pub(crate) struct ScriptedAgent {
    pub healthy: AtomicBool,
    pub suspends: AtomicU32,
}

impl ScriptedAgent {
    pub fn new(healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(healthy),
            suspends: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl AgentClient for ScriptedAgent {
    async fn health(&self, _instance: &Instance) -> AgentResult<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AgentError::Status(503))
        }
    }

    async fn suspend(&self, _instance: &Instance) -> AgentResult<()> {
        self.suspends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Instance store whose `create` always fails.
pub(crate) struct RejectingStore(pub StateStore);

#[async_trait]
impl InstanceStore for RejectingStore {
    async fn find(&self, id: &str) -> StateResult<Option<Instance>> {
        InstanceStore::find(&self.0, id).await
    }

    async fn find_by_name(&self, name: &str) -> StateResult<Option<Instance>> {
        self.0.find_by_name(name).await
    }

    async fn list(&self, query: &InstanceQuery) -> StateResult<Vec<Instance>> {
        InstanceStore::list(&self.0, query).await
    }

    async fn create(&self, _instance: &Instance) -> StateResult<()> {
        Err(StateError::Write("disk full".to_string()))
    }

    async fn update(&self, instance: &Instance) -> StateResult<()> {
        InstanceStore::update(&self.0, instance).await
    }

    async fn delete(&self, id: &str) -> StateResult<bool> {
        InstanceStore::delete(&self.0, id).await
    }

    async fn find_and_claim(
        &self,
        query: &InstanceQuery,
        new_state: InstanceState,
        allowed: &[InstanceState],
        update_start_time: bool,
    ) -> StateResult<Instance> {
        self.0
            .find_and_claim(query, new_state, allowed, update_start_time)
            .await
    }

    async fn patch(
        &self,
        id: &str,
        expected: &[InstanceState],
        patch: &InstancePatch,
    ) -> StateResult<Option<Instance>> {
        self.0.patch(id, expected, patch).await
    }

    async fn mark_for_purge(
        &self,
        pool: &str,
        criteria: &PurgeCriteria,
        now: i64,
    ) -> StateResult<Vec<Instance>> {
        self.0.mark_for_purge(pool, criteria, now).await
    }

    async fn count_by_pool_and_variant(
        &self,
        state: InstanceState,
    ) -> StateResult<Vec<PoolVariantCount>> {
        self.0.count_by_pool_and_variant(state).await
    }
}

pub(crate) fn pool_spec(name: &str, min_size: u32, max_size: u32) -> PoolSpec {
    PoolSpec {
        name: name.to_string(),
        driver: "fake".to_string(),
        platform: Platform {
            os: "linux".to_string(),
            arch: "amd64".to_string(),
            ..Platform::default()
        },
        min_size,
        max_size,
        spec: MachineSpec {
            image: "ubuntu-22.04".to_string(),
            size: "small".to_string(),
            region: "fake-region".to_string(),
            ..MachineSpec::default()
        },
        variants: Vec::new(),
    }
}

pub(crate) struct Harness {
    pub manager: Manager,
    pub driver: Arc<FakeDriver>,
    pub agent: Arc<ScriptedAgent>,
    pub stores: Stores,
}

pub(crate) fn settings(mode: RunnerMode) -> ManagerSettings {
    ManagerSettings {
        runner_name: "runner".to_string(),
        mode,
        agent_port: 9079,
        connectivity_deadline: Duration::from_secs(5),
        hibernate_retries: 3,
        hibernate_backoff_step: Duration::from_secs(30),
        hibernate_attempt_timeout: Duration::from_secs(90),
    }
}

pub(crate) fn harness_with(
    mode: RunnerMode,
    pools: Vec<PoolSpec>,
    driver: FakeDriver,
    stores: Stores,
) -> Harness {
    let driver = Arc::new(driver);
    let mut registry = PoolRegistry::new();
    for spec in pools {
        registry.add(spec, driver.clone()).unwrap();
    }
    let agent = ScriptedAgent::new(true);
    let manager = Manager::new(
        settings(mode),
        registry,
        stores.clone(),
        agent.clone(),
        Metrics::new(),
    );
    Harness {
        manager,
        driver,
        agent,
        stores,
    }
}

pub(crate) fn harness(mode: RunnerMode, pools: Vec<PoolSpec>, driver: FakeDriver) -> Harness {
    let stores = Stores::from_backend(StateStore::open_in_memory().unwrap());
    harness_with(mode, pools, driver, stores)
}

/// Poll `check` until it holds or five seconds pass.
pub(crate) async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
