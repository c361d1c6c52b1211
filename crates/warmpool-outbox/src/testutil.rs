//! Shared fixtures for outbox tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use warmpool_agent::{AgentClient, AgentResult};
use warmpool_core::{MachineSpec, Platform, PoolSpec, RunnerMode, VariantSpec};
use warmpool_drivers::FakeDriver;
use warmpool_manager::{Manager, ManagerSettings, PoolRegistry};
use warmpool_metrics::Metrics;
use warmpool_predict::{Prediction, PredictionInput, Predictor, PredictResult};
use warmpool_state::{Instance, StateStore, Stores};

pub(crate) struct HealthyAgent;

#[async_trait]
impl AgentClient for HealthyAgent {
    async fn health(&self, _instance: &Instance) -> AgentResult<()> {
        Ok(())
    }

    async fn suspend(&self, _instance: &Instance) -> AgentResult<()> {
        Ok(())
    }
}

/// Returns a fixed count per variant, zero for unknown ones.
pub(crate) struct FixedPredictor(HashMap<String, u32>);

impl FixedPredictor {
    pub fn new(counts: &[(&str, u32)]) -> Arc<Self> {
        Arc::new(Self(
            counts.iter().map(|(v, n)| (v.to_string(), *n)).collect(),
        ))
    }
}

#[async_trait]
impl Predictor for FixedPredictor {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn predict(&self, input: &PredictionInput) -> PredictResult<Prediction> {
        Ok(Prediction {
            recommended_instances: self.0.get(&input.variant_id).copied().unwrap_or(0),
        })
    }
}

/// A pool with one extra variant, `large`, that keeps one warm instance.
pub(crate) fn variant_pool(name: &str, min_size: u32, max_size: u32) -> PoolSpec {
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
        variants: vec![VariantSpec {
            variant_id: "large".to_string(),
            machine_type: "large".to_string(),
            min_size: 1,
            ..VariantSpec::default()
        }],
    }
}

/// A pool without variants.
pub(crate) fn plain_pool(name: &str, min_size: u32, max_size: u32) -> PoolSpec {
    PoolSpec {
        variants: Vec::new(),
        ..variant_pool(name, min_size, max_size)
    }
}

pub(crate) struct Harness {
    pub manager: Manager,
    pub driver: Arc<FakeDriver>,
    pub stores: Stores,
}

pub(crate) fn harness(mode: RunnerMode, pools: Vec<PoolSpec>, driver: FakeDriver) -> Harness {
    let stores = Stores::from_backend(StateStore::open_in_memory().unwrap());
    let driver = Arc::new(driver);
    let mut registry = PoolRegistry::new();
    for spec in pools {
        registry.add(spec, driver.clone()).unwrap();
    }
    let settings = ManagerSettings {
        runner_name: "runner".to_string(),
        mode,
        agent_port: 9079,
        connectivity_deadline: Duration::from_secs(5),
        hibernate_retries: 3,
        hibernate_backoff_step: Duration::from_secs(30),
        hibernate_attempt_timeout: Duration::from_secs(90),
    };
    let manager = Manager::new(
        settings,
        registry,
        stores.clone(),
        Arc::new(HealthyAgent),
        Metrics::new(),
    );
    Harness {
        manager,
        driver,
        stores,
    }
}
