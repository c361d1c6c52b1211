//! `setup_instance` jobs: add one warm VM to a pool.

use anyhow::Context;
use async_trait::async_trait;
use tracing::{info, warn};
use warmpool_manager::{Manager, ManagerError};
use warmpool_state::{OutboxJob, OutboxJobType, SetupInstanceParams};

use crate::processor::JobHandler;

pub struct SetupInstanceHandler {
    manager: Manager,
}

impl SetupInstanceHandler {
    pub fn new(manager: Manager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl JobHandler for SetupInstanceHandler {
    fn job_type(&self) -> OutboxJobType {
        OutboxJobType::SetupInstance
    }

    async fn handle(&self, job: &OutboxJob) -> anyhow::Result<()> {
        let params: SetupInstanceParams = job.params()?;
        match self
            .manager
            .setup_instance(&params.pool_name, &params.machine)
            .await
        {
            Ok(instance) => {
                info!(
                    job = job.id,
                    pool = %params.pool_name,
                    instance = %instance.id,
                    "warm instance set up"
                );
                Ok(())
            }
            // A full local pool already has what this job asked for.
            Err(ManagerError::NoInstanceAvailable(pool)) => {
                warn!(job = job.id, %pool, "pool at max size, setup skipped");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("setup instance in pool {}", params.pool_name)),
        }
    }
}
