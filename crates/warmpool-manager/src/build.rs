//! Filling pools up to their warm targets.

use tracing::{debug, info, warn};
use warmpool_core::MachineConfig;
use warmpool_state::{InstanceQuery, OutboxJobType, SetupInstanceParams};

use crate::error::ManagerResult;
use crate::manager::Manager;

impl Manager {
    /// Build every pool. Keeps going after a pool fails and returns the
    /// first error.
    pub async fn build_pools(&self) -> ManagerResult<()> {
        let mut first_err = None;
        for name in self.registry.names() {
            if let Err(e) = self.build_pool(&name).await {
                warn!(pool = %name, error = %e, "failed to build pool");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Bring each variant of `pool` up to its minimum of free instances.
    ///
    /// Local runners create the missing VMs inline (bounded by `max_size`)
    /// and hibernate them in the background. Distributed runners enqueue
    /// `setup_instance` jobs, counting jobs already pending. Returns how
    /// many instances were created or enqueued.
    pub async fn build_pool(&self, pool: &str) -> ManagerResult<u32> {
        let entry = self.entry(pool)?;
        let instances = self.list(pool, &InstanceQuery::default()).await?;
        let pending_jobs = if self.is_distributed() {
            self.stores
                .outbox
                .list(pool, Some(OutboxJobType::SetupInstance))
                .await?
        } else {
            Vec::new()
        };

        let mut total = 0;
        for variant_id in entry.spec.variant_ids() {
            let target = entry.spec.min_size_for(&variant_id);
            if target == 0 {
                continue;
            }
            let free = instances
                .iter()
                .filter(|i| i.variant_id == variant_id && i.is_free())
                .count() as u32;
            let queued = pending_jobs
                .iter()
                .filter_map(|job| job.params::<SetupInstanceParams>().ok())
                .filter(|p| {
                    p.machine
                        .variant_id
                        .as_deref()
                        .unwrap_or(warmpool_core::DEFAULT_VARIANT_ID)
                        == variant_id
                })
                .count() as u32;
            let need = target.saturating_sub(free + queued);
            if need == 0 {
                debug!(%pool, variant = %variant_id, free, target, "variant at target");
                continue;
            }

            let machine = MachineConfig {
                variant_id: Some(variant_id.clone()),
                ..MachineConfig::default()
            };
            for _ in 0..need {
                if self.is_distributed() {
                    self.enqueue_setup(pool, &machine).await?;
                } else {
                    let Some(slot) = self.allocator.reserve_slot(&entry.spec).await? else {
                        warn!(%pool, max_size = entry.spec.max_size, "pool at max size, build stopped");
                        return Ok(total);
                    };
                    self.setup_with_slot(&entry, &machine, slot).await?;
                }
                total += 1;
            }
            info!(%pool, variant = %variant_id, added = need, target, "pool variant built");
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use warmpool_core::{RunnerMode, VariantSpec};
    use warmpool_drivers::FakeDriver;
    use warmpool_state::InstanceState;

    use super::*;
    use crate::testutil::*;

    #[tokio::test]
    async fn local_build_fills_every_variant() {
        let mut spec = pool_spec("linux", 2, 10);
        spec.variants.push(VariantSpec {
            variant_id: "large".to_string(),
            machine_type: "large".to_string(),
            min_size: 1,
            ..VariantSpec::default()
        });
        let h = &harness(RunnerMode::Local, vec![spec], FakeDriver::new().with_hibernate(false));

        h.manager.build_pools().await.unwrap();
        let rows = h.manager.list("linux", &InstanceQuery::default()).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|i| i.state == InstanceState::Created));
        let large: Vec<_> = rows.iter().filter(|i| i.variant_id == "large").collect();
        assert_eq!(large.len(), 1);
        assert_eq!(large[0].size, "large");

        // Already at target.
        assert_eq!(h.manager.build_pool("linux").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn local_build_stops_at_max_size() {
        let h = &harness(
            RunnerMode::Local,
            vec![pool_spec("linux", 5, 3)],
            FakeDriver::new().with_hibernate(false),
        );
        assert_eq!(h.manager.build_pool("linux").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn distributed_build_enqueues_missing_setups_once() {
        let h = &harness(
            RunnerMode::Distributed,
            vec![pool_spec("linux", 3, 10)],
            FakeDriver::new(),
        );
        assert_eq!(h.manager.build_pool("linux").await.unwrap(), 3);
        assert_eq!(h.manager.build_pool("linux").await.unwrap(), 0);

        let jobs = h
            .stores
            .outbox
            .list("linux", Some(OutboxJobType::SetupInstance))
            .await
            .unwrap();
        assert_eq!(jobs.len(), 3);
        let params: SetupInstanceParams = jobs[0].params().unwrap();
        assert_eq!(params.pool_name, "linux");
        assert_eq!(params.machine.variant_id.as_deref(), Some("default"));
    }
}
