//! Destroy paths: single instances, stages, whole pools, and reservations.

use tracing::{debug, error, info, warn};
use warmpool_core::epoch_secs;
use warmpool_drivers::StorageCleanup;
use warmpool_metrics::names;
use warmpool_state::{CapacityReservation, Instance, InstanceQuery, InstanceState};

use crate::error::{ManagerError, ManagerResult};
use crate::manager::Manager;
use crate::registry::PoolEntry;

const LIVE_STATES: [InstanceState; 4] = [
    InstanceState::Created,
    InstanceState::InUse,
    InstanceState::Hibernating,
    InstanceState::Stopped,
];

impl Manager {
    /// Destroy one instance. A missing or already terminating instance is
    /// not an error; terminating rows belong to whoever marked them.
    pub async fn destroy(
        &self,
        pool: &str,
        instance_id: &str,
        cleanup: StorageCleanup,
    ) -> ManagerResult<()> {
        let entry = self.entry(pool)?;
        let Some(instance) = self
            .allocator
            .transition(
                pool,
                &InstanceQuery::default().with_instance(instance_id),
                InstanceState::Terminating,
                &LIVE_STATES,
                epoch_secs(),
            )
            .await?
        else {
            debug!(%pool, instance = %instance_id, "nothing to destroy");
            return Ok(());
        };
        self.destroy_instances(&entry, vec![instance], cleanup)
            .await
            .map(|_| ())
    }

    /// Tear down rows already marked `terminating`.
    ///
    /// Rows are deleted only after the driver succeeds; on failure they stay
    /// `terminating` for the purger to retry.
    pub(crate) async fn destroy_instances(
        &self,
        entry: &PoolEntry,
        instances: Vec<Instance>,
        cleanup: StorageCleanup,
    ) -> ManagerResult<usize> {
        if instances.is_empty() {
            return Ok(0);
        }
        match entry
            .driver
            .destroy_instance_and_storage(&instances, cleanup)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(pool = %entry.name(), error = %e, "instances already gone");
            }
            Err(e) => {
                error!(
                    pool = %entry.name(),
                    count = instances.len(),
                    error = %e,
                    "driver destroy failed, rows left terminating"
                );
                return Err(ManagerError::driver("destroy", e));
            }
        }

        for instance in &instances {
            self.stores.instances.delete(&instance.id).await?;
            if !instance.stage.is_empty() {
                self.stores.stage_owners.delete(&instance.stage).await?;
            }
            self.metrics
                .incr(names::INSTANCES_DESTROYED, entry.name(), &instance.variant_id);
            info!(pool = %entry.name(), instance = %instance.id, "instance destroyed");
        }
        Ok(instances.len())
    }

    /// Destroy whatever VM serves `stage_id` and release its reservation.
    pub async fn destroy_by_stage(
        &self,
        stage_id: &str,
        cleanup: StorageCleanup,
    ) -> ManagerResult<()> {
        if let Some(owner) = self.stores.stage_owners.find(stage_id).await? {
            match self
                .get_instance_by_stage_id(&owner.pool_name, stage_id)
                .await?
            {
                Some(instance) => {
                    self.destroy(&owner.pool_name, &instance.id, cleanup)
                        .await?
                }
                None => {
                    self.stores.stage_owners.delete(stage_id).await?;
                }
            }
        } else {
            debug!(stage = %stage_id, "no instance bound to stage");
        }

        if let Some(reservation) = self.stores.reservations.find(stage_id).await? {
            self.destroy_capacity(&reservation).await?;
        }
        Ok(())
    }

    /// Destroy unretained instances in every pool.
    ///
    /// Keeps going after a pool fails and returns the first error.
    pub async fn clean_pools(&self, destroy_busy: bool, destroy_free: bool) -> ManagerResult<()> {
        let mut allowed = Vec::new();
        if destroy_busy {
            allowed.push(InstanceState::InUse);
        }
        if destroy_free {
            allowed.extend(InstanceState::FREE);
        }
        if allowed.is_empty() {
            return Ok(());
        }

        let mut first_err = None;
        for entry in self.registry.entries() {
            let mut marked = Vec::new();
            loop {
                match self
                    .allocator
                    .transition(
                        entry.name(),
                        &InstanceQuery::default().with_retain(false),
                        InstanceState::Terminating,
                        &allowed,
                        epoch_secs(),
                    )
                    .await
                {
                    Ok(Some(instance)) => marked.push(instance),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(pool = %entry.name(), error = %e, "failed to mark instances for cleanup");
                        first_err.get_or_insert(e);
                        break;
                    }
                }
            }

            match self
                .destroy_instances(entry, marked, StorageCleanup::Delete)
                .await
            {
                Ok(0) => {}
                Ok(count) => info!(pool = %entry.name(), count, "pool cleaned"),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Destroy up to `count` free, unretained instances of one variant.
    ///
    /// Stops early when no free instance is left; returns how many went.
    pub async fn scale_down(&self, pool: &str, variant_id: &str, count: u32) -> ManagerResult<usize> {
        let entry = self.entry(pool)?;
        let query = InstanceQuery::default()
            .with_variant(variant_id)
            .with_retain(false);
        let mut marked = Vec::new();
        for _ in 0..count {
            match self
                .allocator
                .transition(
                    pool,
                    &query,
                    InstanceState::Terminating,
                    &InstanceState::FREE,
                    epoch_secs(),
                )
                .await?
            {
                Some(instance) => marked.push(instance),
                None => break,
            }
        }
        let destroyed = self
            .destroy_instances(&entry, marked, StorageCleanup::Delete)
            .await?;
        if destroyed > 0 {
            info!(%pool, variant = %variant_id, destroyed, "pool scaled down");
        }
        Ok(destroyed)
    }

    /// Release reserved capacity. A reservation already gone is fine.
    pub async fn destroy_capacity(&self, reservation: &CapacityReservation) -> ManagerResult<()> {
        let entry = self.entry(&reservation.pool_name)?;
        match entry.driver.destroy_capacity(reservation).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(reservation = %reservation.reservation_id, "reservation already released");
            }
            Err(e) => return Err(ManagerError::driver("destroy capacity", e)),
        }
        self.stores.reservations.delete(&reservation.stage_id).await?;
        info!(
            stage = %reservation.stage_id,
            reservation = %reservation.reservation_id,
            "capacity released"
        );
        Ok(())
    }
}
