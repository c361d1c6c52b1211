//! The warm-up pipeline, hibernation, resume, and suspend.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use warmpool_agent::wait_healthy;
use warmpool_core::epoch_secs;
use warmpool_drivers::{DriverError, StorageCleanup};
use warmpool_metrics::names;
use warmpool_state::{Instance, InstancePatch, InstanceQuery, InstanceState};

use crate::error::{ManagerError, ManagerResult};
use crate::manager::Manager;
use crate::registry::PoolEntry;

impl Manager {
    pub(crate) fn spawn_warm_up(&self, entry: Arc<PoolEntry>, instance: Instance) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.warm_up(&entry, instance).await {
                warn!(pool = %entry.name(), error = %e, "warm-up pipeline failed");
            }
        })
    }

    /// Drive a fresh free VM to a hibernated warm instance.
    ///
    /// Waits for the agent; a VM that never answers is destroyed. Drivers
    /// without hibernate leave the VM running.
    pub async fn warm_up(&self, entry: &PoolEntry, instance: Instance) -> ManagerResult<()> {
        let deadline = self.settings.connectivity_deadline;
        if let Err(e) = wait_healthy(self.agent.as_ref(), &instance, deadline).await {
            warn!(
                pool = %entry.name(),
                instance = %instance.id,
                error = %e,
                "agent unreachable, destroying instance"
            );
            let unreachable = self
                .allocator
                .transition(
                    entry.name(),
                    &InstanceQuery::default().with_instance(&instance.id),
                    InstanceState::Terminating,
                    &[InstanceState::Created],
                    epoch_secs(),
                )
                .await?;
            if let Some(row) = unreachable {
                self.destroy_instances(entry, vec![row], StorageCleanup::Delete)
                    .await?;
            }
            return Err(e.into());
        }

        if !entry.driver.can_hibernate() {
            debug!(pool = %entry.name(), instance = %instance.id, "driver cannot hibernate, keeping instance running");
            return Ok(());
        }
        self.hibernate(entry.name(), &instance.id).await
    }

    /// Hibernate a free instance, retrying with linear backoff.
    ///
    /// The instance is `hibernating` while the driver works, so it cannot be
    /// claimed. It returns to `created` either way; `is_hibernated` records
    /// the outcome. An instance that was claimed first is left alone.
    pub async fn hibernate(&self, pool: &str, instance_id: &str) -> ManagerResult<()> {
        let entry = self.entry(pool)?;
        let Some(instance) = self
            .allocator
            .transition(
                pool,
                &InstanceQuery::default().with_instance(instance_id),
                InstanceState::Hibernating,
                &[InstanceState::Created],
                epoch_secs(),
            )
            .await?
        else {
            debug!(%pool, instance = %instance_id, "instance no longer free, skipping hibernate");
            return Ok(());
        };

        let result = if instance.is_hibernated {
            Ok(())
        } else {
            self.hibernate_with_retries(&entry, &instance).await
        };

        let settled = InstancePatch::at(epoch_secs()).with_state(InstanceState::Created);
        match result {
            Ok(()) => {
                // The purger may have taken the row while the driver worked.
                let hibernated = settled.with_hibernated(true);
                if self
                    .allocator
                    .patch(pool, instance_id, &[InstanceState::Hibernating], &hibernated)
                    .await?
                    .is_none()
                {
                    debug!(instance = %instance_id, "instance changed hands during hibernate");
                    return Ok(());
                }
                self.metrics
                    .incr(names::HIBERNATIONS, pool, &instance.variant_id);
                info!(%pool, instance = %instance_id, "instance hibernated");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                self.stores.instances.delete(instance_id).await?;
                self.metrics
                    .incr(names::HIBERNATE_FAILURES, pool, &instance.variant_id);
                warn!(%pool, instance = %instance_id, "instance vanished before hibernate, row removed");
                Err(ManagerError::driver("hibernate", e))
            }
            Err(e) => {
                let running = settled.with_hibernated(false);
                self.allocator
                    .patch(pool, instance_id, &[InstanceState::Hibernating], &running)
                    .await?;
                self.metrics
                    .incr(names::HIBERNATE_FAILURES, pool, &instance.variant_id);
                warn!(%pool, instance = %instance_id, error = %e, "hibernate gave up, instance stays running");
                Err(ManagerError::driver("hibernate", e))
            }
        }
    }

    /// One driver hibernate, bounded by the attempt timeout.
    async fn hibernate_once(&self, entry: &PoolEntry, instance: &Instance) -> Result<(), DriverError> {
        let limit = self.settings.hibernate_attempt_timeout;
        let call = entry
            .driver
            .hibernate(&instance.id, entry.name(), &instance.zone);
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Transient(format!(
                "hibernate timed out after {}s",
                limit.as_secs()
            ))),
        }
    }

    async fn hibernate_with_retries(
        &self,
        entry: &PoolEntry,
        instance: &Instance,
    ) -> Result<(), DriverError> {
        let retries = self.settings.hibernate_retries;
        let mut attempt = 0;
        loop {
            match self.hibernate_once(entry, instance).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_found() || attempt >= retries => return Err(e),
                Err(e) => {
                    attempt += 1;
                    let wait = self.settings.hibernate_backoff_step * attempt;
                    warn!(
                        instance = %instance.id,
                        attempt,
                        ?wait,
                        error = %e,
                        "hibernate failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Resume a hibernated VM. `started` is left untouched.
    ///
    /// A suspended retained instance goes back to its owner as `inuse`.
    pub async fn start_instance(&self, pool: &str, instance_id: &str) -> ManagerResult<Instance> {
        let entry = self.entry(pool)?;
        let instance = self.find(instance_id).await?;
        if !instance.is_hibernated {
            return Ok(instance);
        }
        let address = entry
            .driver
            .start(&instance, pool)
            .await
            .map_err(|e| ManagerError::driver("start", e))?;

        let mut patch = InstancePatch::at(epoch_secs())
            .with_hibernated(false)
            .with_address(&address);
        if instance.is_retained() && !instance.owner_id.is_empty() {
            patch.state = Some(InstanceState::InUse);
        }
        let resumed = self
            .allocator
            .patch(
                pool,
                instance_id,
                &[InstanceState::Created, InstanceState::InUse],
                &patch,
            )
            .await?
            .ok_or_else(|| ManagerError::InstanceNotFound(instance_id.to_string()))?;
        info!(%pool, instance = %instance_id, address = %resumed.address, "instance resumed");
        Ok(resumed)
    }

    /// Quiesce the guest, then hibernate the VM (or mark it stopped when
    /// the driver cannot hibernate).
    ///
    /// Only free instances and retained ones may be suspended; a hibernated
    /// instance is always `created`.
    pub async fn suspend(&self, pool: &str, instance_id: &str) -> ManagerResult<Instance> {
        let entry = self.entry(pool)?;
        let instance = self.find(instance_id).await?;
        let allowed = if instance.is_retained() {
            vec![InstanceState::Created, InstanceState::InUse]
        } else {
            vec![InstanceState::Created]
        };
        if !allowed.contains(&instance.state) {
            return Err(ManagerError::BadRequest(format!(
                "instance {instance_id} is {} and cannot be suspended",
                instance.state
            )));
        }
        self.agent.suspend(&instance).await?;

        let patch = if entry.driver.can_hibernate() {
            self.hibernate_once(&entry, &instance)
                .await
                .map_err(|e| ManagerError::driver("hibernate", e))?;
            InstancePatch::at(epoch_secs())
                .with_state(InstanceState::Created)
                .with_hibernated(true)
        } else {
            InstancePatch::at(epoch_secs()).with_state(InstanceState::Stopped)
        };
        let suspended = self
            .allocator
            .patch(pool, instance_id, &allowed, &patch)
            .await?
            .ok_or_else(|| ManagerError::InstanceNotFound(instance_id.to_string()))?;
        info!(%pool, instance = %instance_id, hibernated = suspended.is_hibernated, "instance suspended");
        Ok(suspended)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use tokio::time::Instant;
    use warmpool_core::{MachineConfig, RunnerMode};
    use warmpool_drivers::{FakeDriver, FakeOp};

    use super::*;
    use crate::provision::CreateParams;
    use crate::testutil::*;

    async fn free_instance(h: &Harness) -> Instance {
        let entry = h.manager.entry("linux").unwrap();
        let machine = entry.spec.resolve(&MachineConfig::default());
        h.manager
            .create_instance(&entry, &machine, CreateParams::warm(&MachineConfig::default()))
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn hibernate_retries_with_linear_backoff() {
        let h = &harness(RunnerMode::Local, vec![pool_spec("linux", 1, 5)], FakeDriver::new());
        let instance = free_instance(h).await;
        h.driver
            .fail_times(FakeOp::Hibernate, DriverError::Transient("busy".into()), 2)
            .await;

        let started = Instant::now();
        h.manager.hibernate("linux", &instance.id).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(90));
        assert_eq!(h.driver.calls(FakeOp::Hibernate).await, 3);

        let stored = h.manager.find(&instance.id).await.unwrap();
        assert_eq!(stored.state, InstanceState::Created);
        assert!(stored.is_hibernated);
        assert!(h.driver.is_hibernated(&instance.id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn hibernate_gives_up_after_retries() {
        let h = &harness(RunnerMode::Local, vec![pool_spec("linux", 1, 5)], FakeDriver::new());
        let instance = free_instance(h).await;
        h.driver
            .fail_times(FakeOp::Hibernate, DriverError::Transient("busy".into()), 4)
            .await;

        let started = Instant::now();
        let err = h.manager.hibernate("linux", &instance.id).await.unwrap_err();
        assert!(matches!(err, ManagerError::Driver { op: "hibernate", .. }));
        assert!(started.elapsed() >= Duration::from_secs(180));
        assert_eq!(h.driver.calls(FakeOp::Hibernate).await, 4);

        let stored = h.manager.find(&instance.id).await.unwrap();
        assert_eq!(stored.state, InstanceState::Created);
        assert!(!stored.is_hibernated);
        assert_eq!(
            h.manager
                .metrics()
                .counter(names::HIBERNATE_FAILURES, "linux", "default"),
            1
        );
    }

    #[tokio::test]
    async fn hibernate_not_found_stops_retrying() {
        let h = &harness(RunnerMode::Local, vec![pool_spec("linux", 1, 5)], FakeDriver::new());
        let instance = free_instance(h).await;
        h.driver
            .fail_next(FakeOp::Hibernate, DriverError::NotFound(instance.id.clone()))
            .await;

        assert!(h.manager.hibernate("linux", &instance.id).await.is_err());
        assert_eq!(h.driver.calls(FakeOp::Hibernate).await, 1);
        assert!(h.stores.instances.find(&instance.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claimed_instance_is_not_hibernated() {
        let h = &harness(RunnerMode::Local, vec![pool_spec("linux", 1, 5)], FakeDriver::new());
        let mut instance = free_instance(h).await;
        instance.state = InstanceState::InUse;
        h.stores.instances.update(&instance).await.unwrap();

        h.manager.hibernate("linux", &instance.id).await.unwrap();
        assert_eq!(h.driver.calls(FakeOp::Hibernate).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_agent_destroys_instance() {
        let h = &harness(RunnerMode::Local, vec![pool_spec("linux", 1, 5)], FakeDriver::new());
        h.agent.healthy.store(false, Ordering::SeqCst);
        let instance = free_instance(h).await;
        let entry = h.manager.entry("linux").unwrap();

        let err = h.manager.warm_up(&entry, instance.clone()).await.unwrap_err();
        assert!(matches!(err, ManagerError::Agent(_)));
        assert!(!h.driver.is_live(&instance.id).await);
        assert!(h.stores.instances.find(&instance.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn start_and_suspend_round_trip() {
        let h = &harness(RunnerMode::Local, vec![pool_spec("linux", 1, 5)], FakeDriver::new());
        let instance = free_instance(h).await;
        h.manager.hibernate("linux", &instance.id).await.unwrap();
        let started_at = h.manager.find(&instance.id).await.unwrap().started;

        let resumed = h.manager.start_instance("linux", &instance.id).await.unwrap();
        assert!(!resumed.is_hibernated);
        assert_eq!(resumed.started, started_at);
        assert_ne!(resumed.address, instance.address);

        let suspended = h.manager.suspend("linux", &instance.id).await.unwrap();
        assert!(suspended.is_hibernated);
        assert_eq!(h.agent.suspends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn suspend_without_hibernate_stops() {
        let h = &harness(
            RunnerMode::Local,
            vec![pool_spec("linux", 1, 5)],
            FakeDriver::new().with_hibernate(false),
        );
        let instance = free_instance(h).await;
        let suspended = h.manager.suspend("linux", &instance.id).await.unwrap();
        assert_eq!(suspended.state, InstanceState::Stopped);
        assert!(!suspended.is_hibernated);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_hibernate_attempts_time_out() {
        let h = &harness(
            RunnerMode::Local,
            vec![pool_spec("linux", 1, 5)],
            FakeDriver::new().with_delay(FakeOp::Hibernate, Duration::from_secs(3600)),
        );
        let instance = free_instance(h).await;

        let started = Instant::now();
        let err = h.manager.hibernate("linux", &instance.id).await.unwrap_err();
        assert!(matches!(err, ManagerError::Driver { op: "hibernate", .. }));
        assert_eq!(h.driver.calls(FakeOp::Hibernate).await, 4);
        // Four 90s attempts plus 30s, 60s and 90s of backoff.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(540));
        assert!(elapsed < Duration::from_secs(3600));

        let stored = h.manager.find(&instance.id).await.unwrap();
        assert_eq!(stored.state, InstanceState::Created);
        assert!(!stored.is_hibernated);
    }

    #[tokio::test]
    async fn busy_pool_instance_cannot_be_suspended() {
        let h = &harness(RunnerMode::Local, vec![pool_spec("linux", 0, 5)], FakeDriver::new());
        let busy = h
            .manager
            .provision(crate::provision::ProvisionRequest {
                pool: "linux".to_string(),
                owner_id: "build-1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
            .instance;

        let err = h.manager.suspend("linux", &busy.id).await.unwrap_err();
        assert!(matches!(err, ManagerError::BadRequest(_)));
        assert_eq!(h.driver.calls(FakeOp::Hibernate).await, 0);
        assert_eq!(h.agent.suspends.load(Ordering::SeqCst), 0);

        let stored = h.manager.find(&busy.id).await.unwrap();
        assert_eq!(stored.state, InstanceState::InUse);
        assert!(!stored.is_hibernated);
    }

    #[tokio::test]
    async fn suspended_retained_instance_is_created_until_resumed() {
        let h = &harness(RunnerMode::Local, vec![pool_spec("linux", 0, 5)], FakeDriver::new());
        let gitspace = h
            .manager
            .provision(crate::provision::ProvisionRequest {
                pool: "linux".to_string(),
                owner_id: "gitspace-1".to_string(),
                retain: true,
                ..Default::default()
            })
            .await
            .unwrap()
            .instance;

        let suspended = h.manager.suspend("linux", &gitspace.id).await.unwrap();
        assert!(suspended.is_hibernated);
        assert_eq!(suspended.state, InstanceState::Created);
        assert_eq!(suspended.owner_id, "gitspace-1");
        assert!(h.driver.is_hibernated(&gitspace.id).await);

        let resumed = h.manager.start_instance("linux", &gitspace.id).await.unwrap();
        assert!(!resumed.is_hibernated);
        assert_eq!(resumed.state, InstanceState::InUse);
        assert_eq!(resumed.owner_id, "gitspace-1");
    }

    #[tokio::test]
    async fn resume_does_not_revert_a_concurrent_claim() {
        let h = &harness(
            RunnerMode::Local,
            vec![pool_spec("linux", 0, 5)],
            FakeDriver::new().with_delay(FakeOp::Start, Duration::from_millis(200)),
        );
        let instance = free_instance(h).await;
        h.manager.hibernate("linux", &instance.id).await.unwrap();

        let manager = h.manager.clone();
        let id = instance.id.clone();
        let resume = tokio::spawn(async move { manager.start_instance("linux", &id).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A claim lands while the driver is still resuming the VM.
        let claimed = h
            .manager
            .allocator
            .patch(
                "linux",
                &instance.id,
                &[InstanceState::Created],
                &InstancePatch {
                    state: Some(InstanceState::InUse),
                    owner_id: Some("build-1".to_string()),
                    ..InstancePatch::at(epoch_secs())
                },
            )
            .await
            .unwrap();
        assert!(claimed.is_some());

        let resumed = resume.await.unwrap().unwrap();
        assert_eq!(resumed.state, InstanceState::InUse);
        assert_eq!(resumed.owner_id, "build-1");
        assert!(!resumed.is_hibernated);

        let stored = h.manager.find(&instance.id).await.unwrap();
        assert_eq!(stored, resumed);
        assert_ne!(stored.address, instance.address);
    }
}
