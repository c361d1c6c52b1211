//! Provisioning: warm claims, cold creates, and replenishment.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use warmpool_core::{MachineConfig, RETAIN_LABEL, ResolvedMachine, epoch_secs};
use warmpool_drivers::{CreateOptions, Driver, DriverError, generate_bundle};
use warmpool_metrics::names;
use warmpool_state::{
    CapacityReservation, Instance, InstancePatch, InstanceQuery, InstanceState, OutboxJob,
    SetupInstanceParams, StageOwner,
};

use crate::allocator::{Claim, ClaimRequest, CreateSlot};
use crate::error::{ManagerError, ManagerResult};
use crate::manager::Manager;
use crate::registry::PoolEntry;

/// How long a request waits for a VM another request is creating for the
/// same stage.
const STAGE_WAIT: Duration = Duration::from_secs(600);
const STAGE_POLL: Duration = Duration::from_millis(100);

/// A request for a VM.
#[derive(Debug, Clone, Default)]
pub struct ProvisionRequest {
    pub pool: String,
    pub owner_id: String,
    /// Stage runtime ID. A second request for a bound stage returns the
    /// same VM.
    pub stage: Option<String>,
    pub machine: MachineConfig,
    /// Extra filters a warm instance must satisfy.
    pub query: InstanceQuery,
    /// Capacity reserved earlier for this stage.
    pub reservation: Option<CapacityReservation>,
    /// Dedicated, long-lived VM (e.g. a gitspace): always created fresh and
    /// exempt from purging.
    pub retain: bool,
    pub labels: BTreeMap<String, String>,
    pub storage_identifier: Option<String>,
}

/// A provisioned VM and whether it came from the warm pool.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub instance: Instance,
    pub warmed: bool,
}

/// Inputs for one driver create.
#[derive(Debug, Clone)]
pub(crate) struct CreateParams {
    pub state: InstanceState,
    pub owner_id: String,
    pub stage: String,
    pub retain: bool,
    pub labels: BTreeMap<String, String>,
    pub requested_zone: Option<String>,
    pub reservation: Option<CapacityReservation>,
    pub storage_identifier: String,
}

impl CreateParams {
    /// A free VM for the warm pool.
    pub(crate) fn warm(machine: &MachineConfig) -> Self {
        Self {
            state: InstanceState::Created,
            owner_id: String::new(),
            stage: String::new(),
            retain: false,
            labels: BTreeMap::new(),
            requested_zone: machine.zone.clone(),
            reservation: None,
            storage_identifier: String::new(),
        }
    }
}

/// `{runner}-{pool}-{rand8}`.
pub(crate) fn instance_name(runner: &str, pool: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{runner}-{pool}-{suffix}")
}

/// Destroys a VM that was created but never persisted.
///
/// Armed right after the driver returns; disarmed once the row is stored.
/// Dropping it armed schedules a best-effort destroy.
struct LeakGuard {
    armed: Option<(Arc<dyn Driver>, Instance)>,
}

impl LeakGuard {
    fn new(driver: Arc<dyn Driver>, instance: Instance) -> Self {
        Self {
            armed: Some((driver, instance)),
        }
    }

    fn disarm(mut self) {
        self.armed = None;
    }

    async fn destroy_now(mut self) {
        if let Some((driver, instance)) = self.armed.take() {
            destroy_orphan(driver, instance).await;
        }
    }
}

impl Drop for LeakGuard {
    fn drop(&mut self) {
        let Some((driver, instance)) = self.armed.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(destroy_orphan(driver, instance));
            }
            Err(_) => {
                error!(instance = %instance.id, "instance leaked: no runtime to destroy it");
            }
        }
    }
}

async fn destroy_orphan(driver: Arc<dyn Driver>, instance: Instance) {
    match driver.destroy(std::slice::from_ref(&instance)).await {
        Ok(()) => info!(instance = %instance.id, pool = %instance.pool, "orphaned instance destroyed"),
        Err(e) => {
            error!(instance = %instance.id, pool = %instance.pool, error = %e, "failed to destroy orphaned instance")
        }
    }
}

/// Minimal row for a VM the driver reported as partially created.
fn partial_instance(id: &str, opts: &CreateOptions) -> Instance {
    let now = epoch_secs();
    Instance {
        id: id.to_string(),
        name: opts.instance_name.clone(),
        node_id: None,
        pool: opts.pool_name.clone(),
        provider: String::new(),
        zone: opts.requested_zone.clone().unwrap_or_default(),
        region: opts.machine.region.clone(),
        size: opts.machine.size.clone(),
        image: opts.machine.image.clone(),
        platform: opts.platform.clone(),
        variant_id: opts.machine.variant_id.clone(),
        address: String::new(),
        port: opts.agent_port,
        ca_cert: String::new(),
        ca_key: String::new(),
        tls_cert: String::new(),
        tls_key: String::new(),
        state: InstanceState::Terminating,
        is_hibernated: false,
        started: now,
        updated: now,
        owner_id: String::new(),
        stage: String::new(),
        runner_name: opts.runner_name.clone(),
        storage_identifier: String::new(),
        labels: opts.labels.clone(),
    }
}

impl Manager {
    /// Hand out a VM from `request.pool`.
    ///
    /// Prefers the oldest free instance; otherwise creates one synchronously.
    /// A warm claim triggers a background replacement.
    pub async fn provision(&self, request: ProvisionRequest) -> ManagerResult<Provisioned> {
        let entry = self.entry(&request.pool)?;
        if request.owner_id.is_empty() {
            return Err(ManagerError::BadRequest("owner id is required".to_string()));
        }
        let stage = request.stage.clone().unwrap_or_default();
        if stage.is_empty() {
            return self.provision_in(&entry, &request, &stage).await;
        }

        if let Some(existing) = self.bind_stage(&stage, &request.pool).await? {
            info!(pool = %request.pool, %stage, instance = %existing.id, "stage already provisioned");
            return Ok(Provisioned {
                instance: existing,
                warmed: true,
            });
        }
        let provisioned = self.provision_in(&entry, &request, &stage).await;
        if provisioned.is_err() {
            if let Err(e) = self.stores.stage_owners.delete(&stage).await {
                warn!(%stage, error = %e, "failed to release stage binding");
            }
        }
        provisioned
    }

    /// Claim or create a VM for a request whose stage, if any, is already
    /// bound to this caller.
    async fn provision_in(
        &self,
        entry: &Arc<PoolEntry>,
        request: &ProvisionRequest,
        stage: &str,
    ) -> ManagerResult<Provisioned> {
        let machine = entry.spec.resolve(&request.machine);
        let slot = if request.retain {
            self.allocator
                .reserve_slot(&entry.spec)
                .await?
                .ok_or_else(|| ManagerError::NoInstanceAvailable(request.pool.clone()))?
        } else {
            let claim = ClaimRequest {
                query: self.warm_query(request, &machine),
                owner_id: request.owner_id.clone(),
                stage: stage.to_string(),
                now: epoch_secs(),
            };
            match self.allocator.claim(&entry.spec, &claim).await? {
                Claim::Warm(instance) => {
                    return self.finish_warm_claim(entry, instance, request).await;
                }
                Claim::Create(slot) => slot,
                Claim::Exhausted => {
                    warn!(pool = %request.pool, max_size = entry.spec.max_size, "pool at capacity");
                    return Err(ManagerError::NoInstanceAvailable(request.pool.clone()));
                }
            }
        };

        let params = CreateParams {
            state: InstanceState::InUse,
            owner_id: request.owner_id.clone(),
            stage: stage.to_string(),
            retain: request.retain,
            labels: request.labels.clone(),
            requested_zone: request.machine.zone.clone(),
            reservation: request.reservation.clone(),
            storage_identifier: request.storage_identifier.clone().unwrap_or_default(),
        };
        let instance = self.create_instance(entry, &machine, params).await?;
        drop(slot);

        self.metrics
            .incr(names::COLD_CREATES, &request.pool, &instance.variant_id);
        info!(
            pool = %request.pool,
            instance = %instance.id,
            owner = %request.owner_id,
            %stage,
            "instance created for request"
        );
        Ok(Provisioned {
            instance,
            warmed: false,
        })
    }

    /// What a free instance must match to serve `request`.
    fn warm_query(&self, request: &ProvisionRequest, machine: &ResolvedMachine) -> InstanceQuery {
        let mut query = request.query.clone();
        query.variant_id.get_or_insert_with(|| machine.variant_id.clone());
        if request.machine.image.is_some() {
            query.image = Some(machine.image.clone());
        }
        if request.machine.machine_type.is_some() {
            query.size = Some(machine.size.clone());
        }
        if let Some(zone) = request.machine.zone.as_ref().filter(|z| !z.is_empty()) {
            query.zone = Some(zone.clone());
        }
        query.retain = Some(false);
        query
    }

    async fn finish_warm_claim(
        &self,
        entry: &Arc<PoolEntry>,
        mut instance: Instance,
        request: &ProvisionRequest,
    ) -> ManagerResult<Provisioned> {
        if instance.is_hibernated {
            match entry.driver.start(&instance, entry.name()).await {
                Ok(address) => {
                    let resumed = InstancePatch::at(epoch_secs())
                        .with_hibernated(false)
                        .with_address(&address);
                    instance = self
                        .allocator
                        .patch(entry.name(), &instance.id, &[InstanceState::InUse], &resumed)
                        .await?
                        .ok_or_else(|| ManagerError::InstanceNotFound(instance.id.clone()))?;
                }
                Err(e) => {
                    warn!(instance = %instance.id, error = %e, "failed to resume claimed instance");
                    let manager = self.clone();
                    let broken = instance.clone();
                    tokio::spawn(async move {
                        let pool = broken.pool.clone();
                        if let Err(e) = manager.destroy(&pool, &broken.id, Default::default()).await {
                            warn!(instance = %broken.id, error = %e, "failed to destroy unresumable instance");
                        }
                    });
                    return Err(ManagerError::driver("start", e));
                }
            }
        }

        if let Some(reservation) = request.reservation.clone() {
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.destroy_capacity(&reservation).await {
                    warn!(stage = %reservation.stage_id, error = %e, "failed to release unused reservation");
                }
            });
        }

        self.metrics
            .incr(names::WARM_CLAIMS, entry.name(), &instance.variant_id);
        self.replenish(entry, &instance.variant_id).await;

        info!(
            pool = %entry.name(),
            instance = %instance.id,
            owner = %instance.owner_id,
            stage = %instance.stage,
            "warm instance claimed"
        );
        Ok(Provisioned {
            instance,
            warmed: true,
        })
    }

    /// Bind `stage` to `pool` before any VM is claimed for it.
    ///
    /// Returns `None` when this caller now owns the binding. When another
    /// request holds it, waits for that request's VM and returns it; if that
    /// request fails and drops the binding, tries to take it over.
    async fn bind_stage(&self, stage: &str, pool: &str) -> ManagerResult<Option<Instance>> {
        let owner = StageOwner {
            stage_id: stage.to_string(),
            pool_name: pool.to_string(),
        };
        let deadline = Instant::now() + STAGE_WAIT;
        loop {
            if self.stores.stage_owners.create(&owner).await? {
                return Ok(None);
            }
            if let Some(bound) = self.stores.stage_owners.find(stage).await? {
                if let Some(existing) = self
                    .get_instance_by_stage_id(&bound.pool_name, stage)
                    .await?
                {
                    return Ok(Some(existing));
                }
            }
            if Instant::now() >= deadline {
                warn!(%stage, %pool, "stage bound but no instance appeared");
                return Err(ManagerError::StageBusy(stage.to_string()));
            }
            debug!(%stage, "stage being provisioned elsewhere, waiting");
            tokio::time::sleep(STAGE_POLL).await;
        }
    }

    /// Queue a replacement for a claimed instance. Best-effort.
    async fn replenish(&self, entry: &Arc<PoolEntry>, variant_id: &str) {
        let machine = MachineConfig {
            variant_id: Some(variant_id.to_string()),
            ..MachineConfig::default()
        };

        if self.is_distributed() {
            if let Err(e) = self.enqueue_setup(entry.name(), &machine).await {
                warn!(pool = %entry.name(), error = %e, "failed to enqueue replacement");
            }
            return;
        }

        let slot = match self.allocator.reserve_slot(&entry.spec).await {
            Ok(Some(slot)) => slot,
            Ok(None) => {
                debug!(pool = %entry.name(), "pool at max size, not replenishing");
                return;
            }
            Err(e) => {
                warn!(pool = %entry.name(), error = %e, "failed to reserve replacement slot");
                return;
            }
        };
        let manager = self.clone();
        let entry = entry.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.setup_with_slot(&entry, &machine, slot).await {
                warn!(pool = %entry.name(), error = %e, "failed to create replacement instance");
            }
        });
    }

    /// Persist a `setup_instance` job for any replica to pick up.
    pub async fn enqueue_setup(&self, pool: &str, machine: &MachineConfig) -> ManagerResult<i64> {
        let params = SetupInstanceParams {
            pool_name: pool.to_string(),
            machine: machine.clone(),
        };
        let job = OutboxJob::setup_instance(&params, epoch_secs())?;
        let id = self.stores.outbox.create(&job).await?;
        debug!(%pool, job = id, "setup_instance job enqueued");
        Ok(id)
    }

    /// Create one warm VM in `pool` and start its hibernation pipeline.
    pub async fn setup_instance(&self, pool: &str, machine: &MachineConfig) -> ManagerResult<Instance> {
        let entry = self.entry(pool)?;
        let slot = self
            .allocator
            .reserve_slot(&entry.spec)
            .await?
            .ok_or_else(|| ManagerError::NoInstanceAvailable(pool.to_string()))?;
        self.setup_with_slot(&entry, machine, slot).await
    }

    pub(crate) async fn setup_with_slot(
        &self,
        entry: &Arc<PoolEntry>,
        machine: &MachineConfig,
        slot: CreateSlot,
    ) -> ManagerResult<Instance> {
        let resolved = entry.spec.resolve(machine);
        let instance = self
            .create_instance(entry, &resolved, CreateParams::warm(machine))
            .await?;
        drop(slot);
        self.spawn_warm_up(entry.clone(), instance.clone());
        Ok(instance)
    }

    /// Create a VM through the driver and persist it.
    ///
    /// A VM the driver created but the store could not record is destroyed
    /// before returning.
    pub(crate) async fn create_instance(
        &self,
        entry: &PoolEntry,
        machine: &ResolvedMachine,
        params: CreateParams,
    ) -> ManagerResult<Instance> {
        let name = instance_name(&self.settings.runner_name, entry.name());
        let tls = generate_bundle(&name, &[]).map_err(|e| ManagerError::driver("provision", e))?;

        let mut labels = params.labels.clone();
        labels.insert(RETAIN_LABEL.to_string(), params.retain.to_string());

        let opts = CreateOptions {
            runner_name: self.settings.runner_name.clone(),
            pool_name: entry.name().to_string(),
            instance_name: name,
            platform: entry.spec.platform.clone(),
            machine: machine.clone(),
            tls,
            agent_port: self.settings.agent_port,
            labels,
            requested_zone: params.requested_zone.clone().filter(|z| !z.is_empty()),
            reservation: params.reservation.clone(),
        };

        let created = match entry.driver.create(&opts).await {
            Ok(instance) => instance,
            Err(e) => {
                self.metrics
                    .incr(names::CREATE_FAILURES, entry.name(), &machine.variant_id);
                if matches!(e, DriverError::CapacityUnavailable) {
                    self.metrics
                        .incr(names::CAPACITY_UNAVAILABLE, entry.name(), &machine.variant_id);
                }
                if let Some(id) = e.leaked_instance() {
                    warn!(pool = %entry.name(), instance = %id, "create left a partial instance behind");
                    tokio::spawn(destroy_orphan(entry.driver.clone(), partial_instance(id, &opts)));
                }
                error!(pool = %entry.name(), error = %e, "driver create failed");
                return Err(ManagerError::driver("provision", e));
            }
        };

        let guard = LeakGuard::new(entry.driver.clone(), created.clone());
        let mut instance = created;
        instance.state = params.state;
        instance.owner_id = params.owner_id;
        instance.stage = params.stage;
        instance.storage_identifier = params.storage_identifier;
        instance.runner_name = self.settings.runner_name.clone();
        instance.updated = epoch_secs();

        if let Err(e) = self.stores.instances.create(&instance).await {
            error!(instance = %instance.id, error = %e, "failed to persist new instance");
            guard.destroy_now().await;
            return Err(e.into());
        }
        guard.disarm();

        self.metrics
            .incr(names::INSTANCES_CREATED, entry.name(), &instance.variant_id);
        if let Some(reservation) = params.reservation {
            self.consume_reservation(reservation, &instance).await;
        }
        debug!(pool = %entry.name(), instance = %instance.id, state = %instance.state, "instance persisted");
        Ok(instance)
    }

    /// Record that `instance` used the reservation, or release it if the
    /// driver placed the VM elsewhere.
    async fn consume_reservation(&self, mut reservation: CapacityReservation, instance: &Instance) {
        if reservation.zone.is_empty() || reservation.zone == instance.zone {
            reservation.instance_id = instance.id.clone();
            reservation.machine_ip = instance.address.clone();
            if let Err(e) = self.stores.reservations.update(&reservation).await {
                warn!(stage = %reservation.stage_id, error = %e, "failed to mark reservation consumed");
            }
            return;
        }
        debug!(
            stage = %reservation.stage_id,
            reservation_zone = %reservation.zone,
            instance_zone = %instance.zone,
            "instance placed outside its reservation"
        );
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.destroy_capacity(&reservation).await {
                warn!(stage = %reservation.stage_id, error = %e, "failed to release unused reservation");
            }
        });
    }
}
