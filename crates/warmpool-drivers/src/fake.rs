//! In-memory driver.
//!
//! Behaves like a cloud with a handful of zones: VMs get fresh IDs and
//! addresses, hibernate/resume flips a flag, and capacity reservations are
//! tracked per zone. Failures can be scripted per operation, and every call
//! is counted, so the manager and outbox can be exercised without a cloud.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use warmpool_core::epoch_secs;
use warmpool_state::{CapacityReservation, Instance, InstanceState};

use crate::driver::*;
use crate::error::{DriverError, DriverResult};

/// Driver tag for [`FakeDriver`].
pub const FAKE_DRIVER: &str = "fake";

/// Label recording which reservation a VM was created into.
pub const RESERVATION_LABEL: &str = "reservation";

/// Operations whose calls are counted and whose failures can be scripted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Create,
    Destroy,
    Hibernate,
    Start,
    SetTags,
    Ping,
    Logs,
    ReserveCapacity,
    DestroyCapacity,
}

#[derive(Default)]
struct FakeState {
    instances: BTreeMap<String, Instance>,
    /// Keyed by reservation ID.
    reservations: BTreeMap<String, CapacityReservation>,
    failures: HashMap<FakeOp, VecDeque<DriverError>>,
    calls: HashMap<FakeOp, usize>,
    exhausted_zones: BTreeSet<String>,
    next_host: u32,
}

impl FakeState {
    /// Count the call and pop a scripted failure, if any.
    fn enter(&mut self, op: FakeOp) -> DriverResult<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => {
                debug!(?op, error = %err, "fake driver returning scripted failure");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn next_address(&mut self) -> String {
        self.next_host += 1;
        format!("10.0.{}.{}", self.next_host / 250, self.next_host % 250 + 2)
    }
}

/// A scriptable driver that keeps its "cloud" in memory.
pub struct FakeDriver {
    zones: Vec<String>,
    can_hibernate: bool,
    supports_reservations: bool,
    delays: HashMap<FakeOp, Duration>,
    root_dir: PathBuf,
    state: Mutex<FakeState>,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            zones: vec!["fake-zone-a".to_string(), "fake-zone-b".to_string()],
            can_hibernate: true,
            supports_reservations: true,
            delays: HashMap::new(),
            root_dir: PathBuf::from("/"),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn with_zones(mut self, zones: &[&str]) -> Self {
        self.zones = zones.iter().map(|z| z.to_string()).collect();
        self
    }

    pub fn with_hibernate(mut self, can_hibernate: bool) -> Self {
        self.can_hibernate = can_hibernate;
        self
    }

    pub fn with_reservations(mut self, supported: bool) -> Self {
        self.supports_reservations = supported;
        self
    }

    /// Simulated cloud latency for `create`.
    pub fn with_create_delay(self, delay: Duration) -> Self {
        self.with_delay(FakeOp::Create, delay)
    }

    /// Simulated cloud latency for `op`, spent before the call takes effect.
    pub fn with_delay(mut self, op: FakeOp, delay: Duration) -> Self {
        self.delays.insert(op, delay);
        self
    }

    async fn latency(&self, op: FakeOp) {
        if let Some(delay) = self.delays.get(&op).filter(|d| !d.is_zero()) {
            tokio::time::sleep(*delay).await;
        }
    }

    pub fn with_root_dir(mut self, root: impl Into<PathBuf>) -> Self {
        self.root_dir = root.into();
        self
    }

    /// Make the next call of `op` fail with `err`.
    pub async fn fail_next(&self, op: FakeOp, err: DriverError) {
        self.fail_times(op, err, 1).await;
    }

    /// Make the next `times` calls of `op` fail with `err`.
    pub async fn fail_times(&self, op: FakeOp, err: DriverError, times: usize) {
        let mut state = self.state.lock().await;
        let queue = state.failures.entry(op).or_default();
        queue.extend(std::iter::repeat_n(err, times));
    }

    pub async fn calls(&self, op: FakeOp) -> usize {
        self.state.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// VMs that currently exist in the fake cloud.
    pub async fn live_instances(&self) -> Vec<Instance> {
        self.state.lock().await.instances.values().cloned().collect()
    }

    pub async fn is_live(&self, instance_id: &str) -> bool {
        self.state.lock().await.instances.contains_key(instance_id)
    }

    /// Whether the fake cloud considers the VM hibernated.
    pub async fn is_hibernated(&self, instance_id: &str) -> bool {
        self.state
            .lock()
            .await
            .instances
            .get(instance_id)
            .is_some_and(|i| i.is_hibernated)
    }

    /// Refuse capacity in `zone` from now on.
    pub async fn exhaust_zone(&self, zone: &str) {
        self.state
            .lock()
            .await
            .exhausted_zones
            .insert(zone.to_string());
    }

    pub async fn reservations(&self) -> Vec<CapacityReservation> {
        self.state.lock().await.reservations.values().cloned().collect()
    }

    /// Pick the zone for a create, honouring a still-valid reservation.
    fn placement(
        &self,
        state: &FakeState,
        opts: &CreateOptions,
    ) -> (String, Option<CapacityReservation>) {
        if let Some(reservation) = &opts.reservation {
            match state.reservations.get(&reservation.reservation_id) {
                None => {
                    warn!(
                        reservation = %reservation.reservation_id,
                        "reservation no longer exists, creating without it"
                    );
                }
                Some(r) if opts.requested_zone.as_deref().is_some_and(|z| z != r.zone) => {
                    warn!(
                        reservation = %r.reservation_id,
                        reservation_zone = %r.zone,
                        requested_zone = ?opts.requested_zone,
                        "reservation zone conflicts with requested zone, discarding reservation"
                    );
                }
                Some(r) => return (r.zone.clone(), Some(r.clone())),
            }
        }

        if let Some(zone) = &opts.requested_zone {
            return (zone.clone(), None);
        }
        let candidates = if opts.machine.zones.is_empty() {
            &self.zones
        } else {
            &opts.machine.zones
        };
        let zone = candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_default();
        (zone, None)
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn create(&self, opts: &CreateOptions) -> DriverResult<Instance> {
        self.state.lock().await.enter(FakeOp::Create)?;
        self.latency(FakeOp::Create).await;

        let mut state = self.state.lock().await;
        let (zone, reservation) = self.placement(&state, opts);
        let now = epoch_secs();
        let id = format!("fake-{:08x}", rand::thread_rng().r#gen::<u32>());

        let mut labels = opts.labels.clone();
        if let Some(r) = &reservation {
            labels.insert(RESERVATION_LABEL.to_string(), r.reservation_id.clone());
        }

        let instance = Instance {
            id: id.clone(),
            name: opts.instance_name.clone(),
            node_id: None,
            pool: opts.pool_name.clone(),
            provider: FAKE_DRIVER.to_string(),
            zone,
            region: opts.machine.region.clone(),
            size: opts.machine.size.clone(),
            image: opts.machine.image.clone(),
            platform: opts.platform.clone(),
            variant_id: opts.machine.variant_id.clone(),
            address: state.next_address(),
            port: opts.agent_port,
            ca_cert: opts.tls.ca_cert.clone(),
            ca_key: opts.tls.ca_key.clone(),
            tls_cert: opts.tls.tls_cert.clone(),
            tls_key: opts.tls.tls_key.clone(),
            state: InstanceState::Created,
            is_hibernated: false,
            started: now,
            updated: now,
            owner_id: String::new(),
            stage: String::new(),
            runner_name: opts.runner_name.clone(),
            storage_identifier: String::new(),
            labels,
        };
        state.instances.insert(id.clone(), instance.clone());
        info!(instance = %id, pool = %opts.pool_name, zone = %instance.zone, "fake instance created");
        Ok(instance)
    }

    async fn destroy(&self, instances: &[Instance]) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        state.enter(FakeOp::Destroy)?;
        for instance in instances {
            if state.instances.remove(&instance.id).is_some() {
                debug!(instance = %instance.id, "fake instance destroyed");
            }
        }
        Ok(())
    }

    async fn destroy_instance_and_storage(
        &self,
        instances: &[Instance],
        cleanup: StorageCleanup,
    ) -> DriverResult<()> {
        debug!(count = instances.len(), ?cleanup, "fake destroy with storage");
        self.destroy(instances).await
    }

    async fn hibernate(&self, instance_id: &str, pool: &str, _zone: &str) -> DriverResult<()> {
        self.state.lock().await.enter(FakeOp::Hibernate)?;
        self.latency(FakeOp::Hibernate).await;
        let mut state = self.state.lock().await;
        if !self.can_hibernate {
            return Err(DriverError::BadRequest(format!(
                "{FAKE_DRIVER} driver cannot hibernate"
            )));
        }
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| DriverError::NotFound(instance_id.to_string()))?;
        instance.is_hibernated = true;
        debug!(instance = %instance_id, %pool, "fake instance hibernated");
        Ok(())
    }

    async fn start(&self, instance: &Instance, pool: &str) -> DriverResult<String> {
        self.state.lock().await.enter(FakeOp::Start)?;
        self.latency(FakeOp::Start).await;
        let mut state = self.state.lock().await;
        if !state.instances.contains_key(&instance.id) {
            return Err(DriverError::NotFound(instance.id.clone()));
        }
        let address = state.next_address();
        if let Some(live) = state.instances.get_mut(&instance.id) {
            live.is_hibernated = false;
            live.address = address.clone();
        }
        debug!(instance = %instance.id, %pool, %address, "fake instance started");
        Ok(address)
    }

    async fn set_tags(
        &self,
        instance: &Instance,
        tags: &BTreeMap<String, String>,
    ) -> DriverResult<()> {
        self.state.lock().await.enter(FakeOp::SetTags)?;
        self.latency(FakeOp::SetTags).await;
        let mut state = self.state.lock().await;
        let live = state
            .instances
            .get_mut(&instance.id)
            .ok_or_else(|| DriverError::NotFound(instance.id.clone()))?;
        live.labels
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn ping(&self) -> DriverResult<()> {
        self.state.lock().await.enter(FakeOp::Ping)
    }

    async fn logs(&self, instance_id: &str) -> DriverResult<String> {
        let mut state = self.state.lock().await;
        state.enter(FakeOp::Logs)?;
        let instance = state
            .instances
            .get(instance_id)
            .ok_or_else(|| DriverError::NotFound(instance_id.to_string()))?;
        Ok(format!(
            "[fake console] {} booted in {} at {}\n",
            instance.name, instance.zone, instance.address
        ))
    }

    fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn driver_name(&self) -> &str {
        FAKE_DRIVER
    }

    fn can_hibernate(&self) -> bool {
        self.can_hibernate
    }

    async fn reserve_capacity(
        &self,
        opts: &ReserveCapacityOptions,
    ) -> DriverResult<CapacityReservation> {
        let mut state = self.state.lock().await;
        state.enter(FakeOp::ReserveCapacity)?;
        if !self.supports_reservations {
            return Err(DriverError::CapacityReservationNotSupported(
                FAKE_DRIVER.to_string(),
            ));
        }

        let mut zones: Vec<String> = match &opts.requested_zone {
            Some(zone) => vec![zone.clone()],
            None if !opts.machine.zones.is_empty() => opts.machine.zones.clone(),
            None => self.zones.clone(),
        };
        if opts.requested_zone.is_none() {
            zones.shuffle(&mut rand::thread_rng());
        }

        for zone in zones {
            if state.exhausted_zones.contains(&zone) {
                debug!(%zone, stage = %opts.stage_id, "fake zone has no capacity");
                continue;
            }
            let reservation = CapacityReservation {
                stage_id: opts.stage_id.clone(),
                pool_name: opts.pool_name.clone(),
                instance_id: String::new(),
                reservation_id: format!("res-{:08x}", rand::thread_rng().r#gen::<u32>()),
                zone,
                machine_ip: String::new(),
                created_at: epoch_secs(),
            };
            state
                .reservations
                .insert(reservation.reservation_id.clone(), reservation.clone());
            info!(
                stage = %opts.stage_id,
                reservation = %reservation.reservation_id,
                zone = %reservation.zone,
                "fake capacity reserved"
            );
            return Ok(reservation);
        }
        Err(DriverError::CapacityUnavailable)
    }

    async fn destroy_capacity(&self, reservation: &CapacityReservation) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        state.enter(FakeOp::DestroyCapacity)?;
        state.reservations.remove(&reservation.reservation_id);
        Ok(())
    }

    async fn get_fully_qualified_image(&self, config: &ImageConfig) -> DriverResult<String> {
        if config.image.is_empty() {
            return Err(DriverError::BadRequest("image name is empty".to_string()));
        }
        if config.image.contains('/') {
            return Ok(config.image.clone());
        }
        let project = config.project.as_deref().unwrap_or(FAKE_DRIVER);
        Ok(format!("projects/{project}/global/images/{}", config.image))
    }
}

#[cfg(test)]
mod tests {
    use warmpool_core::{DEFAULT_VARIANT_ID, Platform, ResolvedMachine};

    use super::*;
    use crate::certs::TlsBundle;

    fn machine() -> ResolvedMachine {
        ResolvedMachine {
            variant_id: DEFAULT_VARIANT_ID.to_string(),
            image: "ubuntu".to_string(),
            size: "small".to_string(),
            region: "fake-region".to_string(),
            zones: Vec::new(),
            disk_size: 0,
            disk_type: String::new(),
            nested_virtualization: false,
        }
    }

    fn create_opts(name: &str) -> CreateOptions {
        CreateOptions {
            runner_name: "runner".to_string(),
            pool_name: "pool".to_string(),
            instance_name: name.to_string(),
            platform: Platform {
                os: "linux".to_string(),
                arch: "amd64".to_string(),
                ..Platform::default()
            },
            machine: machine(),
            tls: TlsBundle::default(),
            agent_port: 9079,
            labels: BTreeMap::new(),
            requested_zone: None,
            reservation: None,
        }
    }

    fn reserve_opts(zone: Option<&str>) -> ReserveCapacityOptions {
        ReserveCapacityOptions {
            stage_id: "stage-1".to_string(),
            pool_name: "pool".to_string(),
            machine: machine(),
            requested_zone: zone.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn create_hibernate_start_destroy() {
        let driver = FakeDriver::new();
        let inst = driver.create(&create_opts("vm-1")).await.unwrap();
        assert_eq!(inst.state, InstanceState::Created);
        assert_eq!(inst.provider, FAKE_DRIVER);
        assert!(driver.is_live(&inst.id).await);

        driver.hibernate(&inst.id, "pool", &inst.zone).await.unwrap();
        assert!(driver.is_hibernated(&inst.id).await);

        let address = driver.start(&inst, "pool").await.unwrap();
        assert_ne!(address, inst.address);
        assert!(!driver.is_hibernated(&inst.id).await);

        driver.destroy(std::slice::from_ref(&inst)).await.unwrap();
        assert!(!driver.is_live(&inst.id).await);
        // Destroying a gone VM is not an error.
        driver.destroy(&[inst]).await.unwrap();
        assert_eq!(driver.calls(FakeOp::Destroy).await, 2);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let driver = FakeDriver::new();
        driver
            .fail_times(FakeOp::Create, DriverError::Transient("quota".to_string()), 2)
            .await;

        assert!(driver.create(&create_opts("a")).await.is_err());
        assert!(driver.create(&create_opts("b")).await.is_err());
        assert!(driver.create(&create_opts("c")).await.is_ok());
        assert_eq!(driver.calls(FakeOp::Create).await, 3);
        assert_eq!(driver.live_instances().await.len(), 1);
    }

    #[tokio::test]
    async fn requested_zone_wins_over_candidates() {
        let driver = FakeDriver::new();
        let mut opts = create_opts("vm");
        opts.requested_zone = Some("fake-zone-b".to_string());
        let inst = driver.create(&opts).await.unwrap();
        assert_eq!(inst.zone, "fake-zone-b");
    }

    #[tokio::test]
    async fn reservation_skips_exhausted_zones() {
        let driver = FakeDriver::new();
        driver.exhaust_zone("fake-zone-a").await;
        let reservation = driver.reserve_capacity(&reserve_opts(None)).await.unwrap();
        assert_eq!(reservation.zone, "fake-zone-b");

        driver.exhaust_zone("fake-zone-b").await;
        let err = driver.reserve_capacity(&reserve_opts(None)).await.unwrap_err();
        assert!(matches!(err, DriverError::CapacityUnavailable));
    }

    #[tokio::test]
    async fn reservation_not_supported() {
        let driver = FakeDriver::new().with_reservations(false);
        let err = driver.reserve_capacity(&reserve_opts(None)).await.unwrap_err();
        assert!(matches!(err, DriverError::CapacityReservationNotSupported(_)));
    }

    #[tokio::test]
    async fn create_consumes_reservation_zone() {
        let driver = FakeDriver::new();
        let reservation = driver
            .reserve_capacity(&reserve_opts(Some("fake-zone-b")))
            .await
            .unwrap();

        let mut opts = create_opts("vm");
        opts.reservation = Some(reservation.clone());
        let inst = driver.create(&opts).await.unwrap();
        assert_eq!(inst.zone, "fake-zone-b");
        assert_eq!(
            inst.labels.get(RESERVATION_LABEL),
            Some(&reservation.reservation_id)
        );
    }

    #[tokio::test]
    async fn conflicting_zone_discards_reservation() {
        let driver = FakeDriver::new();
        let reservation = driver
            .reserve_capacity(&reserve_opts(Some("fake-zone-b")))
            .await
            .unwrap();

        let mut opts = create_opts("vm");
        opts.reservation = Some(reservation);
        opts.requested_zone = Some("fake-zone-a".to_string());
        let inst = driver.create(&opts).await.unwrap();
        assert_eq!(inst.zone, "fake-zone-a");
        assert!(!inst.labels.contains_key(RESERVATION_LABEL));
    }

    #[tokio::test]
    async fn hibernate_unsupported_is_rejected() {
        let driver = FakeDriver::new().with_hibernate(false);
        let inst = driver.create(&create_opts("vm")).await.unwrap();
        assert!(!driver.can_hibernate());
        assert!(driver.hibernate(&inst.id, "pool", "").await.is_err());
    }

    #[tokio::test]
    async fn image_and_logs() {
        let driver = FakeDriver::new();
        let image = driver
            .get_fully_qualified_image(&ImageConfig {
                image: "ubuntu-2204".to_string(),
                project: Some("images".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(image, "projects/images/global/images/ubuntu-2204");

        let inst = driver.create(&create_opts("vm-logs")).await.unwrap();
        assert!(driver.logs(&inst.id).await.unwrap().contains("vm-logs"));
        assert!(driver.logs("missing").await.unwrap_err().is_not_found());
    }
}
