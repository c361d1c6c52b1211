//! The narrow interface every cloud adapter implements.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use warmpool_core::{Platform, ResolvedMachine};
use warmpool_state::{CapacityReservation, Instance};

use crate::certs::TlsBundle;
use crate::error::DriverResult;

/// Everything a driver needs to create one VM.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub runner_name: String,
    pub pool_name: String,
    /// `{runner}-{pool}-{rand8}`.
    pub instance_name: String,
    pub platform: Platform,
    pub machine: ResolvedMachine,
    pub tls: TlsBundle,
    pub agent_port: u16,
    pub labels: BTreeMap<String, String>,
    /// Zone the caller insists on, if any.
    pub requested_zone: Option<String>,
    /// Capacity reserved for this stage by an earlier request.
    pub reservation: Option<CapacityReservation>,
}

/// Input for reserving capacity ahead of a create.
#[derive(Debug, Clone)]
pub struct ReserveCapacityOptions {
    pub stage_id: String,
    pub pool_name: String,
    pub machine: ResolvedMachine,
    pub requested_zone: Option<String>,
}

/// What to do with external disks when destroying an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageCleanup {
    /// Leave disks in place for a later attach.
    #[default]
    Detach,
    Delete,
}

/// An image reference to expand into the provider's canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageConfig {
    pub image: String,
    /// Provider project or account that owns the image.
    pub project: Option<String>,
}

/// A cloud adapter. Implementations wrap internally synchronized SDK
/// clients and hold no mutable `Instance` state.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Create a VM; the returned instance is in state `created`.
    async fn create(&self, opts: &CreateOptions) -> DriverResult<Instance>;

    async fn destroy(&self, instances: &[Instance]) -> DriverResult<()>;

    async fn destroy_instance_and_storage(
        &self,
        instances: &[Instance],
        cleanup: StorageCleanup,
    ) -> DriverResult<()>;

    async fn hibernate(&self, instance_id: &str, pool: &str, zone: &str) -> DriverResult<()>;

    /// Resume a hibernated VM and return its (possibly new) address.
    async fn start(&self, instance: &Instance, pool: &str) -> DriverResult<String>;

    async fn set_tags(
        &self,
        instance: &Instance,
        tags: &BTreeMap<String, String>,
    ) -> DriverResult<()>;

    async fn ping(&self) -> DriverResult<()>;

    /// Serial console output.
    async fn logs(&self, instance_id: &str) -> DriverResult<String>;

    /// Filesystem root on the guest.
    fn root_dir(&self) -> &Path;

    fn driver_name(&self) -> &str;

    fn can_hibernate(&self) -> bool;

    /// Reserve capacity in the first zone that has it.
    ///
    /// Fails with `CapacityUnavailable` when every zone refuses and with
    /// `CapacityReservationNotSupported` when the provider lacks the feature.
    async fn reserve_capacity(
        &self,
        opts: &ReserveCapacityOptions,
    ) -> DriverResult<CapacityReservation>;

    async fn destroy_capacity(&self, reservation: &CapacityReservation) -> DriverResult<()>;

    async fn get_fully_qualified_image(&self, config: &ImageConfig) -> DriverResult<String>;
}
