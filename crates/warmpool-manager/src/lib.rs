//! warmpool-manager — owns every VM in every configured pool.
//!
//! The [`Manager`] hands out VMs from warm pools, creates them on demand,
//! hibernates idle ones, tears them down, purges aged ones, and reserves
//! cloud capacity ahead of provisioning.
//!
//! # Architecture
//!
//! ```text
//! provision ──► Allocator::claim ──► Warm(instance) ─► resume, bind stage, replenish
//!                     │
//!                     ├──► Create(slot) ─► driver create ─► persist (LeakGuard)
//!                     └──► Exhausted    ─► NoInstanceAvailable
//!
//! setup_instance ─► create `created` ─► warm_up: wait_healthy ─► hibernate (retries)
//! purger ─► mark_for_purge ─► driver destroy ─► delete rows ─► build_pool
//! ```
//!
//! Local runners serialize each pool through an in-process lock and enforce
//! `max_size`. Distributed runners claim through the store's atomic
//! `find_and_claim` and hand background creates to the outbox.

pub mod allocator;
pub mod build;
pub mod capacity;
pub mod destroy;
pub mod error;
pub mod hibernate;
pub mod manager;
pub mod provision;
pub mod purger;
pub mod registry;

#[cfg(test)]
pub(crate) mod testutil;

pub use allocator::{Allocator, Claim, ClaimRequest, CreateSlot, DistributedAllocator, LocalAllocator};
pub use capacity::CapacityOutcome;
pub use error::{ErrorClass, ManagerError, ManagerResult};
pub use manager::{Manager, ManagerSettings, PoolCounts, PoolInfo};
pub use provision::{ProvisionRequest, Provisioned};
pub use purger::{PurgeReport, PurgerSettings, TTL_MAX_AGE};
pub use registry::{PoolEntry, PoolRegistry};
pub use warmpool_drivers::StorageCleanup;
