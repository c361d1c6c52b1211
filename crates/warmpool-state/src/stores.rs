//! Narrow store interfaces that mediate all persistence.
//!
//! The pool manager, the outbox engine, the scheduler and the predictor only
//! see these traits. `StateStore` (redb) backs the local flavor and `PgStore`
//! (PostgreSQL) backs the distributed flavor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StateResult;
use crate::types::*;

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn find(&self, id: &str) -> StateResult<Option<Instance>>;

    async fn find_by_name(&self, name: &str) -> StateResult<Option<Instance>>;

    /// Matching instances ordered by `started` ascending, then ID.
    async fn list(&self, query: &InstanceQuery) -> StateResult<Vec<Instance>>;

    /// Fails with `AlreadyExists` if the ID is taken.
    async fn create(&self, instance: &Instance) -> StateResult<()>;

    /// Fails with `NotFound` if the row is gone.
    async fn update(&self, instance: &Instance) -> StateResult<()>;

    /// Returns whether a row was removed.
    async fn delete(&self, id: &str) -> StateResult<bool>;

    /// Atomically pick the oldest row matching `query` whose state is in
    /// `allowed`, move it to `new_state` and return it.
    ///
    /// No two concurrent callers receive the same row. Returns
    /// `StateError::NoRows` when nothing matches.
    async fn find_and_claim(
        &self,
        query: &InstanceQuery,
        new_state: InstanceState,
        allowed: &[InstanceState],
        update_start_time: bool,
    ) -> StateResult<Instance>;

    /// Apply `patch` to row `id` if its state is in `expected` (any state
    /// when `expected` is empty). Returns the updated row, or `None` when
    /// the row is gone or in another state.
    async fn patch(
        &self,
        id: &str,
        expected: &[InstanceState],
        patch: &InstancePatch,
    ) -> StateResult<Option<Instance>>;

    /// Flip every row of `pool` selected by `criteria` to `terminating`
    /// (stamping `updated = now`) and return the flipped rows.
    async fn mark_for_purge(
        &self,
        pool: &str,
        criteria: &PurgeCriteria,
        now: i64,
    ) -> StateResult<Vec<Instance>>;

    /// Per (pool, variant) counts of instances in `state`.
    async fn count_by_pool_and_variant(
        &self,
        state: InstanceState,
    ) -> StateResult<Vec<PoolVariantCount>>;
}

#[async_trait]
pub trait StageOwnerStore: Send + Sync {
    /// Returns false if the stage was already bound.
    async fn create(&self, owner: &StageOwner) -> StateResult<bool>;

    async fn find(&self, stage_id: &str) -> StateResult<Option<StageOwner>>;

    async fn delete(&self, stage_id: &str) -> StateResult<bool>;
}

#[async_trait]
pub trait CapacityReservationStore: Send + Sync {
    /// Fails with `AlreadyExists` if the stage already holds a reservation.
    async fn create(&self, reservation: &CapacityReservation) -> StateResult<()>;

    async fn find(&self, stage_id: &str) -> StateResult<Option<CapacityReservation>>;

    async fn update(&self, reservation: &CapacityReservation) -> StateResult<()>;

    async fn delete(&self, stage_id: &str) -> StateResult<bool>;

    /// Reservations never consumed by a create and older than `before`.
    async fn list_unconsumed_older_than(
        &self,
        before: i64,
    ) -> StateResult<Vec<CapacityReservation>>;
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persist a job and return its assigned ID.
    async fn create(&self, job: &OutboxJob) -> StateResult<i64>;

    /// Claim up to `batch_size` pending jobs for `runner_name`.
    ///
    /// Eligible rows are global (`runner_name = ""`) or pinned to this
    /// runner, have a type in `job_types`, and were never processed or last
    /// processed more than `retry_interval` ago. Claimed rows move to
    /// `running` with `retry_count + 1` and `processed_at = now`.
    async fn find_and_claim_pending(
        &self,
        runner_name: &str,
        job_types: &[OutboxJobType],
        batch_size: usize,
        retry_interval: Duration,
        now: i64,
    ) -> StateResult<Vec<OutboxJob>>;

    /// Return a running job to `pending` with the failure text.
    async fn release_with_error(&self, id: i64, error: &str) -> StateResult<()>;

    async fn delete(&self, id: i64) -> StateResult<bool>;

    /// Delete every job created before `before`, whatever its status.
    async fn delete_older_than(&self, before: i64) -> StateResult<u64>;

    /// Any scale job for `(pool, window_start)`, pending or running.
    async fn find_scale_job_for_window(
        &self,
        pool: &str,
        window_start: i64,
    ) -> StateResult<Option<OutboxJob>>;

    /// Jobs of `pool`, optionally restricted to one type, ordered by ID.
    async fn list(&self, pool: &str, job_type: Option<OutboxJobType>) -> StateResult<Vec<OutboxJob>>;
}

#[async_trait]
pub trait UtilizationHistoryStore: Send + Sync {
    async fn create(&self, record: &UtilizationRecord) -> StateResult<()>;

    /// Records in `[start, end]` ordered by `recorded_at` ascending.
    async fn range(
        &self,
        pool: &str,
        variant_id: &str,
        start: i64,
        end: i64,
    ) -> StateResult<Vec<UtilizationRecord>>;

    async fn delete_older_than(&self, before: i64) -> StateResult<u64>;
}

/// One handle per store interface, shared across tasks.
#[derive(Clone)]
pub struct Stores {
    pub instances: Arc<dyn InstanceStore>,
    pub stage_owners: Arc<dyn StageOwnerStore>,
    pub reservations: Arc<dyn CapacityReservationStore>,
    pub outbox: Arc<dyn OutboxStore>,
    pub utilization: Arc<dyn UtilizationHistoryStore>,
}

impl Stores {
    /// Serve every interface from a single backend.
    pub fn from_backend<B>(backend: B) -> Self
    where
        B: InstanceStore
            + StageOwnerStore
            + CapacityReservationStore
            + OutboxStore
            + UtilizationHistoryStore
            + 'static,
    {
        let backend = Arc::new(backend);
        Self {
            instances: backend.clone(),
            stage_owners: backend.clone(),
            reservations: backend.clone(),
            outbox: backend.clone(),
            utilization: backend,
        }
    }
}
