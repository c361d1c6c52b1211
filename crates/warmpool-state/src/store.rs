//! StateStore — redb-backed persistence for the local flavor.
//!
//! Every entity is JSON-serialized into redb's `&[u8]` value columns. redb
//! admits one write transaction at a time, so read-modify-write operations
//! (`find_and_claim`, `mark_for_purge`, `find_and_claim_pending`) run inside
//! a single write transaction and are atomic against each other.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use warmpool_core::epoch_secs;

use crate::error::{StateError, StateResult};
use crate::stores::*;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// How a keyed write treats an existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Insert,
    Update,
    Upsert,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(map_err!(Open))?;
        }
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(STAGE_OWNERS).map_err(map_err!(Table))?;
        txn.open_table(CAPACITY_RESERVATIONS).map_err(map_err!(Table))?;
        txn.open_table(OUTBOX_JOBS).map_err(map_err!(Table))?;
        txn.open_table(UTILIZATION_HISTORY).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic keyed access ───────────────────────────────────────

    fn write_json<T: Serialize>(
        &self,
        def: JsonTable,
        key: &str,
        value: &T,
        mode: WriteMode,
    ) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let exists = table.get(key).map_err(map_err!(Read))?.is_some();
            match mode {
                WriteMode::Insert if exists => {
                    return Err(StateError::AlreadyExists(key.to_string()));
                }
                WriteMode::Update if !exists => {
                    return Err(StateError::NotFound(key.to_string()));
                }
                _ => {}
            }
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, def: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        decode_all(&table)
    }

    fn list_seq<T: DeserializeOwned>(&self, def: SeqTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        decode_all(&table)
    }

    fn remove(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Delete sequence-keyed rows whose decoded value fails `keep`.
    fn remove_seq_where<T, F>(&self, def: SeqTable, keep: F) -> StateResult<u64>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let mut doomed = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let decoded: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if !keep(&decoded) {
                    doomed.push(key.value());
                }
            }
            for key in &doomed {
                table.remove(*key).map_err(map_err!(Write))?;
            }
            removed = doomed.len() as u64;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(removed)
    }

    // ── Instances ──────────────────────────────────────────────────

    fn claim_instance(
        &self,
        query: &InstanceQuery,
        new_state: InstanceState,
        allowed: &[InstanceState],
        update_start_time: bool,
    ) -> StateResult<Instance> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let claimed;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let candidate = decode_all::<_, Instance>(&table)?
                .into_iter()
                .filter(|i| allowed.contains(&i.state) && query.matches(i))
                .min_by(|a, b| a.claim_order().cmp(&b.claim_order()));
            let Some(mut instance) = candidate else {
                return Err(StateError::NoRows);
            };

            instance.state = new_state;
            instance.updated = now;
            if update_start_time {
                instance.started = now;
            }
            let bytes = serde_json::to_vec(&instance).map_err(map_err!(Serialize))?;
            table
                .insert(instance.id.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
            claimed = instance;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(instance = %claimed.id, state = %new_state, "instance claimed");
        Ok(claimed)
    }

    fn patch_instance(
        &self,
        id: &str,
        expected: &[InstanceState],
        patch: &InstancePatch,
    ) -> StateResult<Option<Instance>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let patched;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let existing = table
                .get(id)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let Some(bytes) = existing else {
                return Ok(None);
            };
            let mut instance: Instance =
                serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
            if !expected.is_empty() && !expected.contains(&instance.state) {
                return Ok(None);
            }
            patch.apply(&mut instance);
            let bytes = serde_json::to_vec(&instance).map_err(map_err!(Serialize))?;
            table.insert(id, bytes.as_slice()).map_err(map_err!(Write))?;
            patched = instance;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(Some(patched))
    }

    fn purge_instances(
        &self,
        pool: &str,
        criteria: &PurgeCriteria,
        now: i64,
    ) -> StateResult<Vec<Instance>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut marked = Vec::new();
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let selected: Vec<Instance> = decode_all::<_, Instance>(&table)?
                .into_iter()
                .filter(|i| i.pool == pool && criteria.selects(i))
                .collect();
            for mut instance in selected {
                instance.state = InstanceState::Terminating;
                instance.updated = now;
                let bytes = serde_json::to_vec(&instance).map_err(map_err!(Serialize))?;
                table
                    .insert(instance.id.as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
                marked.push(instance);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(marked)
    }

    // ── Outbox ─────────────────────────────────────────────────────

    fn claim_jobs(
        &self,
        runner_name: &str,
        job_types: &[OutboxJobType],
        batch_size: usize,
        retry_interval: Duration,
        now: i64,
    ) -> StateResult<Vec<OutboxJob>> {
        let retry_before = now - retry_interval.as_secs() as i64;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut claimed = Vec::new();
        {
            let mut table = txn.open_table(OUTBOX_JOBS).map_err(map_err!(Table))?;
            let eligible: Vec<OutboxJob> = decode_all::<_, OutboxJob>(&table)?
                .into_iter()
                .filter(|job| {
                    (job.runner_name.is_empty() || job.runner_name == runner_name)
                        && job.status == OutboxJobStatus::Pending
                        && job_types.contains(&job.job_type)
                        && job.processed_at.is_none_or(|p| p < retry_before)
                })
                .take(batch_size)
                .collect();
            for mut job in eligible {
                job.status = OutboxJobStatus::Running;
                job.retry_count += 1;
                job.processed_at = Some(now);
                let bytes = serde_json::to_vec(&job).map_err(map_err!(Serialize))?;
                table
                    .insert(job.id as u64, bytes.as_slice())
                    .map_err(map_err!(Write))?;
                claimed.push(job);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(claimed)
    }

    fn insert_seq<T: Serialize>(
        &self,
        def: SeqTable,
        sequence: &str,
        build: impl FnOnce(u64) -> T,
    ) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id = next_id(&txn, sequence)?;
        {
            let value = build(id);
            let bytes = serde_json::to_vec(&value).map_err(map_err!(Serialize))?;
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(id, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(id)
    }

    /// Insert `job`, refusing a second scale job for the same pool window.
    fn insert_job(&self, job: &OutboxJob) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id = {
            let mut table = txn.open_table(OUTBOX_JOBS).map_err(map_err!(Table))?;
            if job.job_type == OutboxJobType::Scale {
                let window = job.window_start();
                let taken = decode_all::<_, OutboxJob>(&table)?.into_iter().any(|other| {
                    other.job_type == OutboxJobType::Scale
                        && other.pool_name == job.pool_name
                        && other.window_start() == window
                });
                if taken {
                    return Err(StateError::AlreadyExists(format!(
                        "scale job for {} at {}",
                        job.pool_name,
                        window.unwrap_or_default()
                    )));
                }
            }
            let id = next_id(&txn, "outbox_jobs")?;
            let stored = OutboxJob {
                id: id as i64,
                ..job.clone()
            };
            let bytes = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(id, bytes.as_slice())
                .map_err(map_err!(Write))?;
            id
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(id)
    }

    fn modify_job(&self, id: i64, change: impl FnOnce(&mut OutboxJob)) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(OUTBOX_JOBS).map_err(map_err!(Table))?;
            let existing = table
                .get(id as u64)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let Some(bytes) = existing else {
                return Err(StateError::NotFound(format!("outbox job {id}")));
            };
            let mut job: OutboxJob =
                serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
            change(&mut job);
            let bytes = serde_json::to_vec(&job).map_err(map_err!(Serialize))?;
            table
                .insert(id as u64, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

/// Decode every value of a table.
fn decode_all<K, T>(table: &impl ReadableTable<K, &'static [u8]>) -> StateResult<Vec<T>>
where
    K: redb::Key + 'static,
    T: DeserializeOwned,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
    }
    Ok(results)
}

/// Issue the next ID of `sequence` inside `txn`.
fn next_id(txn: &WriteTransaction, sequence: &str) -> StateResult<u64> {
    let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
    let last = table
        .get(sequence)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = last + 1;
    table.insert(sequence, next).map_err(map_err!(Write))?;
    Ok(next)
}

#[async_trait]
impl InstanceStore for StateStore {
    async fn find(&self, id: &str) -> StateResult<Option<Instance>> {
        self.get_json(INSTANCES, id)
    }

    async fn find_by_name(&self, name: &str) -> StateResult<Option<Instance>> {
        Ok(self
            .list_json::<Instance>(INSTANCES)?
            .into_iter()
            .find(|i| i.name == name))
    }

    async fn list(&self, query: &InstanceQuery) -> StateResult<Vec<Instance>> {
        let mut instances: Vec<Instance> = self
            .list_json::<Instance>(INSTANCES)?
            .into_iter()
            .filter(|i| query.matches(i))
            .collect();
        instances.sort_by(|a, b| a.claim_order().cmp(&b.claim_order()));
        Ok(instances)
    }

    async fn create(&self, instance: &Instance) -> StateResult<()> {
        self.write_json(INSTANCES, &instance.id, instance, WriteMode::Insert)?;
        debug!(instance = %instance.id, pool = %instance.pool, "instance stored");
        Ok(())
    }

    async fn update(&self, instance: &Instance) -> StateResult<()> {
        self.write_json(INSTANCES, &instance.id, instance, WriteMode::Update)
    }

    async fn delete(&self, id: &str) -> StateResult<bool> {
        let existed = self.remove(INSTANCES, id)?;
        debug!(instance = %id, existed, "instance deleted");
        Ok(existed)
    }

    async fn find_and_claim(
        &self,
        query: &InstanceQuery,
        new_state: InstanceState,
        allowed: &[InstanceState],
        update_start_time: bool,
    ) -> StateResult<Instance> {
        self.claim_instance(query, new_state, allowed, update_start_time)
    }

    async fn patch(
        &self,
        id: &str,
        expected: &[InstanceState],
        patch: &InstancePatch,
    ) -> StateResult<Option<Instance>> {
        self.patch_instance(id, expected, patch)
    }

    async fn mark_for_purge(
        &self,
        pool: &str,
        criteria: &PurgeCriteria,
        now: i64,
    ) -> StateResult<Vec<Instance>> {
        self.purge_instances(pool, criteria, now)
    }

    async fn count_by_pool_and_variant(
        &self,
        state: InstanceState,
    ) -> StateResult<Vec<PoolVariantCount>> {
        let mut counts: BTreeMap<(String, String), u32> = BTreeMap::new();
        for instance in self.list_json::<Instance>(INSTANCES)? {
            if instance.state == state {
                *counts
                    .entry((instance.pool, instance.variant_id))
                    .or_default() += 1;
            }
        }
        Ok(counts
            .into_iter()
            .map(|((pool, variant_id), count)| PoolVariantCount {
                pool,
                variant_id,
                count,
            })
            .collect())
    }
}

#[async_trait]
impl StageOwnerStore for StateStore {
    async fn create(&self, owner: &StageOwner) -> StateResult<bool> {
        match self.write_json(STAGE_OWNERS, &owner.stage_id, owner, WriteMode::Insert) {
            Ok(()) => Ok(true),
            Err(StateError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn find(&self, stage_id: &str) -> StateResult<Option<StageOwner>> {
        self.get_json(STAGE_OWNERS, stage_id)
    }

    async fn delete(&self, stage_id: &str) -> StateResult<bool> {
        self.remove(STAGE_OWNERS, stage_id)
    }
}

#[async_trait]
impl CapacityReservationStore for StateStore {
    async fn create(&self, reservation: &CapacityReservation) -> StateResult<()> {
        self.write_json(
            CAPACITY_RESERVATIONS,
            &reservation.stage_id,
            reservation,
            WriteMode::Insert,
        )
    }

    async fn find(&self, stage_id: &str) -> StateResult<Option<CapacityReservation>> {
        self.get_json(CAPACITY_RESERVATIONS, stage_id)
    }

    async fn update(&self, reservation: &CapacityReservation) -> StateResult<()> {
        self.write_json(
            CAPACITY_RESERVATIONS,
            &reservation.stage_id,
            reservation,
            WriteMode::Upsert,
        )
    }

    async fn delete(&self, stage_id: &str) -> StateResult<bool> {
        self.remove(CAPACITY_RESERVATIONS, stage_id)
    }

    async fn list_unconsumed_older_than(
        &self,
        before: i64,
    ) -> StateResult<Vec<CapacityReservation>> {
        Ok(self
            .list_json::<CapacityReservation>(CAPACITY_RESERVATIONS)?
            .into_iter()
            .filter(|r| !r.is_consumed() && r.created_at < before)
            .collect())
    }
}

#[async_trait]
impl OutboxStore for StateStore {
    async fn create(&self, job: &OutboxJob) -> StateResult<i64> {
        let id = self.insert_job(job)?;
        debug!(job_id = id, pool = %job.pool_name, job_type = %job.job_type, "outbox job stored");
        Ok(id as i64)
    }

    async fn find_and_claim_pending(
        &self,
        runner_name: &str,
        job_types: &[OutboxJobType],
        batch_size: usize,
        retry_interval: Duration,
        now: i64,
    ) -> StateResult<Vec<OutboxJob>> {
        self.claim_jobs(runner_name, job_types, batch_size, retry_interval, now)
    }

    async fn release_with_error(&self, id: i64, error: &str) -> StateResult<()> {
        self.modify_job(id, |job| {
            job.status = OutboxJobStatus::Pending;
            job.error_message = Some(error.to_string());
        })
    }

    async fn delete(&self, id: i64) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(OUTBOX_JOBS).map_err(map_err!(Table))?;
            existed = table.remove(id as u64).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    async fn delete_older_than(&self, before: i64) -> StateResult<u64> {
        self.remove_seq_where(OUTBOX_JOBS, |job: &OutboxJob| job.created_at >= before)
    }

    async fn find_scale_job_for_window(
        &self,
        pool: &str,
        window_start: i64,
    ) -> StateResult<Option<OutboxJob>> {
        Ok(self
            .list_seq::<OutboxJob>(OUTBOX_JOBS)?
            .into_iter()
            .find(|job| {
                job.job_type == OutboxJobType::Scale
                    && job.pool_name == pool
                    && job.window_start() == Some(window_start)
            }))
    }

    async fn list(&self, pool: &str, job_type: Option<OutboxJobType>) -> StateResult<Vec<OutboxJob>> {
        Ok(self
            .list_seq::<OutboxJob>(OUTBOX_JOBS)?
            .into_iter()
            .filter(|job| job.pool_name == pool && job_type.is_none_or(|t| t == job.job_type))
            .collect())
    }
}

#[async_trait]
impl UtilizationHistoryStore for StateStore {
    async fn create(&self, record: &UtilizationRecord) -> StateResult<()> {
        self.insert_seq(UTILIZATION_HISTORY, "instance_utilization_history", |_| {
            record.clone()
        })?;
        Ok(())
    }

    async fn range(
        &self,
        pool: &str,
        variant_id: &str,
        start: i64,
        end: i64,
    ) -> StateResult<Vec<UtilizationRecord>> {
        let mut records: Vec<UtilizationRecord> = self
            .list_seq::<UtilizationRecord>(UTILIZATION_HISTORY)?
            .into_iter()
            .filter(|r| {
                r.pool_name == pool
                    && r.variant_id == variant_id
                    && (start..=end).contains(&r.recorded_at)
            })
            .collect();
        records.sort_by_key(|r| r.recorded_at);
        Ok(records)
    }

    async fn delete_older_than(&self, before: i64) -> StateResult<u64> {
        self.remove_seq_where(UTILIZATION_HISTORY, |r: &UtilizationRecord| {
            r.recorded_at >= before
        })
    }
}
