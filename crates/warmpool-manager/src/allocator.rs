//! Claim and release of pool instances.
//!
//! Every path that moves an instance between states goes through an
//! [`Allocator`]. [`LocalAllocator`] serializes each pool behind an
//! in-process mutex and enforces `max_size`; [`DistributedAllocator`] relies
//! on the store's atomic `find_and_claim` so many replicas can share a pool.
//!
//! Locks are only held across store calls. Driver work happens after the
//! lock is released, with a [`CreateSlot`] standing in for the VM that is
//! still being created.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use warmpool_core::PoolSpec;
use warmpool_state::{Instance, InstancePatch, InstanceQuery, InstanceState, InstanceStore};

use crate::error::{ManagerError, ManagerResult};

/// Who is taking a warm instance.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Filter over the pool's free instances; the pool is filled in by the
    /// allocator.
    pub query: InstanceQuery,
    pub owner_id: String,
    pub stage: String,
    pub now: i64,
}

/// Outcome of [`Allocator::claim`].
#[derive(Debug)]
pub enum Claim {
    /// A free instance, already `inuse` and persisted.
    Warm(Instance),
    /// Nothing free, but the caller may create one while holding the slot.
    Create(CreateSlot),
    /// Nothing free and the pool is at `max_size`.
    Exhausted,
}

/// Counts a create in flight toward the pool size until dropped.
#[derive(Debug)]
pub struct CreateSlot {
    pending: Option<Arc<AtomicU32>>,
}

impl CreateSlot {
    /// A slot that counts against nothing.
    pub fn unbounded() -> Self {
        Self { pending: None }
    }

    fn counted(pending: Arc<AtomicU32>) -> Self {
        pending.fetch_add(1, Ordering::SeqCst);
        Self {
            pending: Some(pending),
        }
    }
}

impl Drop for CreateSlot {
    fn drop(&mut self) {
        if let Some(pending) = &self.pending {
            pending.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// The fields a claim writes onto a free instance.
fn claim_patch(instance: &Instance, request: &ClaimRequest) -> InstancePatch {
    InstancePatch {
        state: Some(InstanceState::InUse),
        owner_id: Some(request.owner_id.clone()),
        stage: Some(request.stage.clone()),
        started: instance.is_hibernated.then_some(request.now),
        ..InstancePatch::at(request.now)
    }
}

fn pool_query(pool: &str, query: &InstanceQuery) -> InstanceQuery {
    let mut query = query.clone();
    query.pool = Some(pool.to_string());
    query
}

#[async_trait]
pub trait Allocator: Send + Sync {
    /// Take the oldest free instance of `pool` matching the request.
    async fn claim(&self, pool: &PoolSpec, request: &ClaimRequest) -> ManagerResult<Claim>;

    /// Move the oldest instance of `pool` matching `query` whose state is in
    /// `allowed` to `new_state`. `None` when nothing qualifies.
    async fn transition(
        &self,
        pool: &str,
        query: &InstanceQuery,
        new_state: InstanceState,
        allowed: &[InstanceState],
        now: i64,
    ) -> ManagerResult<Option<Instance>>;

    /// Apply `patch` to one instance of `pool` if its state is in
    /// `expected` (any state when empty). `None` when the row is gone or
    /// has moved on.
    async fn patch(
        &self,
        pool: &str,
        instance_id: &str,
        expected: &[InstanceState],
        patch: &InstancePatch,
    ) -> ManagerResult<Option<Instance>>;

    /// Room for one more instance in `pool`, if the pool allows it.
    async fn reserve_slot(&self, pool: &PoolSpec) -> ManagerResult<Option<CreateSlot>>;
}

/// Per-pool lock and creates in flight.
#[derive(Default)]
struct PoolGuard {
    lock: Mutex<()>,
    pending: Arc<AtomicU32>,
}

/// Single-replica allocator.
pub struct LocalAllocator {
    store: Arc<dyn InstanceStore>,
    pools: Mutex<HashMap<String, Arc<PoolGuard>>>,
}

impl LocalAllocator {
    pub fn new(store: Arc<dyn InstanceStore>) -> Self {
        Self {
            store,
            pools: Mutex::new(HashMap::new()),
        }
    }

    async fn guard(&self, pool: &str) -> Arc<PoolGuard> {
        self.pools
            .lock()
            .await
            .entry(pool.to_string())
            .or_default()
            .clone()
    }

    /// Whether `pool` can take one more instance. Caller holds the pool lock.
    fn has_room(pool: &PoolSpec, guard: &PoolGuard, instances: &[Instance]) -> bool {
        let live = instances
            .iter()
            .filter(|i| i.state != InstanceState::Terminating)
            .count() as u32;
        let pending = guard.pending.load(Ordering::SeqCst);
        live + pending < pool.max_size
    }

    /// Creates currently in flight for `pool`.
    pub async fn pending(&self, pool: &str) -> u32 {
        self.guard(pool).await.pending.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Allocator for LocalAllocator {
    async fn claim(&self, pool: &PoolSpec, request: &ClaimRequest) -> ManagerResult<Claim> {
        let guard = self.guard(&pool.name).await;
        let _held = guard.lock.lock().await;

        let instances = self.store.list(&InstanceQuery::pool(&pool.name)).await?;
        let query = pool_query(&pool.name, &request.query);

        // `list` is ordered oldest first.
        if let Some(free) = instances
            .iter()
            .find(|i| i.state == InstanceState::Created && query.matches(i))
        {
            let mut instance = free.clone();
            claim_patch(free, request).apply(&mut instance);
            self.store.update(&instance).await?;
            debug!(pool = %pool.name, instance = %instance.id, "claimed free instance");
            return Ok(Claim::Warm(instance));
        }

        if Self::has_room(pool, &guard, &instances) {
            Ok(Claim::Create(CreateSlot::counted(guard.pending.clone())))
        } else {
            debug!(pool = %pool.name, max_size = pool.max_size, "pool exhausted");
            Ok(Claim::Exhausted)
        }
    }

    async fn transition(
        &self,
        pool: &str,
        query: &InstanceQuery,
        new_state: InstanceState,
        allowed: &[InstanceState],
        now: i64,
    ) -> ManagerResult<Option<Instance>> {
        let guard = self.guard(pool).await;
        let _held = guard.lock.lock().await;

        let query = pool_query(pool, query);
        let candidate = self
            .store
            .list(&query)
            .await?
            .into_iter()
            .find(|i| allowed.contains(&i.state));
        let Some(mut instance) = candidate else {
            return Ok(None);
        };
        instance.state = new_state;
        instance.updated = now;
        self.store.update(&instance).await?;
        Ok(Some(instance))
    }

    async fn patch(
        &self,
        pool: &str,
        instance_id: &str,
        expected: &[InstanceState],
        patch: &InstancePatch,
    ) -> ManagerResult<Option<Instance>> {
        let guard = self.guard(pool).await;
        let _held = guard.lock.lock().await;
        Ok(self.store.patch(instance_id, expected, patch).await?)
    }

    async fn reserve_slot(&self, pool: &PoolSpec) -> ManagerResult<Option<CreateSlot>> {
        let guard = self.guard(&pool.name).await;
        let _held = guard.lock.lock().await;

        let instances = self.store.list(&InstanceQuery::pool(&pool.name)).await?;
        if Self::has_room(pool, &guard, &instances) {
            Ok(Some(CreateSlot::counted(guard.pending.clone())))
        } else {
            Ok(None)
        }
    }
}

/// Multi-replica allocator over the store's atomic claim.
///
/// `max_size` is not enforced across replicas.
pub struct DistributedAllocator {
    store: Arc<dyn InstanceStore>,
}

impl DistributedAllocator {
    pub fn new(store: Arc<dyn InstanceStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Allocator for DistributedAllocator {
    async fn claim(&self, pool: &PoolSpec, request: &ClaimRequest) -> ManagerResult<Claim> {
        let query = pool_query(&pool.name, &request.query);
        let claimed = match self
            .store
            .find_and_claim(
                &query,
                InstanceState::InUse,
                &[InstanceState::Created],
                false,
            )
            .await
        {
            Ok(instance) => instance,
            Err(e) if e.is_no_rows() => return Ok(Claim::Create(CreateSlot::unbounded())),
            Err(e) => return Err(e.into()),
        };
        // The row is already `inuse`, so no other replica touches it.
        let patch = claim_patch(&claimed, request);
        let instance = self
            .store
            .patch(&claimed.id, &[InstanceState::InUse], &patch)
            .await?
            .ok_or_else(|| ManagerError::InstanceNotFound(claimed.id.clone()))?;
        debug!(pool = %pool.name, instance = %instance.id, "claimed free instance");
        Ok(Claim::Warm(instance))
    }

    async fn transition(
        &self,
        pool: &str,
        query: &InstanceQuery,
        new_state: InstanceState,
        allowed: &[InstanceState],
        now: i64,
    ) -> ManagerResult<Option<Instance>> {
        let query = pool_query(pool, query);
        match self
            .store
            .find_and_claim(&query, new_state, allowed, false)
            .await
        {
            Ok(instance) if instance.updated == now => Ok(Some(instance)),
            Ok(instance) => Ok(self
                .store
                .patch(&instance.id, &[new_state], &InstancePatch::at(now))
                .await?),
            Err(e) if e.is_no_rows() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch(
        &self,
        _pool: &str,
        instance_id: &str,
        expected: &[InstanceState],
        patch: &InstancePatch,
    ) -> ManagerResult<Option<Instance>> {
        Ok(self.store.patch(instance_id, expected, patch).await?)
    }

    async fn reserve_slot(&self, _pool: &PoolSpec) -> ManagerResult<Option<CreateSlot>> {
        Ok(Some(CreateSlot::unbounded()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use warmpool_core::{MachineSpec, Platform};
    use warmpool_state::StateStore;

    use super::*;

    fn pool(max_size: u32) -> PoolSpec {
        PoolSpec {
            name: "linux".to_string(),
            driver: "fake".to_string(),
            platform: Platform::default(),
            min_size: 0,
            max_size,
            spec: MachineSpec::default(),
            variants: Vec::new(),
        }
    }

    fn instance(id: &str, state: InstanceState, started: i64) -> Instance {
        Instance {
            id: id.to_string(),
            name: format!("runner-linux-{id}"),
            node_id: None,
            pool: "linux".to_string(),
            provider: "fake".to_string(),
            zone: String::new(),
            region: String::new(),
            size: String::new(),
            image: String::new(),
            platform: Platform::default(),
            variant_id: "default".to_string(),
            address: String::new(),
            port: 9079,
            ca_cert: String::new(),
            ca_key: String::new(),
            tls_cert: String::new(),
            tls_key: String::new(),
            state,
            is_hibernated: false,
            started,
            updated: started,
            owner_id: String::new(),
            stage: String::new(),
            runner_name: "runner".to_string(),
            storage_identifier: String::new(),
            labels: BTreeMap::from([("retain".to_string(), "false".to_string())]),
        }
    }

    fn request() -> ClaimRequest {
        ClaimRequest {
            query: InstanceQuery::default(),
            owner_id: "owner".to_string(),
            stage: "stage-1".to_string(),
            now: 500,
        }
    }

    async fn seeded(rows: &[Instance]) -> Arc<dyn InstanceStore> {
        let store: Arc<dyn InstanceStore> = Arc::new(StateStore::open_in_memory().unwrap());
        for row in rows {
            store.create(row).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn local_claims_oldest_free() {
        let store = seeded(&[
            instance("b", InstanceState::Created, 200),
            instance("a", InstanceState::Created, 100),
            instance("c", InstanceState::Hibernating, 50),
        ])
        .await;
        let allocator = LocalAllocator::new(store.clone());

        let Claim::Warm(claimed) = allocator.claim(&pool(5), &request()).await.unwrap() else {
            panic!("expected a warm claim");
        };
        assert_eq!(claimed.id, "a");
        assert_eq!(claimed.owner_id, "owner");
        assert_eq!(claimed.started, 100);

        let stored = store.find("a").await.unwrap().unwrap();
        assert_eq!(stored.state, InstanceState::InUse);
        assert_eq!(stored.stage, "stage-1");
    }

    #[tokio::test]
    async fn hibernated_claim_resets_started() {
        let mut row = instance("a", InstanceState::Created, 100);
        row.is_hibernated = true;
        let store = seeded(&[row]).await;
        let allocator = LocalAllocator::new(store);

        let Claim::Warm(claimed) = allocator.claim(&pool(5), &request()).await.unwrap() else {
            panic!("expected a warm claim");
        };
        assert_eq!(claimed.started, 500);
    }

    #[tokio::test]
    async fn local_enforces_max_size_with_pending_creates() {
        let store = seeded(&[instance("a", InstanceState::InUse, 100)]).await;
        let allocator = LocalAllocator::new(store);
        let pool = pool(2);

        let slot = match allocator.claim(&pool, &request()).await.unwrap() {
            Claim::Create(slot) => slot,
            other => panic!("expected create, got {other:?}"),
        };
        assert_eq!(allocator.pending("linux").await, 1);
        assert!(matches!(
            allocator.claim(&pool, &request()).await.unwrap(),
            Claim::Exhausted
        ));
        assert!(allocator.reserve_slot(&pool).await.unwrap().is_none());

        drop(slot);
        assert_eq!(allocator.pending("linux").await, 0);
        assert!(allocator.reserve_slot(&pool).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn transition_respects_allowed_states() {
        let store = seeded(&[instance("a", InstanceState::InUse, 100)]).await;
        let allocator = LocalAllocator::new(store);

        let none = allocator
            .transition(
                "linux",
                &InstanceQuery::default(),
                InstanceState::Hibernating,
                &[InstanceState::Created],
                10,
            )
            .await
            .unwrap();
        assert!(none.is_none());

        let moved = allocator
            .transition(
                "linux",
                &InstanceQuery::default().with_instance("a"),
                InstanceState::Terminating,
                &[InstanceState::InUse],
                10,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.state, InstanceState::Terminating);
        assert_eq!(moved.updated, 10);
    }

    #[tokio::test]
    async fn distributed_claims_are_disjoint() {
        let rows: Vec<Instance> = (0..4)
            .map(|i| instance(&format!("i{i}"), InstanceState::Created, 100 + i))
            .collect();
        let store = seeded(&rows).await;
        let allocator = Arc::new(DistributedAllocator::new(store));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let allocator = allocator.clone();
                tokio::spawn(async move { allocator.claim(&pool(1), &request()).await.unwrap() })
            })
            .collect();

        let mut warm = Vec::new();
        let mut creates = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Claim::Warm(instance) => warm.push(instance.id),
                Claim::Create(_) => creates += 1,
                Claim::Exhausted => panic!("distributed allocator never exhausts"),
            }
        }
        warm.sort();
        warm.dedup();
        assert_eq!(warm.len(), 4);
        assert_eq!(creates, 2);
    }
}
