//! Pool name → (definition, driver).
//!
//! Filled once at startup and read-only afterwards, so lookups need no lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use warmpool_core::PoolSpec;
use warmpool_drivers::Driver;

use crate::error::{ManagerError, ManagerResult};

/// A configured pool and the driver that serves it.
#[derive(Clone)]
pub struct PoolEntry {
    pub spec: PoolSpec,
    pub driver: Arc<dyn Driver>,
}

impl PoolEntry {
    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

#[derive(Clone, Default)]
pub struct PoolRegistry {
    pools: BTreeMap<String, Arc<PoolEntry>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, spec: PoolSpec, driver: Arc<dyn Driver>) -> ManagerResult<()> {
        if self.pools.contains_key(&spec.name) {
            return Err(ManagerError::DuplicatePool(spec.name));
        }
        self.pools
            .insert(spec.name.clone(), Arc::new(PoolEntry { spec, driver }));
        Ok(())
    }

    pub fn get(&self, name: &str) -> ManagerResult<Arc<PoolEntry>> {
        self.pools
            .get(name)
            .cloned()
            .ok_or_else(|| ManagerError::PoolNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.pools.keys().cloned().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<PoolEntry>> {
        self.pools.values()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// One pool per distinct driver instance.
    pub fn distinct_drivers(&self) -> Vec<Arc<PoolEntry>> {
        let mut seen: Vec<*const ()> = Vec::new();
        let mut out = Vec::new();
        for entry in self.pools.values() {
            let ptr = Arc::as_ptr(&entry.driver) as *const ();
            if !seen.contains(&ptr) {
                seen.push(ptr);
                out.push(entry.clone());
            }
        }
        out
    }
}
