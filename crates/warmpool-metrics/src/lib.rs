//! warmpool-metrics — in-process counters and gauges.
//!
//! Series are keyed by metric name plus `(pool, variant)` labels and backed
//! by atomics, so recording is lock-free once a series exists. Exporters are
//! not part of this crate; [`Metrics::snapshot`] returns every series for
//! whoever wants to publish them, and the daemon logs a summary.
//!
//! ```text
//! Metrics
//!   ├── incr() / add()     ← counters (claims, creates, destroys, jobs)
//!   ├── set_gauge()        ← gauges (predicted instances, free/busy)
//!   └── snapshot()         → Vec<Sample>
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

/// Metric names.
pub mod names {
    pub const WARM_CLAIMS: &str = "warmpool_warm_claims_total";
    pub const COLD_CREATES: &str = "warmpool_cold_creates_total";
    pub const INSTANCES_CREATED: &str = "warmpool_instances_created_total";
    pub const INSTANCES_DESTROYED: &str = "warmpool_instances_destroyed_total";
    pub const CREATE_FAILURES: &str = "warmpool_create_failures_total";
    pub const HIBERNATIONS: &str = "warmpool_hibernations_total";
    pub const HIBERNATE_FAILURES: &str = "warmpool_hibernate_failures_total";
    pub const PURGED: &str = "warmpool_purged_instances_total";
    pub const OUTBOX_PROCESSED: &str = "warmpool_outbox_jobs_processed_total";
    pub const OUTBOX_FAILED: &str = "warmpool_outbox_jobs_failed_total";
    pub const OUTBOX_DROPPED: &str = "warmpool_outbox_jobs_dropped_total";
    pub const CAPACITY_UNAVAILABLE: &str = "warmpool_capacity_unavailable_total";

    pub const PREDICTED_INSTANCES: &str = "warmpool_scaler_predicted_instances";
    pub const FREE_INSTANCES: &str = "warmpool_free_instances";
    pub const BUSY_INSTANCES: &str = "warmpool_busy_instances";
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct SeriesKey {
    name: &'static str,
    pool: String,
    variant: String,
}

/// Counter or gauge reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Counter(u64),
    Gauge(i64),
}

/// One series in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub name: &'static str,
    pub pool: String,
    pub variant: String,
    pub value: Value,
}

/// Registry of counters and gauges shared across the process.
#[derive(Default)]
pub struct Metrics {
    counters: RwLock<HashMap<SeriesKey, Arc<AtomicU64>>>,
    gauges: RwLock<HashMap<SeriesKey, Arc<AtomicI64>>>,
}

/// Fetch a series, creating it on first use.
fn series<T: Default>(
    map: &RwLock<HashMap<SeriesKey, Arc<T>>>,
    name: &'static str,
    pool: &str,
    variant: &str,
) -> Arc<T> {
    let key = SeriesKey {
        name,
        pool: pool.to_string(),
        variant: variant.to_string(),
    };
    if let Some(existing) = map
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&key)
    {
        return existing.clone();
    }
    map.write()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(key)
        .or_default()
        .clone()
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn incr(&self, name: &'static str, pool: &str, variant: &str) {
        self.add(name, pool, variant, 1);
    }

    pub fn add(&self, name: &'static str, pool: &str, variant: &str, n: u64) {
        series(&self.counters, name, pool, variant).fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_gauge(&self, name: &'static str, pool: &str, variant: &str, value: i64) {
        series(&self.gauges, name, pool, variant).store(value, Ordering::Relaxed);
        debug!(metric = name, %pool, %variant, value, "gauge updated");
    }

    pub fn counter(&self, name: &'static str, pool: &str, variant: &str) -> u64 {
        series(&self.counters, name, pool, variant).load(Ordering::Relaxed)
    }

    pub fn gauge(&self, name: &'static str, pool: &str, variant: &str) -> i64 {
        series(&self.gauges, name, pool, variant).load(Ordering::Relaxed)
    }

    /// Every series, sorted by name then labels.
    pub fn snapshot(&self) -> Vec<Sample> {
        let mut samples: Vec<Sample> = Vec::new();
        for (key, value) in self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            samples.push(Sample {
                name: key.name,
                pool: key.pool.clone(),
                variant: key.variant.clone(),
                value: Value::Counter(value.load(Ordering::Relaxed)),
            });
        }
        for (key, value) in self
            .gauges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            samples.push(Sample {
                name: key.name,
                pool: key.pool.clone(),
                variant: key.variant.clone(),
                value: Value::Gauge(value.load(Ordering::Relaxed)),
            });
        }
        samples.sort_by(|a, b| {
            (a.name, &a.pool, &a.variant).cmp(&(b.name, &b.pool, &b.variant))
        });
        samples
    }
}
