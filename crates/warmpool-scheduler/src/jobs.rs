//! The jobs every replica schedules.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};
use warmpool_core::config::ScalerConfig;
use warmpool_core::epoch_secs;
use warmpool_manager::Manager;
use warmpool_outbox::OutboxProcessor;
use warmpool_state::{
    InstanceState, OutboxJob, ScaleParams, StateError, UtilizationHistoryStore,
    UtilizationRecord,
};

use crate::scheduler::Job;
use crate::window::next_window_boundary;

/// Claims and runs a batch of outbox jobs.
pub struct OutboxProcessorJob {
    processor: Arc<OutboxProcessor>,
}

impl OutboxProcessorJob {
    pub fn new(processor: Arc<OutboxProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl Job for OutboxProcessorJob {
    fn name(&self) -> &str {
        "outbox-processor"
    }

    fn interval(&self) -> Duration {
        self.processor.config().poll_interval
    }

    async fn execute(&self) -> anyhow::Result<()> {
        let report = self.processor.process_pending_jobs(epoch_secs()).await?;
        if report.claimed > 0 {
            debug!(
                claimed = report.claimed,
                succeeded = report.succeeded,
                failed = report.failed,
                dropped = report.dropped,
                "outbox batch processed"
            );
        }
        Ok(())
    }
}

/// Deletes outbox jobs past retention.
pub struct OutboxCleanupJob {
    processor: Arc<OutboxProcessor>,
}

impl OutboxCleanupJob {
    pub fn new(processor: Arc<OutboxProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl Job for OutboxCleanupJob {
    fn name(&self) -> &str {
        "outbox-cleanup"
    }

    fn interval(&self) -> Duration {
        self.processor.config().cleanup_interval
    }

    async fn execute(&self) -> anyhow::Result<()> {
        self.processor.cleanup_old_jobs(epoch_secs()).await?;
        Ok(())
    }
}

/// Samples in-use counts into the utilization history.
///
/// Every configured `(pool, variant)` gets a row per tick, zero when idle,
/// so averages see quiet periods.
pub struct UtilizationTrackerJob {
    manager: Manager,
    interval: Duration,
}

impl UtilizationTrackerJob {
    pub fn new(manager: Manager, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Record one sample per `(pool, variant)` at `now`.
    pub async fn track_at(&self, now: i64) -> anyhow::Result<usize> {
        let stores = self.manager.stores();
        let mut in_use: HashMap<(String, String), u32> = stores
            .instances
            .count_by_pool_and_variant(InstanceState::InUse)
            .await?
            .into_iter()
            .map(|c| ((c.pool, c.variant_id), c.count))
            .collect();
        for entry in self.manager.registry().entries() {
            for variant_id in entry.spec.variant_ids() {
                in_use
                    .entry((entry.name().to_string(), variant_id))
                    .or_insert(0);
            }
        }

        let mut keys: Vec<_> = in_use.into_iter().collect();
        keys.sort();
        for ((pool, variant_id), count) in &keys {
            stores
                .utilization
                .create(&UtilizationRecord::new(pool, variant_id, *count, now))
                .await?;
        }
        self.manager.record_gauges().await?;
        debug!(series = keys.len(), "utilization recorded");
        Ok(keys.len())
    }
}

#[async_trait]
impl Job for UtilizationTrackerJob {
    fn name(&self) -> &str {
        "utilization-tracker"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn run_on_start(&self) -> bool {
        true
    }

    async fn execute(&self) -> anyhow::Result<()> {
        self.track_at(epoch_secs()).await.map(|_| ())
    }
}

/// Drops utilization history past the retention period.
pub struct HistoryCleanupJob {
    history: Arc<dyn UtilizationHistoryStore>,
    interval: Duration,
    retention_days: u32,
}

impl HistoryCleanupJob {
    pub fn new(history: Arc<dyn UtilizationHistoryStore>, interval: Duration, retention_days: u32) -> Self {
        Self {
            history,
            interval,
            retention_days,
        }
    }

    pub async fn cleanup_at(&self, now: i64) -> anyhow::Result<u64> {
        let cutoff = now - i64::from(self.retention_days) * 24 * 3600;
        let deleted = self.history.delete_older_than(cutoff).await?;
        if deleted > 0 {
            info!(deleted, retention_days = self.retention_days, "utilization history pruned");
        }
        Ok(deleted)
    }
}

#[async_trait]
impl Job for HistoryCleanupJob {
    fn name(&self) -> &str {
        "history-cleanup"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self) -> anyhow::Result<()> {
        self.cleanup_at(epoch_secs()).await.map(|_| ())
    }
}

/// Enqueues one `scale` job per pool shortly before each window opens.
pub struct ScalerTriggerJob {
    manager: Manager,
    config: ScalerConfig,
    last_window: Mutex<Option<i64>>,
}

impl ScalerTriggerJob {
    pub fn new(manager: Manager, config: ScalerConfig) -> Self {
        Self {
            manager,
            config,
            last_window: Mutex::new(None),
        }
    }

    /// Enqueue scale jobs for the window after `now` if it is within lead
    /// time. Returns how many jobs were created.
    pub async fn trigger_at(&self, now: i64) -> anyhow::Result<usize> {
        let window_start = next_window_boundary(now, self.config.window_duration);
        if window_start - now > self.config.lead_time.as_secs() as i64 {
            return Ok(0);
        }
        let mut last_window = self.last_window.lock().await;
        if *last_window == Some(window_start) {
            return Ok(0);
        }

        let params = ScaleParams {
            window_start,
            window_end: window_start + self.config.window_duration.as_secs() as i64,
        };
        let outbox = &self.manager.stores().outbox;
        let mut created = 0;
        for pool in self.manager.registry().names() {
            if outbox
                .find_scale_job_for_window(&pool, window_start)
                .await?
                .is_some()
            {
                debug!(%pool, window_start, "scale job already queued");
                continue;
            }
            // Another replica may enqueue between the lookup and the insert.
            match outbox.create(&OutboxJob::scale(&pool, params, now)?).await {
                Ok(id) => {
                    info!(%pool, window_start, job = id, "scale job enqueued");
                    created += 1;
                }
                Err(StateError::AlreadyExists(_)) => {
                    debug!(%pool, window_start, "scale job already queued");
                }
                Err(e) => return Err(e.into()),
            }
        }
        *last_window = Some(window_start);
        Ok(created)
    }
}

#[async_trait]
impl Job for ScalerTriggerJob {
    fn name(&self) -> &str {
        "scaler-trigger"
    }

    fn interval(&self) -> Duration {
        self.config.check_interval
    }

    fn run_on_start(&self) -> bool {
        true
    }

    async fn execute(&self) -> anyhow::Result<()> {
        self.trigger_at(epoch_secs()).await.map(|_| ())
    }
}
