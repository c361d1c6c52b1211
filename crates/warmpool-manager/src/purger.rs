//! Age-based purging of instances and stale reservations.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use warmpool_core::config::{PurgerConfig, validate_purger_ages};
use warmpool_core::epoch_secs;
use warmpool_drivers::StorageCleanup;
use warmpool_metrics::names;
use warmpool_state::PurgeCriteria;

use crate::error::{ManagerError, ManagerResult};
use crate::manager::Manager;

/// Busy lifetime of instances carrying a `ttl` label.
pub const TTL_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgerSettings {
    pub max_age_busy: Duration,
    pub max_age_free: Duration,
    /// Unconsumed reservations older than this are released.
    pub free_capacity_max_age: Duration,
    pub interval: Duration,
}

impl PurgerSettings {
    pub fn from_config(config: &PurgerConfig) -> Self {
        Self {
            max_age_busy: config.max_age_busy,
            max_age_free: config.max_age_free,
            free_capacity_max_age: config.free_capacity_max_age,
            interval: config.interval,
        }
    }

    pub fn validate(&self) -> ManagerResult<()> {
        validate_purger_ages(self.max_age_busy, self.max_age_free)
            .map_err(ManagerError::InvalidPurger)?;
        if self.interval.is_zero() {
            return Err(ManagerError::InvalidPurger(
                "interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Cut-offs for a sweep at `now`.
    pub fn criteria(&self, now: i64) -> PurgeCriteria {
        let before = |age: Duration| now - age.as_secs() as i64;
        PurgeCriteria {
            busy_before: before(self.max_age_busy),
            ttl_busy_before: before(TTL_MAX_AGE),
            free_before: before(self.max_age_free),
            terminating_before: before(self.interval),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub purged: usize,
    pub failed: usize,
    pub reservations_released: usize,
}

impl Manager {
    /// Run the purger every `settings.interval` until `shutdown` fires.
    pub fn start_instance_purger(
        &self,
        settings: PurgerSettings,
        mut shutdown: watch::Receiver<bool>,
    ) -> ManagerResult<JoinHandle<()>> {
        settings.validate()?;
        let manager = self.clone();
        info!(
            max_age_busy_secs = settings.max_age_busy.as_secs(),
            max_age_free_secs = settings.max_age_free.as_secs(),
            interval_secs = settings.interval.as_secs(),
            "instance purger started"
        );

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(settings.interval) => {
                        match manager.purge_once(&settings, epoch_secs()).await {
                            Ok(report) if report == PurgeReport::default() => {}
                            Ok(report) => debug!(?report, "purger sweep done"),
                            Err(e) => error!(error = %e, "purger sweep failed"),
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("instance purger shutting down");
                        break;
                    }
                }
            }
        }))
    }

    /// One sweep over every pool.
    ///
    /// Aged rows are marked `terminating` atomically, destroyed, and the
    /// pool is rebuilt toward its minimum. Rows whose destroy fails stay
    /// `terminating` and are picked up again one interval later.
    pub async fn purge_once(&self, settings: &PurgerSettings, now: i64) -> ManagerResult<PurgeReport> {
        let criteria = settings.criteria(now);
        let mut report = PurgeReport::default();

        for entry in self.registry.entries() {
            let marked = match self
                .stores
                .instances
                .mark_for_purge(entry.name(), &criteria, now)
                .await
            {
                Ok(marked) => marked,
                Err(e) => {
                    warn!(pool = %entry.name(), error = %e, "failed to mark instances for purge");
                    continue;
                }
            };
            if marked.is_empty() {
                continue;
            }

            let count = marked.len();
            info!(pool = %entry.name(), count, "purging aged instances");
            match self
                .destroy_instances(entry, marked, StorageCleanup::Delete)
                .await
            {
                Ok(destroyed) => {
                    report.purged += destroyed;
                    self.metrics
                        .add(names::PURGED, entry.name(), "", destroyed as u64);
                }
                Err(e) => {
                    report.failed += count;
                    warn!(pool = %entry.name(), error = %e, "purge destroy failed, will retry");
                }
            }

            if let Err(e) = self.build_pool(entry.name()).await {
                warn!(pool = %entry.name(), error = %e, "failed to rebuild pool after purge");
            }
        }

        let stale_before = now - settings.free_capacity_max_age.as_secs() as i64;
        for reservation in self
            .stores
            .reservations
            .list_unconsumed_older_than(stale_before)
            .await?
        {
            match self.destroy_capacity(&reservation).await {
                Ok(()) => report.reservations_released += 1,
                Err(e) => {
                    warn!(stage = %reservation.stage_id, error = %e, "failed to release stale reservation")
                }
            }
        }
        Ok(report)
    }
}
