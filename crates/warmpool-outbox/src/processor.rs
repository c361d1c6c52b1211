//! Claim, dispatch, and retire outbox jobs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use warmpool_core::config::OutboxConfig;
use warmpool_metrics::{Metrics, names};
use warmpool_state::{OutboxJob, OutboxJobType, OutboxStore, StateResult};

/// Executes one type of outbox job.
///
/// Jobs may be delivered more than once; handlers must tolerate that.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> OutboxJobType;

    async fn handle(&self, job: &OutboxJob) -> anyhow::Result<()>;
}

/// What one processing pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Jobs deleted after exhausting their retries.
    pub dropped: usize,
    /// Jobs whose outcome could not be written back.
    pub store_errors: usize,
}

/// Stateless worker over the outbox table.
pub struct OutboxProcessor {
    store: Arc<dyn OutboxStore>,
    runner_name: String,
    config: OutboxConfig,
    handlers: HashMap<OutboxJobType, Arc<dyn JobHandler>>,
    metrics: Arc<Metrics>,
}

impl OutboxProcessor {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        runner_name: &str,
        config: OutboxConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            runner_name: runner_name.to_string(),
            config,
            handlers: HashMap::new(),
            metrics,
        }
    }

    /// Route jobs of the handler's type to it, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.job_type(), handler);
    }

    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Claim one batch and run it. Jobs in a batch run sequentially.
    ///
    /// Only types with a registered handler are claimed. Only the claim
    /// itself can fail the pass; a job whose result cannot be written back
    /// is counted in `store_errors` and the batch goes on.
    pub async fn process_pending_jobs(&self, now: i64) -> StateResult<ProcessReport> {
        let mut report = ProcessReport::default();
        if self.handlers.is_empty() {
            return Ok(report);
        }
        let mut job_types: Vec<OutboxJobType> = self.handlers.keys().copied().collect();
        job_types.sort_by_key(|t| t.as_str());

        let jobs = self
            .store
            .find_and_claim_pending(
                &self.runner_name,
                &job_types,
                self.config.batch_size as usize,
                self.config.retry_interval,
                now,
            )
            .await?;
        report.claimed = jobs.len();
        if !jobs.is_empty() {
            debug!(runner = %self.runner_name, count = jobs.len(), "outbox jobs claimed");
        }

        for job in jobs {
            if job.retry_count > self.config.max_retries {
                warn!(
                    job = job.id,
                    pool = %job.pool_name,
                    job_type = %job.job_type,
                    retries = job.retry_count,
                    last_error = job.error_message.as_deref().unwrap_or(""),
                    "outbox job exceeded retries, dropping"
                );
                self.metrics.incr(names::OUTBOX_DROPPED, &job.pool_name, "");
                report.dropped += 1;
                if let Err(e) = self.store.delete(job.id).await {
                    warn!(job = job.id, error = %e, "failed to delete exhausted outbox job");
                    report.store_errors += 1;
                }
                continue;
            }

            let Some(handler) = self.handlers.get(&job.job_type) else {
                continue;
            };
            match handler.handle(&job).await {
                Ok(()) => {
                    self.metrics.incr(names::OUTBOX_PROCESSED, &job.pool_name, "");
                    debug!(job = job.id, job_type = %job.job_type, "outbox job done");
                    report.succeeded += 1;
                    if let Err(e) = self.store.delete(job.id).await {
                        warn!(job = job.id, error = %e, "failed to delete finished outbox job");
                        report.store_errors += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        job = job.id,
                        pool = %job.pool_name,
                        job_type = %job.job_type,
                        attempt = job.retry_count,
                        error = %e,
                        "outbox job failed"
                    );
                    self.metrics.incr(names::OUTBOX_FAILED, &job.pool_name, "");
                    report.failed += 1;
                    if let Err(e) = self.store.release_with_error(job.id, &format!("{e:#}")).await
                    {
                        warn!(job = job.id, error = %e, "failed to release outbox job");
                        report.store_errors += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Delete jobs older than the retention period, whatever their status.
    pub async fn cleanup_old_jobs(&self, now: i64) -> StateResult<u64> {
        let cutoff = now - self.config.retention.as_secs() as i64;
        let deleted = self.store.delete_older_than(cutoff).await?;
        if deleted > 0 {
            info!(deleted, "old outbox jobs removed");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use warmpool_state::{ScaleParams, StateStore};

    use super::*;

    /// Fails its first `failures` calls.
    struct FlakyHandler {
        job_type: OutboxJobType,
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyHandler {
        fn new(job_type: OutboxJobType, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                job_type,
                failures,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        fn job_type(&self) -> OutboxJobType {
            self.job_type
        }

        async fn handle(&self, _job: &OutboxJob) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                anyhow::bail!("attempt {} failed", call + 1);
            }
            Ok(())
        }
    }

    /// Outbox store whose first `delete` fails.
    struct FailingDelete {
        inner: StateStore,
        tripped: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl OutboxStore for FailingDelete {
        async fn create(&self, job: &OutboxJob) -> StateResult<i64> {
            OutboxStore::create(&self.inner, job).await
        }

        async fn find_and_claim_pending(
            &self,
            runner_name: &str,
            job_types: &[OutboxJobType],
            batch_size: usize,
            retry_interval: Duration,
            now: i64,
        ) -> StateResult<Vec<OutboxJob>> {
            self.inner
                .find_and_claim_pending(runner_name, job_types, batch_size, retry_interval, now)
                .await
        }

        async fn release_with_error(&self, id: i64, error: &str) -> StateResult<()> {
            self.inner.release_with_error(id, error).await
        }

        async fn delete(&self, id: i64) -> StateResult<bool> {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                return Err(warmpool_state::StateError::Write("connection reset".to_string()));
            }
            OutboxStore::delete(&self.inner, id).await
        }

        async fn delete_older_than(&self, before: i64) -> StateResult<u64> {
            OutboxStore::delete_older_than(&self.inner, before).await
        }

        async fn find_scale_job_for_window(
            &self,
            pool: &str,
            window_start: i64,
        ) -> StateResult<Option<OutboxJob>> {
            self.inner.find_scale_job_for_window(pool, window_start).await
        }

        async fn list(
            &self,
            pool: &str,
            job_type: Option<OutboxJobType>,
        ) -> StateResult<Vec<OutboxJob>> {
            OutboxStore::list(&self.inner, pool, job_type).await
        }
    }

    fn config() -> OutboxConfig {
        OutboxConfig {
            batch_size: 10,
            retry_interval: Duration::from_secs(60),
            max_retries: 2,
            retention: Duration::from_secs(48 * 3600),
            ..OutboxConfig::default()
        }
    }

    fn processor(store: &StateStore, metrics: &Arc<Metrics>) -> OutboxProcessor {
        OutboxProcessor::new(Arc::new(store.clone()), "runner-a", config(), metrics.clone())
    }

    async fn enqueue_scale(store: &StateStore, pool: &str, window_start: i64, now: i64) -> i64 {
        let job = OutboxJob::scale(
            pool,
            ScaleParams {
                window_start,
                window_end: window_start + 1800,
            },
            now,
        )
        .unwrap();
        OutboxStore::create(store, &job).await.unwrap()
    }

    #[tokio::test]
    async fn successful_jobs_are_deleted() {
        let store = StateStore::open_in_memory().unwrap();
        let metrics = Metrics::new();
        let handler = FlakyHandler::new(OutboxJobType::Scale, 0);
        let processor = processor(&store, &metrics).with_handler(handler.clone());
        enqueue_scale(&store, "linux", 1800, 1000).await;
        enqueue_scale(&store, "windows", 1800, 1000).await;

        let report = processor.process_pending_jobs(1000).await.unwrap();
        assert_eq!(report.claimed, 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(handler.calls(), 2);
        assert!(OutboxStore::list(&store, "linux", None).await.unwrap().is_empty());
        assert_eq!(metrics.counter(names::OUTBOX_PROCESSED, "linux", ""), 1);
    }

    #[tokio::test]
    async fn failed_jobs_wait_for_retry_interval() {
        let store = StateStore::open_in_memory().unwrap();
        let metrics = Metrics::new();
        let handler = FlakyHandler::new(OutboxJobType::Scale, 1);
        let processor = processor(&store, &metrics).with_handler(handler.clone());
        enqueue_scale(&store, "linux", 1800, 1000).await;

        let first = processor.process_pending_jobs(1000).await.unwrap();
        assert_eq!(first.failed, 1);
        let jobs = OutboxStore::list(&store, "linux", None).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].error_message.as_deref(), Some("attempt 1 failed"));

        // Inside the retry interval nothing is claimed.
        let early = processor.process_pending_jobs(1030).await.unwrap();
        assert_eq!(early.claimed, 0);

        let retry = processor.process_pending_jobs(1061).await.unwrap();
        assert_eq!(retry.succeeded, 1);
        assert_eq!(handler.calls(), 2);
        assert!(OutboxStore::list(&store, "linux", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn jobs_past_max_retries_are_dropped() {
        let store = StateStore::open_in_memory().unwrap();
        let metrics = Metrics::new();
        let handler = FlakyHandler::new(OutboxJobType::Scale, u32::MAX);
        let processor = processor(&store, &metrics).with_handler(handler.clone());
        enqueue_scale(&store, "linux", 1800, 1000).await;

        let mut now = 1000;
        let mut dropped = 0;
        for _ in 0..5 {
            dropped += processor.process_pending_jobs(now).await.unwrap().dropped;
            now += 61;
        }

        // Two retries allowed: attempts one and two run, the third claim drops it.
        assert_eq!(handler.calls(), 2);
        assert_eq!(dropped, 1);
        assert!(OutboxStore::list(&store, "linux", None).await.unwrap().is_empty());
        assert_eq!(metrics.counter(names::OUTBOX_DROPPED, "linux", ""), 1);
    }

    #[tokio::test]
    async fn unhandled_types_are_left_alone() {
        let store = StateStore::open_in_memory().unwrap();
        let metrics = Metrics::new();
        let processor = processor(&store, &metrics)
            .with_handler(FlakyHandler::new(OutboxJobType::SetupInstance, 0));
        enqueue_scale(&store, "linux", 1800, 1000).await;

        let report = processor.process_pending_jobs(1000).await.unwrap();
        assert_eq!(report.claimed, 0);
        let jobs = OutboxStore::list(&store, "linux", None).await.unwrap();
        assert_eq!(jobs[0].retry_count, 0);
    }

    #[tokio::test]
    async fn cleanup_removes_jobs_past_retention() {
        let store = StateStore::open_in_memory().unwrap();
        let processor = processor(&store, &Metrics::new());
        let now = 200_000;
        enqueue_scale(&store, "linux", 0, now - 49 * 3600).await;
        enqueue_scale(&store, "linux", 1800, now - 3600).await;

        assert_eq!(processor.cleanup_old_jobs(now).await.unwrap(), 1);
        let left = OutboxStore::list(&store, "linux", None).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].window_start(), Some(1800));
    }

    #[tokio::test]
    async fn store_error_does_not_abandon_the_batch() {
        let inner = StateStore::open_in_memory().unwrap();
        let store = Arc::new(FailingDelete {
            inner: inner.clone(),
            tripped: std::sync::atomic::AtomicBool::new(false),
        });
        let handler = FlakyHandler::new(OutboxJobType::Scale, 0);
        let processor = OutboxProcessor::new(store, "runner-a", config(), Metrics::new())
            .with_handler(handler.clone());
        for pool in ["a", "b", "c"] {
            enqueue_scale(&inner, pool, 1800, 1000).await;
        }

        let report = processor.process_pending_jobs(1000).await.unwrap();
        assert_eq!(report.claimed, 3);
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.store_errors, 1);
        assert_eq!(handler.calls(), 3);

        // Only the job whose delete failed is left behind.
        let mut left = 0;
        for pool in ["a", "b", "c"] {
            left += OutboxStore::list(&inner, pool, None).await.unwrap().len();
        }
        assert_eq!(left, 1);
    }
}
