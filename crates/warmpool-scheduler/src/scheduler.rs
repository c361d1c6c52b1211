//! Tick-based job registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// A unit of periodic work.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    /// Run once as soon as the job starts instead of after one interval.
    fn run_on_start(&self) -> bool {
        false
    }

    async fn execute(&self) -> anyhow::Result<()>;
}

/// A running job task.
struct RunningJob {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl RunningJob {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                error!(error = %e, "scheduled job task panicked");
            }
        }
    }
}

#[derive(Default)]
struct Registry {
    jobs: HashMap<String, Arc<dyn Job>>,
    running: HashMap<String, RunningJob>,
    started: bool,
}

/// Runs every registered job on its own task.
#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<Mutex<Registry>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job, replacing and stopping any job with the same name.
    ///
    /// Jobs registered after [`start`](Self::start) begin immediately.
    /// A zero interval is refused.
    pub async fn register(&self, job: Arc<dyn Job>) -> anyhow::Result<()> {
        let name = job.name().to_string();
        if job.interval().is_zero() {
            anyhow::bail!("job {name} has a zero interval");
        }
        let mut registry = self.inner.lock().await;
        if let Some(old) = registry.running.remove(&name) {
            old.stop().await;
            debug!(job = %name, "replaced scheduled job");
        }
        if registry.started {
            registry.running.insert(name.clone(), spawn(job.clone()));
        }
        registry.jobs.insert(name, job);
        Ok(())
    }

    pub async fn start(&self) {
        let mut registry = self.inner.lock().await;
        if registry.started {
            return;
        }
        registry.started = true;
        let jobs: Vec<Arc<dyn Job>> = registry.jobs.values().cloned().collect();
        for job in jobs {
            registry.running.insert(job.name().to_string(), spawn(job));
        }
        info!(jobs = registry.running.len(), "scheduler started");
    }

    /// Signal every job and wait for it to finish its current tick.
    pub async fn stop(&self) {
        let mut registry = self.inner.lock().await;
        registry.started = false;
        for (name, running) in registry.running.drain() {
            running.stop().await;
            debug!(job = %name, "scheduled job stopped");
        }
        info!("scheduler stopped");
    }

    /// Names of jobs currently running.
    pub async fn running_jobs(&self) -> Vec<String> {
        let registry = self.inner.lock().await;
        let mut names: Vec<String> = registry.running.keys().cloned().collect();
        names.sort();
        names
    }
}

fn spawn(job: Arc<dyn Job>) -> RunningJob {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(run_job(job, shutdown_rx));
    RunningJob {
        handle,
        shutdown_tx,
    }
}

async fn run_job(job: Arc<dyn Job>, mut shutdown: watch::Receiver<bool>) {
    let name = job.name().to_string();
    let interval = job.interval();
    debug!(job = %name, ?interval, "scheduled job starting");

    if job.run_on_start() {
        execute(job.as_ref(), &name).await;
    }
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                execute(job.as_ref(), &name).await;
            }
            _ = shutdown.changed() => {
                debug!(job = %name, "scheduled job shutting down");
                break;
            }
        }
    }
}

async fn execute(job: &dyn Job, name: &str) {
    if let Err(e) = job.execute().await {
        error!(job = %name, error = %format!("{e:#}"), "scheduled job failed");
    }
}
