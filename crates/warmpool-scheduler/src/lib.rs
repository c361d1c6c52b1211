//! warmpool-scheduler — the replica's clock.
//!
//! A [`Scheduler`] runs each registered [`Job`] on its own task at a fixed
//! interval until stopped. [`jobs`] holds the five jobs every replica runs:
//!
//! ```text
//! outbox-processor   every poll interval  → OutboxProcessor::process_pending_jobs
//! outbox-cleanup     hourly               → OutboxProcessor::cleanup_old_jobs
//! utilization        every interval       → in-use counts → utilization history
//! history-cleanup    every few hours      → drop history past retention
//! scaler-trigger     every minute         → one `scale` job per pool per window
//! ```
//!
//! Windows are aligned to midnight UTC (see [`window`]) so every replica
//! derives the same `(pool, window_start)` and the outbox de-duplicates.

pub mod jobs;
pub mod scheduler;
pub mod window;

pub use jobs::{
    HistoryCleanupJob, OutboxCleanupJob, OutboxProcessorJob, ScalerTriggerJob, UtilizationTrackerJob,
};
pub use scheduler::{Job, Scheduler};
pub use window::next_window_boundary;
