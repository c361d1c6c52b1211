//! warmpool-outbox — durable background work shared by every replica.
//!
//! Writers persist an [`OutboxJob`](warmpool_state::OutboxJob); the
//! [`OutboxProcessor`] claims batches through the store, dispatches each job
//! to the [`JobHandler`] registered for its type, and deletes it on success.
//! Failed jobs go back to `pending` and are retried after the retry interval
//! until they exceed the retry budget.
//!
//! # Architecture
//!
//! ```text
//! scheduler ──► process_pending_jobs
//!                 │ find_and_claim_pending (runner + global jobs)
//!                 ├──► setup_instance ─► SetupInstanceHandler ─► Manager::setup_instance
//!                 └──► scale          ─► ScaleHandler ─► Scaler
//!                                          │ predict per variant
//!                                          ├──► delta > 0: enqueue setup_instance jobs
//!                                          └──► delta < 0: Manager::scale_down
//! ```
//!
//! Delivery is at-least-once; handlers converge rather than assume a single
//! execution.

pub mod processor;
pub mod scaler;
pub mod setup;

#[cfg(test)]
pub(crate) mod testutil;

pub use processor::{JobHandler, OutboxProcessor, ProcessReport};
pub use scaler::{ScaleHandler, ScaleReport, Scaler};
pub use setup::SetupInstanceHandler;
