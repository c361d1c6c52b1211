//! warmpool-state — persistent entities and the stores behind them.
//!
//! # Architecture
//!
//! Callers depend only on the async store traits in [`stores`]. Two backends
//! implement every trait:
//!
//! - [`StateStore`] embeds [redb](https://docs.rs/redb) and serves a single
//!   replica (the local flavor). Values are JSON-serialized into `&[u8]`
//!   columns; outbox and utilization rows use a transactional sequence.
//! - [`PgStore`] uses PostgreSQL through `sqlx` and serves many replicas
//!   (the distributed flavor). Claims use `FOR UPDATE SKIP LOCKED`.
//!
//! Both are `Clone` + `Send` + `Sync` and can be shared across tasks.

pub mod error;
pub mod postgres;
pub mod store;
pub mod stores;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use postgres::PgStore;
pub use store::StateStore;
pub use stores::*;
pub use types::*;
