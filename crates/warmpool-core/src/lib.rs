//! warmpool-core — shared pool types, configuration, and time helpers.
//!
//! Every other warmpool crate depends on this one. It has no async code and
//! no I/O beyond reading the TOML config file.

pub mod config;
pub mod time;
pub mod types;

pub use config::{ConfigError, RunnerMode, WarmpoolConfig};
pub use time::{epoch_secs, parse_duration};
pub use types::*;
