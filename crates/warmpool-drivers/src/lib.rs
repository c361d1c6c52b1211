//! warmpool-drivers — the cloud adapter seam.
//!
//! The pool manager talks to clouds only through the [`Driver`] trait.
//! Adapters wrap their SDK clients however they like; the only one shipped
//! in-tree is [`FakeDriver`], an in-memory cloud used by tests and by the
//! daemon's `fake` pools.

pub mod certs;
pub mod driver;
pub mod error;
pub mod fake;

pub use certs::{AGENT_SERVER_NAME, TlsBundle, generate_bundle};
pub use driver::*;
pub use error::{DriverError, DriverResult};
pub use fake::{FAKE_DRIVER, FakeDriver, FakeOp};
