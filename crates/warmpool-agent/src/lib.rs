//! warmpool-agent — client side of the guest-agent contract.
//!
//! Every VM runs an agent serving HTTPS on its agent port. The orchestrator
//! uses it to learn when a fresh VM is reachable ([`wait_healthy`]) and to
//! quiesce a VM before hibernation ([`AgentClient::suspend`]). Trust is
//! pinned per VM: see [`client::tls_config`].

pub mod backoff;
pub mod client;
pub mod error;

pub use backoff::{Backoff, wait_healthy};
pub use client::{AgentClient, HEALTH_PATH, SUSPEND_PATH, TlsAgentClient};
pub use error::{AgentError, AgentResult};
