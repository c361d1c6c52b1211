//! Guest-agent client errors.

use std::time::Duration;

use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The instance's stored CA or leaf material is unusable.
    #[error("invalid instance trust material: {0}")]
    TrustMaterial(String),

    #[error("connect to {address} failed: {message}")]
    Connect { address: String, message: String },

    #[error("tls handshake failed: {0}")]
    Handshake(String),

    #[error("agent request failed: {0}")]
    Request(String),

    #[error("agent returned status {0}")]
    Status(u16),

    #[error("agent did not answer within {0:?}")]
    Timeout(Duration),

    #[error("agent unreachable after {attempts} attempts over {elapsed:?}: {last}")]
    Unreachable {
        attempts: u32,
        elapsed: Duration,
        last: String,
    },
}
