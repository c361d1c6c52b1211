//! Driver error taxonomy.

use thiserror::Error;

pub type DriverResult<T> = Result<T, DriverError>;

/// Failures reported by cloud adapters.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    /// Every candidate zone refused the request.
    #[error("capacity unavailable in all zones")]
    CapacityUnavailable,

    #[error("driver {0} does not support capacity reservations")]
    CapacityReservationNotSupported(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Network blips, rate limits, and other failures worth retrying.
    #[error("transient driver failure: {0}")]
    Transient(String),

    /// The cloud accepted the create but it did not finish; the resource
    /// may exist and must be destroyed.
    #[error("instance {instance_id} partially created: {message}")]
    Incomplete { instance_id: String, message: String },

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("certificate generation failed: {0}")]
    Certificate(String),

    #[error("{0}")]
    Other(String),
}

impl DriverError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::Transient(_) | DriverError::CapacityUnavailable
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::NotFound(_))
    }

    /// ID of a resource left behind by a failed create, if any.
    pub fn leaked_instance(&self) -> Option<&str> {
        match self {
            DriverError::Incomplete { instance_id, .. } => Some(instance_id),
            _ => None,
        }
    }
}
