//! Manager error types.

use thiserror::Error;
use warmpool_agent::AgentError;
use warmpool_drivers::DriverError;
use warmpool_state::StateError;

/// How a caller should react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    BadRequest,
    NotFound,
    CapacityUnavailable,
    CapacityReservationNotSupported,
    /// Worth retrying later.
    Retryable,
    Internal,
}

/// Errors that can occur during pool-manager operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("duplicate pool: {0}")]
    DuplicatePool(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("no instance available in pool {0}")]
    NoInstanceAvailable(String),

    #[error("stage {0} is bound but its instance never appeared")]
    StageBusy(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("invalid purger settings: {0}")]
    InvalidPurger(String),

    #[error("no capacity in any candidate pool")]
    CapacityUnavailable,

    #[error("no candidate pool supports capacity reservations")]
    CapacityReservationNotSupported,

    #[error("driver {op} failed: {source}")]
    Driver {
        op: &'static str,
        #[source]
        source: DriverError,
    },

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl ManagerError {
    pub fn driver(op: &'static str, source: DriverError) -> Self {
        ManagerError::Driver { op, source }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ManagerError::PoolNotFound(_) | ManagerError::InstanceNotFound(_) => {
                ErrorClass::NotFound
            }
            ManagerError::DuplicatePool(_)
            | ManagerError::BadRequest(_)
            | ManagerError::InvalidPurger(_) => ErrorClass::BadRequest,
            ManagerError::NoInstanceAvailable(_)
            | ManagerError::StageBusy(_)
            | ManagerError::Agent(_) => ErrorClass::Retryable,
            ManagerError::CapacityUnavailable => ErrorClass::CapacityUnavailable,
            ManagerError::CapacityReservationNotSupported => {
                ErrorClass::CapacityReservationNotSupported
            }
            ManagerError::Driver { source, .. } => match source {
                DriverError::CapacityUnavailable => ErrorClass::CapacityUnavailable,
                DriverError::CapacityReservationNotSupported(_) => {
                    ErrorClass::CapacityReservationNotSupported
                }
                DriverError::NotFound(_) => ErrorClass::NotFound,
                DriverError::BadRequest(_) => ErrorClass::BadRequest,
                DriverError::Transient(_) => ErrorClass::Retryable,
                DriverError::Incomplete { .. }
                | DriverError::Certificate(_)
                | DriverError::Other(_) => ErrorClass::Internal,
            },
            ManagerError::State(e) if e.is_not_found() => ErrorClass::NotFound,
            ManagerError::State(_) => ErrorClass::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Retryable | ErrorClass::CapacityUnavailable
        )
    }
}

pub type ManagerResult<T> = Result<T, ManagerError>;
