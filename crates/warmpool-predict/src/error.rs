use thiserror::Error;
use warmpool_state::StateError;

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("invalid window [{start}, {end}]")]
    InvalidWindow { start: i64, end: i64 },

    #[error("history store error: {0}")]
    History(#[from] StateError),
}

pub type PredictResult<T> = Result<T, PredictError>;
