//! warmpool-predict — how many warm instances a window will need.
//!
//! Predictors read utilization history and recommend an instance count for
//! one `(pool, variant)` over one scaling window. The default,
//! [`EmaWeekendPredictor`], blends a recent EMA with the peaks seen in the
//! same window on each of the previous three weeks.

pub mod ema;
pub mod error;

use async_trait::async_trait;

pub use ema::{EmaWeekendPredictor, HISTORY_WEIGHTS, WEEK_SECS};
pub use error::{PredictError, PredictResult};

/// The window a prediction is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionInput {
    pub pool_name: String,
    pub variant_id: String,
    /// Unix seconds.
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prediction {
    pub recommended_instances: u32,
}

#[async_trait]
pub trait Predictor: Send + Sync {
    fn name(&self) -> &str;

    async fn predict(&self, input: &PredictionInput) -> PredictResult<Prediction>;
}
