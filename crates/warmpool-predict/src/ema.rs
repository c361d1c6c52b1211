//! EMA + weekly peaks + weekend decay.
//!
//! ```text
//! ema        = EMA(α = 2/(period+1)) over [start − lookback, start]
//! historical = Σ peak_k·w_k / Σ w_k   for k = 1..3 weeks ago, w = [0.5, 0.3, 0.2]
//! combined   = ema_weight·ema + (1 − ema_weight)·historical
//! result     = ceil(combined · day_multiplier · (1 + safety_buffer)) ≥ min_instances
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Weekday};
use tracing::debug;
use warmpool_core::config::PredictorConfig;
use warmpool_state::{UtilizationHistoryStore, UtilizationRecord};

use crate::error::{PredictError, PredictResult};
use crate::{Prediction, PredictionInput, Predictor};

pub const WEEK_SECS: i64 = 7 * 24 * 3600;

/// Decay weights for one, two, and three weeks ago.
pub const HISTORY_WEIGHTS: [f64; 3] = [0.5, 0.3, 0.2];

pub struct EmaWeekendPredictor {
    history: Arc<dyn UtilizationHistoryStore>,
    config: PredictorConfig,
}

impl EmaWeekendPredictor {
    pub fn new(history: Arc<dyn UtilizationHistoryStore>, config: PredictorConfig) -> Self {
        Self { history, config }
    }

    /// EMA of the samples in order, seeded with the first one.
    fn ema(&self, records: &[UtilizationRecord]) -> f64 {
        let alpha = 2.0 / (f64::from(self.config.ema_period) + 1.0);
        let mut samples = records.iter().map(|r| f64::from(r.in_use_instances));
        let Some(first) = samples.next() else {
            return 0.0;
        };
        samples.fold(first, |ema, value| alpha * value + (1.0 - alpha) * ema)
    }

    /// Weighted mean of the weekly peaks that have data.
    async fn historical(&self, input: &PredictionInput) -> PredictResult<f64> {
        let mut weighted = 0.0;
        let mut weights = 0.0;
        for (k, weight) in HISTORY_WEIGHTS.iter().enumerate() {
            let offset = WEEK_SECS * (k as i64 + 1);
            let records = self
                .history
                .range(
                    &input.pool_name,
                    &input.variant_id,
                    input.start - offset,
                    input.end - offset,
                )
                .await?;
            if let Some(peak) = records.iter().map(|r| r.in_use_instances).max() {
                weighted += f64::from(peak) * weight;
                weights += weight;
            }
        }
        Ok(if weights > 0.0 { weighted / weights } else { 0.0 })
    }

    fn combine(&self, ema: f64, historical: f64) -> f64 {
        match (ema > 0.0, historical > 0.0) {
            (true, true) => {
                self.config.ema_weight * ema + (1.0 - self.config.ema_weight) * historical
            }
            (true, false) => ema,
            (false, true) => historical,
            (false, false) => 0.0,
        }
    }

    fn day_multiplier(&self, start: i64) -> f64 {
        let weekend = DateTime::from_timestamp(start, 0)
            .is_some_and(|t| matches!(t.weekday(), Weekday::Sat | Weekday::Sun));
        if weekend {
            self.config.weekend_multiplier
        } else {
            self.config.weekday_multiplier
        }
    }
}

#[async_trait]
impl Predictor for EmaWeekendPredictor {
    fn name(&self) -> &str {
        "ema_weekend"
    }

    async fn predict(&self, input: &PredictionInput) -> PredictResult<Prediction> {
        if input.end < input.start {
            return Err(PredictError::InvalidWindow {
                start: input.start,
                end: input.end,
            });
        }

        let lookback = i64::from(self.config.lookback_hours) * 3600;
        let recent = self
            .history
            .range(
                &input.pool_name,
                &input.variant_id,
                input.start - lookback,
                input.start,
            )
            .await?;
        let ema = self.ema(&recent);
        let historical = self.historical(input).await?;
        let combined = self.combine(ema, historical);

        let adjusted =
            combined * self.day_multiplier(input.start) * (1.0 + self.config.safety_buffer);
        let recommended = (adjusted.ceil().max(0.0) as u32).max(self.config.min_instances);

        debug!(
            pool = %input.pool_name,
            variant = %input.variant_id,
            window_start = input.start,
            samples = recent.len(),
            ema,
            historical,
            recommended,
            "prediction computed"
        );
        Ok(Prediction {
            recommended_instances: recommended,
        })
    }
}

#[cfg(test)]
mod tests {
    use warmpool_state::StateStore;

    use super::*;

    /// Wednesday 2024-01-03 12:00 UTC.
    const WEDNESDAY_NOON: i64 = 1_704_283_200;
    /// Saturday 2024-01-06 12:00 UTC.
    const SATURDAY_NOON: i64 = WEDNESDAY_NOON + 3 * 24 * 3600;

    fn predictor(store: &StateStore) -> EmaWeekendPredictor {
        EmaWeekendPredictor::new(Arc::new(store.clone()), PredictorConfig::default())
    }

    fn window(start: i64) -> PredictionInput {
        PredictionInput {
            pool_name: "linux".to_string(),
            variant_id: "default".to_string(),
            start,
            end: start + 1800,
        }
    }

    async fn record(store: &StateStore, in_use: u32, at: i64) {
        UtilizationHistoryStore::create(store, &UtilizationRecord::new("linux", "default", in_use, at))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn no_history_yields_minimum() {
        let store = StateStore::open_in_memory().unwrap();
        let prediction = predictor(&store).predict(&window(WEDNESDAY_NOON)).await.unwrap();
        assert_eq!(prediction.recommended_instances, 1);
    }

    #[tokio::test]
    async fn blends_recent_ema_with_weekly_peaks() {
        let store = StateStore::open_in_memory().unwrap();
        for hour in 1..=24 {
            record(&store, 10, WEDNESDAY_NOON - hour * 3600).await;
        }
        for (weeks, peak) in [(1, 20), (2, 15), (3, 12)] {
            let at = WEDNESDAY_NOON - weeks * WEEK_SECS + 600;
            record(&store, peak / 2, at - 300).await;
            record(&store, peak, at).await;
        }

        // 0.4·10 + 0.6·16.9 = 14.14; ×1.1 = 15.55.
        let prediction = predictor(&store).predict(&window(WEDNESDAY_NOON)).await.unwrap();
        assert_eq!(prediction.recommended_instances, 16);
    }

    #[tokio::test]
    async fn weekend_decays_demand() {
        let store = StateStore::open_in_memory().unwrap();
        for hour in 1..=24 {
            record(&store, 10, SATURDAY_NOON - hour * 3600).await;
        }
        // 10 × 0.7 × 1.1 = 7.7.
        let prediction = predictor(&store).predict(&window(SATURDAY_NOON)).await.unwrap();
        assert_eq!(prediction.recommended_instances, 8);
    }

    #[tokio::test]
    async fn history_alone_is_used_when_recent_is_empty() {
        let store = StateStore::open_in_memory().unwrap();
        record(&store, 4, WEDNESDAY_NOON - 2 * WEEK_SECS + 60).await;
        // Only week two has data: 4 × 1.1 = 4.4.
        let prediction = predictor(&store).predict(&window(WEDNESDAY_NOON)).await.unwrap();
        assert_eq!(prediction.recommended_instances, 5);
    }

    #[test]
    fn ema_follows_trend() {
        let store = StateStore::open_in_memory().unwrap();
        let p = predictor(&store);
        let records: Vec<UtilizationRecord> = [0, 0, 0, 13]
            .iter()
            .enumerate()
            .map(|(i, v)| UtilizationRecord::new("linux", "default", *v, i as i64))
            .collect();
        // α = 2/13; a single jump of 13 moves the EMA to 2.
        assert!((p.ema(&records) - 2.0).abs() < 1e-9);
        assert_eq!(p.ema(&[]), 0.0);
    }

    #[tokio::test]
    async fn rejects_inverted_window() {
        let store = StateStore::open_in_memory().unwrap();
        let input = PredictionInput {
            end: WEDNESDAY_NOON - 1,
            ..window(WEDNESDAY_NOON)
        };
        assert!(matches!(
            predictor(&store).predict(&input).await,
            Err(PredictError::InvalidWindow { .. })
        ));
    }
}
