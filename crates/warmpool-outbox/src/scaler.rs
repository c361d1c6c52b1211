//! Predictive scaling of one pool for one window.
//!
//! ```text
//! for each variant (default first):
//!   predicted = Predictor::predict(pool, variant, window)
//!   target    = max(predicted, min_size)
//!   delta     = target − free
//!   delta > 0 → enqueue `delta` setup_instance jobs
//!   delta < 0 → Manager::scale_down(−delta)
//! ```
//!
//! Re-running a scale job re-reads the free counts, so repeated runs move
//! toward the same target instead of compounding destroys.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info};
use warmpool_core::{DEFAULT_VARIANT_ID, MachineConfig};
use warmpool_manager::Manager;
use warmpool_metrics::names;
use warmpool_predict::{PredictionInput, Predictor};
use warmpool_state::{InstanceQuery, OutboxJob, OutboxJobType, ScaleParams};

use crate::processor::JobHandler;

/// What scaling did for one variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantScale {
    pub variant_id: String,
    pub predicted: u32,
    pub target: u32,
    pub free: u32,
    pub enqueued: u32,
    pub destroyed: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleReport {
    pub variants: Vec<VariantScale>,
}

impl ScaleReport {
    pub fn enqueued(&self) -> u32 {
        self.variants.iter().map(|v| v.enqueued).sum()
    }

    pub fn destroyed(&self) -> u32 {
        self.variants.iter().map(|v| v.destroyed).sum()
    }
}

pub struct Scaler {
    manager: Manager,
    predictor: Arc<dyn Predictor>,
}

impl Scaler {
    pub fn new(manager: Manager, predictor: Arc<dyn Predictor>) -> Self {
        Self { manager, predictor }
    }

    /// Free (`created` or `hibernating`) instances per variant.
    async fn free_by_variant(&self, pool: &str) -> anyhow::Result<HashMap<String, u32>> {
        let mut free = HashMap::new();
        for instance in self.manager.list(pool, &InstanceQuery::default()).await? {
            if instance.is_free() {
                *free.entry(instance.variant_id).or_insert(0) += 1;
            }
        }
        Ok(free)
    }

    /// Bring every variant of `pool` to its predicted warm count.
    pub async fn scale(&self, pool: &str, window: ScaleParams) -> anyhow::Result<ScaleReport> {
        let entry = self.manager.registry().get(pool)?;
        let free = self.free_by_variant(pool).await?;
        let mut report = ScaleReport::default();

        for variant_id in &entry.spec.variant_ids() {
            let input = PredictionInput {
                pool_name: pool.to_string(),
                variant_id: variant_id.clone(),
                start: window.window_start,
                end: window.window_end,
            };
            let predicted = self
                .predictor
                .predict(&input)
                .await
                .with_context(|| format!("predict {pool}/{variant_id}"))?
                .recommended_instances;
            self.manager.metrics().set_gauge(
                names::PREDICTED_INSTANCES,
                pool,
                variant_id,
                i64::from(predicted),
            );

            let min_size = entry.spec.min_size_for(variant_id);
            let target = predicted.max(min_size);
            let current = free.get(variant_id).copied().unwrap_or(0);
            let mut step = VariantScale {
                variant_id: variant_id.clone(),
                predicted,
                target,
                free: current,
                enqueued: 0,
                destroyed: 0,
            };

            if target > current {
                let machine = MachineConfig {
                    variant_id: (variant_id != DEFAULT_VARIANT_ID).then(|| variant_id.clone()),
                    ..MachineConfig::default()
                };
                for _ in current..target {
                    self.manager.enqueue_setup(pool, &machine).await?;
                    step.enqueued += 1;
                }
            } else if current > target {
                let destroyed = self
                    .manager
                    .scale_down(pool, variant_id, current - target)
                    .await?;
                step.destroyed = destroyed as u32;
            }

            if step.enqueued > 0 || step.destroyed > 0 {
                info!(
                    %pool,
                    variant = %variant_id,
                    predictor = self.predictor.name(),
                    predicted,
                    target,
                    free = current,
                    enqueued = step.enqueued,
                    destroyed = step.destroyed,
                    "pool scaled"
                );
            } else {
                debug!(%pool, variant = %variant_id, predicted, target, "pool already at target");
            }
            report.variants.push(step);
        }
        Ok(report)
    }
}

/// Runs [`Scaler`] for `scale` jobs.
pub struct ScaleHandler {
    scaler: Scaler,
}

impl ScaleHandler {
    pub fn new(scaler: Scaler) -> Self {
        Self { scaler }
    }
}

#[async_trait]
impl JobHandler for ScaleHandler {
    fn job_type(&self) -> OutboxJobType {
        OutboxJobType::Scale
    }

    async fn handle(&self, job: &OutboxJob) -> anyhow::Result<()> {
        let window: ScaleParams = job.params()?;
        self.scaler
            .scale(&job.pool_name, window)
            .await
            .with_context(|| format!("scale pool {}", job.pool_name))?;
        Ok(())
    }
}
