//! Capacity reservations ahead of provisioning.

use tracing::{debug, info, warn};
use warmpool_core::MachineConfig;
use warmpool_drivers::{DriverError, ReserveCapacityOptions};
use warmpool_metrics::names;
use warmpool_state::{CapacityReservation, StateError};

use crate::error::{ManagerError, ManagerResult};
use crate::manager::Manager;

/// Result of trying to reserve capacity for a stage.
#[derive(Debug, Clone, PartialEq)]
pub enum CapacityOutcome {
    Reserved(CapacityReservation),
    /// Every candidate pool refused for lack of capacity.
    Unavailable,
    /// No candidate pool's driver supports reservations.
    NotSupported,
}

impl Manager {
    /// Reserve capacity for `stage_id` in the first of `pools` that has it.
    ///
    /// Idempotent per stage: an existing reservation is returned as is.
    pub async fn handle_capacity_reservation(
        &self,
        stage_id: &str,
        pools: &[String],
        machine: &MachineConfig,
    ) -> ManagerResult<CapacityOutcome> {
        if stage_id.is_empty() {
            return Err(ManagerError::BadRequest("stage id is required".to_string()));
        }
        if pools.is_empty() {
            return Err(ManagerError::BadRequest("no candidate pools".to_string()));
        }
        if let Some(existing) = self.stores.reservations.find(stage_id).await? {
            debug!(stage = %stage_id, "reservation already held");
            return Ok(CapacityOutcome::Reserved(existing));
        }

        let mut unavailable = 0;
        for pool in pools {
            let entry = self.entry(pool)?;
            let resolved = entry.spec.resolve(machine);
            let opts = ReserveCapacityOptions {
                stage_id: stage_id.to_string(),
                pool_name: pool.clone(),
                requested_zone: machine.zone.clone().filter(|z| !z.is_empty()),
                machine: resolved,
            };
            let reservation = match entry.driver.reserve_capacity(&opts).await {
                Ok(reservation) => reservation,
                Err(DriverError::CapacityUnavailable) => {
                    self.metrics
                        .incr(names::CAPACITY_UNAVAILABLE, pool, &opts.machine.variant_id);
                    debug!(stage = %stage_id, %pool, "no capacity in pool");
                    unavailable += 1;
                    continue;
                }
                Err(DriverError::CapacityReservationNotSupported(driver)) => {
                    debug!(stage = %stage_id, %pool, %driver, "reservations not supported");
                    continue;
                }
                Err(e) => return Err(ManagerError::driver("reserve capacity", e)),
            };

            match self.stores.reservations.create(&reservation).await {
                Ok(()) => {}
                Err(StateError::AlreadyExists(_)) => {
                    // Lost a race with another request for the same stage.
                    warn!(stage = %stage_id, "stage reserved concurrently, releasing duplicate");
                    if let Err(e) = entry.driver.destroy_capacity(&reservation).await {
                        warn!(reservation = %reservation.reservation_id, error = %e, "failed to release duplicate reservation");
                    }
                    if let Some(existing) = self.stores.reservations.find(stage_id).await? {
                        return Ok(CapacityOutcome::Reserved(existing));
                    }
                    continue;
                }
                Err(e) => {
                    if let Err(release) = entry.driver.destroy_capacity(&reservation).await {
                        warn!(reservation = %reservation.reservation_id, error = %release, "failed to release unrecorded reservation");
                    }
                    return Err(e.into());
                }
            }
            info!(
                stage = %stage_id,
                %pool,
                reservation = %reservation.reservation_id,
                zone = %reservation.zone,
                "capacity reserved"
            );
            return Ok(CapacityOutcome::Reserved(reservation));
        }

        if unavailable > 0 {
            Ok(CapacityOutcome::Unavailable)
        } else {
            Ok(CapacityOutcome::NotSupported)
        }
    }
}
