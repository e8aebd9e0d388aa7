//! Gate actuator drivers
//!
//! One contract, two implementations selected at startup from config:
//! - `simulated` - console rendering with modelled travel time
//! - `gpio` - Linux sysfs GPIO lamps plus a PWM servo
//!
//! Indicators follow the commanded position: they switch when a command is
//! issued, before the gate has finished travelling.

pub mod gpio;
pub mod simulated;

use crate::domain::types::{GatePosition, IndicatorState};
use crate::infra::config::{Config, DriverKind};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub use gpio::GpioActuator;
pub use simulated::SimulatedActuator;

/// Hardware failure while bringing up an actuator (fatal at startup)
#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("failed to initialize {what} at {path}: {source}")]
    Init {
        what: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Gate actuator with red/green status lamps
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Command the gate toward `target` and resolve once actuation completes.
    ///
    /// Re-commanding the current target re-asserts the lamps and returns
    /// without travel.
    async fn set_position(&self, target: GatePosition);

    /// Current lamp outputs
    fn indicators(&self) -> IndicatorState;

    /// Last commanded position
    fn position(&self) -> GatePosition;

    fn name(&self) -> &'static str;
}

/// Build the configured actuator. Errors here must stop the process.
pub fn build_actuator(config: &Config) -> Result<Arc<dyn Actuator>, ActuatorError> {
    let actuator: Arc<dyn Actuator> = match config.driver() {
        DriverKind::Simulated => Arc::new(SimulatedActuator::new(config.travel_time())),
        DriverKind::Gpio => Arc::new(GpioActuator::open(config.gpio(), config.travel_time())?),
    };

    info!(driver = %config.driver().as_str(), "actuator_ready");
    Ok(actuator)
}
