//! Simulated actuator for laptop demos and tests

use super::Actuator;
use crate::domain::types::{GatePosition, IndicatorState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy)]
struct Outputs {
    position: GatePosition,
    indicators: IndicatorState,
}

/// Renders the gate to the log and models travel with a sleep
pub struct SimulatedActuator {
    travel_time: Duration,
    outputs: Mutex<Outputs>,
}

impl SimulatedActuator {
    pub fn new(travel_time: Duration) -> Self {
        Self {
            travel_time,
            outputs: Mutex::new(Outputs {
                position: GatePosition::Closed,
                indicators: IndicatorState::for_position(GatePosition::Closed),
            }),
        }
    }

    fn render(position: GatePosition) -> (&'static str, &'static str) {
        match position {
            GatePosition::Open => ("OPEN  [|||||||      ]", "GREEN"),
            GatePosition::Closed => ("CLOSE [|||||||||||||]", "RED"),
        }
    }
}

#[async_trait]
impl Actuator for SimulatedActuator {
    async fn set_position(&self, target: GatePosition) {
        let previous = {
            let mut outputs = self.outputs.lock();
            let previous = outputs.position;
            // Position and lamps change under one lock so observers never see a mix
            *outputs = Outputs { position: target, indicators: IndicatorState::for_position(target) };
            previous
        };

        let (gate, led) = Self::render(target);
        info!(gate = %gate, led = %led, "actuator_command");

        if previous != target && !self.travel_time.is_zero() {
            tokio::time::sleep(self.travel_time).await;
        }
    }

    fn indicators(&self) -> IndicatorState {
        self.outputs.lock().indicators
    }

    fn position(&self) -> GatePosition {
        self.outputs.lock().position
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}
