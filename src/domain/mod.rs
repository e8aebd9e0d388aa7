//! Domain models - core types of the gate node
//!
//! This module contains the canonical data types used throughout the system:
//! - `PlateIdentifier` - validated plate token from the recognizer
//! - `AuthorizationOutcome` - classified controller decision
//! - `GateState` / `GatePosition` / `IndicatorState` - gate and lamp state
//! - `DecisionRecord` - audit record for each resolved plate event

pub mod decision;
pub mod types;

pub use decision::DecisionRecord;
pub use types::{
    AuthorizationOutcome, GatePosition, GateState, GateTransition, IndicatorState, PlateError,
    PlateIdentifier,
};
