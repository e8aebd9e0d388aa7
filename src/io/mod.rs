//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `wire` - Embedded controller request/response grammar
//! - `controller` - Authorization client that runs the controller executable
//! - `actuator` - Gate and indicator drivers (simulated, sysfs GPIO)
//! - `decision_log` - Decision output to file (JSONL format)
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod actuator;
pub mod controller;
pub mod decision_log;
pub mod prometheus;
pub mod wire;

// Re-export commonly used types
pub use actuator::{build_actuator, Actuator, ActuatorError};
pub use controller::{Authorizer, ProcessAuthorizer};
pub use decision_log::{create_decision_log, DecisionLog, DecisionSender};
