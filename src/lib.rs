//! Parking gate node library
//!
//! Exposes modules for integration testing and binary reuse:
//! - `domain` - plates, gate states, outcomes and decision records
//! - `infra` - configuration and metrics
//! - `io` - controller client, actuators, decision egress, Prometheus
//! - `services` - the gate supervisor

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
