//! Services - business logic and state management
//!
//! - `supervisor` - Gate state machine: plate intake, authorization
//!   handshake, actuation and auto-close

pub mod supervisor;

// Re-export commonly used types
pub use supervisor::{GateEvent, GateSupervisor, SupervisorHandle};
