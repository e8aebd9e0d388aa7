//! Decision records - one per resolved plate event

use crate::domain::types::{AuthorizationOutcome, PlateIdentifier};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Audit record for a single authorization cycle
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub id: String,
    pub plate: PlateIdentifier,
    pub outcome: AuthorizationOutcome,
    pub latency_ms: u64,
    pub decided_at: u64,
    /// Whether the gate was commanded open for this event
    pub opened: bool,
}

impl DecisionRecord {
    pub fn new(plate: PlateIdentifier, outcome: AuthorizationOutcome, latency_ms: u64) -> Self {
        Self {
            id: new_uuid_v7(),
            plate,
            outcome,
            latency_ms,
            decided_at: epoch_ms(),
            opened: outcome.is_authorized(),
        }
    }

    /// Serialize as a single JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
