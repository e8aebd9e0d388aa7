//! Shared types for the parking gate node

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::time::Instant;

/// Default upper bound on plate length (characters)
pub const DEFAULT_PLATE_MAX_LEN: usize = 32;

/// Why a raw OCR string was refused as a plate identifier
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlateError {
    #[error("plate is empty")]
    Empty,
    #[error("plate length {len} exceeds maximum {max}")]
    TooLong { len: usize, max: usize },
    #[error("plate contains invalid character {ch:?} at index {index}")]
    InvalidChar { ch: char, index: usize },
}

/// Validated license plate token: `^[A-Z0-9-]{1,max_len}$`
///
/// The inner string is only reachable through validation, so anything holding a
/// `PlateIdentifier` may forward it to the controller as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PlateIdentifier(String);

impl PlateIdentifier {
    /// Validate `raw` against the plate grammar with the given length bound
    pub fn parse(raw: &str, max_len: usize) -> Result<Self, PlateError> {
        if raw.is_empty() {
            return Err(PlateError::Empty);
        }

        let len = raw.chars().count();
        if len > max_len {
            return Err(PlateError::TooLong { len, max: max_len });
        }

        if let Some((index, ch)) = raw.chars().enumerate().find(|(_, c)| !is_plate_char(*c)) {
            return Err(PlateError::InvalidChar { ch, index });
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[inline]
fn is_plate_char(c: char) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-'
}

impl FromStr for PlateIdentifier {
    type Err = PlateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, DEFAULT_PLATE_MAX_LEN)
    }
}

impl fmt::Display for PlateIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PlateIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Commanded actuator position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatePosition {
    Closed,
    Open,
}

impl GatePosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatePosition::Closed => "closed",
            GatePosition::Open => "open",
        }
    }
}

/// Red/green status lamps
///
/// Only constructible from a position, so both lamps can never be lit together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndicatorState {
    red: bool,
    green: bool,
}

impl IndicatorState {
    pub const fn for_position(position: GatePosition) -> Self {
        match position {
            GatePosition::Closed => Self { red: true, green: false },
            GatePosition::Open => Self { red: false, green: true },
        }
    }

    pub fn red(&self) -> bool {
        self.red
    }

    pub fn green(&self) -> bool {
        self.green
    }
}

impl Default for IndicatorState {
    fn default() -> Self {
        Self::for_position(GatePosition::Closed)
    }
}

/// Supervisor state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    #[default]
    Closed,
    AwaitingAuthorization,
    Opening,
    Open,
    Closing,
}

impl GateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateState::Closed => "closed",
            GateState::AwaitingAuthorization => "awaiting_authorization",
            GateState::Opening => "opening",
            GateState::Open => "open",
            GateState::Closing => "closing",
        }
    }

    /// Value for the gate state gauge (0=closed, 1=awaiting, 2=moving, 3=open)
    pub fn gauge(&self) -> u64 {
        match self {
            GateState::Closed => 0,
            GateState::AwaitingAuthorization => 1,
            GateState::Opening | GateState::Closing => 2,
            GateState::Open => 3,
        }
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified result of one authorization request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationOutcome {
    Authorized,
    Denied,
    Timeout,
    ControllerUnavailable,
    MalformedResponse,
}

impl AuthorizationOutcome {
    pub const ALL: [AuthorizationOutcome; 5] = [
        AuthorizationOutcome::Authorized,
        AuthorizationOutcome::Denied,
        AuthorizationOutcome::Timeout,
        AuthorizationOutcome::ControllerUnavailable,
        AuthorizationOutcome::MalformedResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorizationOutcome::Authorized => "authorized",
            AuthorizationOutcome::Denied => "denied",
            AuthorizationOutcome::Timeout => "timeout",
            AuthorizationOutcome::ControllerUnavailable => "controller_unavailable",
            AuthorizationOutcome::MalformedResponse => "malformed_response",
        }
    }

    #[inline]
    pub fn is_authorized(&self) -> bool {
        matches!(self, AuthorizationOutcome::Authorized)
    }

    /// Stable index for per-outcome counters
    #[inline]
    pub fn index(&self) -> usize {
        match self {
            AuthorizationOutcome::Authorized => 0,
            AuthorizationOutcome::Denied => 1,
            AuthorizationOutcome::Timeout => 2,
            AuthorizationOutcome::ControllerUnavailable => 3,
            AuthorizationOutcome::MalformedResponse => 4,
        }
    }
}

impl fmt::Display for AuthorizationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change published by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateTransition {
    pub from: GateState,
    pub to: GateState,
    pub at: Instant,
}
