//! Embedded controller request/response contract
//!
//! Request: `<binary> <park_flag> <PLATE>`
//!
//! Response (stdout, at most `MAX_RESPONSE_LEN` bytes):
//! - Zero or more diagnostic lines
//! - A final non-empty verdict line:
//!   - `APPROVED` [SP plate]
//!   - `DENIED` [SP reason]
//!
//! An `APPROVED` line naming a different plate cannot be attributed to the
//! request and is a protocol error.

use crate::domain::types::PlateIdentifier;

/// Upper bound on captured stdout/stderr
pub const MAX_RESPONSE_LEN: usize = 4096;

pub const TOKEN_APPROVED: &str = "APPROVED";
pub const TOKEN_DENIED: &str = "DENIED";

/// Parsed verdict line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    Denied { reason: Option<String> },
}

/// Why a response did not match the grammar
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    Empty,
    NotUtf8,
    TooLarge,
    UnknownVerdict(String),
    PlateMismatch { expected: String, got: String },
}

impl WireError {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireError::Empty => "empty",
            WireError::NotUtf8 => "not_utf8",
            WireError::TooLarge => "too_large",
            WireError::UnknownVerdict(_) => "unknown_verdict",
            WireError::PlateMismatch { .. } => "plate_mismatch",
        }
    }
}

/// Build the controller argv tail for a plate
pub fn request_args<'a>(park_flag: &'a str, plate: &'a PlateIdentifier) -> [&'a str; 2] {
    [park_flag, plate.as_str()]
}

/// Parse raw controller stdout into a verdict
pub fn parse_response(raw: &[u8], plate: &PlateIdentifier) -> Result<Verdict, WireError> {
    if raw.len() > MAX_RESPONSE_LEN {
        return Err(WireError::TooLarge);
    }

    let text = std::str::from_utf8(raw).map_err(|_| WireError::NotUtf8)?;
    let line = verdict_line(text).ok_or(WireError::Empty)?;

    let (token, rest) = match line.split_once(char::is_whitespace) {
        Some((token, rest)) => (token, rest.trim()),
        None => (line, ""),
    };

    match token {
        TOKEN_APPROVED => {
            if rest.is_empty() || rest == plate.as_str() {
                Ok(Verdict::Approved)
            } else {
                Err(WireError::PlateMismatch {
                    expected: plate.as_str().to_string(),
                    got: rest.to_string(),
                })
            }
        }
        TOKEN_DENIED => {
            let reason = (!rest.is_empty()).then(|| rest.to_string());
            Ok(Verdict::Denied { reason })
        }
        _ => Err(WireError::UnknownVerdict(line.to_string())),
    }
}

/// Last non-empty trimmed line
fn verdict_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rev().find(|l| !l.is_empty())
}

/// Diagnostic lines preceding the verdict
pub fn diagnostics(raw: &[u8]) -> impl Iterator<Item = &str> {
    let text = std::str::from_utf8(raw).unwrap_or_default();
    let mut lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    lines.pop();
    lines.into_iter()
}
