//! Error kinds for the agent runtime.
//!
//! One hand-rolled enum per error kind, not one type per call site —
//! manual `Display`+`Error` impls, no `thiserror`.

use std::error::Error as StdError;
use std::fmt;

/// The error kinds named by the design's error-handling section.
#[derive(Debug)]
pub enum CoreError {
    /// The Shield rejected a byte sequence.
    InvalidInput { reason: String },
    /// The Document Parser failed on malformed bytes.
    InvalidDocument { reason: String },
    /// A required config option was missing or malformed.
    Config { reason: String },
    /// A region's backing buffer is exhausted.
    OutOfRegion,
    /// Filesystem or socket I/O failure.
    Io(std::io::Error),
    /// An HTTPS origin could not be reached.
    Connect { reason: String },
    /// A deadline elapsed.
    Timeout { reason: String },
    /// A tool or mesh node name lookup missed.
    NotFound { what: String },
    /// A fixed-capacity table (tool registry, mesh registry) is full.
    Full { what: String },
    /// A dispatched tool reported failure.
    ToolFailure { tool: String, reason: String },
    /// A structured response did not have the expected shape.
    Parse { reason: String },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::InvalidInput { reason } => write!(f, "invalid input: {reason}"),
            CoreError::InvalidDocument { reason } => write!(f, "invalid document: {reason}"),
            CoreError::Config { reason } => write!(f, "config error: {reason}"),
            CoreError::OutOfRegion => write!(f, "region exhausted"),
            CoreError::Io(e) => write!(f, "io error: {e}"),
            CoreError::Connect { reason } => write!(f, "connect error: {reason}"),
            CoreError::Timeout { reason } => write!(f, "timeout: {reason}"),
            CoreError::NotFound { what } => write!(f, "not found: {what}"),
            CoreError::Full { what } => write!(f, "full: {what}"),
            CoreError::ToolFailure { tool, reason } => {
                write!(f, "tool '{tool}' failed: {reason}")
            }
            CoreError::Parse { reason } => write!(f, "parse error: {reason}"),
        }
    }
}

impl StdError for CoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            CoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(e)
    }
}

/// Renders the way the chat bridge expects non-answer failures to look:
/// a single line beginning with `"Error: "`.
pub fn user_visible(err: &CoreError) -> String {
    format!("Error: {err}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_kind() {
        let e = CoreError::NotFound {
            what: "tool 'frobnicate'".to_string(),
        };
        assert_eq!(e.to_string(), "not found: tool 'frobnicate'");
    }

    #[test]
    fn user_visible_prefixes_error() {
        let e = CoreError::OutOfRegion;
        assert_eq!(user_visible(&e), "Error: region exhausted");
    }
}
