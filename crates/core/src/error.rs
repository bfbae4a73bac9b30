//! Script-visible and sandbox error values raised during execution.

use crate::value::Value;

/// An error travelling up the interpreter's call stack.
///
/// Only `Raised` is a script-level condition that `pcall` may catch; the
/// other kinds are sandbox enforcement and bypass every protected frame.
#[derive(Debug, Clone)]
pub enum ScriptError {
    /// A script-raised error: arithmetic/type/index faults or an explicit
    /// `error(...)` call. The payload is an arbitrary value, most commonly
    /// a `source:line: message` string.
    Raised { value: Value, traceback: Option<String> },
    /// The per-worker instruction budget was exhausted. Carries the
    /// effective budget. Never catchable from script.
    LimitExceeded { max: u64 },
    /// An intermediate string would have exceeded the per-worker string
    /// size cap. Never catchable from script.
    StringLimitExceeded { max: usize },
    /// A suspended worker discovered its host-side owner went away.
    Orphaned,
    /// An interpreter invariant was violated. A bug, not a script
    /// condition; aborts the call with a diagnostic.
    Internal(String),
}

impl ScriptError {
    /// Shorthand for a raised string message.
    pub fn raised(message: impl Into<String>) -> ScriptError {
        ScriptError::Raised {
            value: Value::from(message.into()),
            traceback: None,
        }
    }

    /// Whether a protected call (`pcall`/`xpcall`) may convert this error
    /// into a `(false, message)` return.
    pub fn catchable(&self) -> bool {
        matches!(self, ScriptError::Raised { .. })
    }

    /// The error payload as seen by an error handler.
    pub fn value(&self) -> Value {
        match self {
            ScriptError::Raised { value, .. } => value.clone(),
            other => Value::from(other.to_string()),
        }
    }
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::Raised { value, .. } => write!(f, "{}", value.display_string()),
            ScriptError::LimitExceeded { max } => {
                write!(f, "instruction budget exhausted (max {max})")
            }
            ScriptError::StringLimitExceeded { max } => {
                write!(f, "string size cap exceeded (max {max} bytes)")
            }
            ScriptError::Orphaned => write!(f, "worker orphaned by its host"),
            ScriptError::Internal(msg) => write!(f, "internal interpreter error: {msg}"),
        }
    }
}

impl std::error::Error for ScriptError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_raised_is_catchable() {
        assert!(ScriptError::raised("boom").catchable());
        assert!(!ScriptError::LimitExceeded { max: 50 }.catchable());
        assert!(!ScriptError::StringLimitExceeded { max: 100 }.catchable());
        assert!(!ScriptError::Orphaned.catchable());
        assert!(!ScriptError::Internal("bad".into()).catchable());
    }

    #[test]
    fn limit_error_reports_budget() {
        let e = ScriptError::LimitExceeded { max: 50 };
        assert!(e.to_string().contains("50"));
    }
}
