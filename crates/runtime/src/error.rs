//! Host-facing error type
//!
//! Every failure mode of the sandbox surfaces to the embedding host as a
//! distinct kind, so hosts can tell "the script misbehaved" apart from
//! "the script hit its budget" apart from "the source was rejected".

use moat_core::ScriptError;

/// Errors returned from the host facade (`load`, `call`, `resume`).
#[derive(Debug, Clone)]
pub enum RuntimeError {
    /// The source text failed to compile.
    Compile(String),
    /// The source text exceeded the configured length cap; it was never
    /// handed to the compiler.
    ScriptTooLong { len: usize, max: usize },
    /// A script-level error escaped every protected call.
    Lua {
        message: String,
        traceback: Option<String>,
    },
    /// The instruction budget was exhausted. Carries the effective budget.
    LimitExceeded { max: u64 },
    /// An intermediate string outgrew the per-worker cap.
    StringLimitExceeded { max: usize },
    /// A worker discovered its host-side owner dropped every handle.
    Orphaned,
    /// An interpreter invariant was violated; a bug, not a script
    /// condition.
    Internal(String),
}

impl RuntimeError {
    /// Stable kind name, used by hosts mapping errors to exit codes.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::Compile(_) => "compile",
            RuntimeError::ScriptTooLong { .. } => "script-too-long",
            RuntimeError::Lua { .. } => "lua",
            RuntimeError::LimitExceeded { .. } => "limit-exceeded",
            RuntimeError::StringLimitExceeded { .. } => "string-limit-exceeded",
            RuntimeError::Orphaned => "orphaned",
            RuntimeError::Internal(_) => "internal",
        }
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::Compile(msg) => write!(f, "compile error: {msg}"),
            RuntimeError::ScriptTooLong { len, max } => {
                write!(f, "script is {len} bytes, cap is {max}")
            }
            RuntimeError::Lua { message, .. } => write!(f, "{message}"),
            RuntimeError::LimitExceeded { max } => {
                write!(f, "instruction budget exhausted (max {max})")
            }
            RuntimeError::StringLimitExceeded { max } => {
                write!(f, "string size cap exceeded (max {max} bytes)")
            }
            RuntimeError::Orphaned => write!(f, "worker orphaned by its host"),
            RuntimeError::Internal(msg) => write!(f, "internal interpreter error: {msg}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<ScriptError> for RuntimeError {
    fn from(e: ScriptError) -> RuntimeError {
        match e {
            ScriptError::Raised { value, traceback } => RuntimeError::Lua {
                message: value.display_string(),
                traceback,
            },
            ScriptError::LimitExceeded { max } => RuntimeError::LimitExceeded { max },
            ScriptError::StringLimitExceeded { max } => RuntimeError::StringLimitExceeded { max },
            ScriptError::Orphaned => RuntimeError::Orphaned,
            ScriptError::Internal(msg) => RuntimeError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct() {
        let kinds = [
            RuntimeError::Compile("x".into()).kind(),
            RuntimeError::ScriptTooLong { len: 2, max: 1 }.kind(),
            RuntimeError::Lua {
                message: "m".into(),
                traceback: None,
            }
            .kind(),
            RuntimeError::LimitExceeded { max: 1 }.kind(),
            RuntimeError::StringLimitExceeded { max: 1 }.kind(),
            RuntimeError::Orphaned.kind(),
            RuntimeError::Internal("x".into()).kind(),
        ];
        let unique: std::collections::HashSet<_> = kinds.iter().collect();
        assert_eq!(unique.len(), kinds.len());
    }

    #[test]
    fn limit_errors_convert_losslessly() {
        match RuntimeError::from(ScriptError::LimitExceeded { max: 50 }) {
            RuntimeError::LimitExceeded { max } => assert_eq!(max, 50),
            other => panic!("unexpected {other:?}"),
        }
    }
}
