//! Compile-time error type.

/// A positioned syntax or code-generation error.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub chunk: String,
    pub line: u32,
    pub message: String,
}

impl CompileError {
    pub fn new(chunk: &str, line: u32, message: impl Into<String>) -> CompileError {
        CompileError {
            chunk: chunk.to_string(),
            line,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.chunk, self.line, self.message)
    }
}

impl std::error::Error for CompileError {}
