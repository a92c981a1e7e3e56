//! Assembler-side errors. Runtime (loader/interpreter) errors live in
//! `agni_vm::error` instead, next to the code that raises them.

/// An assembly failure, always anchored to the 1-based source line
/// that caused it so a caller can report `<file>:<line>: error:
/// <reason>` without re-scanning (§4.2).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{line}: {message}")]
pub struct AssembleError {
    pub line: u32,
    pub message: String,
}

impl AssembleError {
    pub fn new(line: u32, message: impl Into<String>) -> AssembleError {
        AssembleError { line, message: message.into() }
    }
}
