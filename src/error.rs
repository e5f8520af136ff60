//! Error types for the GEMM to PIM toolchain

use thiserror::Error;

/// Result type for scheduling and assembly operations
pub type CompileResult<T> = Result<T, CompileError>;

/// Toolchain errors
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("line {line}: unknown mnemonic '{mnemonic}'")]
    UnknownMnemonic { line: usize, mnemonic: String },

    #[error("line {line}: {message}")]
    Grammar { line: usize, message: String },

    #[error("line {line}: unresolved operand '{token}'")]
    UnresolvedOperand { line: usize, token: String },

    #[error("line {line}: {what} index {index} exceeds capacity {capacity}")]
    Capacity {
        line: usize,
        what: String,
        index: usize,
        capacity: usize,
    },

    #[error("line {line}: {stream} stream exhausted")]
    StreamExhausted { line: usize, stream: String },

    #[error("{stream} line {line}: invalid hex token '{token}'")]
    BadRecord {
        stream: String,
        line: usize,
        token: String,
    },

    #[error("Scheduling error: {message}")]
    Schedule { message: String },

    #[error("Scheduling error: a {packet}-word packet at SW{width} does not fit a VWR half of {half_words} words")]
    RegisterHalf {
        packet: usize,
        width: u32,
        half_words: usize,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Coarse error taxonomy used when reporting failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Grammar,
    Resource,
    StreamExhaustion,
    Environment,
}

impl CompileError {
    pub fn grammar(line: usize, msg: impl Into<String>) -> Self {
        CompileError::Grammar { line, message: msg.into() }
    }

    pub fn unresolved(line: usize, token: impl Into<String>) -> Self {
        CompileError::UnresolvedOperand { line, token: token.into() }
    }

    pub fn capacity(line: usize, what: impl Into<String>, index: usize, capacity: usize) -> Self {
        CompileError::Capacity {
            line,
            what: what.into(),
            index,
            capacity,
        }
    }

    pub fn exhausted(line: usize, stream: impl Into<String>) -> Self {
        CompileError::StreamExhausted { line, stream: stream.into() }
    }

    pub fn schedule(msg: impl Into<String>) -> Self {
        CompileError::Schedule { message: msg.into() }
    }

    pub fn register_half(packet: usize, width: u32, half_words: usize) -> Self {
        CompileError::RegisterHalf {
            packet,
            width,
            half_words,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        CompileError::Config { message: msg.into() }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            CompileError::UnknownMnemonic { .. }
            | CompileError::Grammar { .. }
            | CompileError::UnresolvedOperand { .. } => ErrorCategory::Grammar,
            CompileError::Capacity { .. }
            | CompileError::Schedule { .. }
            | CompileError::RegisterHalf { .. } => ErrorCategory::Resource,
            CompileError::StreamExhausted { .. } | CompileError::BadRecord { .. } => {
                ErrorCategory::StreamExhaustion
            }
            CompileError::Config { .. } | CompileError::Io(_) | CompileError::Json(_) => {
                ErrorCategory::Environment
            }
        }
    }

    /// Source line the error refers to, when it has one
    pub fn line(&self) -> Option<usize> {
        match self {
            CompileError::UnknownMnemonic { line, .. }
            | CompileError::Grammar { line, .. }
            | CompileError::UnresolvedOperand { line, .. }
            | CompileError::Capacity { line, .. }
            | CompileError::StreamExhausted { line, .. } => Some(*line),
            _ => None,
        }
    }
}

/// A non-fatal finding recorded while scheduling or assembling
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Diagnostic {
    /// Assembly line, when the finding is tied to one
    pub line: Option<usize>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(line: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {}: {}", line, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}
