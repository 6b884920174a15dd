//! Error types for the value analysis.
//!
//! Unmodelable constructs, arithmetic edge cases and overflow are *not* errors:
//! they evaluate to an unknown value and, at most, produce a log line. Only the
//! conditions below abort an edge, a refinement round, or option loading.

use thiserror::Error;

use crate::cfa::EdgeId;

/// Main error type for value-analysis operations.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The transfer relation met a construct it cannot classify.
    #[error("Unrecognized code on edge {edge}: {message}")]
    UnrecognizedCode { edge: EdgeId, message: String },

    /// A call to a function on the configured deny-list.
    #[error("Unsupported function '{function}' called on edge {edge}")]
    UnsupportedFunction { edge: EdgeId, function: String },

    /// The same error path was handed to the refiner twice.
    #[error("Refinement made no progress: error path {path_hash:016x} was already refined")]
    RefinementFailed { path_hash: u64 },

    /// A textual memory location could not be parsed.
    #[error("Invalid memory location '{0}'")]
    InvalidLocation(String),

    /// A malformed or failing query against a single state.
    #[error("Query error: {0}")]
    Query(String),

    /// Malformed initial precision file.
    #[error("Precision file, line {line}: {message}")]
    PrecisionFile { line: usize, message: String },

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AnalysisError {
    pub fn unrecognized(edge: EdgeId, message: impl Into<String>) -> Self {
        AnalysisError::UnrecognizedCode {
            edge,
            message: message.into(),
        }
    }

    pub fn query(message: impl Into<String>) -> Self {
        AnalysisError::Query(message.into())
    }

    /// Whether this is the distinguished "no progress" refinement failure.
    pub fn is_no_progress(&self) -> bool {
        matches!(self, AnalysisError::RefinementFailed { .. })
    }
}

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Unknown option in the `cpa.value` namespace
    #[error("Unknown option '{0}'")]
    UnknownOption(String),

    /// Option value of the wrong shape
    #[error("Invalid value '{value}' for option '{option}': expected {expected}")]
    InvalidValue {
        option: String,
        value: String,
        expected: &'static str,
    },

    /// Line that is neither a comment nor `key = value`
    #[error("Malformed line {line}: '{text}'")]
    MalformedLine { line: usize, text: String },

    /// Blacklist that does not compile
    #[error("Invalid variable blacklist: {0}")]
    Blacklist(#[from] regex::Error),
}

/// Result type alias for value-analysis operations
pub type Result<T> = std::result::Result<T, AnalysisError>;
