//! Typed errors for the file formats.

use thiserror::Error;

/// Errors raised while reading or writing the tool's file formats.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("cannot open file {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse {what} in {path}: '{line}'")]
    Parse {
        what: &'static str,
        path: String,
        line: String,
    },

    #[error("missing tag '{tag}' in {path}")]
    MissingTag { tag: &'static str, path: String },

    #[error("read an incorrect number of values for '{tag}' in {path}: expected {expected}, got {got}")]
    ValueCount {
        tag: &'static str,
        path: String,
        expected: usize,
        got: usize,
    },

    #[error("duplicate timestamp {timestamp} for sensor id {sensor}")]
    DuplicateTimestamp { timestamp: f64, sensor: usize },

    #[error("{0}")]
    Format(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
