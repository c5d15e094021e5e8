//! Error handling module
//!
//! Provides the error taxonomy for a comparison run. Fatal errors
//! (`Connection`, `Configuration`) abort the run; per-table errors are
//! converted into [`SkipReason`]s and recorded in the result instead of
//! propagating.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Comparison-engine error type
#[derive(Error, Debug)]
pub enum CompareError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to introspect table {table}: {message}")]
    Introspection { table: String, message: String },

    #[error("failed to read table {table}: {message}")]
    Read { table: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, CompareError>;

/// Why a discovered table was not fully compared.
///
/// Every table found on either side ends up in the result, compared or
/// carrying one of these. Skips never abort the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum SkipReason {
    /// Table exists only on the right side
    MissingInLeft,
    /// Table exists only on the left side
    MissingInRight,
    /// Excluded by the table filter
    Excluded,
    /// No columns survived intersection and filtering
    NoCommonColumns,
    /// Metadata could not be read for this table
    Introspection(String),
    /// Row streaming failed mid-comparison
    ReadError(String),
    /// The run was cancelled before this table finished
    Cancelled,
}

impl SkipReason {
    /// Short human-readable label used by the text report
    pub fn describe(&self) -> String {
        match self {
            SkipReason::MissingInLeft => "skipped: missing in left database".to_string(),
            SkipReason::MissingInRight => "skipped: missing in right database".to_string(),
            SkipReason::Excluded => "skipped: excluded by filter".to_string(),
            SkipReason::NoCommonColumns => "skipped: no common columns".to_string(),
            SkipReason::Introspection(msg) => format!("skipped: introspection failed ({msg})"),
            SkipReason::ReadError(msg) => format!("skipped: read error ({msg})"),
            SkipReason::Cancelled => "skipped: cancelled".to_string(),
        }
    }
}

/// Helper function to create a configuration error
pub fn configuration_error(msg: impl Into<String>) -> CompareError {
    CompareError::Configuration(msg.into())
}
