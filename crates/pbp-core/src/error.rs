//! Error taxonomy
//!
//! Severity follows the processing scope: configuration errors stop a run
//! before any day starts, catalog errors skip one file, retrieval and analysis
//! errors degrade one segment, day-structural errors abandon one day.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PbpError {
    /// Invalid or incomplete configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// A listed file could not be turned into a record
    #[error("cannot catalog {name}: {reason}")]
    Catalog { name: String, reason: String },

    /// An object could not be made available locally
    #[error("cannot retrieve {uri}: {reason}")]
    Retrieval {
        uri: String,
        reason: String,
        retryable: bool,
    },

    /// The day cannot be processed at all
    #[error("day {date}: {reason}")]
    DayStructural { date: String, reason: String },

    /// The spectral step rejected a segment
    #[error("analysis failed: {0}")]
    Analysis(String),

    /// The day was aborted before completion
    #[error("day {0} cancelled")]
    Cancelled(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Regex(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, PbpError>;

impl PbpError {
    pub fn config(msg: impl Into<String>) -> Self {
        PbpError::Config(msg.into())
    }

    pub fn retrieval(uri: impl Into<String>, reason: impl ToString, retryable: bool) -> Self {
        PbpError::Retrieval {
            uri: uri.into(),
            reason: reason.to_string(),
            retryable,
        }
    }

    pub fn day(date: impl ToString, reason: impl ToString) -> Self {
        PbpError::DayStructural {
            date: date.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether repeating the failed operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            PbpError::Retrieval { retryable, .. } => *retryable,
            PbpError::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::InvalidInput
            ),
            _ => false,
        }
    }

    /// Errors that end the current day rather than one segment
    pub fn is_fatal_for_day(&self) -> bool {
        matches!(
            self,
            PbpError::DayStructural { .. } | PbpError::Cancelled(_) | PbpError::Config(_)
        )
    }
}
