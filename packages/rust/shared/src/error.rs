//! Error types for the GTFS ETL.
//!
//! Library crates use [`GtfsEtlError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use chrono::NaiveDate;

/// Top-level error type for all GTFS ETL operations.
#[derive(Debug, thiserror::Error)]
pub enum GtfsEtlError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/download failure. Retried locally with backoff.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// Corrupt or missing archive member.
    #[error("extraction failure: {message}")]
    ExtractionFailure { message: String },

    /// A uniqueness invariant that should hold in the store was violated.
    #[error("unsupported state: {message}")]
    UnsupportedState { message: String },

    /// No uploaded snapshot within the lookback window for a target date.
    #[error(
        "no source date with a successful upload within {lookback_days} days on or before {date}"
    )]
    NoSourceDate { date: NaiveDate, lookback_days: u32 },

    /// External statistics engine failure.
    #[error("stats engine error: {0}")]
    Stats(String),

    /// Database or object storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad date window, invalid argument, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Stats table or record parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, GtfsEtlError>;

impl GtfsEtlError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an extraction failure from any displayable message.
    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::ExtractionFailure {
            message: msg.into(),
        }
    }

    /// Create an unsupported-state error from any displayable message.
    pub fn unsupported_state(msg: impl Into<String>) -> Self {
        Self::UnsupportedState {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Transient failures worth another attempt within the same date.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SourceUnavailable(_))
    }

    /// Failures that need an operator and must never be retried automatically.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnsupportedState { .. } | Self::NoSourceDate { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = GtfsEtlError::config("missing archive root");
        assert_eq!(err.to_string(), "config error: missing archive root");

        let err = GtfsEtlError::NoSourceDate {
            date: NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
            lookback_days: 10,
        };
        assert!(err.to_string().contains("within 10 days"));
        assert!(err.to_string().contains("2024-03-10"));
    }

    #[test]
    fn retry_and_fatal_classification() {
        assert!(GtfsEtlError::SourceUnavailable("timeout".into()).is_retryable());
        assert!(!GtfsEtlError::SourceUnavailable("timeout".into()).is_fatal());

        assert!(GtfsEtlError::unsupported_state("two open routes").is_fatal());
        assert!(!GtfsEtlError::unsupported_state("two open routes").is_retryable());

        assert!(!GtfsEtlError::extraction("bad crc").is_retryable());
        assert!(!GtfsEtlError::Storage("locked".into()).is_fatal());
    }
}
