//! Error types for the table engine.
//!
//! Everything funnels into the single root [`Error`] enum. Every variant carries a stable
//! machine-matchable [`Error::code`]; causes are preserved so callers can walk the chain.

use strum::{AsRefStr, Display as StrumDisplay};

use crate::Version;

/// A [`std::result::Result`] that has the engine [`Error`] as the error variant
pub type DeltaResult<T, E = Error> = std::result::Result<T, E>;

/// Subcodes for CDC failures, surfaced through [`Error::Cdc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CdcErrorCode {
    InvalidVersionRange,
    InvalidTimeRange,
    TableNotFound,
    CdcNotEnabled,
    StorageError,
    ParseError,
    EmptyWrite,
}

#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The object does not exist in the backing store.
    #[error("file not found: {path} ({operation})")]
    FileNotFound { path: String, operation: String },

    /// A conditional write observed a different object version than the caller expected.
    /// Non-retryable at the storage layer; the log boundary translates it to [`Error::Concurrency`].
    #[error("version mismatch on {path}: expected {expected:?}, actual {actual:?}")]
    VersionMismatch {
        path: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Any other backend failure, surfaced unchanged with path and operation attached.
    #[error("storage error on {path} ({operation}): {source}")]
    Storage {
        path: String,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An optimistic commit lost the race for its target version. Retryable.
    #[error("concurrent modification: expected version {expected}, actual version {actual}")]
    Concurrency { expected: Version, actual: Version },

    /// Schema mismatch, malformed variant, bad filter/projection spec, out-of-range version, ...
    #[error("validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
        value: Option<String>,
    },

    #[error("cdc error [{code}]: {message}")]
    Cdc { code: CdcErrorCode, message: String },

    /// Cancellation surfaced at a suspension point.
    #[error("operation aborted")]
    Aborted,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Generic(String),

    /// Unexpected engine state. Always a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn generic(msg: impl ToString) -> Self {
        Error::Generic(msg.to_string())
    }

    pub fn internal(msg: impl ToString) -> Self {
        Error::Internal(msg.to_string())
    }

    pub fn validation(msg: impl ToString) -> Self {
        Error::Validation {
            message: msg.to_string(),
            field: None,
            value: None,
        }
    }

    pub fn validation_for(field: impl ToString, value: impl ToString, msg: impl ToString) -> Self {
        Error::Validation {
            message: msg.to_string(),
            field: Some(field.to_string()),
            value: Some(value.to_string()),
        }
    }

    pub fn file_not_found(path: impl ToString, operation: impl ToString) -> Self {
        Error::FileNotFound {
            path: path.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn storage(
        path: impl ToString,
        operation: impl ToString,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Storage {
            path: path.to_string(),
            operation: operation.to_string(),
            source: Box::new(source),
        }
    }

    pub fn cdc(code: CdcErrorCode, msg: impl ToString) -> Self {
        Error::Cdc {
            code,
            message: msg.to_string(),
        }
    }

    /// Stable machine-matchable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::FileNotFound { .. } => "FILE_NOT_FOUND",
            Error::VersionMismatch { .. } => "VERSION_MISMATCH",
            Error::Storage { .. } => "STORAGE_ERROR",
            Error::Concurrency { .. } => "CONCURRENT_MODIFICATION",
            Error::Validation { .. } => "VALIDATION_ERROR",
            Error::Cdc { .. } => "CDC_ERROR",
            Error::Aborted => "ABORTED",
            Error::Json(_) => "JSON_ERROR",
            Error::Arrow(_) => "ARROW_ERROR",
            Error::Parquet(_) => "PARQUET_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Generic(_) => "GENERIC",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::FileNotFound { .. })
    }

    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, Error::VersionMismatch { .. })
    }

    pub fn is_concurrency(&self) -> bool {
        matches!(self, Error::Concurrency { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }

    /// Whether [`crate::retry::with_retry`] will retry this error by default.
    pub fn is_retryable(&self) -> bool {
        self.is_concurrency()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::generic("x").code(), "GENERIC");
        assert_eq!(
            Error::Concurrency {
                expected: 0,
                actual: 1
            }
            .code(),
            "CONCURRENT_MODIFICATION"
        );
        assert_eq!(Error::validation("bad").code(), "VALIDATION_ERROR");
        assert_eq!(
            Error::cdc(CdcErrorCode::CdcNotEnabled, "off").code(),
            "CDC_ERROR"
        );
    }

    #[test]
    fn only_concurrency_is_retryable() {
        assert!(Error::Concurrency {
            expected: 3,
            actual: 4
        }
        .is_retryable());
        assert!(!Error::validation("nope").is_retryable());
        assert!(!Error::file_not_found("p", "read").is_retryable());
        assert!(!Error::Aborted.is_retryable());
    }

    #[test]
    fn cdc_codes_render_screaming_snake() {
        assert_eq!(CdcErrorCode::InvalidVersionRange.to_string(), "INVALID_VERSION_RANGE");
        assert_eq!(CdcErrorCode::CdcNotEnabled.to_string(), "CDC_NOT_ENABLED");
    }
}
