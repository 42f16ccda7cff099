//! Structured failures shared by every stage of the engine.
//!
//! Each [`Error`] carries a stable numeric code and at most four string
//! arguments, so it can cross an FFI or IPC boundary as a plain
//! [`ErrorRecord`] without losing its kind.

/// Every failure the engine can report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("failed to scan '{path}': {detail}")]
    Scan { path: String, detail: String },

    #[error("no files to archive")]
    EmptyArchive,

    #[error("unknown transform '{script_id}'")]
    Transform { script_id: String },

    #[error("invalid compression level {value}, expected 0..=9")]
    InvalidLevel { value: u32 },

    #[error("failed to read '{path}': {detail}")]
    Read { path: String, detail: String },

    #[error("sink failure: {detail}")]
    Sink { detail: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {detail}")]
    Internal { detail: String },

    #[error("invalid archive: {detail}")]
    InvalidArchive { detail: String },

    #[error("checksum mismatch for '{path}': expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        path: String,
        expected: u32,
        actual: u32,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn scan(path: impl Into<String>, source: &anyhow::Error) -> Self {
        Self::Scan {
            path: path.into(),
            detail: format!("{source:#}"),
        }
    }

    pub(crate) fn read(path: impl Into<String>, source: impl std::fmt::Display) -> Self {
        Self::Read {
            path: path.into(),
            detail: format!("{source:#}"),
        }
    }

    pub(crate) fn sink(source: &anyhow::Error) -> Self {
        Self::Sink {
            detail: format!("{source:#}"),
        }
    }

    pub(crate) fn internal(detail: impl Into<String>) -> Self {
        Self::Internal {
            detail: detail.into(),
        }
    }

    pub(crate) fn invalid_archive(detail: impl std::fmt::Display) -> Self {
        Self::InvalidArchive {
            detail: format!("{detail:#}"),
        }
    }

    /// Stable numeric discriminant of this error kind.
    pub fn code(&self) -> u32 {
        match self {
            Error::Scan { .. } => 0x01,
            Error::EmptyArchive => 0x02,
            Error::Transform { .. } => 0x03,
            Error::InvalidLevel { .. } => 0x04,
            Error::Read { .. } => 0x05,
            Error::Sink { .. } => 0x06,
            Error::Cancelled => 0x07,
            Error::Internal { .. } => 0x08,
            Error::InvalidArchive { .. } => 0x09,
            Error::ChecksumMismatch { .. } => 0x0A,
        }
    }

    /// Whether this is the cancellation outcome rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Flattened form of an [`Error`]: a code plus four free-form slots.
///
/// Unused slots are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorRecord {
    pub code: u32,
    pub arg0: String,
    pub arg1: String,
    pub arg2: String,
    pub arg3: String,
}

impl ErrorRecord {
    fn new(code: u32, args: &[&str]) -> Self {
        let arg = |i: usize| args.get(i).map(|s| s.to_string()).unwrap_or_default();
        Self {
            code,
            arg0: arg(0),
            arg1: arg(1),
            arg2: arg(2),
            arg3: arg(3),
        }
    }
}

impl From<&Error> for ErrorRecord {
    fn from(err: &Error) -> Self {
        let code = err.code();
        match err {
            Error::Scan { path, detail } | Error::Read { path, detail } => {
                Self::new(code, &[path, detail])
            }
            Error::Transform { script_id } => Self::new(code, &[script_id]),
            Error::InvalidLevel { value } => Self::new(code, &[&value.to_string()]),
            Error::Sink { detail }
            | Error::Internal { detail }
            | Error::InvalidArchive { detail } => Self::new(code, &[detail]),
            Error::ChecksumMismatch {
                path,
                expected,
                actual,
            } => Self::new(
                code,
                &[path, &format!("{expected:08x}"), &format!("{actual:08x}")],
            ),
            Error::EmptyArchive | Error::Cancelled => Self::new(code, &[]),
        }
    }
}

impl From<Error> for ErrorRecord {
    fn from(err: Error) -> Self {
        Self::from(&err)
    }
}
