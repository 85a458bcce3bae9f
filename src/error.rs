//! Error types for the advertisement aggregation core.

/// Result type returned by fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error raised by the aggregation core.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Detailed error message, if any.
    pub message: String,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, message: String::new() }
    }

    pub(crate) fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

/// Kind of error raised by the aggregation core.
///
/// Most failure conditions here are expected to be absorbed internally
/// (logged and skipped) rather than propagated; these variants cover the
/// cases where a caller genuinely needs to react.
#[derive(Debug, Clone, PartialEq, Eq, displaydoc::Display)]
#[non_exhaustive]
pub enum ErrorKind {
    /// scanner failed to start
    ScannerStartFailed,
    /// scanner timed out
    ScannerTimeout,
    /// management protocol framing error
    ManagementProtocolFramingError,
    /// management command failed with status {0}
    ManagementCommandFailed(u8),
    /// adapter recovery failed
    AdapterRecoveryFailed,
    /// subscriber callback failed
    CallbackFailure,
    /// internal error: {0}
    Internal(InternalErrorKind),
}

/// Internal error kind, used for conditions that should not occur given a
/// correctly behaving scanner but are not part of the public error contract.
#[derive(Debug, Clone, PartialEq, Eq, displaydoc::Display)]
#[non_exhaustive]
pub enum InternalErrorKind {
    /// truncated AD structure
    TruncatedAdStructure,
    /// frame too large: {0} bytes
    FrameTooLarge(usize),
    /// malformed persisted state: {0}
    MalformedPersistedState(String),
}
