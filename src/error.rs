//! Error types and Result alias.

use thiserror::Error;

/// Classified failure causes, mirrored into the caller's diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorCode {
    /// Malformed input: wrong field count, wrong type in a row,
    /// unparsable condition.
    #[error("bad argument")]
    BadArgument,
    /// Insert found an entry equal under the unique comparator.
    #[error("uniqueness violation")]
    UniquenessViolation,
    /// A non-nullable field was given a null value.
    #[error("nullability violation")]
    NullabilityViolation,
    /// LIKE escape option is not a single character, or a lone escape
    /// terminates the pattern.
    #[error("invalid escape sequence")]
    InvalidEscape,
    /// Internal inconsistency: parent page not found, root id mismatch.
    #[error("unexpected internal state")]
    Unexpected,
    /// Unsupported type, sort order, or projection at open negotiation.
    #[error("not supported")]
    NotSupported,
    /// Verification detected an inconsistency and stopped.
    #[error("verify aborted")]
    VerifyAborted,
    /// A long operation was cancelled by the caller.
    #[error("cancelled")]
    Cancel,
    /// On-disk state failed a structural check.
    #[error("corrupt data")]
    Corrupt,
}

#[derive(Debug, Clone)]
pub struct Error {
    code: ErrorCode,
    message: Option<String>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(m) => write!(f, "{}: {}", self.code, m),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::new(code)
    }
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Error {
            code,
            message: None,
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Error {
            code,
            message: Some(message.into()),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::new(ErrorCode::UniquenessViolation);
        assert_eq!(e.to_string(), "uniqueness violation");
        let e = Error::with_message(ErrorCode::Corrupt, "page 7");
        assert_eq!(e.to_string(), "corrupt data: page 7");
    }

    #[test]
    fn test_error_code_accessor() {
        let e = Error::new(ErrorCode::Cancel);
        assert_eq!(e.code(), ErrorCode::Cancel);
    }
}
