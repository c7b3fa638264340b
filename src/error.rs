//! Error types for ssh-utils

use std::fmt;

use thiserror::Error;

/// Best-effort classification of a failure, inferred from error-stream text.
///
/// The numeric values follow the SFTP status codes most remote tools echo in
/// their messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// "No such file or directory"
    NoSuchFile = 2,
    /// "Permission denied" / "Operation not permitted"
    PermissionDenied = 3,
    /// The elevation secret was rejected
    AuthenticationFailed = 5,
}

impl ErrorCode {
    /// Numeric value of the code
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorCode::NoSuchFile => "no such file",
            ErrorCode::PermissionDenied => "permission denied",
            ErrorCode::AuthenticationFailed => "authentication failed",
        };
        write!(f, "{} ({})", text, self.as_u32())
    }
}

/// Main error type for ssh-utils
#[derive(Debug, Clone, Error)]
pub enum SshError {
    /// Credentials or settings cannot be resolved into a usable identity
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport or authentication failure while connecting
    #[error("SSH connection error: {0}")]
    Connect(String),

    /// A channel could not be opened for a command
    #[error("Failed to open channel: {0}")]
    Exec(String),

    /// The elevation secret was rejected
    #[error("Elevation failed: {0}")]
    ChallengeFailure(String),

    /// A command wrote to its error stream
    #[error("{message}")]
    Command {
        /// Trimmed error-stream content
        message: String,
        /// Classified code, when the text is recognized
        code: Option<ErrorCode>,
    },

    /// A single file or directory operation failed
    #[error("Transfer failed for {path}: {message}")]
    Transfer {
        /// Path the operation was acting on
        path: String,
        /// Underlying diagnostic text
        message: String,
        /// Classified code, when the text is recognized
        code: Option<ErrorCode>,
    },

    /// A batch finished with some of its tasks failed
    #[error("{failed} of {total} tasks failed, first error: {first}")]
    BatchPartialFailure {
        /// Number of failed tasks
        failed: usize,
        /// Number of attempted tasks
        total: usize,
        /// First failure encountered
        first: Box<SshError>,
    },

    /// Invalid parameters supplied by the caller
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),

    /// Local IO error
    #[error("IO error: {0}")]
    Io(String),
}

/// Result type alias using SshError
pub type Result<T> = std::result::Result<T, SshError>;

impl From<std::io::Error> for SshError {
    fn from(err: std::io::Error) -> Self {
        SshError::Io(err.to_string())
    }
}

impl SshError {
    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        SshError::Config(msg.into())
    }

    /// Create a connection error from a string
    pub fn connect(msg: impl Into<String>) -> Self {
        SshError::Connect(msg.into())
    }

    /// Create a channel-open error from a string
    pub fn exec(msg: impl Into<String>) -> Self {
        SshError::Exec(msg.into())
    }

    /// Create an elevation failure from a string
    pub fn challenge_failure(msg: impl Into<String>) -> Self {
        SshError::ChallengeFailure(msg.into())
    }

    /// Create an invalid params error from a string
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        SshError::InvalidParams(msg.into())
    }

    /// Create a transfer error for `path`
    pub fn transfer(
        path: impl Into<String>,
        message: impl Into<String>,
        code: Option<ErrorCode>,
    ) -> Self {
        SshError::Transfer {
            path: path.into(),
            message: message.into(),
            code,
        }
    }

    /// Classified code carried by this error, if any
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            SshError::Command { code, .. } | SshError::Transfer { code, .. } => *code,
            SshError::ChallengeFailure(_) => Some(ErrorCode::AuthenticationFailed),
            SshError::BatchPartialFailure { first, .. } => first.code(),
            _ => None,
        }
    }

    /// Re-label a command failure as a transfer failure on `path`
    pub fn into_transfer(self, path: impl Into<String>) -> Self {
        let path = path.into();
        match self {
            SshError::Command { message, code } => SshError::Transfer {
                path,
                message,
                code,
            },
            SshError::Transfer { .. } => self,
            other => {
                let code = other.code();
                SshError::Transfer {
                    path,
                    message: other.to_string(),
                    code,
                }
            }
        }
    }
}
