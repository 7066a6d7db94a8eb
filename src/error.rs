use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by every public operation of the library.
///
/// Each variant maps to one [`ErrorKind`], which is what callers on the far
/// side of the HTTP boundary see.
#[derive(Debug, Error)]
pub enum Error {
    /// A privileged operation was refused by the user or the OS.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("overlay client is not installed")]
    NotInstalled,

    /// The overlay client process cannot be controlled.
    #[error("overlay daemon unreachable: {0}")]
    DaemonUnreachable(String),

    #[error("timed out after {elapsed_ms}ms waiting for {what}")]
    Timeout { what: String, elapsed_ms: u64 },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("job {0} is already running")]
    ConflictAlreadyRunning(String),

    #[error("authentication failed for {0}")]
    AuthenticationFailed(String),

    /// The host could be resolved but not queried.
    #[error("host not reachable: {0}")]
    NotReachable(String),

    /// Wraps an I/O fault during a mirror run. Progress made before the
    /// fault is kept on the job.
    #[error("transfer failed on {path}: {source}")]
    TransferError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid input: {0}")]
    ValidationError(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    PermissionDenied,
    NotInstalled,
    DaemonUnreachable,
    Timeout,
    NotFound,
    ConflictAlreadyRunning,
    AuthenticationFailed,
    NotReachable,
    TransferError,
    ValidationError,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::NotInstalled => ErrorKind::NotInstalled,
            Error::DaemonUnreachable(_) => ErrorKind::DaemonUnreachable,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::ConflictAlreadyRunning(_) => ErrorKind::ConflictAlreadyRunning,
            Error::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            Error::NotReachable(_) => ErrorKind::NotReachable,
            Error::TransferError { .. } => ErrorKind::TransferError,
            Error::ValidationError(_) => ErrorKind::ValidationError,
            Error::Storage(_) | Error::Io(_) => ErrorKind::Internal,
        }
    }

    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound { what, id: id.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::ValidationError(message.into())
    }

    pub fn transfer(path: impl Into<String>, source: std::io::Error) -> Self {
        Error::TransferError {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_variants() {
        assert_eq!(Error::NotInstalled.kind(), ErrorKind::NotInstalled);
        assert_eq!(
            Error::not_found("job", "abc").kind(),
            ErrorKind::NotFound
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        assert_eq!(Error::transfer("a/b", io).kind(), ErrorKind::TransferError);
        assert_eq!(
            Error::from(std::io::Error::new(std::io::ErrorKind::Other, "x")).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn messages_name_the_subject() {
        let err = Error::not_found("share", "nas/photos");
        assert_eq!(err.to_string(), "share not found: nas/photos");
        let err = Error::Timeout {
            what: "connection path".into(),
            elapsed_ms: 3000,
        };
        assert!(err.to_string().contains("3000ms"));
    }
}
