//! Error types for notebook operations.
//!
//! Every failure the manager surfaces carries a [`ErrorKind`] so the transport
//! layer can report a stable machine-readable tag next to the message.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

pub type Result<T, E = NotebookError> = std::result::Result<T, E>;

/// Error type for notebook operations.
#[derive(Debug, thiserror::Error)]
pub enum NotebookError {
    #[error("Notebook {} not found", .0.display())]
    NotFound(PathBuf),

    #[error("Notebook {} already exists", .0.display())]
    AlreadyExists(PathBuf),

    #[error("Failed to load notebook {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("Could not acquire lock on {} within {:?}", .path.display(), .timeout)]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    #[error("No operations to undo for {}", .0.display())]
    NoHistory(PathBuf),

    #[error("Cell with ID {0} not found")]
    CellNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Stable category of a [`NotebookError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Corrupt,
    LockTimeout,
    ExecutionFailure,
    NoHistory,
    CellNotFound,
    InvalidArgument,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Corrupt => "corrupt",
            ErrorKind::LockTimeout => "lock_timeout",
            ErrorKind::ExecutionFailure => "execution_failure",
            ErrorKind::NoHistory => "no_history",
            ErrorKind::CellNotFound => "cell_not_found",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Io => "io",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl NotebookError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NotebookError::NotFound(_) => ErrorKind::NotFound,
            NotebookError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            NotebookError::Corrupt { .. } => ErrorKind::Corrupt,
            NotebookError::LockTimeout { .. } => ErrorKind::LockTimeout,
            NotebookError::ExecutionFailure(_) => ErrorKind::ExecutionFailure,
            NotebookError::NoHistory(_) => ErrorKind::NoHistory,
            NotebookError::CellNotFound(_) => ErrorKind::CellNotFound,
            NotebookError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            NotebookError::Io { .. } => ErrorKind::Io,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        NotebookError::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_snake_case() {
        let err = NotebookError::CellNotFound("abc".to_string());
        assert_eq!(err.kind(), ErrorKind::CellNotFound);
        assert_eq!(err.kind().as_str(), "cell_not_found");
        assert_eq!(
            serde_json::to_value(err.kind()).unwrap(),
            serde_json::json!("cell_not_found")
        );
    }

    #[test]
    fn test_messages_include_context() {
        let err = NotebookError::LockTimeout {
            path: PathBuf::from("/tmp/a.ipynb"),
            timeout: Duration::from_secs(1),
        };
        let message = err.to_string();
        assert!(message.contains("/tmp/a.ipynb"));
        assert!(message.contains("1s"));

        let err = NotebookError::io(
            "/tmp/b.ipynb",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("denied"));
    }
}
