// crates/core/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when reading a JSONL file (history log or transcript)
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("File not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Permission denied reading file: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ParseError {
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }

    /// Missing files and denied reads are expected while another process
    /// mutates the tree; callers degrade to empty results for these.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::PermissionDenied { .. })
    }
}

/// Errors surfaced by destructive repository operations.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Failed to remove transcript {path}: {source}")]
    RemoveTranscript {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to rewrite history log {path}: {source}")]
    RewriteLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::not_found("/path/to/file.jsonl");
        assert!(err.to_string().contains("/path/to/file.jsonl"));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_parse_error_io_classification() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = ParseError::io("/test/path", io_err);
        assert!(matches!(err, ParseError::NotFound { .. }));
        assert!(err.is_transient());

        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = ParseError::io("/test/path", io_err);
        assert!(matches!(err, ParseError::PermissionDenied { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_parse_error_io_other() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout");
        let err = ParseError::io("/test/path", io_err);
        assert!(matches!(err, ParseError::Io { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_index_error_display() {
        let err = IndexError::SessionNotFound("abc".into());
        assert_eq!(err.to_string(), "Session not found: abc");

        let err = IndexError::RewriteLog {
            path: PathBuf::from("/tmp/history.jsonl"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        assert!(err.to_string().contains("/tmp/history.jsonl"));
        assert!(err.to_string().contains("disk full"));
    }
}
