use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Problems with the shape of a batch. Raised before any transfer starts
/// and fatal to the whole batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("asset '{key}' of item '{item}' has no usable href")]
    MissingHref { item: String, key: String },

    #[error("unsupported scheme '{scheme}' in href {href}")]
    UnsupportedScheme { scheme: String, href: String },

    #[error("invalid href {href}: {reason}")]
    InvalidHref { href: String, reason: String },

    #[error("destination {path:?} is claimed by both {first} and {second}")]
    DestinationConflict {
        path: PathBuf,
        first: String,
        second: String,
    },

    #[error("duplicate key '{0}' in batch")]
    DuplicateKey(String),

    #[error("invalid destination template '{template}': {reason}")]
    Template { template: String, reason: String },

    #[error("item '{item}' has no collection id, required by the destination template")]
    MissingCollection { item: String },

    #[error("destination path {0:?} escapes the destination root")]
    UnsafePath(PathBuf),
}

/// Category of a per-asset failure, recorded in the batch report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    ClientRequest,
    SizeMismatch,
    ChecksumMismatch,
    Cancelled,
    Io,
}

impl ErrorKind {
    /// Only transient transport failures are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transport)
    }

    pub fn is_integrity(self) -> bool {
        matches!(self, Self::SizeMismatch | Self::ChecksumMismatch)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transport => "transport",
            Self::ClientRequest => "client request",
            Self::SizeMismatch => "size mismatch",
            Self::ChecksumMismatch => "checksum mismatch",
            Self::Cancelled => "cancelled",
            Self::Io => "io",
        };
        f.write_str(name)
    }
}

/// Failure of a single fetch attempt.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("transport error for {uri}: {message}")]
    Transport { uri: String, message: String },

    #[error("request for {uri} rejected: {message}")]
    ClientRequest { uri: String, message: String },

    #[error("size mismatch for {uri}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        uri: String,
        expected: u64,
        actual: u64,
    },

    #[error("checksum mismatch for {uri}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        uri: String,
        expected: String,
        actual: String,
    },

    #[error("transfer of {uri} cancelled")]
    Cancelled { uri: String },

    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::ClientRequest { .. } => ErrorKind::ClientRequest,
            Self::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            Self::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify a non-success HTTP status. Request timeouts and rate limiting
    /// are transient even though they are 4xx.
    pub fn from_status(uri: &str, status: u16) -> Self {
        let message = format!("HTTP {status}");
        match status {
            408 | 429 | 500..=599 => Self::Transport {
                uri: uri.to_string(),
                message,
            },
            _ => Self::ClientRequest {
                uri: uri.to_string(),
                message,
            },
        }
    }

    pub fn from_reqwest(uri: &str, err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(uri, status.as_u16());
        }
        if err.is_builder() {
            return Self::ClientRequest {
                uri: uri.to_string(),
                message: err.to_string(),
            };
        }
        Self::Transport {
            uri: uri.to_string(),
            message: err.to_string(),
        }
    }
}

/// Error as it is kept in a report: the kind plus the last message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&FetchError> for ErrorRecord {
    fn from(err: &FetchError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(FetchError::from_status("u", 404).kind(), ErrorKind::ClientRequest);
        assert_eq!(FetchError::from_status("u", 403).kind(), ErrorKind::ClientRequest);
        assert_eq!(FetchError::from_status("u", 503).kind(), ErrorKind::Transport);
        assert_eq!(FetchError::from_status("u", 429).kind(), ErrorKind::Transport);
        assert_eq!(FetchError::from_status("u", 408).kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Transport.is_retryable());
        for kind in [
            ErrorKind::ClientRequest,
            ErrorKind::SizeMismatch,
            ErrorKind::ChecksumMismatch,
            ErrorKind::Cancelled,
            ErrorKind::Io,
        ] {
            assert!(!kind.is_retryable(), "{kind} should not be retried");
        }
    }
}
