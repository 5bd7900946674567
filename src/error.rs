//! Error types for the block cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the block cache
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Block size hint in a path is not a positive integer
    #[error("Invalid block size '{value}' in path {path}")]
    InvalidBlockSize { path: String, value: String },

    // =========================================================================
    // Cache Metadata Errors
    // =========================================================================
    /// Malformed cache metadata record
    #[error("Malformed cache info record: {0}")]
    InfoFormat(String),

    /// Cache metadata record written by an unknown format version
    #[error("Unsupported cache info version {found} (expected {expected})")]
    UnsupportedInfoVersion { found: i32, expected: i32 },

    // =========================================================================
    // Fetch Errors
    // =========================================================================
    /// Remote source failed a range read
    #[error("Remote fetch of {path} at offset {offset} failed: {reason}")]
    RemoteFetch {
        path: String,
        offset: u64,
        reason: String,
    },

    /// Remote source returned fewer bytes than the block layout requires
    #[error("Short remote read of {path} at offset {offset}: expected {expected}, got {got}")]
    ShortRemoteRead {
        path: String,
        offset: u64,
        expected: usize,
        got: usize,
    },

    /// Worker was closed before the requested range was fetched
    #[error("Block worker for {path} block {block} closed before range was fetched")]
    WorkerClosed { path: String, block: u64 },
}

impl Error {
    /// Returns true when the same read may succeed if issued again.
    ///
    /// Fetch failures, format errors and configuration errors are final for the
    /// lifetime of the current cache instance. A closed worker never restarts,
    /// so `WorkerClosed` is final too; reading again needs a fresh attach.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Rebuild an equivalent error so it can be handed to several waiters.
    ///
    /// Only the fetch-side variants are reproduced exactly; anything else is
    /// flattened into a `RemoteFetch` carrying the original message.
    pub(crate) fn duplicate(&self, path: &str, offset: u64) -> Error {
        match self {
            Error::RemoteFetch {
                path,
                offset,
                reason,
            } => Error::RemoteFetch {
                path: path.clone(),
                offset: *offset,
                reason: reason.clone(),
            },
            Error::ShortRemoteRead {
                path,
                offset,
                expected,
                got,
            } => Error::ShortRemoteRead {
                path: path.clone(),
                offset: *offset,
                expected: *expected,
                got: *got,
            },
            Error::UnsupportedInfoVersion { found, expected } => Error::UnsupportedInfoVersion {
                found: *found,
                expected: *expected,
            },
            Error::InfoFormat(msg) => Error::InfoFormat(msg.clone()),
            Error::WorkerClosed { path, block } => Error::WorkerClosed {
                path: path.clone(),
                block: *block,
            },
            other => Error::RemoteFetch {
                path: path.to_string(),
                offset,
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let closed = Error::WorkerClosed {
            path: "/a".to_string(),
            block: 3,
        };
        assert!(!closed.is_retryable());
        assert!(Error::Io(std::io::ErrorKind::Interrupted.into()).is_retryable());

        let fetch = Error::RemoteFetch {
            path: "/a".to_string(),
            offset: 0,
            reason: "boom".to_string(),
        };
        assert!(!fetch.is_retryable());
        assert!(!Error::Config("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_duplicate_preserves_fetch_errors() {
        let err = Error::RemoteFetch {
            path: "/data/file".to_string(),
            offset: 4096,
            reason: "connection reset".to_string(),
        };
        let copy = err.duplicate("/ignored", 0);
        assert_eq!(copy.to_string(), err.to_string());
    }

    #[test]
    fn test_duplicate_flattens_io_errors() {
        let err = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        let copy = err.duplicate("/data/file", 100);
        match copy {
            Error::RemoteFetch {
                path,
                offset,
                reason,
            } => {
                assert_eq!(path, "/data/file");
                assert_eq!(offset, 100);
                assert!(reason.contains("disk gone"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
