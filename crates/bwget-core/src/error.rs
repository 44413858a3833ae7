//! Error types for the bwget engine

use thiserror::Error;

/// Errors that can occur while running a transfer.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("server rejected request: HTTP {status}")]
    ServerRejected { status: u16 },

    #[error("transfer interrupted: {0}")]
    Interrupted(String),

    #[error("TLS certificate verification failed: {0}")]
    TlsUntrusted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not enough disk space: need {needed} bytes, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("invalid URL or source: {0}")]
    InvalidUrl(String),

    #[error("invalid SHA-256 digest {0:?} (must be 64 hex characters)")]
    InvalidDigest(String),

    #[error("SHA-256 mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("download cancelled")]
    Cancelled,

    #[error("torrent metadata could not be resolved: {0}")]
    Metadata(String),

    #[error("peer connection failed: {0}")]
    Peer(String),

    #[error("torrent error: {0}")]
    Torrent(#[source] anyhow::Error),

    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Check if another attempt could succeed where this one failed.
    ///
    /// Connection drops, timeouts, 5xx responses, and torrent peer failures
    /// are worth retrying; everything else (bad status, bad digest, local
    /// filesystem errors, untrusted certificates) will fail the same way
    /// again.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Network(_) | EngineError::Interrupted(_) | EngineError::Peer(_) => true,
            EngineError::ServerRejected { status } => *status >= 500,
            _ => false,
        }
    }
}

/// Classify a reqwest error, splitting TLS trust failures out of the
/// transient network class.
///
/// reqwest does not expose certificate errors as a distinct variant, so the
/// source chain is inspected; a match is fatal since retrying will not make
/// a certificate valid.
pub(crate) fn classify_transport_error(err: reqwest::Error) -> EngineError {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&err);
    while let Some(cause) = source {
        let text = cause.to_string();
        if text.contains("certificate") || text.contains("UnknownIssuer") {
            return EngineError::TlsUntrusted(err.to_string());
        }
        source = cause.source();
    }
    EngineError::Network(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_retryable_above_500() {
        assert!(EngineError::ServerRejected { status: 500 }.is_retryable());
        assert!(EngineError::ServerRejected { status: 503 }.is_retryable());
        assert!(!EngineError::ServerRejected { status: 404 }.is_retryable());
        assert!(!EngineError::ServerRejected { status: 403 }.is_retryable());
    }

    #[test]
    fn fatal_classes_are_not_retryable() {
        assert!(!EngineError::InvalidDigest("xyz".into()).is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(!EngineError::TlsUntrusted("bad cert".into()).is_retryable());
        assert!(!EngineError::Io(std::io::Error::other("disk full")).is_retryable());
        assert!(!EngineError::InsufficientSpace {
            needed: 10,
            available: 1
        }
        .is_retryable());
        assert!(!EngineError::Metadata("no metadata".into()).is_retryable());
    }

    #[test]
    fn peer_failures_are_retryable() {
        assert!(EngineError::Peer("tracker timeout".into()).is_retryable());
    }
}
