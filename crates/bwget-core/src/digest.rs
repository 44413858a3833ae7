//! Streaming SHA-256 verification of completed files
//!
//! Verification is always a dedicated full-file pass after the transfer
//! finishes. Resumed attempts never carry an incremental accumulator, so
//! the result is independent of how many attempts it took to produce the
//! file.

use crate::error::EngineError;
use bwget_types::{ProgressEvent, ProgressSink, TransferPhase};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Result of comparing a file against an expected digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestCheck {
    Matched,
    Mismatched { actual: String },
}

/// True when `s` is a well-formed SHA-256 hex digest.
pub fn is_hex_digest(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Hash `path` in `block_size` reads and compare against `expected_hex`
/// (case-insensitive). The file is never loaded into memory at once.
///
/// An unreadable file is an I/O error, not a mismatch.
pub async fn verify_file(
    path: &Path,
    expected_hex: &str,
    block_size: usize,
    sink: &dyn ProgressSink,
) -> Result<DigestCheck, EngineError> {
    let mut file = File::open(path).await?;
    let total = file.metadata().await?.len();

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; block_size.max(1)];
    let mut hashed = 0u64;
    let start = Instant::now();

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        hashed += n as u64;

        let elapsed = start.elapsed();
        let rate = if elapsed.as_secs_f64() > 0.0 {
            (hashed as f64 / elapsed.as_secs_f64()) as u64
        } else {
            0
        };
        sink.on_event(&ProgressEvent {
            phase: TransferPhase::Verifying,
            bytes_transferred: hashed,
            total_bytes: Some(total),
            elapsed,
            rate,
        });
    }

    let actual = hex::encode(hasher.finalize());
    if actual.eq_ignore_ascii_case(expected_hex) {
        Ok(DigestCheck::Matched)
    } else {
        Ok(DigestCheck::Mismatched { actual })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bwget_types::NullSink;
    use tempfile::TempDir;

    // SHA-256 of the ASCII string "hello world"
    const HELLO_DIGEST: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn digest_format_validation() {
        assert!(is_hex_digest(HELLO_DIGEST));
        assert!(is_hex_digest(&HELLO_DIGEST.to_uppercase()));
        assert!(!is_hex_digest("abc123"));
        assert!(!is_hex_digest(&"g".repeat(64)));
        assert!(!is_hex_digest(""));
    }

    #[tokio::test]
    async fn matches_known_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let check = verify_file(&path, HELLO_DIGEST, 4, &NullSink).await.unwrap();
        assert_eq!(check, DigestCheck::Matched);
    }

    #[tokio::test]
    async fn comparison_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let upper = HELLO_DIGEST.to_uppercase();
        let check = verify_file(&path, &upper, 1024, &NullSink).await.unwrap();
        assert_eq!(check, DigestCheck::Matched);
    }

    #[tokio::test]
    async fn reports_actual_digest_on_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("other.txt");
        tokio::fs::write(&path, b"something else").await.unwrap();

        match verify_file(&path, HELLO_DIGEST, 1024, &NullSink).await.unwrap() {
            DigestCheck::Mismatched { actual } => {
                assert_eq!(actual.len(), 64);
                assert_ne!(actual, HELLO_DIGEST);
            }
            DigestCheck::Matched => panic!("expected mismatch"),
        }
    }

    #[tokio::test]
    async fn verification_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let first = verify_file(&path, HELLO_DIGEST, 3, &NullSink).await.unwrap();
        let second = verify_file(&path, HELLO_DIGEST, 3, &NullSink).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn missing_file_is_io_error_not_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.bin");

        let err = verify_file(&path, HELLO_DIGEST, 1024, &NullSink)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
