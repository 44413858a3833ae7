//! Shared types for bwget
//!
//! This crate contains the data structures shared between the download
//! engine and the CLI: the transfer request, the resolved configuration,
//! and the progress event stream.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

// ============================================================================
// Source & Request Types
// ============================================================================

/// What kind of resource a request points at.
///
/// Resolved once when the request is constructed; the engine dispatches on
/// the variant and never re-inspects the raw input string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Plain HTTP(S) resource.
    Http(Url),
    /// A `.torrent` metainfo file served over HTTP(S).
    TorrentUrl(Url),
    /// A `.torrent` metainfo file on the local filesystem.
    TorrentFile(PathBuf),
    /// A magnet URI (metadata resolved via DHT/peer exchange).
    Magnet(String),
}

impl SourceKind {
    /// Whether this source goes through the torrent driver.
    pub fn is_torrent(&self) -> bool {
        !matches!(self, SourceKind::Http(_))
    }
}

/// Immutable input to one download.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub source: SourceKind,
    /// Explicit output path; derived from the source when absent.
    pub output: Option<PathBuf>,
    /// Continue from an existing partial file instead of starting over.
    pub resume: bool,
    /// Expected SHA-256 digest (64 hex chars), verified after completion.
    pub expected_sha256: Option<String>,
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Fully resolved engine configuration.
///
/// Built once by the caller (config file + CLI flags) and moved into the
/// engine at construction. The engine performs no config discovery itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub network: NetworkConfig,
    pub download: DownloadConfig,
    pub retry: RetryConfig,
    pub torrent: TorrentConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            download: DownloadConfig::default(),
            retry: RetryConfig::default(),
            torrent: TorrentConfig::default(),
        }
    }
}

/// Transport configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub user_agent: String,
    /// Timeout for short metadata requests (HEAD, sidecar digest).
    pub request_timeout: Duration,
    /// Read timeout while streaming a body.
    pub stream_timeout: Duration,
    /// Proxy endpoint passed through to the transport, if any.
    pub proxy: Option<String>,
    /// TLS certificate verification (disabling is per-request trust only).
    pub verify_tls: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("bwget/{}", env!("CARGO_PKG_VERSION")),
            request_timeout: Duration::from_secs(15),
            stream_timeout: Duration::from_secs(30),
            proxy: None,
            verify_tls: true,
        }
    }
}

/// Transfer behavior configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Read/write chunk size for streaming bodies.
    pub chunk_size: usize,
    /// Block size for the post-transfer digest pass.
    pub hash_chunk_size: usize,
    /// Bandwidth cap in bytes/second (0 = unlimited).
    pub bandwidth_limit: u64,
    /// Whether downloads resume by default.
    pub resume_default: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1 << 18,
            hash_chunk_size: 1 << 20,
            bandwidth_limit: 0,
            resume_default: true,
        }
    }
}

/// Retry/backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retries after the initial attempt.
    pub max_retries: u32,
    /// Base delay; doubles on every subsequent retry.
    pub base_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
        }
    }
}

/// Torrent driver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentConfig {
    /// First port of the peer listen range.
    pub listen_port_start: u16,
    /// One past the last port of the peer listen range.
    pub listen_port_end: u16,
    /// Peer connection cap (0 = backend default).
    pub max_peers: u32,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            listen_port_start: 6881,
            listen_port_end: 6891,
            max_peers: 0,
        }
    }
}

// ============================================================================
// Progress Types
// ============================================================================

/// Which stage of a transfer a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferPhase {
    /// Opening the connection; no byte counts yet.
    Connecting,
    /// Torrent metadata resolution; total size unknown.
    ResolvingMetadata,
    /// Bytes are flowing.
    Transferring,
    /// Post-transfer digest pass over the completed file.
    Verifying,
}

/// A progress snapshot emitted repeatedly during a transfer.
///
/// `bytes_transferred` is monotonic non-decreasing within one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: TransferPhase,
    pub bytes_transferred: u64,
    /// Unknown until headers/metadata resolve.
    pub total_bytes: Option<u64>,
    pub elapsed: Duration,
    /// Current transfer rate in bytes/second.
    pub rate: u64,
}

/// Anything that can consume progress events.
///
/// Decouples the engine from the rendering technology; the CLI attaches an
/// indicatif-backed sink, tests attach [`NullSink`].
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// A sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_event(&self, _event: &ProgressEvent) {}
}

// ============================================================================
// Result Types
// ============================================================================

/// Terminal success payload for one transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSummary {
    /// Final destination file.
    pub path: PathBuf,
    /// On-disk length at completion.
    pub bytes_written: u64,
    /// True when a digest was supplied and matched.
    pub verified: bool,
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.base_backoff, Duration::from_secs(1));
        assert_eq!(cfg.download.chunk_size, 256 * 1024);
        assert_eq!(cfg.download.hash_chunk_size, 1024 * 1024);
        assert!(cfg.download.resume_default);
        assert!(cfg.network.verify_tls);
        assert_eq!(cfg.torrent.listen_port_start, 6881);
    }

    #[test]
    fn source_kind_torrent_dispatch() {
        let http = SourceKind::Http(Url::parse("https://example.com/a").unwrap());
        assert!(!http.is_torrent());
        assert!(SourceKind::Magnet("magnet:?xt=urn:btih:abc".into()).is_torrent());
        assert!(SourceKind::TorrentFile(PathBuf::from("a.torrent")).is_torrent());
    }
}
