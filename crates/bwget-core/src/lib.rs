//! bwget core - the download engine
//!
//! One [`Engine::run`] call performs one transfer: it dispatches on the
//! request's source kind, drives the retry loop around driver attempts,
//! applies the bandwidth cap, and verifies the result against an optional
//! SHA-256 digest. Everything else (CLI, config files, progress rendering)
//! lives outside this crate and talks to it through [`bwget_types`].

mod digest;
mod error;
mod http;
mod rate_limit;
mod retry;
pub mod source;
mod torrent;

pub use digest::{is_hex_digest, verify_file, DigestCheck};
pub use error::EngineError;
pub use http::RemoteInfo;
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;

use bwget_types::{
    EngineConfig, ProgressSink, SourceKind, TransferRequest, TransferSummary,
};
use http::HttpDriver;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use torrent::TorrentDriver;
use tracing::{info, warn};
use url::Url;

/// Result of a single driver attempt, classified for the retry loop.
#[derive(Debug)]
pub(crate) enum AttemptOutcome {
    Completed { bytes_written: u64 },
    Retryable(EngineError),
    Fatal(EngineError),
    Cancelled,
}

/// Everything a driver needs besides the request itself.
pub(crate) struct AttemptContext<'a> {
    pub limiter: &'a RateLimiter,
    pub sink: &'a dyn ProgressSink,
    pub cancel: &'a CancellationToken,
    pub chunk_size: usize,
}

/// The download engine. Holds the immutable configuration and the transport
/// clients; one instance serves any number of sequential transfers.
pub struct Engine {
    config: EngineConfig,
    http: HttpDriver,
    torrent: TorrentDriver,
    limiter: RateLimiter,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(config: EngineConfig, sink: Arc<dyn ProgressSink>) -> Result<Self, EngineError> {
        let http = HttpDriver::new(&config.network)?;
        let torrent = TorrentDriver::new(config.torrent.clone(), config.download.bandwidth_limit);
        let limiter = RateLimiter::new(config.download.bandwidth_limit);
        Ok(Self {
            config,
            http,
            torrent,
            limiter,
            sink,
            cancel: CancellationToken::new(),
        })
    }

    /// The cooperative cancellation signal. Cancelling it aborts the active
    /// transfer at the next suspension point.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one transfer to a terminal result.
    pub async fn run(&self, request: &TransferRequest) -> Result<TransferSummary, EngineError> {
        if let Some(digest) = &request.expected_sha256 {
            if !is_hex_digest(digest) {
                return Err(EngineError::InvalidDigest(digest.clone()));
            }
        }

        match &request.source {
            SourceKind::Http(url) => self.run_http(url, request).await,
            _ => self.run_torrent(request).await,
        }
    }

    // ========================================================================
    // HTTP transfers
    // ========================================================================

    async fn run_http(
        &self,
        url: &Url,
        request: &TransferRequest,
    ) -> Result<TransferSummary, EngineError> {
        let started = Instant::now();

        // HEAD probe for size, range support, and a filename hint. Probe
        // failures are tolerated; the GET itself settles everything.
        let remote = match self.http.probe(url).await {
            Ok(info) => info,
            Err(e) => {
                warn!("HEAD probe failed for {}: {}", url, e);
                RemoteInfo::default()
            }
        };

        // An explicit output path that names a directory means "download
        // into it"; anything else fixes the filename outright.
        let (out_dir, explicit_name) = match &request.output {
            Some(path) if path.is_dir() => (Some(path.clone()), None),
            Some(path) => (None, Some(path.clone())),
            None => (None, None),
        };
        let explicit_output = explicit_name.is_some();
        let mut dest = match explicit_name {
            Some(path) => path,
            None => {
                let mut name = source::pick_filename(url, None);
                if let Some(hint) = &remote.filename {
                    info!("filename from Content-Disposition: {}", hint);
                    name = PathBuf::from(hint);
                }
                match &out_dir {
                    Some(dir) => dir.join(name),
                    None => name,
                }
            }
        };
        // Without a HEAD hint the GET response may still name the file.
        let allow_rename = !explicit_output && remote.filename.is_none();
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let expected = match &request.expected_sha256 {
            Some(digest) => Some(digest.to_ascii_lowercase()),
            None => self.http.fetch_sidecar_digest(url).await,
        };

        if request.resume {
            let on_disk = disk_len(&dest).await?;
            if let Some(total) = remote.size {
                if on_disk == total && total > 0 {
                    info!("{} already fully downloaded", dest.display());
                    let verified = self.verify_if_requested(&dest, expected.as_deref()).await?;
                    return Ok(TransferSummary {
                        path: dest,
                        bytes_written: on_disk,
                        verified,
                        elapsed: started.elapsed(),
                    });
                }
                if on_disk > total {
                    warn!(
                        "local file larger than remote ({} > {}); starting fresh",
                        on_disk, total
                    );
                    truncate(&dest).await?;
                }
            }
        } else {
            // Resuming disabled: discard any partial data once, before the
            // attempt sequence. Later retries still continue from whatever
            // the failed attempt managed to write.
            truncate(&dest).await?;
        }

        let policy = RetryPolicy::new(&self.config.retry);
        let mut attempt_index = 0u32;
        loop {
            let start_offset = disk_len(&dest).await?;
            let ctx = self.attempt_context();
            match self
                .http
                .attempt(url, &mut dest, start_offset, allow_rename, &ctx)
                .await
            {
                AttemptOutcome::Completed { .. } => break,
                AttemptOutcome::Cancelled => return Err(EngineError::Cancelled),
                AttemptOutcome::Fatal(e) => return Err(e),
                AttemptOutcome::Retryable(e) => {
                    attempt_index += 1;
                    self.backoff_or_bail(&policy, attempt_index, e).await?;
                }
            }
        }

        let bytes_written = disk_len(&dest).await?;
        let verified = self.verify_if_requested(&dest, expected.as_deref()).await?;
        Ok(TransferSummary {
            path: dest,
            bytes_written,
            verified,
            elapsed: started.elapsed(),
        })
    }

    // ========================================================================
    // Torrent transfers
    // ========================================================================

    async fn run_torrent(&self, request: &TransferRequest) -> Result<TransferSummary, EngineError> {
        let started = Instant::now();

        // An explicit output path names either the directory to download
        // into, or (when it is not a directory) the file to select from a
        // multi-file torrent.
        let (out_dir, requested_name) = match &request.output {
            Some(path) if path.is_dir() => (path.clone(), None),
            Some(path) => {
                let dir = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
                (dir, name)
            }
            None => (PathBuf::from("."), None),
        };
        tokio::fs::create_dir_all(&out_dir).await?;

        let expected = match (&request.expected_sha256, &request.source) {
            (Some(digest), _) => Some(digest.to_ascii_lowercase()),
            (None, SourceKind::TorrentUrl(url)) => self.http.fetch_sidecar_digest(url).await,
            _ => None,
        };

        let policy = RetryPolicy::new(&self.config.retry);
        let mut attempt_index = 0u32;
        let mut final_path: Option<PathBuf> = None;
        loop {
            let ctx = self.attempt_context();
            let (outcome, path) = self
                .torrent
                .attempt(
                    &request.source,
                    &out_dir,
                    requested_name.as_deref(),
                    request.resume,
                    &ctx,
                )
                .await;
            if path.is_some() {
                final_path = path;
            }
            match outcome {
                AttemptOutcome::Completed { .. } => break,
                AttemptOutcome::Cancelled => return Err(EngineError::Cancelled),
                AttemptOutcome::Fatal(e) => return Err(e),
                AttemptOutcome::Retryable(e) => {
                    attempt_index += 1;
                    self.backoff_or_bail(&policy, attempt_index, e).await?;
                }
            }
        }

        let dest = final_path.ok_or_else(|| {
            EngineError::Metadata("transfer finished without resolving a file path".to_string())
        })?;
        let bytes_written = disk_len(&dest).await?;
        let verified = self.verify_if_requested(&dest, expected.as_deref()).await?;
        Ok(TransferSummary {
            path: dest,
            bytes_written,
            verified,
            elapsed: started.elapsed(),
        })
    }

    // ========================================================================
    // Shared pieces
    // ========================================================================

    fn attempt_context(&self) -> AttemptContext<'_> {
        AttemptContext {
            limiter: &self.limiter,
            sink: self.sink.as_ref(),
            cancel: &self.cancel,
            chunk_size: self.config.download.chunk_size,
        }
    }

    /// Sleep out the backoff for retry number `attempt_index`, or convert
    /// the failure into exhaustion. The sleep is cancellation-interruptible.
    async fn backoff_or_bail(
        &self,
        policy: &RetryPolicy,
        attempt_index: u32,
        error: EngineError,
    ) -> Result<(), EngineError> {
        let Some(delay) = policy.next_delay(attempt_index) else {
            return Err(EngineError::RetriesExhausted {
                attempts: attempt_index,
                source: Box::new(error),
            });
        };
        warn!(
            "attempt {}/{} failed: {}; retrying in {:.1}s",
            attempt_index,
            policy.max_retries(),
            error,
            delay.as_secs_f64()
        );
        tokio::select! {
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// The dedicated full-file digest pass. A mismatch is its own terminal
    /// failure, distinct from transfer failure; the file is left in place.
    async fn verify_if_requested(
        &self,
        path: &Path,
        expected: Option<&str>,
    ) -> Result<bool, EngineError> {
        let Some(expected) = expected else {
            return Ok(false);
        };
        let check = verify_file(
            path,
            expected,
            self.config.download.hash_chunk_size,
            self.sink.as_ref(),
        )
        .await?;
        match check {
            DigestCheck::Matched => {
                info!("checksum OK for {}", path.display());
                Ok(true)
            }
            DigestCheck::Mismatched { actual } => Err(EngineError::DigestMismatch {
                expected: expected.to_string(),
                actual,
            }),
        }
    }
}

/// Current on-disk length of `path`; 0 when it does not exist yet.
async fn disk_len(path: &Path) -> Result<u64, EngineError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(EngineError::Io(e)),
    }
}

/// Truncate `path` to zero length if it exists.
async fn truncate(path: &Path) -> Result<(), EngineError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::Io(e)),
    }
}
