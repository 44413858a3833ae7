//! HTTP(S) transfer driver
//!
//! Performs a single resumable transfer attempt: a ranged GET streamed into
//! the destination file through the rate limiter, with the outcome
//! classified for the orchestrator's retry loop.

use crate::error::{classify_transport_error, EngineError};
use crate::source::parse_content_disposition;
use crate::{AttemptContext, AttemptOutcome};
use bwget_types::{NetworkConfig, ProgressEvent, TransferPhase};
use futures::StreamExt;
use reqwest::{header, Client, Proxy, StatusCode};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use url::Url;

/// Remote metadata gathered by a HEAD probe.
#[derive(Debug, Clone, Default)]
pub struct RemoteInfo {
    /// Filename suggested by `Content-Disposition`, if any.
    pub filename: Option<String>,
    /// Remote size from `Content-Length`, if known.
    pub size: Option<u64>,
    /// Whether the server advertises byte-range support.
    pub accepts_ranges: bool,
}

pub(crate) struct HttpDriver {
    client: Client,
}

impl HttpDriver {
    pub fn new(network: &NetworkConfig) -> Result<Self, EngineError> {
        let mut builder = Client::builder()
            .user_agent(network.user_agent.clone())
            .connect_timeout(network.request_timeout)
            .read_timeout(network.stream_timeout);

        if !network.verify_tls {
            warn!("TLS certificate verification disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(proxy) = &network.proxy {
            builder = builder.proxy(Proxy::all(proxy.as_str())?);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    /// HEAD probe for remote size, range support, and a filename hint.
    pub async fn probe(&self, url: &Url) -> Result<RemoteInfo, EngineError> {
        let resp = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(classify_transport_error)?;

        // Non-success HEAD responses (404, 405 on servers that refuse HEAD)
        // carry no authoritative metadata.
        if !resp.status().is_success() {
            return Ok(RemoteInfo::default());
        }

        let size = resp
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let accepts_ranges = resp
            .headers()
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("bytes"))
            .unwrap_or(false);
        let filename = resp
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_disposition);

        Ok(RemoteInfo {
            filename,
            size,
            accepts_ranges,
        })
    }

    /// Try to fetch a `<url>.sha256` sidecar checksum. Absence or malformed
    /// content is not an error, just `None`.
    pub async fn fetch_sidecar_digest(&self, url: &Url) -> Option<String> {
        let sidecar = format!("{}.sha256", url);
        let resp = self.client.get(&sidecar).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body = resp.text().await.ok()?;
        let digest = crate::source::parse_sidecar_digest(&body);
        if digest.is_some() {
            info!("loaded checksum from {}", sidecar);
        }
        digest
    }

    /// One transfer attempt, streaming into `dest` starting at
    /// `start_offset`.
    ///
    /// When `allow_rename` is set and the transfer starts from offset zero,
    /// a `Content-Disposition` filename on the GET response renames `dest`
    /// in place before any byte is written. This covers servers that refuse
    /// HEAD but still name the file on the GET.
    pub async fn attempt(
        &self,
        url: &Url,
        dest: &mut PathBuf,
        start_offset: u64,
        allow_rename: bool,
        ctx: &AttemptContext<'_>,
    ) -> AttemptOutcome {
        match self
            .run_attempt(url, dest, start_offset, allow_rename, ctx)
            .await
        {
            Ok(outcome) => outcome,
            Err(EngineError::Cancelled) => AttemptOutcome::Cancelled,
            Err(e) if e.is_retryable() => AttemptOutcome::Retryable(e),
            Err(e) => AttemptOutcome::Fatal(e),
        }
    }

    async fn run_attempt(
        &self,
        url: &Url,
        dest: &mut PathBuf,
        start_offset: u64,
        allow_rename: bool,
        ctx: &AttemptContext<'_>,
    ) -> Result<AttemptOutcome, EngineError> {
        ctx.sink.on_event(&ProgressEvent {
            phase: TransferPhase::Connecting,
            bytes_transferred: 0,
            total_bytes: None,
            elapsed: Duration::ZERO,
            rate: 0,
        });

        let ranged = start_offset > 0;
        let mut request = self.client.get(url.clone());
        if ranged {
            debug!("resuming with Range: bytes={}-", start_offset);
            request = request.header(header::RANGE, format!("bytes={}-", start_offset));
        }

        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(AttemptOutcome::Cancelled),
            resp = request.send() => resp.map_err(classify_transport_error)?,
        };

        let status = response.status();
        let mut offset = start_offset;
        match status {
            StatusCode::PARTIAL_CONTENT => {
                // Range honored; keep appending at the requested offset.
            }
            StatusCode::RANGE_NOT_SATISFIABLE if ranged => {
                // The partial file already covers the remote size.
                info!("server reports range not satisfiable; treating as complete");
                return Ok(AttemptOutcome::Completed { bytes_written: 0 });
            }
            StatusCode::OK if ranged => {
                // Server ignored the range: restart from zero and truncate,
                // otherwise the prefix would be written twice.
                warn!("server ignored range request; restarting from offset 0");
                offset = 0;
            }
            s if s.is_success() => {}
            s => return Err(EngineError::ServerRejected { status: s.as_u16() }),
        }

        // The GET is the last chance for a server-suggested filename. Only a
        // from-scratch write may rename; an append at offset > 0 is already
        // committed to its on-disk name.
        if allow_rename && offset == 0 {
            let suggested = response
                .headers()
                .get(header::CONTENT_DISPOSITION)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_disposition);
            if let Some(name) = suggested {
                if dest.file_name().map_or(true, |current| current != name.as_str()) {
                    info!("filename from Content-Disposition: {}", name);
                    *dest = dest.with_file_name(name);
                }
            }
        }

        let total = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|len| offset + len);

        if let Some(total) = total {
            ensure_disk_space(dest, total.saturating_sub(offset))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(dest)
            .await?;
        // Enforce on-disk length == start offset, both for a clean resume
        // append and for the 200-after-range restart.
        file.set_len(offset).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut stream = response.bytes_stream();
        let mut transferred = offset;
        let mut written_this_attempt = 0u64;
        let start = Instant::now();
        let mut last_emit = Instant::now();

        loop {
            let next = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    file.flush().await?;
                    return Ok(AttemptOutcome::Cancelled);
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(classify_transport_error)?;

            // Process in bounded slices so throttling and cancellation stay
            // responsive even for oversized network reads. Each slice is
            // written in full or not at all.
            for piece in chunk.chunks(ctx.chunk_size.max(1)) {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        file.flush().await?;
                        return Ok(AttemptOutcome::Cancelled);
                    }
                    _ = ctx.limiter.acquire(piece.len() as u64) => {}
                }

                file.write_all(piece).await?;
                transferred += piece.len() as u64;
                written_this_attempt += piece.len() as u64;

                if last_emit.elapsed() >= Duration::from_millis(250) {
                    let elapsed = start.elapsed();
                    let rate = if elapsed.as_secs_f64() > 0.0 {
                        (written_this_attempt as f64 / elapsed.as_secs_f64()) as u64
                    } else {
                        0
                    };
                    ctx.sink.on_event(&ProgressEvent {
                        phase: TransferPhase::Transferring,
                        bytes_transferred: transferred,
                        total_bytes: total,
                        elapsed,
                        rate,
                    });
                    last_emit = Instant::now();
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        if let Some(total) = total {
            if transferred < total {
                // The connection closed before the advertised length was
                // delivered; the partial file stays for the next attempt.
                return Err(EngineError::Interrupted(format!(
                    "stream ended at {} of {} bytes",
                    transferred, total
                )));
            }
        }

        let elapsed = start.elapsed();
        let rate = if elapsed.as_secs_f64() > 0.0 {
            (written_this_attempt as f64 / elapsed.as_secs_f64()) as u64
        } else {
            0
        };
        ctx.sink.on_event(&ProgressEvent {
            phase: TransferPhase::Transferring,
            bytes_transferred: transferred,
            total_bytes: total,
            elapsed,
            rate,
        });

        info!(
            "transfer attempt complete: {} bytes this attempt, {} on disk",
            written_this_attempt, transferred
        );
        Ok(AttemptOutcome::Completed {
            bytes_written: written_this_attempt,
        })
    }
}

/// Pre-flight free-space check against the destination's filesystem.
///
/// A confirmed shortfall aborts before the first byte is written; a failed
/// query (exotic filesystems, permissions) only warns, since the write
/// itself will surface any real problem.
fn ensure_disk_space(dest: &Path, required: u64) -> Result<(), EngineError> {
    if required == 0 {
        return Ok(());
    }
    let dir = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match fs2::available_space(dir) {
        Ok(available) if available < required => {
            Err(EngineError::InsufficientSpace {
                needed: required,
                available,
            })
        }
        Ok(_) => Ok(()),
        Err(e) => {
            warn!("could not check free disk space for {}: {}", dir.display(), e);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_space_check_passes_for_small_requirements() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        assert!(ensure_disk_space(&dest, 0).is_ok());
        assert!(ensure_disk_space(&dest, 4096).is_ok());
    }

    #[test]
    fn disk_space_check_rejects_impossible_requirements() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        match ensure_disk_space(&dest, u64::MAX) {
            Err(EngineError::InsufficientSpace { needed, .. }) => {
                assert_eq!(needed, u64::MAX);
            }
            other => panic!("expected InsufficientSpace, got {:?}", other.err()),
        }
    }
}
