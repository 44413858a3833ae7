//! Torrent transfer driver
//!
//! Wraps a librqbit session for single-file BitTorrent/magnet downloads.
//! Each attempt owns its own session: metadata is resolved (list-only add),
//! exactly one file is selected, and only that file's pieces are fetched.
//! The session is dropped on completion, so nothing is ever seeded.
//!
//! File selection from a multi-file torrent is deterministic: an exact name
//! match against the requested output filename wins, otherwise the largest
//! file, ties broken by the lowest file index.

use crate::error::EngineError;
use crate::{AttemptContext, AttemptOutcome};
use bwget_types::{ProgressEvent, SourceKind, TorrentConfig, TransferPhase};
use librqbit::limits::LimitsConfig;
use librqbit::{AddTorrent, AddTorrentOptions, AddTorrentResponse, Session, SessionOptions};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub(crate) struct TorrentDriver {
    config: TorrentConfig,
    /// Aggregate download cap across all peers, bytes/second (0 = none).
    bandwidth_limit: u64,
}

impl TorrentDriver {
    pub fn new(config: TorrentConfig, bandwidth_limit: u64) -> Self {
        if config.max_peers > 0 {
            // The backend exposes no hard peer-count cap; see DESIGN.md.
            warn!(
                "max_peers = {} is not enforced by the torrent backend",
                config.max_peers
            );
        }
        Self {
            config,
            bandwidth_limit,
        }
    }

    /// One torrent attempt. Returns the outcome plus the path of the
    /// selected file once metadata resolved far enough to know it.
    pub async fn attempt(
        &self,
        source: &SourceKind,
        out_dir: &Path,
        requested_name: Option<&str>,
        resume: bool,
        ctx: &AttemptContext<'_>,
    ) -> (AttemptOutcome, Option<PathBuf>) {
        let mut file_path = None;
        let outcome = match self
            .run_attempt(source, out_dir, requested_name, resume, ctx, &mut file_path)
            .await
        {
            Ok(outcome) => outcome,
            Err(EngineError::Cancelled) => AttemptOutcome::Cancelled,
            Err(e) if e.is_retryable() => AttemptOutcome::Retryable(e),
            Err(e) => AttemptOutcome::Fatal(e),
        };
        (outcome, file_path)
    }

    async fn run_attempt(
        &self,
        source: &SourceKind,
        out_dir: &Path,
        requested_name: Option<&str>,
        resume: bool,
        ctx: &AttemptContext<'_>,
        file_path: &mut Option<PathBuf>,
    ) -> Result<AttemptOutcome, EngineError> {
        let session = self.open_session(out_dir).await?;
        let start = Instant::now();

        // Metadata phase: a list-only add resolves the metainfo (over DHT
        // for magnets) without starting the transfer.
        self.emit_indeterminate(ctx, start, TransferPhase::ResolvingMetadata);
        let list_opts = AddTorrentOptions {
            list_only: true,
            ..Default::default()
        };
        let listed = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
            resp = session.add_torrent(self.to_add_torrent(source)?, Some(list_opts)) => {
                resp.map_err(classify_backend_error)?
            }
        };
        let AddTorrentResponse::ListOnly(listed) = listed else {
            return Err(EngineError::Metadata(
                "backend did not return torrent metadata".to_string(),
            ));
        };

        // Enumerate files and pick exactly one.
        let mut files = Vec::new();
        let iter = listed
            .info
            .iter_file_details()
            .map_err(|e| EngineError::Metadata(format!("{e:#}")))?;
        for details in iter {
            let rel = details
                .filename
                .to_pathbuf()
                .map_err(|e| EngineError::Metadata(format!("{e:#}")))?;
            files.push((rel, details.len));
        }
        if files.is_empty() {
            return Err(EngineError::Metadata("torrent contains no files".to_string()));
        }
        let selected = select_file(&files, requested_name);
        let (rel, selected_len) = &files[selected];
        info!(
            "selected file {} of {}: {} ({} bytes)",
            selected + 1,
            files.len(),
            rel.display(),
            selected_len
        );

        // Multi-file torrents land in a subfolder named after the torrent.
        let torrent_name = listed
            .info
            .name
            .as_ref()
            .map(|b| String::from_utf8_lossy(b.as_ref()).into_owned())
            .unwrap_or_default();
        let resolved = if files.len() == 1 || torrent_name.is_empty() {
            out_dir.join(rel)
        } else {
            out_dir.join(&torrent_name).join(rel)
        };
        *file_path = Some(resolved.clone());

        if !resume {
            // Piece-level resume disabled: discard prior partial data so
            // the backend starts from nothing.
            match tokio::fs::remove_file(&resolved).await {
                Ok(()) => debug!("discarded existing {}", resolved.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(EngineError::Io(e)),
            }
        }

        // Real add: only the selected file's pieces. `overwrite` lets the
        // backend re-check existing on-disk data, which is what piece-level
        // resume means here: verified pieces are not re-fetched.
        let add_opts = AddTorrentOptions {
            only_files: Some(vec![selected]),
            overwrite: true,
            ..Default::default()
        };
        let added = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
            resp = session.add_torrent(self.to_add_torrent(source)?, Some(add_opts)) => {
                resp.map_err(classify_backend_error)?
            }
        };
        let handle = match added {
            AddTorrentResponse::Added(_, handle) => handle,
            AddTorrentResponse::AlreadyManaged(_, handle) => handle,
            AddTorrentResponse::ListOnly(_) => {
                return Err(EngineError::Metadata(
                    "backend refused to start the transfer".to_string(),
                ))
            }
        };

        // Poll-based progress until all selected pieces are on disk.
        let mut last_progress = 0u64;
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            let stats = handle.stats();
            if let Some(error) = stats.error {
                return Err(EngineError::Peer(error));
            }

            let elapsed = start.elapsed();
            let rate = if elapsed.as_secs_f64() > 0.0 {
                (stats.progress_bytes as f64 / elapsed.as_secs_f64()) as u64
            } else {
                0
            };
            // Monotonic within the attempt even if the backend momentarily
            // revises its piece accounting.
            last_progress = last_progress.max(stats.progress_bytes);
            ctx.sink.on_event(&ProgressEvent {
                phase: TransferPhase::Transferring,
                bytes_transferred: last_progress,
                total_bytes: Some(stats.total_bytes),
                elapsed,
                rate,
            });

            if stats.finished {
                info!("torrent transfer complete: {} bytes", last_progress);
                return Ok(AttemptOutcome::Completed {
                    bytes_written: last_progress,
                });
            }
        }
    }

    async fn open_session(&self, out_dir: &Path) -> Result<std::sync::Arc<Session>, EngineError> {
        let download_bps = session_download_cap(self.bandwidth_limit);
        let opts = SessionOptions {
            disable_dht_persistence: true,
            fastresume: true,
            listen_port_range: Some(self.config.listen_port_start..self.config.listen_port_end),
            enable_upnp_port_forwarding: false,
            ratelimits: LimitsConfig {
                download_bps,
                upload_bps: None,
            },
            ..Default::default()
        };
        debug!(
            "opening torrent session in {} (ports {}-{})",
            out_dir.display(),
            self.config.listen_port_start,
            self.config.listen_port_end
        );
        // A bind failure across the whole port range surfaces here and is
        // fatal.
        Session::new_with_opts(out_dir.to_path_buf(), opts)
            .await
            .map_err(EngineError::Torrent)
    }

    fn to_add_torrent(&self, source: &SourceKind) -> Result<AddTorrent<'static>, EngineError> {
        match source {
            SourceKind::Magnet(uri) => Ok(AddTorrent::from_url(uri.clone())),
            SourceKind::TorrentUrl(url) => Ok(AddTorrent::from_url(url.to_string())),
            SourceKind::TorrentFile(path) => {
                AddTorrent::from_local_filename(&path.to_string_lossy())
                    .map_err(|e| EngineError::Metadata(format!("{e:#}")))
            }
            SourceKind::Http(url) => Err(EngineError::InvalidUrl(url.to_string())),
        }
    }

    fn emit_indeterminate(&self, ctx: &AttemptContext<'_>, start: Instant, phase: TransferPhase) {
        ctx.sink.on_event(&ProgressEvent {
            phase,
            bytes_transferred: 0,
            total_bytes: None,
            elapsed: start.elapsed(),
            rate: 0,
        });
    }
}

/// The session limit is a u32; larger configured caps saturate rather than
/// silently turning the cap off.
fn session_download_cap(limit: u64) -> Option<NonZeroU32> {
    NonZeroU32::new(limit.min(u64::from(u32::MAX)) as u32)
}

/// Deterministic single-file selection: exact name match first, then the
/// largest file, ties broken by lowest index.
fn select_file(files: &[(PathBuf, u64)], requested_name: Option<&str>) -> usize {
    if let Some(wanted) = requested_name {
        for (idx, (path, _)) in files.iter().enumerate() {
            if path.file_name().map(|n| n == wanted).unwrap_or(false) {
                return idx;
            }
        }
    }
    files
        .iter()
        .enumerate()
        .max_by(|(ia, (_, la)), (ib, (_, lb))| la.cmp(lb).then(ib.cmp(ia)))
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

/// Split backend failures into the fatal metadata class and the retryable
/// peer class.
fn classify_backend_error(e: anyhow::Error) -> EngineError {
    let text = format!("{e:#}");
    let lowered = text.to_ascii_lowercase();
    if lowered.contains("magnet") || lowered.contains("bencode") || lowered.contains("parse") {
        EngineError::Metadata(text)
    } else {
        EngineError::Peer(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files() -> Vec<(PathBuf, u64)> {
        vec![
            (PathBuf::from("readme.txt"), 100),
            (PathBuf::from("disc/image.iso"), 700_000),
            (PathBuf::from("cover.jpg"), 700_000),
        ]
    }

    #[test]
    fn selects_exact_name_match_first() {
        assert_eq!(select_file(&files(), Some("readme.txt")), 0);
        assert_eq!(select_file(&files(), Some("image.iso")), 1);
    }

    #[test]
    fn selects_largest_without_name_match() {
        // 1 and 2 tie on size; lowest index wins.
        assert_eq!(select_file(&files(), None), 1);
        assert_eq!(select_file(&files(), Some("absent.bin")), 1);
    }

    #[test]
    fn single_file_torrent_trivial() {
        let one = vec![(PathBuf::from("only.bin"), 42)];
        assert_eq!(select_file(&one, None), 0);
    }

    #[test]
    fn oversized_bandwidth_cap_saturates() {
        assert_eq!(session_download_cap(0), None);
        assert_eq!(session_download_cap(1_000), NonZeroU32::new(1_000));
        assert_eq!(session_download_cap(u64::MAX), NonZeroU32::new(u32::MAX));
    }
}
