//! Source classification and destination naming

use crate::digest::is_hex_digest;
use crate::error::EngineError;
use bwget_types::SourceKind;
use std::path::{Path, PathBuf};
use url::Url;

/// Classify a raw source string into a [`SourceKind`], once, at request
/// construction time.
pub fn classify(raw: &str) -> Result<SourceKind, EngineError> {
    if raw.starts_with("magnet:") {
        return Ok(SourceKind::Magnet(raw.to_string()));
    }

    if raw.to_ascii_lowercase().ends_with(".torrent") {
        if let Ok(url) = Url::parse(raw) {
            if matches!(url.scheme(), "http" | "https") {
                return Ok(SourceKind::TorrentUrl(url));
            }
        }
        return Ok(SourceKind::TorrentFile(PathBuf::from(raw)));
    }

    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => {
            Ok(SourceKind::Http(url))
        }
        _ => Err(EngineError::InvalidUrl(raw.to_string())),
    }
}

/// Derive the initial destination file name: explicit output wins, else the
/// last URL path segment, else `index.html`.
pub fn pick_filename(url: &Url, explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    let segment = url
        .path_segments()
        .and_then(|s| s.filter(|p| !p.is_empty()).last())
        .unwrap_or("");
    if segment.is_empty() {
        PathBuf::from("index.html")
    } else {
        PathBuf::from(segment)
    }
}

/// Extract the filename from a `Content-Disposition` header value, if any.
pub fn parse_content_disposition(header: &str) -> Option<String> {
    let name = header.split("filename=").nth(1)?;
    let name = name.split(';').next()?.trim().trim_matches('"');
    if name.is_empty() {
        return None;
    }
    // Strip any path components a hostile server might smuggle in.
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
}

/// Pull a digest out of a `.sha256` sidecar body: first whitespace token of
/// the first line, accepted only if it is a well-formed digest.
pub fn parse_sidecar_digest(body: &str) -> Option<String> {
    let token = body.lines().next()?.split_whitespace().next()?;
    if is_hex_digest(token) {
        Some(token.to_ascii_lowercase())
    } else {
        None
    }
}
