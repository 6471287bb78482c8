//! HLS Origin (C3) — pure helpers for serving `{storage_root}/{streamId}/{filename}`
//! (spec §4.4). The axum handlers that wire these into HTTP responses live in
//! `lib.rs`, following the teacher's convention of keeping handler glue in
//! `lib.rs` and delegating behavior to a module; the Range-support and
//! per-filetype Cache-Control logic here is grounded directly on
//! `hls_segment_handler`/`hls_playlist_handler` in the teacher's `lib.rs`.

use std::path::{Path, PathBuf};

/// The sole path-traversal defense (spec §4.4): reject `..`, `/`, `\` in the
/// filename. No further normalization is performed.
pub fn validate_filename(filename: &str) -> bool {
    !filename.contains("..") && !filename.contains('/') && !filename.contains('\\')
}

pub fn resolve_path(storage_root: &Path, stream_id: &str, filename: &str) -> Option<PathBuf> {
    if !validate_filename(stream_id) || !validate_filename(filename) {
        return None;
    }
    Some(storage_root.join(stream_id).join(filename))
}

pub fn content_type_for(filename: &str) -> &'static str {
    if filename.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if filename.ends_with(".ts") {
        "video/mp2t"
    } else {
        "application/octet-stream"
    }
}

pub fn cache_control_for(filename: &str) -> &'static str {
    if filename.ends_with(".m3u8") {
        "no-cache, no-store, must-revalidate"
    } else {
        "public, max-age=31536000, immutable"
    }
}

/// Parses a single-range `Range: bytes=start-end` header against a known
/// total length. Returns `None` for anything absent, malformed, or
/// unsatisfiable, in which case callers fall back to a full response
/// (matching `hls_segment_handler`'s behavior in the teacher).
pub fn parse_byte_range(range_header: &str, total: usize) -> Option<(usize, usize)> {
    let spec = range_header.trim().strip_prefix("bytes=")?;
    let (start_str, end_str) = spec.split_once('-')?;
    let start: usize = start_str.parse().ok()?;
    let end: usize = end_str.parse().ok()?;
    if start <= end && end < total {
        Some((start, end))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_filenames() {
        assert!(!validate_filename("../etc/passwd"));
        assert!(!validate_filename("a/b.ts"));
        assert!(!validate_filename("a\\b.ts"));
        assert!(validate_filename("segment_00001.ts"));
    }

    #[test]
    fn resolve_path_rejects_traversal_in_either_segment() {
        let root = Path::new("/tmp/fabriq-hls");
        assert!(resolve_path(root, "../x", "playlist.m3u8").is_none());
        assert!(resolve_path(root, "stream_abc", "../../etc/passwd").is_none());
        assert_eq!(
            resolve_path(root, "stream_abc", "playlist.m3u8").unwrap(),
            root.join("stream_abc").join("playlist.m3u8")
        );
    }

    #[test]
    fn content_type_and_cache_control_by_extension() {
        assert_eq!(content_type_for("playlist.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(content_type_for("segment_00001.ts"), "video/mp2t");
        assert_eq!(content_type_for("unknown.bin"), "application/octet-stream");

        assert_eq!(
            cache_control_for("playlist.m3u8"),
            "no-cache, no-store, must-revalidate"
        );
        assert_eq!(
            cache_control_for("segment_00001.ts"),
            "public, max-age=31536000, immutable"
        );
    }

    #[test]
    fn byte_range_parsing() {
        assert_eq!(parse_byte_range("bytes=0-99", 1000), Some((0, 99)));
        assert_eq!(parse_byte_range("bytes=900-999", 1000), Some((900, 999)));
        assert_eq!(parse_byte_range("bytes=900-1000", 1000), None);
        assert_eq!(parse_byte_range("bytes=100-50", 1000), None);
        assert_eq!(parse_byte_range("nonsense", 1000), None);
    }
}
