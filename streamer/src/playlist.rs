//! Segment window tracking and HLS playlist generation.
//!
//! ffmpeg's segment muxer writes `segment-<n>.ts` files with strictly
//! increasing sequence numbers; this module scans the directory, retains
//! the configured sliding window, deletes everything older (best-effort)
//! and renders the live playlist text on every request.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// One fixed-duration chunk of encoded video, immutable once the encoder
/// has moved on to the next sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub sequence: u64,
    pub path: PathBuf,
    pub duration_s: u32,
    pub size: u64,
}

/// Canonical on-disk / URI filename for a sequence number.
pub fn segment_filename(sequence: u64) -> String {
    format!("segment-{sequence:05}.ts")
}

/// Parse the sequence number out of `segment-00042.ts`.
pub fn parse_sequence(filename: &str) -> Option<u64> {
    filename
        .strip_prefix("segment-")?
        .strip_suffix(".ts")?
        .parse()
        .ok()
}

/// Scan the segment directory for closed segments, ascending by sequence.
///
/// The highest-numbered file is still being written by the muxer and is
/// excluded; a segment only counts as closed once a newer one exists.
pub fn scan_segments(dir: &Path, segment_duration: u32) -> Vec<Segment> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return vec![],
    };

    let mut segments: Vec<Segment> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let name = path.file_name()?.to_str()?.to_string();
            let sequence = parse_sequence(&name)?;
            let size = entry.metadata().ok()?.len();
            Some(Segment {
                sequence,
                path,
                duration_s: segment_duration,
                size,
            })
        })
        .collect();

    segments.sort_by_key(|s| s.sequence);
    // Drop the open segment at the tail.
    segments.pop();
    segments
}

/// Keep only the contiguous run ending at the newest segment.
///
/// A gap means files went missing underneath us; anything before the gap
/// can no longer be published without violating media-sequence contiguity.
pub fn contiguous_tail(segments: Vec<Segment>) -> Vec<Segment> {
    let mut start = 0;
    for i in (1..segments.len()).rev() {
        if segments[i].sequence != segments[i - 1].sequence + 1 {
            start = i;
            break;
        }
    }
    segments.into_iter().skip(start).collect()
}

/// Split into (retained window, evictable prefix).
pub fn retain_window(segments: Vec<Segment>, window: usize) -> (Vec<Segment>, Vec<Segment>) {
    if segments.len() <= window {
        return (segments, vec![]);
    }
    let split = segments.len() - window;
    let mut segments = segments;
    let retained = segments.split_off(split);
    (retained, segments)
}

/// Delete evicted segment files.  Best-effort: a missing file is fine.
pub fn evict(evicted: &[Segment]) {
    for segment in evicted {
        match std::fs::remove_file(&segment.path) {
            Ok(()) => debug!("Evicted segment {}", segment.sequence),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Cannot evict {}: {e}", segment.path.display()),
        }
    }
}

/// Render the live playlist for the retained window.
///
/// No `#EXT-X-ENDLIST`: the stream never ends.  Segment URIs are relative
/// so the playlist works behind any path prefix.  `discontinuity` is the
/// first sequence after an encoder restart; timestamps reset there, so the
/// segment is preceded by `#EXT-X-DISCONTINUITY` while it is in the window.
pub fn build_playlist(
    segments: &[Segment],
    target_duration: u32,
    now: DateTime<Utc>,
    discontinuity: Option<u64>,
) -> String {
    let media_sequence = segments.first().map(|s| s.sequence).unwrap_or(0);

    let mut out = String::with_capacity(256);
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:3\n");
    out.push_str(&format!("#EXT-X-TARGETDURATION:{target_duration}\n"));
    out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{media_sequence}\n"));
    out.push_str(&format!(
        "#EXT-X-PROGRAM-DATE-TIME:{}\n",
        now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    ));
    for segment in segments {
        if Some(segment.sequence) == discontinuity {
            out.push_str("#EXT-X-DISCONTINUITY\n");
        }
        out.push_str(&format!("#EXTINF:{}.0,\n", segment.duration_s));
        out.push_str(&segment_filename(segment.sequence));
        out.push('\n');
    }
    out
}

// ─── tests ───────────────────────────────────────────────────────────────
