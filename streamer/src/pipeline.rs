//! Shared pipeline state: frame fingerprint, retained segment window,
//! encoder lifecycle state and health bookkeeping.
//!
//! The capture loop mutates this state while the HTTP handlers read it,
//! so everything lives in one struct behind a single mutex – a playlist
//! build must never observe a half-updated segment list.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use tracing::{info, warn};

use dashcast_common::config::Config;
use dashcast_common::error::PipelineError;
use dashcast_common::protocol::HealthResponse;

use crate::playlist::Segment;

// ── Encoder lifecycle ────────────────────────────────────────────────────

/// Tagged encoder lifecycle state.  Transitions are explicit; anything
/// not listed in [`EncoderState::can_transition_to`] is a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    /// Not started yet.
    Idle,
    /// Subprocess spawned, no segment written so far.
    Starting,
    /// Producing segments.
    Streaming,
    /// Subprocess died or stalled; not yet restarted.
    Degraded,
    /// Subprocess respawned after a failure, waiting for its first segment.
    Restarting,
}

impl EncoderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Streaming => "streaming",
            Self::Degraded => "degraded",
            Self::Restarting => "restarting",
        }
    }

    pub fn can_transition_to(&self, next: EncoderState) -> bool {
        use EncoderState::*;
        matches!(
            (*self, next),
            (Idle, Starting)
                | (Starting, Streaming)
                | (Starting, Degraded)
                | (Streaming, Degraded)
                | (Degraded, Restarting)
                | (Restarting, Streaming)
                | (Restarting, Degraded)
        )
    }
}

// ── Pipeline state ───────────────────────────────────────────────────────

struct PipelineInner {
    /// Digest of the last frame actually sent to the encoder.  Never set
    /// from a skipped frame.
    fingerprint: Option<[u8; 16]>,
    /// Most recent captured frame (PNG), snapshot source.
    last_frame: Option<Vec<u8>>,
    /// Retained segments, ascending sequence, contiguous.
    segments: VecDeque<Segment>,
    last_capture: Option<Instant>,
    last_encode: Option<Instant>,
    encoder_state: EncoderState,
    state_since: Instant,
    /// First sequence written after an encoder restart; timestamps reset
    /// there, so the playlist marks it with a discontinuity tag.
    discontinuity: Option<u64>,
    /// Readiness is level-triggered and fires exactly once per process.
    readiness_fired: bool,
    started: Instant,
}

/// Handle shared between the capture loop and the HTTP server.
pub struct Pipeline {
    inner: Mutex<PipelineInner>,
}

impl Pipeline {
    pub fn new() -> Self {
        let now = Instant::now();
        Pipeline {
            inner: Mutex::new(PipelineInner {
                fingerprint: None,
                last_frame: None,
                segments: VecDeque::new(),
                last_capture: None,
                last_encode: None,
                encoder_state: EncoderState::Idle,
                state_since: now,
                discontinuity: None,
                readiness_fired: false,
                started: now,
            }),
        }
    }

    // ── capture bookkeeping ──────────────────────────────────────────

    /// Record a successful capture and keep the frame for snapshots.
    pub fn note_capture(&self, png: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_frame = Some(png);
        inner.last_capture = Some(Instant::now());
    }

    pub fn fingerprint(&self) -> Option<[u8; 16]> {
        self.inner.lock().unwrap().fingerprint
    }

    /// Update the fingerprint after a frame was successfully handed to
    /// the encoder.
    pub fn set_fingerprint(&self, digest: [u8; 16]) {
        self.inner.lock().unwrap().fingerprint = Some(digest);
    }

    pub fn snapshot_frame(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().last_frame.clone()
    }

    // ── encoder state machine ────────────────────────────────────────

    pub fn encoder_state(&self) -> EncoderState {
        self.inner.lock().unwrap().encoder_state
    }

    pub fn seconds_in_state(&self) -> u64 {
        self.inner.lock().unwrap().state_since.elapsed().as_secs()
    }

    /// Apply a state transition.  Invalid transitions are refused and
    /// logged; the state machine must only move along defined edges.
    pub fn transition_encoder(&self, next: EncoderState) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.encoder_state;
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            warn!(
                "Refusing encoder transition {} → {}",
                current.as_str(),
                next.as_str()
            );
            return false;
        }
        info!("Encoder {} → {}", current.as_str(), next.as_str());
        inner.encoder_state = next;
        inner.state_since = Instant::now();
        true
    }

    // ── segment window ───────────────────────────────────────────────

    /// Replace the retained segment list with a freshly scanned window.
    ///
    /// Returns `true` when the window just became fully populated for the
    /// first time – the caller must emit the one-time readiness signal.
    pub fn update_segments(&self, segments: Vec<Segment>, window: usize) -> bool {
        let mut inner = self.inner.lock().unwrap();

        let newest_before = inner.segments.back().map(|s| s.sequence);
        let newest_after = segments.last().map(|s| s.sequence);

        // A scan taken while the encoder is between processes can regress
        // (removing the dead encoder's open file demotes its predecessor
        // to "open").  Published sequence numbers only ever advance.
        if newest_after < newest_before {
            return false;
        }

        if newest_after > newest_before {
            inner.last_encode = Some(Instant::now());
            // A fresh segment means the encoder is (back) in business.
            if matches!(
                inner.encoder_state,
                EncoderState::Starting | EncoderState::Restarting
            ) {
                if inner.encoder_state == EncoderState::Restarting {
                    inner.discontinuity = newest_before.map(|b| b + 1).or(newest_after);
                }
                info!(
                    "Encoder {} → streaming (segment {} appeared)",
                    inner.encoder_state.as_str(),
                    newest_after.unwrap_or(0)
                );
                inner.encoder_state = EncoderState::Streaming;
                inner.state_since = Instant::now();
            }
        }

        inner.segments = segments.into();

        if !inner.readiness_fired && inner.segments.len() >= window {
            inner.readiness_fired = true;
            return true;
        }
        false
    }

    pub fn segments(&self) -> Vec<Segment> {
        self.inner.lock().unwrap().segments.iter().cloned().collect()
    }

    /// Sequence at which the encoder last restarted, if any; the playlist
    /// marks it with `#EXT-X-DISCONTINUITY` while it remains in the window.
    pub fn discontinuity(&self) -> Option<u64> {
        self.inner.lock().unwrap().discontinuity
    }

    /// Resolve a sequence number to its file path, failing for evicted
    /// or not-yet-written segments.
    pub fn segment_path(&self, sequence: u64) -> Result<PathBuf, PipelineError> {
        let inner = self.inner.lock().unwrap();
        inner
            .segments
            .iter()
            .find(|s| s.sequence == sequence)
            .map(|s| s.path.clone())
            .ok_or(PipelineError::SegmentNotFound(sequence))
    }

    // ── health ───────────────────────────────────────────────────────

    /// Point-in-time health read; combines ages and encoder liveness.
    pub fn health(&self, config: &Config) -> HealthResponse {
        let inner = self.inner.lock().unwrap();

        let capture_tolerance = (config.frame_interval().as_secs() * 3).max(5);
        let encode_tolerance = (config.segment_duration as u64 * 3).max(5);

        let last_capture_age_s = inner.last_capture.map(|t| t.elapsed().as_secs());
        let last_encode_age_s = inner.last_encode.map(|t| t.elapsed().as_secs());

        HealthResponse {
            capture_ok: last_capture_age_s
                .map(|age| age <= capture_tolerance)
                .unwrap_or(false),
            encode_ok: inner.encoder_state == EncoderState::Streaming
                && last_encode_age_s
                    .map(|age| age <= encode_tolerance)
                    .unwrap_or(false),
            segments_available: inner.segments.len(),
            last_capture_age_s,
            last_encode_age_s,
            encoder_state: inner.encoder_state.as_str().to_string(),
            uptime_secs: inner.started.elapsed().as_secs(),
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
