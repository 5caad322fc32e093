//! Shared HTTP protocol types for the streamer's serving surface.

use serde::{Deserialize, Serialize};

/// Health-check response returned by `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Last capture happened within tolerance.
    pub capture_ok: bool,
    /// Encoder is alive and produced a segment within tolerance.
    pub encode_ok: bool,
    /// Number of segments currently retained in the sliding window.
    pub segments_available: usize,
    /// Seconds since the last successful capture, if any.
    pub last_capture_age_s: Option<u64>,
    /// Seconds since the last segment appeared, if any.
    pub last_encode_age_s: Option<u64>,
    /// Current encoder lifecycle state (`idle`, `starting`, …).
    pub encoder_state: String,
    pub uptime_secs: u64,
}
