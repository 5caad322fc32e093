//! Configuration parsing – reads a KEY=VALUE file (`dashcast.conf`).
//!
//! The streamer loads the whole file at startup; unknown keys are
//! silently ignored so the same file can carry host-side settings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

/// Application configuration for the capture→encode→publish pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    // ── dashboard ────────────────────────────────────────────────────
    /// Dashboard path (`/lovelace/0`) or a full `http(s)://` URL.
    pub dashboard_url: String,
    /// Long-lived access token injected into the browser session.
    pub access_token: Option<String>,
    /// Explicit base URL override; tried first when resolving.
    pub base_url: Option<String>,
    pub kiosk_mode: bool,
    pub dark_mode: bool,

    // ── capture ──────────────────────────────────────────────────────
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub render_timeout_secs: u64,
    pub capture_retry_limit: u32,
    pub browser_bin: String,
    pub devtools_port: u16,

    // ── encoding ─────────────────────────────────────────────────────
    /// x264 constant rate factor (lower = better quality).
    pub quality: u32,
    pub segment_duration: u32,
    /// Number of segments retained in the sliding window.
    pub segment_window: usize,
    pub hls_dir: PathBuf,
    pub encoder_startup_timeout_secs: u64,
    pub frame_write_timeout_ms: u64,

    // ── serving / supervision ────────────────────────────────────────
    pub listen_addr: String,
    pub ready_file: PathBuf,
    pub supervisor_url: String,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/dashcast/dashcast.conf"
    }

    /// Nominal interval between capture ticks.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }

    /// Summary safe for logging: the access token is redacted.
    pub fn summary(&self) -> String {
        format!(
            "dashboard={} {}x{}@{}fps crf={} segment={}s window={} token={}",
            self.dashboard_url,
            self.width,
            self.height,
            self.fps,
            self.quality,
            self.segment_duration,
            self.segment_window,
            if self.access_token.is_some() { "***" } else { "(not set)" },
        )
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let config = from_str(&text)?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Build a [`Config`] from conf-file text; every key has a default.
pub fn from_str(text: &str) -> Result<Config> {
    let map = parse_conf(text);

    let get = |key: &str| -> Option<String> { map.get(key).cloned() };
    let get_u32 = |key: &str, default: u32| -> u32 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_u64 = |key: &str, default: u64| -> u64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_bool = |key: &str, default: bool| -> bool {
        get(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(default)
    };

    Ok(Config {
        dashboard_url: get("DASHBOARD_URL").unwrap_or_else(|| "/lovelace/0".into()),
        access_token: get("ACCESS_TOKEN").filter(|s| !s.is_empty()),
        base_url: get("BASE_URL").filter(|s| !s.is_empty()),
        kiosk_mode: get_bool("KIOSK_MODE", true),
        dark_mode: get_bool("DARK_MODE", true),

        width: get_u32("WIDTH", 1920),
        height: get_u32("HEIGHT", 1080),
        fps: get_u32("FPS", 5).max(1),
        render_timeout_secs: get_u64("RENDER_TIMEOUT_SECS", 20),
        capture_retry_limit: get_u32("CAPTURE_RETRY_LIMIT", 3),
        browser_bin: get("BROWSER_BIN")
            .unwrap_or_else(|| "/usr/bin/chromium-browser".into()),
        devtools_port: get("DEVTOOLS_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(9222),

        quality: get_u32("QUALITY", 23),
        segment_duration: get_u32("SEGMENT_DURATION", 4).max(1),
        // Historically 3; raised to 6 for devices that prefetch several
        // segments before starting playback.
        segment_window: get_u32("SEGMENT_WINDOW", 6).max(1) as usize,
        hls_dir: PathBuf::from(get("HLS_DIR").unwrap_or_else(|| "/tmp/hls".into())),
        encoder_startup_timeout_secs: get_u64("ENCODER_STARTUP_TIMEOUT_SECS", 15),
        frame_write_timeout_ms: get_u64("FRAME_WRITE_TIMEOUT_MS", 500),

        listen_addr: get("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8099".into()),
        ready_file: PathBuf::from(
            get("READY_FILE").unwrap_or_else(|| "/tmp/dashcast.ready".into()),
        ),
        supervisor_url: get("SUPERVISOR_URL")
            .unwrap_or_else(|| "http://supervisor".into()),
    })
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
