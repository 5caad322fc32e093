//! Encoder bridge – owns one long-lived ffmpeg subprocess.
//!
//! Frames arrive as PNG bytes on stdin (`image2pipe`) at the nominal
//! capture rate; when the capturer skips an unchanged frame the bridge
//! re-sends the last delivered one, so the encoder always sees constant
//! input cadence.  Output is a rotating set of MPEG-TS segment files;
//! the playlist itself is built in-process by [`crate::playlist`].

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use dashcast_common::config::Config;
use dashcast_common::error::PipelineError;

/// Abstraction over the encoder so the capture loop is testable without
/// spawning ffmpeg.
pub trait FrameSink {
    /// Feed one tick's frame.  `None` means "content unchanged, repeat
    /// the last frame".  Returns `true` when a new frame was actually
    /// delivered to the encoder.
    fn write_frame(
        &mut self,
        png: Option<&[u8]>,
    ) -> impl std::future::Future<Output = Result<bool, PipelineError>> + Send;

    /// `Some(reason)` when the subprocess has exited.
    fn check_alive(&mut self) -> Option<String>;

    /// Tear down and respawn the subprocess, with backoff.
    fn restart(&mut self) -> impl std::future::Future<Output = Result<(), PipelineError>> + Send;

    /// Forget accumulated restart backoff once the encoder has proven
    /// healthy again.
    fn reset_backoff(&mut self);
}

pub struct EncoderBridge {
    config: Config,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    /// Last frame actually delivered; duplicated on skipped ticks.
    last_frame: Option<Vec<u8>>,
    restart_attempts: u32,
    /// First sequence number the next spawn will write.  Carried across
    /// restarts so retained sequence numbers stay strictly increasing.
    start_number: u64,
}

impl EncoderBridge {
    pub fn new(config: Config) -> Self {
        EncoderBridge {
            config,
            child: None,
            stdin: None,
            last_frame: None,
            restart_attempts: 0,
            start_number: 0,
        }
    }

    /// Fresh start: wipe stale segments from a previous run and spawn
    /// ffmpeg numbering from zero.
    pub async fn start(&mut self) -> Result<()> {
        clean_segment_dir(&self.config.hls_dir)?;
        self.start_number = 0;
        self.spawn().await
    }

    /// Spawn ffmpeg and verify it survives its first moments.
    async fn spawn(&mut self) -> Result<()> {
        let args = build_args(&self.config, self.start_number);
        debug!("Starting ffmpeg {}", args.join(" "));

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn ffmpeg")?;

        // Drain stderr so the pipe never fills up and blocks the encoder.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                use tokio::io::AsyncBufReadExt;
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        warn!("[ffmpeg] {line}");
                    }
                }
                debug!("ffmpeg stderr stream ended");
            });
        }

        self.stdin = child.stdin.take();

        // Give ffmpeg a moment to fail on bad arguments before declaring
        // success.
        tokio::time::sleep(Duration::from_millis(500)).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                anyhow::bail!("ffmpeg exited immediately with {status}");
            }
            Ok(None) => {}
            Err(e) => warn!("Cannot check ffmpeg status: {e}"),
        }

        info!(
            "HLS encoder started (pid={:?}, {}s segments → {})",
            child.id(),
            self.config.segment_duration,
            self.config.hls_dir.display()
        );
        self.child = Some(child);
        Ok(())
    }

    /// Close stdin, wait bounded, then force-kill.
    pub async fn stop(&mut self) {
        self.stdin.take();
        if let Some(mut child) = self.child.take() {
            match timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => debug!("ffmpeg exited with {status}"),
                Ok(Err(e)) => warn!("Cannot wait for ffmpeg: {e}"),
                Err(_) => {
                    warn!("ffmpeg did not exit in time, killing");
                    child.start_kill().ok();
                    let _ = child.wait().await;
                }
            }
            info!("HLS encoder stopped");
        }
    }
}

impl FrameSink for EncoderBridge {
    async fn write_frame(&mut self, png: Option<&[u8]>) -> Result<bool, PipelineError> {
        let bytes: &[u8] = match (png, self.last_frame.as_deref()) {
            (Some(fresh), _) => fresh,
            (None, Some(previous)) => previous,
            // No frame captured yet – nothing to duplicate.
            (None, None) => return Ok(false),
        };

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| PipelineError::Encoder("stdin closed".into()))?;

        let budget = Duration::from_millis(self.config.frame_write_timeout_ms);
        let write = async {
            stdin.write_all(bytes).await?;
            stdin.flush().await
        };
        match timeout(budget, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(PipelineError::Encoder(format!("pipe write failed: {e}")));
            }
            Err(_) => {
                // Overrun policy: drop the newest frame rather than stall
                // the capture loop.  The aborted write may have pushed a
                // partial image into the pipe and image2pipe cannot resync
                // mid-frame, so the subprocess must be replaced.
                return Err(PipelineError::Encoder(format!(
                    "frame write exceeded {}ms, pipe poisoned",
                    budget.as_millis()
                )));
            }
        }

        if let Some(fresh) = png {
            self.last_frame = Some(fresh.to_vec());
            return Ok(true);
        }
        Ok(false)
    }

    fn check_alive(&mut self) -> Option<String> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(format!("ffmpeg exited with {status}")),
            Ok(None) => None,
            Err(e) => Some(format!("cannot check ffmpeg: {e}")),
        }
    }

    async fn restart(&mut self) -> Result<(), PipelineError> {
        self.stop().await;

        // The segment the dead encoder was writing is truncated and was
        // never published (scan treats the highest number as open).
        // Remove it and reuse its number, so the retained run stays
        // contiguous and no truncated file is ever served.
        remove_open_segment(&self.config.hls_dir);
        self.start_number = next_segment_number(&self.config.hls_dir);

        let backoff = restart_backoff(self.restart_attempts);
        self.restart_attempts = self.restart_attempts.saturating_add(1);
        warn!(
            "Restarting encoder in {}s (attempt {}, resuming at segment {})",
            backoff.as_secs(),
            self.restart_attempts,
            self.start_number
        );
        tokio::time::sleep(backoff).await;

        self.spawn()
            .await
            .map_err(|e| PipelineError::Encoder(format!("restart failed: {e:#}")))
    }

    fn reset_backoff(&mut self) {
        self.restart_attempts = 0;
    }
}

/// Delete the highest-numbered segment file, if any.  Only called after
/// the encoder died mid-write, when that file is truncated.
pub fn remove_open_segment(dir: &std::path::Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let newest = entries
        .flatten()
        .filter_map(|e| {
            let name = e.file_name();
            let sequence = crate::playlist::parse_sequence(name.to_str()?)?;
            Some((sequence, e.path()))
        })
        .max_by_key(|(sequence, _)| *sequence);

    if let Some((sequence, path)) = newest {
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Removed truncated open segment {sequence}"),
            Err(e) => warn!("Cannot remove open segment {}: {e}", path.display()),
        }
    }
}

/// First unused sequence number in the segment directory.
pub fn next_segment_number(dir: &std::path::Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|e| crate::playlist::parse_sequence(e.file_name().to_str()?))
        .max()
        .map(|n| n + 1)
        .unwrap_or(0)
}

/// Exponential restart backoff, capped at 30 s.
pub fn restart_backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(5)).min(Duration::from_secs(30))
}

/// Remove stale segments from previous runs and recreate the directory.
pub fn clean_segment_dir(dir: &std::path::Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)
            .with_context(|| format!("Cannot clean segment dir {}", dir.display()))?;
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Cannot create segment dir {}", dir.display()))?;
    Ok(())
}

/// ffmpeg argument list for the low-latency HLS pipeline.
///
/// Video: x264 ultrafast/zerolatency at the configured CRF, main@4.0 for
/// broad hardware-decoder support, keyframe every second.  A silent AAC
/// track is muxed in because some streaming devices refuse video-only
/// streams.  Output goes through the segment muxer; the playlist is ours.
pub fn build_args(config: &Config, start_number: u64) -> Vec<String> {
    let fps = config.fps.to_string();
    let segment_pattern = config.hls_dir.join("segment-%05d.ts");

    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        // Frame input on stdin
        "-f".into(),
        "image2pipe".into(),
        "-vcodec".into(),
        "png".into(),
        "-r".into(),
        fps.clone(),
        "-i".into(),
        "-".into(),
        // Silent audio source
        "-f".into(),
        "lavfi".into(),
        "-i".into(),
        "anullsrc=channel_layout=stereo:sample_rate=44100".into(),
        // Video encoding
        "-map".into(),
        "0:v".into(),
        "-map".into(),
        "1:a".into(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "ultrafast".into(),
        "-tune".into(),
        "zerolatency".into(),
        "-crf".into(),
        config.quality.to_string(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-profile:v".into(),
        "main".into(),
        "-level".into(),
        "4.0".into(),
        "-r".into(),
        fps.clone(),
        "-g".into(),
        fps,
        "-sc_threshold".into(),
        "0".into(),
        // Audio encoding
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "32k".into(),
        "-shortest".into(),
        // Rotating MPEG-TS segments
        "-f".into(),
        "segment".into(),
        "-segment_format".into(),
        "mpegts".into(),
        "-segment_time".into(),
        config.segment_duration.to_string(),
        "-segment_start_number".into(),
        start_number.to_string(),
    ];
    args.push(segment_pattern.to_string_lossy().into_owned());
    args
}

// ─── tests ───────────────────────────────────────────────────────────────
