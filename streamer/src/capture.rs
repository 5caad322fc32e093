//! Capture loop – renders the dashboard at a fixed period, deduplicates
//! unchanged frames and drives the encoder bridge.
//!
//! Each tick: render, login-redirect check, fingerprint compare, frame
//! hand-off (the bridge duplicates the previous frame for skipped ticks
//! so encoder input cadence stays constant), then segment-window
//! maintenance and the one-time readiness signal.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dashcast_common::config::Config;
use dashcast_common::error::PipelineError;

use crate::auth::CredentialSource;
use crate::browser::Renderer;
use crate::encoder::FrameSink;
use crate::pipeline::{EncoderState, Pipeline};
use crate::playlist;

/// A login redirect means the session expired; the frame must trigger
/// re-authentication instead of being treated as content.
pub fn is_login_page(url: &str) -> bool {
    url.contains("/auth")
}

pub struct CaptureLoop<'a, R, S, A> {
    pub renderer: &'a mut R,
    pub sink: &'a mut S,
    pub auth: &'a mut A,
    pub pipeline: Arc<Pipeline>,
    pub config: &'a Config,
    /// Consecutive render failures; reset on success, fatal past the limit.
    retries: u32,
    /// Total tolerated TLS errors, for throttled logging.
    tls_errors: u64,
}

impl<'a, R, S, A> CaptureLoop<'a, R, S, A>
where
    R: Renderer,
    S: FrameSink,
    A: CredentialSource,
{
    pub fn new(
        renderer: &'a mut R,
        sink: &'a mut S,
        auth: &'a mut A,
        pipeline: Arc<Pipeline>,
        config: &'a Config,
    ) -> Self {
        CaptureLoop {
            renderer,
            sink,
            auth,
            pipeline,
            config,
            retries: 0,
            tls_errors: 0,
        }
    }

    /// Run until cancelled.  Returns `Err` only on an exhausted retry
    /// budget – the caller restarts the capturer, not the process.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let mut ticker = tokio::time::interval(self.config.frame_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Capture loop started ({}fps, {}ms interval)",
            self.config.fps,
            self.config.frame_interval().as_millis()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => {
                    info!("Capture loop cancelled");
                    return Ok(());
                }
            }
            self.tick().await?;
        }
    }

    /// One capture tick.  Stage-local errors are contained here; only an
    /// exhausted render retry budget escalates.
    pub async fn tick(&mut self) -> Result<(), PipelineError> {
        // ── encoder liveness ─────────────────────────────────────────
        if let Some(reason) = self.sink.check_alive() {
            warn!("Encoder died: {reason}");
            self.pipeline.transition_encoder(EncoderState::Degraded);
        } else if self.stalled_startup() {
            warn!(
                "Encoder produced no segment within {}s of startup",
                self.config.encoder_startup_timeout_secs
            );
            self.pipeline.transition_encoder(EncoderState::Degraded);
        }
        if self.pipeline.encoder_state() == EncoderState::Degraded {
            match self.sink.restart().await {
                Ok(()) => {
                    self.pipeline.transition_encoder(EncoderState::Restarting);
                }
                Err(e) => {
                    error!("Encoder restart failed: {e}");
                    return Ok(()); // try again next tick
                }
            }
        }

        // ── render ───────────────────────────────────────────────────
        let png = match self.renderer.render_frame().await {
            Ok(png) => {
                self.retries = 0;
                png
            }
            Err(e) if !e.counts_toward_retry_limit() => {
                // Expected on self-signed hosts; tolerated and throttled.
                if self.tls_errors % 10 == 0 {
                    warn!("TLS warning (suppressing repeats): {e}");
                }
                self.tls_errors += 1;
                return Ok(());
            }
            Err(e) => {
                self.retries += 1;
                warn!(
                    "Render failed ({}/{}): {e}",
                    self.retries, self.config.capture_retry_limit
                );
                if self.retries > self.config.capture_retry_limit {
                    return Err(PipelineError::Capture(format!(
                        "render failed {} times: {e}",
                        self.retries
                    )));
                }
                return Ok(());
            }
        };

        // ── session expiry ───────────────────────────────────────────
        match self.renderer.current_url().await {
            Ok(url) if is_login_page(&url) => {
                warn!("Login page detected at {url}, re-resolving credential");
                match self.auth.resolve().await {
                    Ok(credential) => {
                        if let Err(e) = self.renderer.establish_session(&credential).await {
                            warn!("Session re-establishment failed: {e}");
                        }
                    }
                    Err(e) => warn!("Credential re-resolution failed: {e}"),
                }
                // The login page is not content; never fingerprint or
                // encode it.
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => debug!("Cannot read current URL: {e}"),
        }

        self.pipeline.note_capture(png.clone());

        // ── dedup & hand-off ─────────────────────────────────────────
        let digest = md5::compute(&png).0;
        let changed = self.pipeline.fingerprint() != Some(digest);
        if !changed {
            debug!("Frame unchanged, encoder will duplicate");
        }

        match self.sink.write_frame(changed.then_some(png.as_slice())).await {
            Ok(delivered) => {
                if delivered && changed {
                    self.pipeline.set_fingerprint(digest);
                }
            }
            Err(e) => {
                warn!("Frame hand-off failed: {e}");
                self.pipeline.transition_encoder(EncoderState::Degraded);
                return Ok(());
            }
        }

        self.maintain_segments();
        Ok(())
    }

    fn stalled_startup(&self) -> bool {
        matches!(
            self.pipeline.encoder_state(),
            EncoderState::Starting | EncoderState::Restarting
        ) && self.pipeline.seconds_in_state() > self.config.encoder_startup_timeout_secs
    }

    /// Refresh the retained window from disk, evict stale files and fire
    /// the readiness signal the first time the window fills.
    fn maintain_segments(&mut self) {
        let scanned =
            playlist::scan_segments(&self.config.hls_dir, self.config.segment_duration);
        let contiguous = playlist::contiguous_tail(scanned);
        let (retained, evicted) =
            playlist::retain_window(contiguous, self.config.segment_window);

        // Publish before unlinking: a playlist built mid-maintenance must
        // never reference a file that is already gone.
        let just_ready = self
            .pipeline
            .update_segments(retained, self.config.segment_window);
        playlist::evict(&evicted);

        if self.pipeline.encoder_state() == EncoderState::Streaming {
            self.sink.reset_backoff();
        }

        if just_ready {
            info!(
                "Segment window full ({} segments) – signalling readiness",
                self.config.segment_window
            );
            if let Err(e) = std::fs::write(&self.config.ready_file, b"ready\n") {
                warn!(
                    "Cannot write readiness file {}: {e}",
                    self.config.ready_file.display()
                );
            }
        }
    }
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credential;
    use std::collections::VecDeque;

    struct FakeRenderer {
        frames: VecDeque<Result<Vec<u8>, PipelineError>>,
        url: String,
        sessions: u32,
    }

    impl FakeRenderer {
        fn steady(frame: &[u8]) -> Self {
            FakeRenderer {
                frames: VecDeque::from(vec![Ok(frame.to_vec())]),
                url: "http://ha.lan:8123/lovelace/0".into(),
                sessions: 0,
            }
        }
    }

    impl Renderer for FakeRenderer {
        async fn render_frame(&mut self) -> Result<Vec<u8>, PipelineError> {
            match self.frames.len() {
                0 => Err(PipelineError::Capture("no frames".into())),
                1 => match self.frames.front().unwrap() {
                    Ok(f) => Ok(f.clone()),
                    Err(PipelineError::Tls(m)) => Err(PipelineError::Tls(m.clone())),
                    Err(e) => Err(PipelineError::Capture(e.to_string())),
                },
                _ => self.frames.pop_front().unwrap(),
            }
        }

        async fn current_url(&mut self) -> Result<String, PipelineError> {
            Ok(self.url.clone())
        }

        async fn establish_session(
            &mut self,
            _credential: &Credential,
        ) -> Result<(), PipelineError> {
            self.sessions += 1;
            self.url = "http://ha.lan:8123/lovelace/0".into();
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeSink {
        /// Frames written per tick, fresh or duplicated.
        writes: u32,
        /// Fresh frames actually delivered.
        delivered: u32,
        alive: bool,
        restarts: u32,
        fail_writes: bool,
    }

    impl FrameSink for FakeSink {
        async fn write_frame(&mut self, png: Option<&[u8]>) -> Result<bool, PipelineError> {
            if self.fail_writes {
                return Err(PipelineError::Encoder("pipe poisoned".into()));
            }
            self.writes += 1;
            Ok(if png.is_some() {
                self.delivered += 1;
                true
            } else {
                false
            })
        }

        fn check_alive(&mut self) -> Option<String> {
            if self.alive {
                None
            } else {
                Some("gone".into())
            }
        }

        async fn restart(&mut self) -> Result<(), PipelineError> {
            self.restarts += 1;
            self.alive = true;
            Ok(())
        }

        fn reset_backoff(&mut self) {}
    }

    struct FakeAuth {
        resolves: u32,
    }

    impl CredentialSource for FakeAuth {
        async fn resolve(&mut self) -> Result<Credential, PipelineError> {
            self.resolves += 1;
            Ok(Credential {
                base_url: "http://ha.lan:8123".into(),
                token: Some("tok".into()),
            })
        }
    }

    fn test_config(name: &str) -> Config {
        let dir = std::env::temp_dir().join("dashcast_test").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dashcast_common::config::from_str(&format!(
            "HLS_DIR={}\nREADY_FILE={}\nSEGMENT_WINDOW=3\nCAPTURE_RETRY_LIMIT=2\n",
            dir.display(),
            dir.join("ready").display(),
        ))
        .unwrap()
    }

    fn ready() -> (FakeSink, FakeAuth, Arc<Pipeline>) {
        let pipeline = Arc::new(Pipeline::new());
        pipeline.transition_encoder(EncoderState::Starting);
        (
            FakeSink {
                alive: true,
                ..Default::default()
            },
            FakeAuth { resolves: 0 },
            pipeline,
        )
    }

    #[tokio::test]
    async fn test_unchanged_content_duplicates_at_constant_cadence() {
        let config = test_config("dedup");
        let mut renderer = FakeRenderer::steady(b"frame-a");
        let (mut sink, mut auth, pipeline) = ready();
        let mut lp =
            CaptureLoop::new(&mut renderer, &mut sink, &mut auth, pipeline.clone(), &config);

        for _ in 0..5 {
            lp.tick().await.unwrap();
        }

        // One write per tick, but only the first frame was fresh.
        assert_eq!(sink.writes, 5);
        assert_eq!(sink.delivered, 1);
        assert_eq!(pipeline.fingerprint(), Some(md5::compute(b"frame-a").0));
    }

    #[tokio::test]
    async fn test_changed_content_updates_fingerprint() {
        let config = test_config("changed");
        let mut renderer = FakeRenderer::steady(b"frame-a");
        renderer.frames.push_front(Ok(b"frame-old".to_vec()));
        let (mut sink, mut auth, pipeline) = ready();
        let mut lp =
            CaptureLoop::new(&mut renderer, &mut sink, &mut auth, pipeline.clone(), &config);

        lp.tick().await.unwrap();
        assert_eq!(pipeline.fingerprint(), Some(md5::compute(b"frame-old").0));
        lp.tick().await.unwrap();
        assert_eq!(pipeline.fingerprint(), Some(md5::compute(b"frame-a").0));
        assert_eq!(sink.delivered, 2);
    }

    #[tokio::test]
    async fn test_login_page_triggers_reauth_not_content() {
        let config = test_config("login");
        let mut renderer = FakeRenderer::steady(b"login-html");
        renderer.url = "http://ha.lan:8123/auth/authorize?x=1".into();
        let (mut sink, mut auth, pipeline) = ready();
        let mut lp =
            CaptureLoop::new(&mut renderer, &mut sink, &mut auth, pipeline.clone(), &config);

        lp.tick().await.unwrap();

        assert_eq!(lp.auth.resolves, 1);
        assert_eq!(lp.renderer.sessions, 1);
        // The login frame never reached the encoder or the fingerprint.
        assert_eq!(lp.sink.writes, 0);
        assert_eq!(pipeline.fingerprint(), None);

        // Session restored; next tick streams content again.
        lp.tick().await.unwrap();
        assert_eq!(lp.sink.writes, 1);
    }

    #[tokio::test]
    async fn test_tls_errors_never_count_toward_fatal_limit() {
        let config = test_config("tls");
        let mut renderer = FakeRenderer {
            frames: VecDeque::from(vec![Err(PipelineError::Tls("self-signed".into()))]),
            url: "https://ha.lan/lovelace/0".into(),
            sessions: 0,
        };
        let (mut sink, mut auth, pipeline) = ready();
        let mut lp =
            CaptureLoop::new(&mut renderer, &mut sink, &mut auth, pipeline, &config);

        // Far beyond CAPTURE_RETRY_LIMIT=2, still never fatal.
        for _ in 0..25 {
            lp.tick().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_render_failures_escalate_after_limit() {
        let config = test_config("fatal");
        let mut renderer = FakeRenderer {
            frames: VecDeque::from(vec![Err(PipelineError::Capture("timeout".into()))]),
            url: "http://ha.lan/lovelace/0".into(),
            sessions: 0,
        };
        let (mut sink, mut auth, pipeline) = ready();
        let mut lp =
            CaptureLoop::new(&mut renderer, &mut sink, &mut auth, pipeline, &config);

        // CAPTURE_RETRY_LIMIT=2: two contained failures, third escalates.
        assert!(lp.tick().await.is_ok());
        assert!(lp.tick().await.is_ok());
        match lp.tick().await {
            Err(PipelineError::Capture(_)) => {}
            other => panic!("expected fatal capture error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dead_encoder_restarted_and_health_degrades() {
        let config = test_config("encoder_restart");
        let mut renderer = FakeRenderer::steady(b"frame-a");
        let (mut sink, mut auth, pipeline) = ready();
        sink.alive = false;
        let mut lp =
            CaptureLoop::new(&mut renderer, &mut sink, &mut auth, pipeline.clone(), &config);

        lp.tick().await.unwrap();
        assert_eq!(lp.sink.restarts, 1);
        assert_eq!(pipeline.encoder_state(), EncoderState::Restarting);
        let health = pipeline.health(&config);
        assert!(!health.encode_ok);
    }

    #[tokio::test]
    async fn test_published_window_always_backed_by_files() {
        let config = test_config("window_files");
        let mut renderer = FakeRenderer::steady(b"frame-a");
        let (mut sink, mut auth, pipeline) = ready();
        let mut lp =
            CaptureLoop::new(&mut renderer, &mut sink, &mut auth, pipeline.clone(), &config);

        // 7 files on disk: 0..=5 closed, 6 still open.  Window is 3, so
        // maintenance must evict 0..=2 and publish [3, 4, 5].
        for n in 0..7u64 {
            std::fs::write(
                config.hls_dir.join(playlist::segment_filename(n)),
                b"ts",
            )
            .unwrap();
        }

        lp.tick().await.unwrap();

        let segments = pipeline.segments();
        let sequences: Vec<u64> = segments.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![3, 4, 5]);
        // Every published sequence is servable from disk.
        for segment in &segments {
            assert!(segment.path.exists(), "segment {} missing", segment.sequence);
        }
        for n in 0..3u64 {
            assert!(!config.hls_dir.join(playlist::segment_filename(n)).exists());
        }
    }

    #[tokio::test]
    async fn test_poisoned_pipe_degrades_then_restarts_encoder() {
        let config = test_config("poisoned_pipe");
        let mut renderer = FakeRenderer::steady(b"frame-a");
        let (mut sink, mut auth, pipeline) = ready();
        sink.fail_writes = true;
        let mut lp =
            CaptureLoop::new(&mut renderer, &mut sink, &mut auth, pipeline.clone(), &config);

        // A failed hand-off (e.g. a timed-out pipe write) degrades the
        // encoder instead of being treated as a skipped frame.
        lp.tick().await.unwrap();
        assert_eq!(pipeline.encoder_state(), EncoderState::Degraded);
        assert_eq!(lp.sink.restarts, 0);

        // The pipe is healthy after the restart.
        lp.sink.fail_writes = false;
        lp.tick().await.unwrap();
        assert_eq!(lp.sink.restarts, 1);
        assert_eq!(pipeline.encoder_state(), EncoderState::Restarting);
        assert_eq!(lp.sink.writes, 1);
    }

    #[tokio::test]
    async fn test_readiness_file_written_once_window_full() {
        let config = test_config("readiness");
        let mut renderer = FakeRenderer::steady(b"frame-a");
        let (mut sink, mut auth, pipeline) = ready();
        let mut lp =
            CaptureLoop::new(&mut renderer, &mut sink, &mut auth, pipeline.clone(), &config);

        // Simulate the muxer: 4 closed segments (plus one open) on disk.
        for n in 0..5u64 {
            std::fs::write(
                config.hls_dir.join(playlist::segment_filename(n)),
                b"ts",
            )
            .unwrap();
        }

        lp.tick().await.unwrap();

        assert!(config.ready_file.exists());
        let segments = pipeline.segments();
        assert_eq!(segments.len(), 3);
        // Oldest closed segment was evicted from disk.
        assert!(!config.hls_dir.join(playlist::segment_filename(0)).exists());
        assert_eq!(pipeline.encoder_state(), EncoderState::Streaming);
    }
}
