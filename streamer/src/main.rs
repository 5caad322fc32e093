//! Dashcast Streamer – captures a dashboard and serves it as live HLS.
//!
//! This binary:
//! 1. Reads configuration from `dashcast.conf`
//! 2. Resolves the dashboard base URL and access credential
//! 3. Renders the page in headless Chromium and feeds frames to a
//!    persistent ffmpeg subprocess writing rotating MPEG-TS segments
//! 4. Runs an axum HTTP server exposing playlist, segments, snapshot
//!    and health to client devices.

mod auth;
mod browser;
mod capture;
mod encoder;
mod pipeline;
mod playlist;
mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dashcast_common::config::Config;

use crate::auth::{Authenticator, Credential, CredentialSource};
use crate::browser::{Browser, Renderer};
use crate::capture::CaptureLoop;
use crate::encoder::{restart_backoff, EncoderBridge};
use crate::pipeline::{EncoderState, Pipeline};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| Config::default_path().to_string());
    let config = dashcast_common::config::load(&PathBuf::from(&config_path))
        .context("Config load failed")?;

    info!("Dashcast Streamer starting ({})", config.summary());
    if config.access_token.is_none() {
        warn!(
            "No ACCESS_TOKEN configured – the dashboard will only render \
             if it is reachable without login"
        );
    }

    std::fs::create_dir_all(&config.hls_dir).context("Cannot create HLS directory")?;
    // Stale readiness from a previous run must not fool the supervisor.
    let _ = std::fs::remove_file(&config.ready_file);

    // ── ctrl-c ───────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let ctrlc_cancel = cancel.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        ctrlc_cancel.cancel();
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── pipeline + capture stage ─────────────────────────────────────
    let pipeline = Arc::new(Pipeline::new());
    let capture_task = tokio::spawn(capture_stage(
        config.clone(),
        pipeline.clone(),
        cancel.clone(),
    ));

    // ── HTTP server (blocks until shutdown) ──────────────────────────
    let state = server::AppState {
        pipeline,
        config: Arc::new(config.clone()),
    };
    server::run(state, &config.listen_addr, cancel.clone()).await?;

    // Server exits on cancellation; give the capture stage a bounded
    // window to close the encoder pipe and the browser.
    cancel.cancel();
    match tokio::time::timeout(Duration::from_secs(10), capture_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("Capture stage ended with error: {e:#}"),
        Ok(Err(e)) => error!("Capture task panicked: {e}"),
        Err(_) => warn!("Capture stage did not stop in time"),
    }

    info!("Dashcast Streamer stopped");
    Ok(())
}

/// Long-running capture→encode stage.  Owns the browser, the encoder
/// subprocess and the credential; restarts the capturer on fatal render
/// errors without touching the rest of the process.
async fn capture_stage(
    config: Config,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut authenticator = Authenticator::new(config.clone())?;

    let mut bridge = EncoderBridge::new(config.clone());
    if let Err(e) = bridge.start().await {
        // Without an encoder there is no stream at all.
        cancel.cancel();
        return Err(e.context("Encoder startup failed"));
    }
    pipeline.transition_encoder(EncoderState::Starting);

    while !cancel.is_cancelled() {
        let Some(credential) = resolve_with_backoff(&mut authenticator, &cancel).await
        else {
            break;
        };

        let mut browser = match Browser::launch(config.clone()).await {
            Ok(b) => b,
            Err(e) => {
                error!("Browser launch failed: {e:#}");
                if !sleep_or_cancel(Duration::from_secs(5), &cancel).await {
                    break;
                }
                continue;
            }
        };
        if let Err(e) = browser.establish_session(&credential).await {
            warn!("Session establishment failed: {e}");
            browser.close().await;
            if !sleep_or_cancel(Duration::from_secs(5), &cancel).await {
                break;
            }
            continue;
        }

        let mut lp = CaptureLoop::new(
            &mut browser,
            &mut bridge,
            &mut authenticator,
            pipeline.clone(),
            &config,
        );
        let result = lp.run(&cancel).await;
        browser.close().await;

        match result {
            Ok(()) => break, // cancelled
            Err(e) => {
                error!("Capturer failed fatally: {e} – restarting capture stage");
                if !sleep_or_cancel(Duration::from_secs(2), &cancel).await {
                    break;
                }
            }
        }
    }

    bridge.stop().await;
    Ok(())
}

/// Resolve the credential, backing off between attempts.  `None` means
/// shutdown was requested first; the pipeline reports `starting` health
/// the whole time.
async fn resolve_with_backoff(
    authenticator: &mut Authenticator,
    cancel: &CancellationToken,
) -> Option<Credential> {
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        match authenticator.resolve().await {
            Ok(credential) => return Some(credential),
            Err(e) => {
                let backoff = restart_backoff(attempt);
                attempt = attempt.saturating_add(1);
                warn!("{e}; retrying in {}s", backoff.as_secs());
                if !sleep_or_cancel(backoff, cancel).await {
                    return None;
                }
            }
        }
    }
}

/// Sleep unless cancelled first; `false` means cancelled.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}
