//! Headless browser control over the DevTools remote-debugging protocol.
//!
//! Spawns one Chromium subprocess with a debugging port, bootstraps the
//! page WebSocket via the `/json` HTTP endpoints, then drives the page
//! with a handful of protocol calls: viewport override, dark-mode media
//! emulation, navigation, script evaluation and screenshot capture.

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_tungstenite::tokio::{connect_async, ConnectStream};
use async_tungstenite::tungstenite::Message;
use async_tungstenite::WebSocketStream;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use dashcast_common::config::Config;
use dashcast_common::error::PipelineError;

use crate::auth::{dashboard_full_url, token_injection_script, Credential};

/// Idempotent page-side hook: reload when the dashboard configuration
/// changes, so edits show up on the stream without a restart.
const AUTO_REFRESH_SCRIPT: &str = r#"(function() {
    if (window.__dashcastAutoRefresh) return;
    window.__dashcastAutoRefresh = true;
    function subscribe() {
        const root = document.querySelector('home-assistant');
        const connection = root && root.__hass && root.__hass.connection;
        if (!connection) { setTimeout(subscribe, 1000); return; }
        connection.subscribeEvents(function() { location.reload(); }, 'lovelace_updated');
    }
    subscribe();
})();"#;

/// Narrow seam between the capture loop and the rendering engine.
pub trait Renderer {
    /// Render the dashboard and return the current viewport as PNG bytes.
    fn render_frame(
        &mut self,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, PipelineError>> + Send;

    /// The page's current location – used to detect login redirects.
    fn current_url(
        &mut self,
    ) -> impl std::future::Future<Output = Result<String, PipelineError>> + Send;

    /// (Re-)authenticate the session and navigate to the dashboard.
    fn establish_session(
        &mut self,
        credential: &Credential,
    ) -> impl std::future::Future<Output = Result<(), PipelineError>> + Send;
}

pub struct Browser {
    config: Config,
    child: Child,
    ws: WebSocketStream<ConnectStream>,
    next_id: u64,
}

impl Browser {
    /// Spawn the browser subprocess and connect to its page target.
    pub async fn launch(config: Config) -> Result<Self> {
        let args = build_browser_args(&config);
        debug!("Starting browser {} {}", config.browser_bin, args.join(" "));

        let mut child = Command::new(&config.browser_bin)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", config.browser_bin))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                use tokio::io::AsyncBufReadExt;
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        debug!("[browser] {line}");
                    }
                }
            });
        }

        let ws_url = bootstrap_ws_url(config.devtools_port, config.render_timeout_secs)
            .await
            .context("DevTools endpoint did not come up")?;
        let (ws, _) = connect_async(ws_url.as_str())
            .await
            .with_context(|| format!("Cannot connect to DevTools at {ws_url}"))?;

        info!("Browser started (pid={:?}, devtools={})", child.id(), ws_url);
        Ok(Browser {
            config,
            child,
            ws,
            next_id: 0,
        })
    }

    /// Issue one protocol call and wait for its response, skipping any
    /// interleaved events.  Bounded by the render timeout.
    async fn call(&mut self, method: &str, params: Value) -> Result<Value, PipelineError> {
        self.next_id += 1;
        let id = self.next_id;
        let envelope = json!({ "id": id, "method": method, "params": params });

        let budget = Duration::from_secs(self.config.render_timeout_secs);
        let exchange = async {
            self.ws
                .send(Message::Text(envelope.to_string().into()))
                .await
                .map_err(|e| PipelineError::Capture(format!("{method}: send failed: {e}")))?;

            while let Some(msg) = self.ws.next().await {
                let msg =
                    msg.map_err(|e| classify_error(&format!("{method}: {e}")))?;
                let Message::Text(text) = msg else { continue };
                let text: &str = text.as_ref();
                let value: Value = match serde_json::from_str(text) {
                    Ok(v) => v,
                    Err(_) => continue,
                };

                if value.get("id").and_then(Value::as_u64) == Some(id) {
                    if let Some(err) = value.get("error") {
                        return Err(classify_error(&format!("{method}: {err}")));
                    }
                    return Ok(value.get("result").cloned().unwrap_or(Value::Null));
                }
                if let Some(event) = value.get("method").and_then(Value::as_str) {
                    debug!("CDP event {event}");
                }
            }
            Err(PipelineError::Capture(format!(
                "{method}: devtools connection closed"
            )))
        };

        tokio::time::timeout(budget, exchange)
            .await
            .map_err(|_| PipelineError::Capture(format!("{method}: timed out")))?
    }

    /// Wait for a protocol event, tolerating its absence – the event may
    /// already have fired before we started listening.
    async fn wait_event(&mut self, name: &str, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("No {name} within {}s, continuing", budget.as_secs());
                return false;
            }
            let next = tokio::time::timeout(remaining, self.ws.next()).await;
            match next {
                Ok(Some(Ok(Message::Text(text)))) => {
                    let text: &str = text.as_ref();
                    if let Ok(value) = serde_json::from_str::<Value>(text) {
                        if value.get("method").and_then(Value::as_str) == Some(name) {
                            return true;
                        }
                    }
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => {
                    warn!("DevTools read error while waiting for {name}: {e}");
                    return false;
                }
                Ok(None) | Err(_) => return false,
            }
        }
    }

    async fn navigate(&mut self, url: &str) -> Result<(), PipelineError> {
        info!("Navigating to {url}");
        self.call("Page.navigate", json!({ "url": url })).await?;
        self.wait_event(
            "Page.loadEventFired",
            Duration::from_secs(self.config.render_timeout_secs),
        )
        .await;
        // Dashboards keep hydrating after the load event.
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(())
    }

    async fn evaluate(&mut self, expression: &str) -> Result<Value, PipelineError> {
        self.call(
            "Runtime.evaluate",
            json!({ "expression": expression, "returnByValue": true }),
        )
        .await
    }

    /// Close the page politely, then make sure the subprocess is gone.
    pub async fn close(mut self) {
        let _ = tokio::time::timeout(
            Duration::from_secs(2),
            self.call("Browser.close", json!({})),
        )
        .await;
        self.child.start_kill().ok();
        let _ = self.child.wait().await;
        info!("Browser stopped");
    }
}

impl Renderer for Browser {
    async fn render_frame(&mut self) -> Result<Vec<u8>, PipelineError> {
        let result = self
            .call("Page.captureScreenshot", json!({ "format": "png" }))
            .await?;
        let data = result
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::Capture("screenshot without data".into()))?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| PipelineError::Capture(format!("screenshot decode: {e}")))
    }

    async fn current_url(&mut self) -> Result<String, PipelineError> {
        let result = self.evaluate("location.href").await?;
        result
            .pointer("/result/value")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PipelineError::Capture("location.href unavailable".into()))
    }

    async fn establish_session(&mut self, credential: &Credential) -> Result<(), PipelineError> {
        self.call("Page.enable", json!({})).await?;
        self.call(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": self.config.width,
                "height": self.config.height,
                "deviceScaleFactor": 1,
                "mobile": false,
            }),
        )
        .await?;

        if self.config.dark_mode {
            self.call(
                "Emulation.setEmulatedMedia",
                json!({
                    "features": [{ "name": "prefers-color-scheme", "value": "dark" }]
                }),
            )
            .await?;
            debug!("Dark mode enabled via emulated media");
        }

        // Seed the token before the dashboard loads, from the base origin
        // so the storage ends up on the right host.
        if let Some(token) = &credential.token {
            self.navigate(&credential.base_url).await?;
            self.evaluate(&token_injection_script(&credential.base_url, token))
                .await?;
            debug!("Access token injected");
        }

        let full_url = dashboard_full_url(&self.config, &credential.base_url);
        self.navigate(&full_url).await?;
        self.evaluate(AUTO_REFRESH_SCRIPT).await?;

        info!("Dashboard session established at {full_url}");
        Ok(())
    }
}

/// Classify a protocol/transport failure.  Certificate trouble from
/// self-signed hosts is expected and must not count as a capture fault.
pub fn classify_error(text: &str) -> PipelineError {
    let lowered = text.to_lowercase();
    if lowered.contains("certificate") || lowered.contains("ssl") || lowered.contains("err_cert") {
        PipelineError::Tls(text.to_string())
    } else {
        PipelineError::Capture(text.to_string())
    }
}

/// Browser flags, tuned for small headless hosts.
pub fn build_browser_args(config: &Config) -> Vec<String> {
    vec![
        "--headless".into(),
        "--no-sandbox".into(),
        "--disable-dev-shm-usage".into(),
        "--disable-gpu".into(),
        "--disable-software-rasterizer".into(),
        "--disable-extensions".into(),
        "--disable-background-networking".into(),
        "--disable-sync".into(),
        "--disable-translate".into(),
        "--disable-default-apps".into(),
        "--no-first-run".into(),
        "--single-process".into(),
        "--hide-scrollbars".into(),
        "--ignore-certificate-errors".into(),
        format!("--window-size={},{}", config.width, config.height),
        format!("--remote-debugging-port={}", config.devtools_port),
        "about:blank".into(),
    ]
}

/// Poll the `/json` bootstrap endpoints until the page target appears.
async fn bootstrap_ws_url(port: u16, timeout_secs: u64) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;
    let list_url = format!("http://127.0.0.1:{port}/json");
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);

    loop {
        match client.get(&list_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let targets: Vec<Value> = resp.json().await.unwrap_or_default();
                if let Some(ws_url) = find_page_ws_url(&targets) {
                    return Ok(ws_url);
                }
            }
            Ok(resp) => debug!("DevTools /json returned {}", resp.status()),
            Err(e) => debug!("DevTools not up yet: {e}"),
        }
        if Instant::now() >= deadline {
            anyhow::bail!("No DevTools page target on port {port} after {timeout_secs}s");
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Pick the first page target's WebSocket URL from a `/json` listing.
fn find_page_ws_url(targets: &[Value]) -> Option<String> {
    targets
        .iter()
        .find(|t| t.get("type").and_then(Value::as_str) == Some("page"))
        .and_then(|t| t.get("webSocketDebuggerUrl"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

// ─── tests ───────────────────────────────────────────────────────────────
