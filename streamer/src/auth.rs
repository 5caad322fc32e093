//! Authenticator – resolves the dashboard's base URL and owns the
//! long-lived access credential.
//!
//! The host's configured and discovered URLs frequently disagree (bare
//! host, default port present or missing, http vs https), so resolution
//! walks a flat, ordered list of candidate base URLs and the first
//! reachable one wins.  Re-invoked whenever the capturer detects a
//! login-page render.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use dashcast_common::config::Config;
use dashcast_common::error::PipelineError;

/// Well-known internal host exposed to add-on containers.
const INTERNAL_HOST: &str = "http://homeassistant.local.hass.io:8123";

/// Default port appended to candidates that carry none.
const DEFAULT_PORT: u16 = 8123;

/// Resolved session credential.  Immutable; a failed authentication
/// discards it and resolves a fresh one.
#[derive(Debug, Clone)]
pub struct Credential {
    pub base_url: String,
    pub token: Option<String>,
}

/// Seam for the capture loop: re-resolution on session expiry goes
/// through this trait so tests can stub it out.
pub trait CredentialSource {
    fn resolve(
        &mut self,
    ) -> impl std::future::Future<Output = Result<Credential, PipelineError>> + Send;
}

pub struct Authenticator {
    config: Config,
    client: reqwest::Client,
}

impl Authenticator {
    pub fn new(config: Config) -> Result<Self> {
        // Self-signed certificates are expected on dashboard hosts; the
        // probe must tolerate them and surface them as warnings only.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(10))
            .build()
            .context("Cannot create HTTP client")?;
        Ok(Authenticator { config, client })
    }

    /// Ask the Supervisor API for the host's canonical URLs.  Absent
    /// token or unreachable API simply yields no extra candidates.
    async fn discovered_urls(&self) -> Vec<String> {
        let token = match std::env::var("SUPERVISOR_TOKEN") {
            Ok(t) if !t.is_empty() => t,
            _ => {
                debug!("No SUPERVISOR_TOKEN – skipping base URL discovery");
                return vec![];
            }
        };

        let url = format!("{}/core/api/config", self.config.supervisor_url);
        let resp = match self.client.get(&url).bearer_auth(&token).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("Supervisor config API unreachable: {e}");
                return vec![];
            }
        };
        if !resp.status().is_success() {
            warn!("Supervisor config API returned {}", resp.status());
            return vec![];
        }

        let body: serde_json::Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!("Cannot parse Supervisor config response: {e}");
                return vec![];
            }
        };

        ["internal_url", "external_url"]
            .iter()
            .filter_map(|key| body.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string)
            .collect()
    }
}

impl CredentialSource for Authenticator {
    async fn resolve(&mut self) -> Result<Credential, PipelineError> {
        let discovered = self.discovered_urls().await;
        let candidates = candidate_base_urls(&self.config, &discovered);
        debug!("Probing {} candidate base URLs", candidates.len());

        for base in &candidates {
            match self.client.get(base.as_str()).send().await {
                // Any HTTP response at all means the host is reachable;
                // the browser session handles the actual login.
                Ok(resp) => {
                    info!("Resolved base URL {} ({})", base, resp.status());
                    return Ok(Credential {
                        base_url: base.clone(),
                        token: self.config.access_token.clone(),
                    });
                }
                Err(e) if is_tls_error(&e) => {
                    let tls = PipelineError::Tls(e.to_string());
                    warn!("{tls} while probing {base}");
                }
                Err(e) => {
                    debug!("Candidate {base} unreachable: {e}");
                }
            }
        }

        Err(PipelineError::Auth(format!(
            "no reachable base URL among {} candidates",
            candidates.len()
        )))
    }
}

fn is_tls_error(e: &reqwest::Error) -> bool {
    let text = e.to_string();
    text.contains("certificate") || text.contains("SSL") || text.contains("TLS")
}

/// Ordered, de-duplicated candidate list: explicit configuration first,
/// then Supervisor-discovered URLs, then the well-known internal host –
/// each expanded into its default-port and scheme variants.
pub fn candidate_base_urls(config: &Config, discovered: &[String]) -> Vec<String> {
    let mut raw: Vec<String> = Vec::new();

    if let Some(origin) = origin_of(&config.dashboard_url) {
        raw.push(origin);
    }
    if let Some(base) = &config.base_url {
        raw.push(base.clone());
    }
    raw.extend(discovered.iter().cloned());
    raw.push(INTERNAL_HOST.to_string());

    let mut out: Vec<String> = Vec::new();
    for candidate in raw {
        for variant in expand_variants(&candidate) {
            if !out.contains(&variant) {
                out.push(variant);
            }
        }
    }
    out
}

/// Expand one candidate into its URL-form variants: as given, with the
/// default port when none is present, and a plain-http fallback for
/// https candidates (self-hosted dashboards often serve both).
fn expand_variants(raw: &str) -> Vec<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return vec![];
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };

    let mut out = vec![with_scheme.clone()];
    if let Some((scheme, host)) = with_scheme.split_once("://") {
        if !host.contains(':') {
            out.push(format!("{scheme}://{host}:{DEFAULT_PORT}"));
        }
        if scheme == "https" {
            out.push(format!("http://{host}"));
            if !host.contains(':') {
                out.push(format!("http://{host}:{DEFAULT_PORT}"));
            }
        }
    }
    out
}

/// Extract `scheme://host[:port]` from an absolute URL.
fn origin_of(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let host = rest.split('/').next()?;
    if host.is_empty() {
        return None;
    }
    Some(format!("{scheme}://{host}"))
}

/// Full dashboard URL for a resolved base, with kiosk styling applied
/// idempotently.
pub fn dashboard_full_url(config: &Config, base_url: &str) -> String {
    let mut url = if config.dashboard_url.contains("://") {
        config.dashboard_url.clone()
    } else if config.dashboard_url.starts_with('/') {
        format!("{base_url}{}", config.dashboard_url)
    } else {
        format!("{base_url}/{}", config.dashboard_url)
    };

    if config.kiosk_mode && !url.contains("kiosk") {
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str("kiosk");
    }
    url
}

/// JavaScript that seeds the frontend's token storage so the dashboard
/// renders without interactive login.  Storage shape matches what the
/// frontend reads back on load.
pub fn token_injection_script(base_url: &str, token: &str) -> String {
    format!(
        r#"(function() {{
    const tokenData = {{
        hassUrl: "{base_url}",
        clientId: "{base_url}/",
        expires: Date.now() + 315360000000,
        refresh_token: "",
        access_token: "{token}",
        expires_in: 315360000,
        token_type: "Bearer"
    }};
    localStorage.setItem("hassTokens", JSON.stringify(tokenData));
}})();"#
    )
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use dashcast_common::config;

    #[test]
    fn test_candidate_order_explicit_first() {
        let cfg = config::from_str("BASE_URL=http://ha.lan:8123\n").unwrap();
        let candidates = candidate_base_urls(&cfg, &["https://home.example.com".into()]);

        assert_eq!(candidates[0], "http://ha.lan:8123");
        // discovered https host expands into default-port and http forms
        assert!(candidates.contains(&"https://home.example.com".to_string()));
        assert!(candidates.contains(&"https://home.example.com:8123".to_string()));
        assert!(candidates.contains(&"http://home.example.com".to_string()));
        // well-known internal host is the last resort
        assert_eq!(candidates.last().unwrap(), INTERNAL_HOST);
    }

    #[test]
    fn test_candidates_deduplicated() {
        let cfg = config::from_str("BASE_URL=http://ha.lan\n").unwrap();
        let candidates = candidate_base_urls(&cfg, &["http://ha.lan/".into()]);
        let count = candidates.iter().filter(|c| *c == "http://ha.lan").count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_absolute_dashboard_url_origin_wins() {
        let cfg = config::from_str("DASHBOARD_URL=https://view.lan:9443/lovelace/tv\n").unwrap();
        let candidates = candidate_base_urls(&cfg, &[]);
        assert_eq!(candidates[0], "https://view.lan:9443");
    }

    #[test]
    fn test_expand_variants_bare_host() {
        let variants = expand_variants("ha.lan");
        assert_eq!(variants, vec!["http://ha.lan", "http://ha.lan:8123"]);
    }

    #[test]
    fn test_dashboard_full_url_kiosk() {
        let cfg = config::from_str("DASHBOARD_URL=/lovelace/0\n").unwrap();
        assert_eq!(
            dashboard_full_url(&cfg, "http://ha.lan:8123"),
            "http://ha.lan:8123/lovelace/0?kiosk"
        );

        let cfg = config::from_str("DASHBOARD_URL=/lovelace/0?edit=1\n").unwrap();
        assert_eq!(
            dashboard_full_url(&cfg, "http://ha.lan:8123"),
            "http://ha.lan:8123/lovelace/0?edit=1&kiosk"
        );

        // idempotent: kiosk already present
        let cfg = config::from_str("DASHBOARD_URL=/lovelace/0?kiosk\n").unwrap();
        assert_eq!(
            dashboard_full_url(&cfg, "http://ha.lan:8123"),
            "http://ha.lan:8123/lovelace/0?kiosk"
        );

        // disabled
        let cfg = config::from_str("DASHBOARD_URL=/lovelace/0\nKIOSK_MODE=false\n").unwrap();
        assert_eq!(
            dashboard_full_url(&cfg, "http://ha.lan:8123"),
            "http://ha.lan:8123/lovelace/0"
        );
    }

    #[test]
    fn test_token_injection_script() {
        let script = token_injection_script("http://ha.lan:8123", "tok123");
        assert!(script.contains(r#"localStorage.setItem("hassTokens""#));
        assert!(script.contains(r#"access_token: "tok123""#));
        assert!(script.contains(r#"hassUrl: "http://ha.lan:8123""#));
    }

    #[test]
    fn test_origin_of() {
        assert_eq!(
            origin_of("https://a.example.com:8443/lovelace/0"),
            Some("https://a.example.com:8443".into())
        );
        assert_eq!(origin_of("/lovelace/0"), None);
    }
}
