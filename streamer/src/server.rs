//! HTTP server publishing the stream to client devices.
//!
//! Routes:
//!   GET /hls/stream.m3u8   → live playlist (always revalidated, never 304)
//!   GET /hls/segment-N.ts  → MPEG-TS segment bytes, 404 once evicted
//!   GET /snapshot.jpg      → most recent frame as JPEG
//!   GET /health            → pipeline health JSON

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use dashcast_common::config::Config;

use crate::pipeline::Pipeline;
use crate::playlist;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
/// Stale playlists behind client caches are an audited defect class:
/// every playlist response forces revalidation and carries no validators
/// (an ETag would let a 304 mask fresh content).
const NO_STORE: &str = "no-cache, no-store, must-revalidate";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/hls/stream.m3u8", get(serve_playlist))
        .route("/hls/{name}", get(serve_segment))
        .route("/snapshot.jpg", get(serve_snapshot))
        .route("/health", get(serve_health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server.  Blocks until the token is cancelled.
pub async fn run(
    state: AppState,
    listen_addr: &str,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Stream server listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

// ── route handlers ───────────────────────────────────────────────────────

async fn serve_playlist(State(state): State<AppState>) -> impl IntoResponse {
    let segments = state.pipeline.segments();
    if segments.is_empty() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CACHE_CONTROL, NO_STORE)],
            "Stream not ready yet".to_string(),
        )
            .into_response();
    }

    let text = playlist::build_playlist(
        &segments,
        state.config.segment_duration,
        chrono::Utc::now(),
        state.pipeline.discontinuity(),
    );
    (
        [
            (header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE),
            (header::CACHE_CONTROL, NO_STORE),
        ],
        text,
    )
        .into_response()
}

async fn serve_segment(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    // The strict filename format doubles as traversal protection.
    let sequence = playlist::parse_sequence(&name).ok_or(StatusCode::NOT_FOUND)?;
    let path = state
        .pipeline
        .segment_path(sequence)
        .map_err(|_| StatusCode::NOT_FOUND)?;

    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        // Evicted between lookup and read
        if e.kind() == std::io::ErrorKind::NotFound {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    })?;

    Ok((
        [
            (header::CONTENT_TYPE, "video/mp2t"),
            // Segments are immutable once closed
            (header::CACHE_CONTROL, "max-age=3600"),
        ],
        bytes,
    ))
}

async fn serve_snapshot(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, StatusCode> {
    let png = state
        .pipeline
        .snapshot_frame()
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)?;

    let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(&png))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        jpeg,
    ))
}

async fn serve_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pipeline.health(&state.config))
}

/// Re-encode a captured PNG frame as JPEG (quality 85).  Alpha is
/// flattened first; JPEG has no transparency.
fn encode_jpeg(png: &[u8]) -> anyhow::Result<Vec<u8>> {
    let img = image::load_from_memory(png)?;
    let rgb = image::DynamicImage::ImageRgb8(img.to_rgb8());

    let mut out = std::io::Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 85);
    rgb.write_with_encoder(encoder)?;
    Ok(out.into_inner())
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::EncoderState;
    use crate::playlist::Segment;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(name: &str) -> (AppState, std::path::PathBuf) {
        let dir = std::env::temp_dir().join("dashcast_test").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let config = dashcast_common::config::from_str(&format!(
            "HLS_DIR={}\nSEGMENT_DURATION=4\nSEGMENT_WINDOW=3\n",
            dir.display()
        ))
        .unwrap();
        let state = AppState {
            pipeline: Arc::new(Pipeline::new()),
            config: Arc::new(config),
        };
        (state, dir)
    }

    fn populate_segments(state: &AppState, dir: &std::path::Path, sequences: &[u64]) {
        let segments: Vec<Segment> = sequences
            .iter()
            .map(|&sequence| {
                let path = dir.join(playlist::segment_filename(sequence));
                std::fs::write(&path, format!("ts-{sequence}")).unwrap();
                Segment {
                    sequence,
                    path,
                    duration_s: 4,
                    size: 10,
                }
            })
            .collect();
        state.pipeline.transition_encoder(EncoderState::Starting);
        state.pipeline.update_segments(segments, 3);
    }

    async fn get(app: Router, uri: &str) -> axum::response::Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_playlist_unavailable_before_first_segment() {
        let (state, _dir) = test_state("playlist_503");
        let resp = get(router(state), "/hls/stream.m3u8").await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_playlist_headers_never_cacheable() {
        let (state, dir) = test_state("playlist_headers");
        populate_segments(&state, &dir, &[4, 5, 6]);

        // Immediate repeats must always be full 200 responses.
        for _ in 0..3 {
            let resp = get(router(state.clone()), "/hls/stream.m3u8").await;
            assert_eq!(resp.status(), StatusCode::OK);

            let headers = resp.headers();
            assert_eq!(headers[header::CONTENT_TYPE], PLAYLIST_CONTENT_TYPE);
            assert_eq!(headers[header::CACHE_CONTROL], NO_STORE);
            // Validators would let a 304 mask fresh content.
            assert!(headers.get(header::ETAG).is_none());
            assert!(headers.get(header::LAST_MODIFIED).is_none());
        }
    }

    #[tokio::test]
    async fn test_playlist_matches_window() {
        let (state, dir) = test_state("playlist_body");
        populate_segments(&state, &dir, &[4, 5, 6]);

        let resp = get(router(state), "/hls/stream.m3u8").await;
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();

        assert!(text.contains("#EXT-X-MEDIA-SEQUENCE:4"));
        assert!(text.contains("segment-00004.ts"));
        assert!(text.contains("segment-00006.ts"));
        assert!(!text.contains("segment-00003.ts"));
        assert!(!text.contains("#EXT-X-ENDLIST"));
    }

    #[tokio::test]
    async fn test_segment_served_and_evicted_404() {
        let (state, dir) = test_state("segments");
        populate_segments(&state, &dir, &[4, 5, 6]);

        let resp = get(router(state.clone()), "/hls/segment-00005.ts").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "video/mp2t");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ts-5");

        // Evicted and future sequence numbers are a client error, not a
        // pipeline fault.
        for uri in ["/hls/segment-00003.ts", "/hls/segment-00009.ts", "/hls/evil.ts"] {
            let resp = get(router(state.clone()), uri).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_health_json() {
        let (state, _dir) = test_state("health");
        let resp = get(router(state), "/health").await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let health: dashcast_common::protocol::HealthResponse =
            serde_json::from_slice(&body).unwrap();
        assert!(!health.capture_ok);
        assert!(!health.encode_ok);
        assert_eq!(health.segments_available, 0);
        assert_eq!(health.encoder_state, "idle");
    }

    #[tokio::test]
    async fn test_snapshot_reencodes_frame() {
        let (state, _dir) = test_state("snapshot");

        // 503 until the first capture lands.
        let resp = get(router(state.clone()), "/snapshot.jpg").await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        // Store a real 2x2 PNG frame.
        let mut png = std::io::Cursor::new(Vec::new());
        let frame = image::RgbaImage::from_pixel(2, 2, image::Rgba([10, 20, 30, 255]));
        image::DynamicImage::ImageRgba8(frame)
            .write_with_encoder(image::codecs::png::PngEncoder::new(&mut png))
            .unwrap();
        state.pipeline.note_capture(png.into_inner());

        let resp = get(router(state), "/snapshot.jpg").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/jpeg");
        assert_eq!(resp.headers()[header::CACHE_CONTROL], "no-cache");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        // JPEG SOI marker
        assert_eq!(&body[..2], &[0xFF, 0xD8]);
    }
}
