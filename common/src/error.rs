//! Pipeline error taxonomy.
//!
//! Stage-local errors are retried or contained inside their stage; only
//! retry exhaustion escalates to a pipeline-level restart.  TLS errors
//! from self-signed dashboard hosts are expected and never fatal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Credential resolution or injection failed.  Retried with backoff;
    /// the pipeline reports `starting` health until resolved.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Page render timed out or the browser crashed.  Bounded retries,
    /// then a capturer restart.
    #[error("capture failed: {0}")]
    Capture(String),

    /// Self-signed certificate on the dashboard host.  Tolerated and
    /// logged at reduced frequency; does not count toward retry limits.
    #[error("TLS certificate warning: {0}")]
    Tls(String),

    /// The encoder subprocess exited unexpectedly.  Auto-restarted with
    /// backoff; health degrades until the first post-restart segment.
    #[error("encoder failed: {0}")]
    Encoder(String),

    /// A client asked for an evicted or not-yet-written segment.  Served
    /// as HTTP 404, not a pipeline fault.
    #[error("segment {0} not found")]
    SegmentNotFound(u64),
}

impl PipelineError {
    /// Whether this error counts toward a stage's fatal retry limit.
    pub fn counts_toward_retry_limit(&self) -> bool {
        !matches!(self, PipelineError::Tls(_))
    }
}
