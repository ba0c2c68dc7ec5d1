//! Centralized error types for the Vigil core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Attaches machine-readable error codes for logs and diagnostics
//! - Maps 1:1 onto the pipeline's failure policy: everything except I/O
//!   failures at startup is recoverable at the tick boundary

use thiserror::Error;

/// Application-wide error type for the Vigil pipeline.
#[derive(Debug, Error)]
pub enum VigilError {
    /// Transient network failure talking to the control API or object store.
    ///
    /// Callers log it, keep any cached state, and retry on the next tick.
    #[error("network error: {0}")]
    Network(String),

    /// The RTSP source is unreachable or the transcoder failed to launch or
    /// verify. The session is marked `error`; the verify cycle restarts it.
    #[error("stream unavailable: {0}")]
    StreamUnavailable(String),

    /// The one-shot frame extractor failed. Affects a single tick only.
    #[error("frame extraction failed: {0}")]
    Extraction(String),

    /// The object store rejected an upload. The screenshot counter is not
    /// incremented, so the next tick retries from the same position.
    #[error("upload failed: {0}")]
    Upload(String),

    /// A SOP's structured output schema violates the schema rules.
    #[error("invalid output schema: {0}")]
    Schema(String),

    /// The vision call exceeded its deadline. No Analysis record is written.
    #[error("analysis timed out after {0}s")]
    AnalysisTimeout(u64),

    /// The vision model's response could not be parsed into the SOP's shape.
    /// Carries the raw response text for debugging.
    #[error("analysis response could not be parsed: {message}")]
    AnalysisParse {
        message: String,
        /// Raw accumulated response text, for diagnostics.
        raw: String,
    },

    /// The vision call itself failed (bad image, HTTP error status, stream
    /// error mid-response).
    #[error("analysis failed: {0}")]
    Analysis(String),

    /// Missing or invalid configuration (credentials, deprecated model).
    /// Detected at startup where possible, otherwise surfaced per call.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem failure (scratch directory creation, frame copy).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VigilError {
    /// Returns a machine-readable error code for logs and diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network(_) => "network_error",
            Self::StreamUnavailable(_) => "stream_unavailable",
            Self::Extraction(_) => "extraction_failed",
            Self::Upload(_) => "upload_failed",
            Self::Schema(_) => "schema_invalid",
            Self::AnalysisTimeout(_) => "analysis_timeout",
            Self::AnalysisParse { .. } => "analysis_parse",
            Self::Analysis(_) => "analysis_failed",
            Self::Config(_) => "configuration_error",
            Self::Io(_) => "io_error",
        }
    }

    /// Whether the error is expected to clear on its own by the next
    /// scheduler pass (as opposed to needing operator attention).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::StreamUnavailable(_)
                | Self::Extraction(_)
                | Self::Upload(_)
                | Self::AnalysisTimeout(_)
        )
    }
}

impl From<reqwest::Error> for VigilError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

/// Convenient Result alias for pipeline operations.
pub type VigilResult<T> = Result<T, VigilError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(VigilError::Network("x".into()).code(), "network_error");
        assert_eq!(
            VigilError::StreamUnavailable("x".into()).code(),
            "stream_unavailable"
        );
        assert_eq!(VigilError::Upload("x".into()).code(), "upload_failed");
        assert_eq!(VigilError::AnalysisTimeout(30).code(), "analysis_timeout");
        assert_eq!(
            VigilError::AnalysisParse {
                message: "x".into(),
                raw: "{".into()
            }
            .code(),
            "analysis_parse"
        );
        assert_eq!(VigilError::Config("x".into()).code(), "configuration_error");
    }

    #[test]
    fn tick_boundary_errors_are_transient() {
        assert!(VigilError::Upload("rejected".into()).is_transient());
        assert!(VigilError::AnalysisTimeout(30).is_transient());
        assert!(!VigilError::Schema("no type".into()).is_transient());
        assert!(!VigilError::Config("missing key".into()).is_transient());
    }

    #[test]
    fn analysis_parse_keeps_raw_text() {
        let err = VigilError::AnalysisParse {
            message: "expected value".into(),
            raw: "not json".into(),
        };
        if let VigilError::AnalysisParse { raw, .. } = &err {
            assert_eq!(raw, "not json");
        } else {
            unreachable!();
        }
    }
}
