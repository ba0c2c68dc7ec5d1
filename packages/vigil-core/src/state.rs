//! Core configuration types.
//!
//! All fields have sensible defaults; `validate()` rejects values that would
//! break the pipeline at runtime (zero intervals, empty grids).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for the transcoder supervisor.
///
/// Groups the external-process tunables: HLS window shape, verification and
/// extraction deadlines, and diagnostics retention.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TranscodeConfig {
    /// Path or name of the ffmpeg executable.
    pub ffmpeg_path: PathBuf,

    /// Seconds per HLS segment.
    pub segment_seconds: u32,

    /// Number of segments kept in the rolling playlist window.
    pub playlist_size: u32,

    /// Deadline for the playlist and first segment to appear after launch
    /// (seconds).
    pub verify_timeout_secs: u64,

    /// Deadline for the one-shot frame extractor (seconds).
    pub extract_timeout_secs: u64,

    /// Grace period between TERM and KILL on teardown (seconds).
    pub stop_grace_secs: u64,

    /// Number of recent stderr lines retained per transcoder process.
    pub log_ring_lines: usize,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            segment_seconds: 2,
            playlist_size: 5,
            verify_timeout_secs: 10,
            extract_timeout_secs: 5,
            stop_grace_secs: 5,
            log_ring_lines: 100,
        }
    }
}

impl TranscodeConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.segment_seconds == 0 {
            return Err("segment_seconds must be >= 1".to_string());
        }
        if self.playlist_size == 0 {
            return Err("playlist_size must be >= 1".to_string());
        }
        if self.verify_timeout_secs == 0 {
            return Err("verify_timeout_secs must be >= 1".to_string());
        }
        if self.log_ring_lines == 0 {
            return Err("log_ring_lines must be >= 1".to_string());
        }
        Ok(())
    }
}

/// Configuration for the Vigil pipeline.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    // Control plane
    /// Base URL of the CRUD service (`API_BASE_URL`).
    pub api_base_url: String,

    /// TTL for the cached stream registry (seconds).
    pub streams_cache_ttl_secs: u64,

    // Scheduling
    /// Interval between stream health verification passes (seconds).
    pub verify_interval_secs: u64,

    /// Interval between screenshot capture passes (seconds).
    pub capture_interval_secs: u64,

    /// Delay before retrying a failed stream start (seconds).
    pub start_retry_delay_secs: u64,

    // Grid
    /// Rows in the analysis grid.
    pub grid_rows: u32,

    /// Columns in the analysis grid.
    pub grid_cols: u32,

    // Vision
    /// Vision model identifier passed to the generate-content endpoint.
    pub vision_model: String,

    /// Deadline for a single vision call (seconds).
    pub vision_timeout_secs: u64,

    // Filesystem
    /// Root of the local screenshot/grid mirror.
    pub uploads_dir: PathBuf,

    /// Transcoder supervision settings.
    #[serde(default)]
    pub transcode: TranscodeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:5000".to_string(),
            streams_cache_ttl_secs: 300,
            verify_interval_secs: 60,
            capture_interval_secs: 10,
            start_retry_delay_secs: 2,
            grid_rows: 2,
            grid_cols: 3,
            vision_model: "gemini-1.5-flash".to_string(),
            vision_timeout_secs: 30,
            uploads_dir: PathBuf::from("uploads"),
            transcode: TranscodeConfig::default(),
        }
    }
}

impl Config {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.api_base_url.is_empty() {
            return Err("api_base_url must not be empty".to_string());
        }
        if self.grid_rows == 0 || self.grid_cols == 0 {
            return Err("grid dimensions must be >= 1".to_string());
        }
        if self.capture_interval_secs == 0 {
            return Err("capture_interval_secs must be >= 1".to_string());
        }
        if self.verify_interval_secs == 0 {
            return Err("verify_interval_secs must be >= 1".to_string());
        }
        if self.vision_timeout_secs == 0 {
            return Err("vision_timeout_secs must be >= 1".to_string());
        }
        if self.vision_model.is_empty() {
            return Err("vision_model must not be empty".to_string());
        }
        self.transcode.validate()
    }

    /// Number of screenshots accumulated before a grid is dispatched.
    #[must_use]
    pub fn screenshots_per_grid(&self) -> usize {
        (self.grid_rows * self.grid_cols) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn default_grid_is_two_by_three() {
        let config = Config::default();
        assert_eq!(config.screenshots_per_grid(), 6);
    }

    #[test]
    fn zero_grid_dimension_rejected() {
        let config = Config {
            grid_rows: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_capture_interval_rejected() {
        let config = Config {
            capture_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_playlist_size_rejected() {
        let transcode = TranscodeConfig {
            playlist_size: 0,
            ..Default::default()
        };
        assert!(transcode.validate().is_err());
    }
}
