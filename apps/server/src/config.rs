//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the control-plane CRUD service.
    /// Override: `API_BASE_URL`
    pub api_base_url: String,

    /// TTL for the cached stream registry (seconds).
    /// Override: `VIGIL_STREAMS_CACHE_TTL`
    pub streams_cache_ttl_secs: u64,

    /// Interval between stream verification passes (seconds).
    /// Override: `VIGIL_VERIFY_INTERVAL`
    pub verify_interval_secs: u64,

    /// Interval between screenshot capture passes (seconds).
    /// Override: `VIGIL_CAPTURE_INTERVAL`
    pub capture_interval_secs: u64,

    /// Rows in the analysis grid.
    pub grid_rows: u32,

    /// Columns in the analysis grid.
    pub grid_cols: u32,

    /// Vision model identifier.
    /// Override: `VIGIL_VISION_MODEL`
    pub vision_model: String,

    /// Deadline for a single vision call (seconds).
    pub vision_timeout_secs: u64,

    /// Root of the local screenshot/grid mirror.
    pub uploads_dir: PathBuf,

    /// Path or name of the ffmpeg executable.
    /// Override: `VIGIL_FFMPEG_PATH`
    pub ffmpeg_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = vigil_core::Config::default();
        Self {
            api_base_url: core.api_base_url,
            streams_cache_ttl_secs: core.streams_cache_ttl_secs,
            verify_interval_secs: core.verify_interval_secs,
            capture_interval_secs: core.capture_interval_secs,
            grid_rows: core.grid_rows,
            grid_cols: core.grid_cols,
            vision_model: core.vision_model,
            vision_timeout_secs: core.vision_timeout_secs,
            uploads_dir: core.uploads_dir,
            ffmpeg_path: core.transcode.ffmpeg_path,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("API_BASE_URL") {
            if !val.is_empty() {
                self.api_base_url = val;
            }
        }
        if let Ok(val) = std::env::var("VIGIL_STREAMS_CACHE_TTL") {
            if let Ok(ttl) = val.parse() {
                self.streams_cache_ttl_secs = ttl;
            }
        }
        if let Ok(val) = std::env::var("VIGIL_VERIFY_INTERVAL") {
            if let Ok(interval) = val.parse() {
                self.verify_interval_secs = interval;
            }
        }
        if let Ok(val) = std::env::var("VIGIL_CAPTURE_INTERVAL") {
            if let Ok(interval) = val.parse() {
                self.capture_interval_secs = interval;
            }
        }
        if let Ok(val) = std::env::var("VIGIL_VISION_MODEL") {
            if !val.is_empty() {
                self.vision_model = val;
            }
        }
        if let Ok(val) = std::env::var("VIGIL_FFMPEG_PATH") {
            if !val.is_empty() {
                self.ffmpeg_path = PathBuf::from(val);
            }
        }
    }

    /// Converts to vigil-core's Config type.
    pub fn to_core_config(&self) -> vigil_core::Config {
        vigil_core::Config {
            api_base_url: self.api_base_url.clone(),
            streams_cache_ttl_secs: self.streams_cache_ttl_secs,
            verify_interval_secs: self.verify_interval_secs,
            capture_interval_secs: self.capture_interval_secs,
            grid_rows: self.grid_rows,
            grid_cols: self.grid_cols,
            vision_model: self.vision_model.clone(),
            vision_timeout_secs: self.vision_timeout_secs,
            uploads_dir: self.uploads_dir.clone(),
            transcode: vigil_core::TranscodeConfig {
                ffmpeg_path: self.ffmpeg_path.clone(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
