//! Application bootstrap and dependency wiring.
//!
//! The composition root: every service is instantiated and wired here, in
//! dependency order, so the object graph is visible in one place and easy to
//! swap for tests.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::catalog::StreamCatalog;
use crate::control::{ControlApi, HttpControlApi};
use crate::error::{VigilError, VigilResult};
use crate::fetcher::HttpImageFetcher;
use crate::processor::ScreenshotProcessor;
use crate::scheduler::Scheduler;
use crate::state::Config;
use crate::stitcher::Stitcher;
use crate::storage::{GcsStore, ObjectStore};
use crate::stream::{StreamManager, StreamSupervisor};
use crate::vision::{GeminiClient, VisionModel};

/// Timeout for control-plane and image-download HTTP requests. The vision
/// call manages its own (longer) streaming deadline.
const HTTP_TIMEOUT_SECS: u64 = 15;

/// Container for all bootstrapped services.
pub struct BootstrappedServices {
    /// Transcoder supervisor (owns every ffmpeg process).
    pub stream_manager: Arc<StreamManager>,
    /// TTL cache over the stream registry.
    pub catalog: Arc<StreamCatalog>,
    /// Per-stream capture pipeline.
    pub processor: Arc<ScreenshotProcessor>,
    /// Interval task driver.
    pub scheduler: Arc<Scheduler>,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
    /// Shared HTTP client for connection pooling.
    http_client: Client,
}

impl std::fmt::Debug for BootstrappedServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrappedServices").finish_non_exhaustive()
    }
}

impl BootstrappedServices {
    /// Returns the shared HTTP client.
    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    /// Starts the first transcoder pass and the recurring scheduler loops.
    pub async fn start(&self) {
        self.scheduler.initialize_streams().await;
        Arc::clone(&self.scheduler).start();
    }

    /// Initiates graceful shutdown: cancels every loop, then stops and
    /// reclaims every transcoder session.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");
        self.cancel_token.cancel();
        self.stream_manager.stop_all().await;
        log::info!("[Bootstrap] Shutdown complete");
    }
}

/// Creates the shared HTTP client used by the control-plane client and the
/// image fetcher.
fn create_http_client() -> VigilResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .map_err(|e| VigilError::Config(format!("failed to create HTTP client: {e}")))
}

/// The vision client streams its response, so its client carries no overall
/// request timeout - the adapter enforces the deadline itself.
fn create_vision_http_client() -> VigilResult<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .map_err(|e| VigilError::Config(format!("failed to create HTTP client: {e}")))
}

/// Bootstraps all services with their dependencies.
///
/// Wiring order: shared infrastructure (HTTP clients, cancellation token),
/// external collaborators (object store, vision model, control client),
/// then the pipeline services that compose them.
///
/// # Errors
///
/// Fails fast on invalid configuration or missing credentials
/// (`GCS_CREDENTIALS_PATH`, `GCS_BUCKET_NAME`, `GEMINI_API_KEY`).
pub fn bootstrap_services(config: &Config) -> VigilResult<BootstrappedServices> {
    config.validate().map_err(VigilError::Config)?;

    let http_client = create_http_client()?;
    let cancel_token = CancellationToken::new();

    let store: Arc<dyn ObjectStore> = Arc::new(GcsStore::from_env()?);
    let vision: Arc<dyn VisionModel> = Arc::new(GeminiClient::from_env(
        create_vision_http_client()?,
        config.vision_model.clone(),
        Duration::from_secs(config.vision_timeout_secs),
    )?);
    let control: Arc<dyn ControlApi> = Arc::new(HttpControlApi::new(
        http_client.clone(),
        config.api_base_url.clone(),
    ));

    let catalog = Arc::new(StreamCatalog::new(
        Arc::clone(&control),
        Duration::from_secs(config.streams_cache_ttl_secs),
    ));

    let stream_manager = Arc::new(StreamManager::new(config.transcode.clone()));

    let stitcher = Stitcher::new(Arc::new(HttpImageFetcher::new(http_client.clone())));
    let processor = Arc::new(ScreenshotProcessor::new(
        Arc::clone(&stream_manager) as Arc<dyn StreamSupervisor>,
        Arc::clone(&store),
        Arc::clone(&vision),
        Arc::clone(&control),
        stitcher,
        config.uploads_dir.clone(),
        config.screenshots_per_grid(),
    ));

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&catalog),
        Arc::clone(&stream_manager) as Arc<dyn StreamSupervisor>,
        Arc::clone(&processor),
        config,
        cancel_token.clone(),
    ));

    Ok(BootstrappedServices {
        stream_manager,
        catalog,
        processor,
        scheduler,
        cancel_token,
        http_client,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_client_builds() {
        let client = create_http_client().unwrap();
        assert!(client.get("http://example.com").build().is_ok());
    }

    #[test]
    fn bootstrap_rejects_invalid_config() {
        let config = Config {
            grid_rows: 0,
            ..Default::default()
        };
        let err = bootstrap_services(&config).unwrap_err();
        assert_eq!(err.code(), "configuration_error");
    }
}
