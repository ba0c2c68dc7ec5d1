//! Image download for grid composition.

use async_trait::async_trait;
use image::DynamicImage;
use reqwest::Client;

use crate::error::{VigilError, VigilResult};

/// Fetches and decodes an image from a URL.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> VigilResult<DynamicImage>;
}

/// reqwest-backed [`ImageFetcher`]. URLs returned by the object store are
/// publicly resolvable, so no credentials are attached.
pub struct HttpImageFetcher {
    client: Client,
}

impl HttpImageFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> VigilResult<DynamicImage> {
        let response = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| VigilError::Network(format!("image download failed: {e}")))?;
        let bytes = response.bytes().await?;
        image::load_from_memory(&bytes)
            .map_err(|e| VigilError::Network(format!("image decode failed for {url}: {e}")))
    }
}
