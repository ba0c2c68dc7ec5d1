//! TTL cache over the remote stream registry.
//!
//! The scheduler reads the stream list on every pass; hitting the control
//! API each time would couple every tick to its availability. The catalog
//! caches the last good list and serves it for `ttl` seconds, falling back
//! to stale data when a refresh fails.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::control::{ControlApi, StreamSummary};

struct CachedStreams {
    streams: Vec<StreamSummary>,
    last_updated: Option<Instant>,
}

/// Fail-soft TTL cache for the stream registry.
pub struct StreamCatalog {
    control: Arc<dyn ControlApi>,
    cache: RwLock<CachedStreams>,
    ttl: Duration,
}

impl StreamCatalog {
    /// Creates a catalog backed by the given control client.
    pub fn new(control: Arc<dyn ControlApi>, ttl: Duration) -> Self {
        Self {
            control,
            cache: RwLock::new(CachedStreams {
                streams: Vec::new(),
                last_updated: None,
            }),
            ttl,
        }
    }

    /// Returns the stream list, refreshing from the control API when the
    /// cached copy has expired.
    ///
    /// On refresh failure the previously cached list is returned unchanged
    /// (empty until the first successful fetch). Concurrent refreshes are
    /// permitted; the last writer wins.
    pub async fn streams(&self) -> Vec<StreamSummary> {
        {
            let cache = self.cache.read();
            if let Some(at) = cache.last_updated {
                if at.elapsed() < self.ttl {
                    return cache.streams.clone();
                }
            }
        }

        match self.control.fetch_streams().await {
            Ok(streams) => {
                if streams.is_empty() {
                    log::warn!("[Catalog] Registry returned no streams");
                } else {
                    log::info!("[Catalog] Fetched {} streams from registry", streams.len());
                }
                let mut cache = self.cache.write();
                cache.streams = streams.clone();
                cache.last_updated = Some(Instant::now());
                streams
            }
            Err(e) => {
                let cache = self.cache.read();
                log::error!(
                    "[Catalog] Registry refresh failed ({}), serving {} cached entries",
                    e,
                    cache.streams.len()
                );
                cache.streams.clone()
            }
        }
    }

    /// Drops the cached list so the next read refetches.
    pub fn invalidate(&self) {
        self.cache.write().last_updated = None;
    }
}
