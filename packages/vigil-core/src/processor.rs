//! Per-stream capture pipeline: frame → upload → count → grid → analysis.
//!
//! One invocation handles one tick for one stream. Counter updates and grid
//! dispatch are serialized per stream by an async mutex held for the whole
//! tick; distinct streams proceed in parallel. The counter is reset *before*
//! grid dispatch so a failing downstream never produces duplicate grids on
//! retry - losing one grid's worth of screenshots is the accepted trade in
//! this lossy-by-design pipeline.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::control::{ControlApi, StreamSummary};
use crate::error::VigilResult;
use crate::stitcher::Stitcher;
use crate::storage::ObjectStore;
use crate::stream::StreamSupervisor;
use crate::utils::{sanitize_stream_name, url_basename, url_stem};
use crate::vision::VisionModel;

/// Timestamp layout embedded in screenshot blob keys.
const KEY_TIMESTAMP_FORMAT: &str = "%y-%m-%d--%H--%M--%S";

/// Drives one iteration of the capture pipeline per stream per tick.
pub struct ScreenshotProcessor {
    supervisor: Arc<dyn StreamSupervisor>,
    store: Arc<dyn ObjectStore>,
    vision: Arc<dyn VisionModel>,
    control: Arc<dyn ControlApi>,
    stitcher: Stitcher,
    uploads_dir: PathBuf,
    screenshots_per_grid: AtomicUsize,
    /// Per-stream tick serialization and screenshot counters. The map itself
    /// is lock-free; each entry's mutex covers one stream's whole tick.
    counters: DashMap<i64, Arc<Mutex<usize>>>,
}

impl ScreenshotProcessor {
    pub fn new(
        supervisor: Arc<dyn StreamSupervisor>,
        store: Arc<dyn ObjectStore>,
        vision: Arc<dyn VisionModel>,
        control: Arc<dyn ControlApi>,
        stitcher: Stitcher,
        uploads_dir: PathBuf,
        screenshots_per_grid: usize,
    ) -> Self {
        Self {
            supervisor,
            store,
            vision,
            control,
            stitcher,
            uploads_dir,
            screenshots_per_grid: AtomicUsize::new(screenshots_per_grid),
            counters: DashMap::new(),
        }
    }

    /// Captures, uploads, and counts one screenshot for the stream; when the
    /// counter reaches the grid size, resets it and dispatches grid creation.
    pub async fn process_screenshot(
        &self,
        stream: &StreamSummary,
        grid_rows: u32,
        grid_cols: u32,
    ) -> VigilResult<()> {
        let per_grid = (grid_rows * grid_cols) as usize;
        if per_grid != self.screenshots_per_grid.load(Ordering::Relaxed) {
            log::warn!(
                "[Processor] Grid dimensions ({}x{}) don't match screenshots_per_grid ({}), adapting",
                grid_rows,
                grid_cols,
                self.screenshots_per_grid.load(Ordering::Relaxed)
            );
            self.screenshots_per_grid.store(per_grid, Ordering::Relaxed);
        }

        let counter = self
            .counters
            .entry(stream.id)
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .clone();
        let mut count = counter.lock().await;

        let Some(frame_path) = self.supervisor.latest_frame(stream.id).await else {
            log::warn!(
                "[Processor] No frame available for stream {} ({}), skipping tick",
                stream.id,
                stream.name
            );
            return Ok(());
        };

        let stamp = Utc::now().format(KEY_TIMESTAMP_FORMAT);
        let key = format!(
            "screenshots/{}-{}-{}.jpg",
            stream.id,
            sanitize_stream_name(&stream.name),
            stamp
        );

        // Upload before counting: a rejected upload must not advance the
        // counter, so the next tick retries from the same position.
        self.store.upload(&frame_path, &key).await?;

        let mirror_dir = self.uploads_dir.join("screenshots");
        tokio::fs::create_dir_all(&mirror_dir).await?;
        let mirror_path = mirror_dir.join(url_basename(&key));
        tokio::fs::copy(&frame_path, &mirror_path).await?;

        *count += 1;
        log::debug!(
            "[Processor] Stream {} at {}/{} screenshots",
            stream.id,
            *count,
            per_grid
        );

        if *count >= per_grid {
            *count = 0;
            self.create_grid(stream, grid_rows, grid_cols).await?;
        }
        Ok(())
    }

    /// Builds a grid from the most recent screenshots and runs the stream's
    /// first SOP against it.
    async fn create_grid(
        &self,
        stream: &StreamSummary,
        grid_rows: u32,
        grid_cols: u32,
    ) -> VigilResult<()> {
        let per_grid = (grid_rows * grid_cols) as usize;
        let urls = self
            .store
            .recent_screenshot_urls(stream.id, per_grid)
            .await?;
        if urls.len() < per_grid {
            log::warn!(
                "[Processor] Not enough screenshots for a grid on {} (have {}, need {})",
                stream.name,
                urls.len(),
                per_grid
            );
            return Ok(());
        }

        // The grid inherits the oldest contributing screenshot's name, which
        // makes grid keys deterministic for a given batch.
        let stem = url_stem(&urls[0]).to_owned();
        let grid_key = format!("grids/{stem}.png");
        let grid_path = self.uploads_dir.join("grids").join(format!("{stem}.png"));

        self.stitcher
            .stitch(&urls, &grid_path, grid_rows, grid_cols)
            .await?;
        self.store.upload(&grid_path, &grid_key).await?;

        let detail = self.control.fetch_stream(stream.id).await?;
        let Some(sop) = detail.sops.into_iter().next() else {
            log::info!(
                "[Processor] No SOPs associated with stream {}, grid stored without analysis",
                stream.name
            );
            return Ok(());
        };

        let output = self.vision.analyze(&grid_path, &sop).await?;
        log::info!(
            "[Processor] Analysis for stream {} (sop {}): {}",
            stream.id,
            sop.id,
            output
        );

        // The grid exists and the analysis succeeded; a failed record write
        // is logged but does not fail the tick.
        if let Err(e) = self.control.create_analysis(stream.id, sop.id, &output).await {
            log::error!(
                "[Processor] Failed to record analysis for stream {}: {}",
                stream.id,
                e
            );
        }
        Ok(())
    }
}
