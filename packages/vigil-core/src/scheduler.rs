//! Fixed-interval task driver: initialize, verify, capture.
//!
//! Each task runs on its own tokio interval with missed ticks skipped, and
//! each pass is awaited inline - a pass that overruns its interval suppresses
//! the late ticks instead of queueing them. Failures are absorbed per stream;
//! one broken stream never aborts a pass.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::catalog::StreamCatalog;
use crate::processor::ScreenshotProcessor;
use crate::state::Config;
use crate::stream::{StartOutcome, StreamStatus, StreamSupervisor};

#[derive(Clone, Copy)]
enum Task {
    Verify,
    Capture,
}

impl Task {
    const fn name(&self) -> &'static str {
        match self {
            Self::Verify => "verify_streams",
            Self::Capture => "capture_screenshots",
        }
    }
}

/// Drives the recurring pipeline tasks until cancelled.
pub struct Scheduler {
    catalog: Arc<StreamCatalog>,
    supervisor: Arc<dyn StreamSupervisor>,
    processor: Arc<ScreenshotProcessor>,
    verify_interval: Duration,
    capture_interval: Duration,
    start_retry_delay: Duration,
    grid_rows: u32,
    grid_cols: u32,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        catalog: Arc<StreamCatalog>,
        supervisor: Arc<dyn StreamSupervisor>,
        processor: Arc<ScreenshotProcessor>,
        config: &Config,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            catalog,
            supervisor,
            processor,
            verify_interval: Duration::from_secs(config.verify_interval_secs),
            capture_interval: Duration::from_secs(config.capture_interval_secs),
            start_retry_delay: Duration::from_secs(config.start_retry_delay_secs),
            grid_rows: config.grid_rows,
            grid_cols: config.grid_cols,
            cancel,
        }
    }

    /// Startup pass: starts a transcoder for every known stream, retrying
    /// once after a short delay on failure.
    pub async fn initialize_streams(&self) {
        let streams = self.catalog.streams().await;
        log::info!("[Scheduler] Initializing {} stream(s)", streams.len());

        for stream in streams {
            if self.cancel.is_cancelled() {
                return;
            }
            let outcome = self
                .supervisor
                .start_stream(stream.id, &stream.rtsp_url)
                .await;
            if let StartOutcome::Failed(reason) = outcome {
                log::error!(
                    "[Scheduler] Failed to initialize stream {}: {}, retrying",
                    stream.name,
                    reason
                );
                tokio::time::sleep(self.start_retry_delay).await;
                if let StartOutcome::Failed(reason) = self
                    .supervisor
                    .start_stream(stream.id, &stream.rtsp_url)
                    .await
                {
                    log::error!(
                        "[Scheduler] Failed to initialize stream {} after retry: {}",
                        stream.name,
                        reason
                    );
                }
            }
        }
    }

    /// Verify pass: restarts any stream that is not running.
    pub async fn verify_pass(&self) {
        for stream in self.catalog.streams().await {
            if self.cancel.is_cancelled() {
                return;
            }
            let status = self.supervisor.stream_status(stream.id).await;
            let running = matches!(
                &status,
                Some(snapshot) if snapshot.status == StreamStatus::Running
            );
            if running {
                continue;
            }

            let observed = status
                .map(|s| s.status.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            log::error!(
                "[Scheduler] Stream {} not running (status: {}), attempting restart",
                stream.name,
                observed
            );
            self.supervisor.stop_stream(stream.id).await;
            tokio::time::sleep(self.start_retry_delay).await;
            match self
                .supervisor
                .start_stream(stream.id, &stream.rtsp_url)
                .await
            {
                StartOutcome::Started => {
                    log::info!("[Scheduler] Stream {} restarted", stream.name);
                }
                StartOutcome::AlreadyRunning => {}
                StartOutcome::Failed(reason) => {
                    log::error!(
                        "[Scheduler] Restart of stream {} failed: {}",
                        stream.name,
                        reason
                    );
                }
            }
        }
    }

    /// Capture pass: one screenshot per running stream, fanned out so slow
    /// streams don't delay the others. Per-stream serialization is the
    /// processor's responsibility.
    pub async fn capture_pass(&self) {
        let streams = self.catalog.streams().await;
        let mut tasks = JoinSet::new();

        for stream in streams {
            let supervisor = Arc::clone(&self.supervisor);
            let processor = Arc::clone(&self.processor);
            let (grid_rows, grid_cols) = (self.grid_rows, self.grid_cols);

            tasks.spawn(async move {
                let status = supervisor.stream_status(stream.id).await;
                let running = matches!(
                    &status,
                    Some(snapshot) if snapshot.status == StreamStatus::Running
                );
                if !running {
                    log::warn!(
                        "[Scheduler] Skipping screenshot for {} - stream not running",
                        stream.name
                    );
                    return;
                }
                if let Err(e) = processor
                    .process_screenshot(&stream, grid_rows, grid_cols)
                    .await
                {
                    log::error!(
                        "[Scheduler] Screenshot pass failed for {} ({}): {}",
                        stream.name,
                        e.code(),
                        e
                    );
                }
            });
        }

        while tasks.join_next().await.is_some() {}
    }

    /// Spawns the verify and capture loops. Returns immediately; the loops
    /// run until the cancellation token fires.
    pub fn start(self: Arc<Self>) {
        let verify = Arc::clone(&self);
        tokio::spawn(async move {
            verify.run_loop(Task::Verify, verify.verify_interval).await;
        });

        let capture = self;
        tokio::spawn(async move {
            capture
                .run_loop(Task::Capture, capture.capture_interval)
                .await;
        });
    }

    /// Shared interval loop: skipped (not queued) missed ticks, cancellation
    /// via `select!`, and a log line whenever a pass overran its interval.
    async fn run_loop(&self, task: Task, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup work
        // (initialize_streams) isn't doubled by an instant verify/capture.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::info!("[Scheduler] {} loop shutting down", task.name());
                    return;
                }
                _ = interval.tick() => {}
            }

            let started = tokio::time::Instant::now();
            match task {
                Task::Verify => self.verify_pass().await,
                Task::Capture => self.capture_pass().await,
            }
            let elapsed = started.elapsed();
            if elapsed > period {
                log::warn!(
                    "[Scheduler] {} pass took {:?} (interval {:?}), dropping missed ticks",
                    task.name(),
                    elapsed,
                    period
                );
            }
        }
    }
}
