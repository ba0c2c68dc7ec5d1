//! Transcoder supervision: one external RTSP→HLS process per stream.
//!
//! The manager owns every live session exclusively. A single mutex guards
//! the session registry; it is never held across process or filesystem I/O.
//! Scratch directories, child processes, and stderr rings all live and die
//! with their session.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr};

use crate::state::TranscodeConfig;
use crate::stream::transcoder::{self, PLAYLIST_MAGIC, PLAYLIST_NAME};

/// Number of stderr lines included in crash diagnostics.
const CRASH_LOG_TAIL: usize = 5;

/// Poll cadence for HLS verification.
const VERIFY_POLL: Duration = Duration::from_millis(500);

/// Lifecycle state of a supervised stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    /// Session reserved, transcoder starting up.
    Init,
    /// Transcoder alive with a verified HLS window.
    Running,
    /// Launch, verification, or the process itself failed.
    Error,
}

impl StreamStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::Error => "error",
        }
    }
}

/// Point-in-time view of a session's health.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub status: StreamStatus,
    pub error: Option<String>,
}

/// Result of a start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Transcoder launched and the HLS window verified.
    Started,
    /// A session for this id already exists; nothing was changed.
    AlreadyRunning,
    /// Launch or verification failed; the session was torn down.
    Failed(String),
}

/// Stream lifecycle operations consumed by the scheduler and processor.
#[async_trait]
pub trait StreamSupervisor: Send + Sync {
    async fn start_stream(&self, id: i64, rtsp_url: &str) -> StartOutcome;
    async fn stop_stream(&self, id: i64);
    async fn stream_status(&self, id: i64) -> Option<StatusSnapshot>;
    /// Extracts the newest frame as a JPEG, returning its path. The path is
    /// stable across calls (overwritten); callers needing to retain the
    /// image must copy it.
    async fn latest_frame(&self, id: i64) -> Option<PathBuf>;
}

struct StreamSession {
    rtsp_url: String,
    status: StreamStatus,
    error: Option<String>,
    work_dir: Option<PathBuf>,
    child: Option<Child>,
    /// Unix process-group id of the transcoder subtree (None on Windows).
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<i32>,
    log_ring: Arc<Mutex<VecDeque<String>>>,
}

impl StreamSession {
    fn reserved(rtsp_url: &str) -> Self {
        Self {
            rtsp_url: rtsp_url.to_string(),
            status: StreamStatus::Init,
            error: None,
            work_dir: None,
            child: None,
            pgid: None,
            log_ring: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

/// Supervises RTSP→HLS transcoder processes with thread-safe lifecycle
/// management and single-frame extraction.
pub struct StreamManager {
    config: TranscodeConfig,
    sessions: Mutex<HashMap<i64, StreamSession>>,
}

impl StreamManager {
    pub fn new(config: TranscodeConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Launches and verifies a transcoder for the stream.
    ///
    /// The id is reserved atomically before any slow work, so concurrent
    /// callers observe `AlreadyRunning` rather than racing two processes.
    pub async fn start_stream(&self, id: i64, rtsp_url: &str) -> StartOutcome {
        {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(&id) {
                return StartOutcome::AlreadyRunning;
            }
            sessions.insert(id, StreamSession::reserved(rtsp_url));
        }

        let work_dir = match tempfile::Builder::new()
            .prefix(&format!("stream_{id}_"))
            .tempdir()
        {
            Ok(dir) => dir.into_path(),
            Err(e) => {
                let reason = format!("cannot create scratch directory: {e}");
                log::error!("[StreamManager] {} for stream {}", reason, id);
                self.fail_and_teardown(id, &reason).await;
                return StartOutcome::Failed(reason);
            }
        };
        self.sessions
            .lock()
            .entry(id)
            .and_modify(|s| s.work_dir = Some(work_dir.clone()));

        let mut command = transcoder::hls_command(&self.config, rtsp_url, &work_dir);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("transcoder launch failed: {e}");
                log::error!("[StreamManager] {} for stream {}", reason, id);
                self.fail_and_teardown(id, &reason).await;
                return StartOutcome::Failed(reason);
            }
        };

        let pgid = child.id().map(|pid| pid as i32);
        let ring = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(&id) {
                None => {
                    // Stopped while we were spawning; reap the orphan.
                    let _ = child.start_kill();
                    None
                }
                Some(session) => {
                    session.pgid = pgid;
                    let ring = Arc::clone(&session.log_ring);
                    if let Some(stderr) = child.stderr.take() {
                        spawn_stderr_reader(
                            id,
                            stderr,
                            Arc::clone(&ring),
                            self.config.log_ring_lines,
                        );
                    }
                    session.child = Some(child);
                    Some(ring)
                }
            }
        };
        let ring = match ring {
            Some(ring) => ring,
            None => {
                let _ = tokio::fs::remove_dir_all(&work_dir).await;
                return StartOutcome::Failed("session stopped during startup".into());
            }
        };

        let verify_timeout = Duration::from_secs(self.config.verify_timeout_secs);
        if !verify_hls(&work_dir, verify_timeout).await {
            let tail = tail_of(&ring, CRASH_LOG_TAIL);
            let reason = format!("HLS setup timeout; stderr tail: {tail:?}");
            log::error!("[StreamManager] Stream {} failed verification: {}", id, reason);
            self.fail_and_teardown(id, &reason).await;
            return StartOutcome::Failed(reason);
        }

        let mut sessions = self.sessions.lock();
        match sessions.get_mut(&id) {
            Some(session) => {
                session.status = StreamStatus::Running;
                session.error = None;
                log::info!(
                    "[StreamManager] Stream {} running ({} -> {})",
                    id,
                    session.rtsp_url,
                    work_dir.display()
                );
                StartOutcome::Started
            }
            None => StartOutcome::Failed("session stopped during startup".into()),
        }
    }

    /// Records the failure then tears the session down.
    async fn fail_and_teardown(&self, id: i64, reason: &str) {
        {
            let mut sessions = self.sessions.lock();
            if let Some(session) = sessions.get_mut(&id) {
                session.status = StreamStatus::Error;
                session.error = Some(reason.to_string());
            }
        }
        self.stop_stream(id).await;
    }

    /// Returns a health snapshot, reaping crashed processes as a side effect.
    ///
    /// When the transcoder has exited since the last observation the snapshot
    /// is synthesized as an error carrying the stderr tail, and the session
    /// is stopped.
    pub async fn get_stream_status(&self, id: i64) -> Option<StatusSnapshot> {
        let crash = {
            let mut sessions = self.sessions.lock();
            let session = sessions.get_mut(&id)?;
            let exit = session
                .child
                .as_mut()
                .and_then(|child| child.try_wait().ok().flatten());
            match exit {
                Some(status) => {
                    let tail = tail_of(&session.log_ring, CRASH_LOG_TAIL);
                    Some(format!("transcoder exited ({status}); stderr tail: {tail:?}"))
                }
                None => {
                    return Some(StatusSnapshot {
                        status: session.status,
                        error: session.error.clone(),
                    });
                }
            }
        };

        let error = crash.expect("crash path always carries a reason");
        log::error!("[StreamManager] Stream {} crashed: {}", id, error);
        self.stop_stream(id).await;
        Some(StatusSnapshot {
            status: StreamStatus::Error,
            error: Some(error),
        })
    }

    /// Extracts the newest frame of the rolling window into
    /// `{id}_latest.jpg` inside the session's scratch directory.
    ///
    /// Extraction failures never mutate session state; the caller simply
    /// skips the tick.
    pub async fn get_latest_frame(&self, id: i64) -> Option<PathBuf> {
        let work_dir = { self.sessions.lock().get(&id)?.work_dir.clone()? };
        let segment = newest_segment(&work_dir).await?;
        let output = work_dir.join(format!("{id}_latest.jpg"));

        let mut command = transcoder::extract_command(&self.config, &segment, &output);
        let extract_timeout = Duration::from_secs(self.config.extract_timeout_secs);
        match tokio::time::timeout(extract_timeout, command.output()).await {
            Ok(Ok(out)) if out.status.success() => Some(output),
            Ok(Ok(out)) => {
                log::warn!(
                    "[StreamManager] Frame extraction failed for stream {} ({}): {}",
                    id,
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                None
            }
            Ok(Err(e)) => {
                log::warn!(
                    "[StreamManager] Frame extractor could not run for stream {}: {}",
                    id,
                    e
                );
                None
            }
            Err(_) => {
                log::warn!(
                    "[StreamManager] Frame extraction timed out for stream {}",
                    id
                );
                None
            }
        }
    }

    /// Stops the session: TERM to the process group, bounded wait, kill,
    /// then scratch removal (errors ignored).
    pub async fn stop_stream(&self, id: i64) {
        let session = { self.sessions.lock().remove(&id) };
        let Some(mut session) = session else {
            return;
        };
        log::info!("[StreamManager] Stopping stream {}", id);

        if let Some(mut child) = session.child.take() {
            let grace = Duration::from_secs(self.config.stop_grace_secs);
            terminate(&mut child, session.pgid, grace).await;
        }
        if let Some(dir) = session.work_dir.take() {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                log::debug!(
                    "[StreamManager] Scratch cleanup for stream {} skipped: {}",
                    id,
                    e
                );
            }
        }
    }

    /// Stops every live session. Idempotent; registered at shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<i64> = { self.sessions.lock().keys().copied().collect() };
        if !ids.is_empty() {
            log::info!("[StreamManager] Stopping {} stream(s)", ids.len());
        }
        for id in ids {
            self.stop_stream(id).await;
        }
    }

    /// Returns the ids of all tracked sessions.
    #[must_use]
    pub fn session_ids(&self) -> Vec<i64> {
        self.sessions.lock().keys().copied().collect()
    }

    #[cfg(test)]
    pub(crate) fn work_dir_of(&self, id: i64) -> Option<PathBuf> {
        self.sessions.lock().get(&id)?.work_dir.clone()
    }
}

#[async_trait]
impl StreamSupervisor for StreamManager {
    async fn start_stream(&self, id: i64, rtsp_url: &str) -> StartOutcome {
        StreamManager::start_stream(self, id, rtsp_url).await
    }

    async fn stop_stream(&self, id: i64) {
        StreamManager::stop_stream(self, id).await;
    }

    async fn stream_status(&self, id: i64) -> Option<StatusSnapshot> {
        StreamManager::get_stream_status(self, id).await
    }

    async fn latest_frame(&self, id: i64) -> Option<PathBuf> {
        StreamManager::get_latest_frame(self, id).await
    }
}

/// Sends TERM to the process group, waits up to `grace`, then force-kills.
async fn terminate(child: &mut Child, pgid: Option<i32>, grace: Duration) {
    #[cfg(unix)]
    if let Some(pgid) = pgid {
        unsafe {
            libc::killpg(pgid, libc::SIGTERM);
        }
    }
    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
        let _ = pgid;
        if let Some(pid) = child.id() {
            unsafe {
                GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
            }
        }
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        #[cfg(unix)]
        if let Some(pgid) = pgid {
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

/// Feeds the bounded stderr ring from a detached reader task.
fn spawn_stderr_reader(
    id: i64,
    stderr: ChildStderr,
    ring: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            push_bounded(&ring, line, capacity);
        }
        log::debug!("[StreamManager] stderr reader for stream {} finished", id);
    });
}

fn push_bounded(ring: &Mutex<VecDeque<String>>, line: String, capacity: usize) {
    let mut ring = ring.lock();
    if ring.len() >= capacity {
        ring.pop_front();
    }
    ring.push_back(line);
}

fn tail_of(ring: &Mutex<VecDeque<String>>, count: usize) -> Vec<String> {
    let ring = ring.lock();
    ring.iter()
        .skip(ring.len().saturating_sub(count))
        .cloned()
        .collect()
}

/// Polls the scratch directory until the playlist exists, starts with the
/// HLS magic marker, and at least one segment is present.
pub(crate) async fn verify_hls(work_dir: &Path, timeout: Duration) -> bool {
    let playlist = work_dir.join(PLAYLIST_NAME);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if playlist.exists()
            && newest_segment(work_dir).await.is_some()
            && tokio::fs::read_to_string(&playlist)
                .await
                .map(|data| data.starts_with(PLAYLIST_MAGIC))
                .unwrap_or(false)
        {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(VERIFY_POLL).await;
    }
}

/// Returns the newest `.ts` segment by filename. Segment names are
/// zero-padded sequence numbers, so lexicographic order is arrival order.
pub(crate) async fn newest_segment(work_dir: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(work_dir).await.ok()?;
    let mut newest: Option<String> = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".ts") && newest.as_deref().map_or(true, |n| name.as_str() > n) {
            newest = Some(name);
        }
    }
    newest.map(|name| work_dir.join(name))
}
