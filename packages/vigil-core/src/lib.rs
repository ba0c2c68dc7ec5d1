//! Vigil Core - RTSP stream monitoring with vision-model analysis.
//!
//! This crate supervises one RTSP→HLS transcoder per registered camera
//! stream, captures periodic screenshots from the rolling HLS buffer,
//! composes them into annotated grids, and submits each grid to a vision
//! model under the stream's Standard Operating Procedure. Results are
//! recorded through the external control-plane CRUD service.
//!
//! # Architecture
//!
//! - [`stream`]: transcoder process supervision and frame extraction
//! - [`processor`]: the per-stream capture → upload → grid → analysis pipeline
//! - [`scheduler`]: fixed-interval task driver with overlap suppression
//! - [`catalog`]: TTL cache over the remote stream registry
//! - [`storage`]: object-store upload and logical-timestamp listing
//! - [`stitcher`]: label-bar annotation and R×C grid composition
//! - [`vision`]: schema-driven vision-model adapter
//! - [`control`]: client for the CRUD service
//! - [`bootstrap`]: composition root
//! - [`error`], [`state`], [`utils`]: shared foundations
//!
//! # Abstraction Traits
//!
//! External collaborators sit behind traits so services can be tested
//! against mocks:
//!
//! - [`StreamSupervisor`](stream::StreamSupervisor): transcoder lifecycle
//! - [`ObjectStore`](storage::ObjectStore): blob upload and listing
//! - [`VisionModel`](vision::VisionModel): grid analysis
//! - [`ControlApi`](control::ControlApi): the CRUD service
//! - [`ImageFetcher`](fetcher::ImageFetcher): grid image downloads

#![warn(clippy::all)]

pub mod bootstrap;
pub mod catalog;
pub mod control;
pub mod error;
pub mod fetcher;
pub mod processor;
pub mod scheduler;
pub mod state;
pub mod stitcher;
pub mod storage;
pub mod stream;
pub mod utils;
pub mod vision;

// Re-export commonly used types at the crate root
pub use bootstrap::{bootstrap_services, BootstrappedServices};
pub use catalog::StreamCatalog;
pub use control::{ControlApi, HttpControlApi, Sop, SopRef, StreamDetail, StreamSummary};
pub use error::{VigilError, VigilResult};
pub use fetcher::{HttpImageFetcher, ImageFetcher};
pub use processor::ScreenshotProcessor;
pub use scheduler::Scheduler;
pub use state::{Config, TranscodeConfig};
pub use stitcher::Stitcher;
pub use storage::{GcsStore, ObjectStore};
pub use stream::{StartOutcome, StatusSnapshot, StreamManager, StreamStatus, StreamSupervisor};
pub use utils::validate_rtsp_url;
pub use vision::{GeminiClient, OutputSchema, VisionModel};
