//! Transcoder supervision and frame extraction.

pub mod manager;
pub(crate) mod transcoder;

pub use manager::{
    StartOutcome, StatusSnapshot, StreamManager, StreamStatus, StreamSupervisor,
};
