//! Vision-model integration: schema translation and the streaming adapter.

pub mod gemini;
pub mod schema;

pub use gemini::{GeminiClient, VisionModel};
pub use schema::OutputSchema;
