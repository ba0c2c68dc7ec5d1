//! Vision-model adapter for the Gemini generate-content API.
//!
//! Speaks the streaming REST endpoint directly (`streamGenerateContent` with
//! SSE framing): the request carries the grid image as inline bytes plus the
//! SOP prompt, and a response schema translated from the SOP's structured
//! output descriptor. Chunks are accumulated under a hard deadline and the
//! final text is parsed and re-validated against the schema.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

use crate::control::Sop;
use crate::error::{VigilError, VigilResult};
use crate::vision::schema::OutputSchema;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Vision analysis interface consumed by the screenshot pipeline.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Analyzes an image under the given SOP, returning the schema-shaped
    /// JSON output.
    async fn analyze(&self, image_path: &Path, sop: &Sop) -> VigilResult<Value>;
}

/// Maps a raster image extension onto its MIME type.
///
/// Only formats the vision API accepts as inline data are allowed.
pub(crate) fn mime_for_image(path: &Path) -> VigilResult<&'static str> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "jpg" | "jpeg" => Ok("image/jpeg"),
        "png" => Ok("image/png"),
        "gif" => Ok("image/gif"),
        "bmp" => Ok("image/bmp"),
        other => Err(VigilError::Analysis(format!(
            "unsupported image format \"{other}\" for {}",
            path.display()
        ))),
    }
}

fn is_deprecation_notice(text: &str) -> bool {
    text.to_lowercase().contains("deprecated")
}

/// Incremental SSE parser: splits `data:` lines out of arbitrarily chunked
/// network reads and accumulates the candidates' text parts.
#[derive(Default)]
pub(crate) struct SseAccumulator {
    pending: String,
    text: String,
}

impl SseAccumulator {
    /// Feeds one network chunk; complete lines are consumed, the trailing
    /// partial line is buffered for the next chunk.
    fn push(&mut self, chunk: &str) -> VigilResult<()> {
        self.pending.push_str(chunk);
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            self.handle_line(line.trim_end())?;
        }
        Ok(())
    }

    /// Consumes any buffered partial line and returns the accumulated text.
    fn finish(mut self) -> VigilResult<String> {
        let rest = std::mem::take(&mut self.pending);
        self.handle_line(rest.trim_end())?;
        Ok(self.text)
    }

    fn handle_line(&mut self, line: &str) -> VigilResult<()> {
        let Some(payload) = line.strip_prefix("data:") else {
            return Ok(());
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return Ok(());
        }
        let value: Value = serde_json::from_str(payload)
            .map_err(|e| VigilError::Analysis(format!("malformed stream chunk: {e}")))?;

        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown model error");
            if is_deprecation_notice(message) {
                return Err(VigilError::Config(format!("model deprecated: {message}")));
            }
            return Err(VigilError::Analysis(message.to_string()));
        }

        if let Some(parts) = value
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    self.text.push_str(text);
                }
            }
        }
        Ok(())
    }
}

/// Streaming client for the Gemini generate-content API.
pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl GeminiClient {
    /// Creates a client for the hosted API.
    pub fn new(
        client: Client,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            timeout,
        }
    }

    /// Reads `GEMINI_API_KEY` from the environment; fails fast when unset.
    pub fn from_env(client: Client, model: impl Into<String>, timeout: Duration) -> VigilResult<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| VigilError::Config("GEMINI_API_KEY is not set".into()))?;
        Ok(Self::new(client, api_key, model, timeout))
    }

    /// Overrides the API origin. Used by tests.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent",
            self.base_url, self.model
        )
    }

    async fn request_and_collect(&self, body: &Value) -> VigilResult<String> {
        let response = self
            .client
            .post(self.endpoint())
            .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            if is_deprecation_notice(&text) {
                return Err(VigilError::Config(format!("model deprecated: {text}")));
            }
            return Err(VigilError::Analysis(format!(
                "model returned {status}: {text}"
            )));
        }

        let mut accumulator = SseAccumulator::default();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| VigilError::Analysis(format!("response stream failed: {e}")))?;
            accumulator.push(&String::from_utf8_lossy(&chunk))?;
        }
        accumulator.finish()
    }
}

#[async_trait]
impl VisionModel for GeminiClient {
    async fn analyze(&self, image_path: &Path, sop: &Sop) -> VigilResult<Value> {
        if !image_path.exists() {
            return Err(VigilError::Analysis(format!(
                "image not found: {}",
                image_path.display()
            )));
        }
        let mime = mime_for_image(image_path)?;
        let schema = OutputSchema::parse(&sop.structured_schema)?;

        let bytes = tokio::fs::read(image_path).await?;
        let body = json!({
            "contents": [{
                "parts": [
                    {"inline_data": {"mime_type": mime, "data": BASE64.encode(&bytes)}},
                    {"text": sop.prompt},
                ]
            }],
            "generation_config": {
                "temperature": 0.4,
                "top_p": 0.95,
                "top_k": 40,
                "max_output_tokens": 2048,
                "response_mime_type": "application/json",
                "response_schema": schema.to_response_schema(),
            }
        });

        log::info!(
            "[Vision] Analyzing {} with model {} (sop {})",
            image_path.display(),
            self.model,
            sop.id
        );

        let deadline_secs = self.timeout.as_secs();
        let raw = tokio::time::timeout(self.timeout, self.request_and_collect(&body))
            .await
            .map_err(|_| VigilError::AnalysisTimeout(deadline_secs))??;

        let output: Value = serde_json::from_str(&raw).map_err(|e| VigilError::AnalysisParse {
            message: e.to_string(),
            raw: raw.clone(),
        })?;
        if let Err(message) = schema.check(&output) {
            return Err(VigilError::AnalysisParse { message, raw });
        }

        log::info!("[Vision] Analysis complete for {}", image_path.display());
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_sop() -> Sop {
        Sop {
            id: 9,
            prompt: "Count people".into(),
            frequency_seconds: None,
            structured_schema: json!({
                "type": "object",
                "properties": {
                    "count": {"type": "number"},
                    "flags": {"type": "array", "items": {"type": "boolean"}}
                },
                "required": ["count"]
            }),
        }
    }

    fn write_test_jpeg(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("grid.jpg");
        image::RgbImage::from_pixel(2, 2, image::Rgb([128, 128, 128]))
            .save(&path)
            .unwrap();
        path
    }

    fn sse_chunk(text: &str) -> String {
        let payload = json!({
            "candidates": [{"content": {"parts": [{"text": text}]}}]
        });
        format!("data: {payload}\n\n")
    }

    #[test]
    fn mime_mapping_covers_supported_formats() {
        assert_eq!(mime_for_image(Path::new("a.jpg")).unwrap(), "image/jpeg");
        assert_eq!(mime_for_image(Path::new("a.JPEG")).unwrap(), "image/jpeg");
        assert_eq!(mime_for_image(Path::new("a.png")).unwrap(), "image/png");
        assert_eq!(mime_for_image(Path::new("a.bmp")).unwrap(), "image/bmp");
        assert!(mime_for_image(Path::new("a.webp")).is_err());
        assert!(mime_for_image(Path::new("noext")).is_err());
    }

    #[test]
    fn accumulator_joins_text_across_chunks() {
        let mut acc = SseAccumulator::default();
        let chunk = sse_chunk("{\"count\":");
        // Split an SSE line across two network reads.
        let (head, tail) = chunk.split_at(10);
        acc.push(head).unwrap();
        acc.push(tail).unwrap();
        acc.push(&sse_chunk("3}")).unwrap();
        assert_eq!(acc.finish().unwrap(), "{\"count\":3}");
    }

    #[test]
    fn accumulator_ignores_non_data_lines() {
        let mut acc = SseAccumulator::default();
        acc.push(": keepalive\n\n").unwrap();
        acc.push("event: message\n").unwrap();
        assert_eq!(acc.finish().unwrap(), "");
    }

    #[test]
    fn accumulator_surfaces_stream_errors() {
        let mut acc = SseAccumulator::default();
        let err = acc
            .push("data: {\"error\": {\"message\": \"quota exhausted\"}}\n")
            .unwrap_err();
        assert_eq!(err.code(), "analysis_failed");
    }

    #[test]
    fn accumulator_detects_deprecation_in_stream() {
        let mut acc = SseAccumulator::default();
        let err = acc
            .push("data: {\"error\": {\"message\": \"model X is deprecated\"}}\n")
            .unwrap_err();
        assert_eq!(err.code(), "configuration_error");
    }

    fn client_for(server: &MockServer, timeout: Duration) -> GeminiClient {
        GeminiClient::new(Client::new(), "test-key", "test-model", timeout)
            .with_base_url(server.uri())
    }

    #[tokio::test]
    async fn analyze_parses_streamed_schema_shaped_output() {
        let server = MockServer::start().await;
        let body = format!(
            "{}{}",
            sse_chunk("{\"count\": 3, \"flags\":"),
            sse_chunk(" [true, false]}")
        );
        Mock::given(method("POST"))
            .and(path("/v1beta/models/test-model:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let image = write_test_jpeg(dir.path());
        let output = client_for(&server, Duration::from_secs(30))
            .analyze(&image, &sample_sop())
            .await
            .unwrap();

        assert_eq!(output, json!({"count": 3, "flags": [true, false]}));
    }

    #[tokio::test]
    async fn analyze_times_out_and_reports_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse_chunk("{}"), "text/event-stream")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let image = write_test_jpeg(dir.path());
        let err = client_for(&server, Duration::from_secs(1))
            .analyze(&image, &sample_sop())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "analysis_timeout");
    }

    #[tokio::test]
    async fn analyze_rejects_non_json_responses_with_raw_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse_chunk("I cannot help with that."), "text/event-stream"),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let image = write_test_jpeg(dir.path());
        let err = client_for(&server, Duration::from_secs(30))
            .analyze(&image, &sample_sop())
            .await
            .unwrap_err();

        match err {
            VigilError::AnalysisParse { raw, .. } => {
                assert_eq!(raw, "I cannot help with that.")
            }
            other => panic!("expected AnalysisParse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn analyze_flags_deprecated_models_as_config_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                "Gemini 1.0 Pro Vision has been deprecated, use a newer model",
            ))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let image = write_test_jpeg(dir.path());
        let err = client_for(&server, Duration::from_secs(30))
            .analyze(&image, &sample_sop())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "configuration_error");
    }

    #[tokio::test]
    async fn analyze_rejects_missing_image() {
        let server = MockServer::start().await;
        let err = client_for(&server, Duration::from_secs(30))
            .analyze(Path::new("/nonexistent/grid.jpg"), &sample_sop())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "analysis_failed");
    }
}
