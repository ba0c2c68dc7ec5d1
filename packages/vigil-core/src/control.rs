//! Client for the control-plane CRUD service.
//!
//! The CRUD service owns persistence of streams, SOPs, and analyses; the
//! pipeline consumes exactly three endpoints through the [`ControlApi`]
//! trait so services can be tested against a mock.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{VigilError, VigilResult};

/// Reference to a SOP attached to a stream in the registry listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SopRef {
    pub id: i64,
}

/// One entry of the stream registry (`GET /api/streams`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub id: i64,
    pub name: String,
    pub rtsp_url: String,
    #[serde(default)]
    pub sops: Vec<SopRef>,
}

/// A Standard Operating Procedure: prompt, cadence, and the shape the vision
/// model's output must take.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sop {
    pub id: i64,
    pub prompt: String,
    #[serde(default)]
    pub frequency_seconds: Option<u64>,
    /// Recursive type descriptor; parsed into `OutputSchema` at use time.
    pub structured_schema: Value,
}

/// Full detail for one stream (`GET /api/stream/{id}`), including SOP bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDetail {
    pub id: i64,
    pub name: String,
    pub rtsp_url: String,
    #[serde(default)]
    pub sops: Vec<Sop>,
}

#[derive(Debug, Deserialize)]
struct StreamsEnvelope {
    streams: Vec<StreamSummary>,
}

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    stream: StreamDetail,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisBody<'a> {
    rtsp_id: i64,
    sop_id: i64,
    output: &'a Value,
}

/// Narrow interface to the CRUD service.
#[async_trait]
pub trait ControlApi: Send + Sync {
    /// Fetches the full stream registry.
    async fn fetch_streams(&self) -> VigilResult<Vec<StreamSummary>>;

    /// Fetches one stream with its SOP bodies.
    async fn fetch_stream(&self, stream_id: i64) -> VigilResult<StreamDetail>;

    /// Records an analysis result for a stream/SOP pair.
    async fn create_analysis(
        &self,
        stream_id: i64,
        sop_id: i64,
        output: &Value,
    ) -> VigilResult<()>;
}

/// HTTP implementation of [`ControlApi`] against `API_BASE_URL`.
pub struct HttpControlApi {
    client: Client,
    base_url: String,
}

impl HttpControlApi {
    /// Creates a new client. `base_url` must not end with a slash.
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl ControlApi for HttpControlApi {
    async fn fetch_streams(&self) -> VigilResult<Vec<StreamSummary>> {
        let response = self.client.get(self.url("/api/streams")).send().await?;
        if !response.status().is_success() {
            return Err(VigilError::Network(format!(
                "GET /api/streams returned {}",
                response.status()
            )));
        }
        let envelope: StreamsEnvelope = response
            .json()
            .await
            .map_err(|e| VigilError::Network(format!("malformed stream registry: {e}")))?;
        Ok(envelope.streams)
    }

    async fn fetch_stream(&self, stream_id: i64) -> VigilResult<StreamDetail> {
        let response = self
            .client
            .get(self.url(&format!("/api/stream/{stream_id}")))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(VigilError::Network(format!(
                "GET /api/stream/{stream_id} returned {}",
                response.status()
            )));
        }
        let envelope: StreamEnvelope = response
            .json()
            .await
            .map_err(|e| VigilError::Network(format!("malformed stream detail: {e}")))?;
        Ok(envelope.stream)
    }

    async fn create_analysis(
        &self,
        stream_id: i64,
        sop_id: i64,
        output: &Value,
    ) -> VigilResult<()> {
        let body = AnalysisBody {
            rtsp_id: stream_id,
            sop_id,
            output,
        };
        let response = self
            .client
            .post(self.url("/api/analysis"))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(VigilError::Network(format!(
                "POST /api/analysis returned {status}: {text}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(server: &MockServer) -> HttpControlApi {
        HttpControlApi::new(Client::new(), server.uri())
    }

    #[tokio::test]
    async fn fetch_streams_parses_camel_case_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/streams"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "streams": [
                    {"id": 3, "name": "Front Door", "rtspUrl": "rtsp://cam/1", "sops": [{"id": 9}]},
                    {"id": 4, "name": "Gate", "rtspUrl": "rtsp://cam/2"}
                ]
            })))
            .mount(&server)
            .await;

        let streams = api(&server).fetch_streams().await.unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].rtsp_url, "rtsp://cam/1");
        assert_eq!(streams[0].sops[0].id, 9);
        assert!(streams[1].sops.is_empty());
    }

    #[tokio::test]
    async fn fetch_streams_surfaces_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/streams"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = api(&server).fetch_streams().await.unwrap_err();
        assert_eq!(err.code(), "network_error");
    }

    #[tokio::test]
    async fn fetch_stream_unwraps_envelope_with_sop_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/stream/3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "stream": {
                    "id": 3,
                    "name": "Front Door",
                    "rtspUrl": "rtsp://cam/1",
                    "sops": [{
                        "id": 9,
                        "prompt": "Count people",
                        "frequencySeconds": 60,
                        "structuredSchema": {"type": "object", "properties": {"count": {"type": "number"}}, "required": ["count"]}
                    }]
                }
            })))
            .mount(&server)
            .await;

        let detail = api(&server).fetch_stream(3).await.unwrap();
        assert_eq!(detail.sops.len(), 1);
        assert_eq!(detail.sops[0].prompt, "Count people");
        assert_eq!(detail.sops[0].frequency_seconds, Some(60));
    }

    #[tokio::test]
    async fn create_analysis_posts_expected_body() {
        let server = MockServer::start().await;
        let output = json!({"count": 3, "flags": [true, false]});
        Mock::given(method("POST"))
            .and(path("/api/analysis"))
            .and(body_json(json!({
                "rtspId": 3,
                "sopId": 9,
                "output": {"count": 3, "flags": [true, false]}
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        api(&server).create_analysis(3, 9, &output).await.unwrap();
    }
}
