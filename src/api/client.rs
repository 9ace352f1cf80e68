use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{multipart, RequestBuilder, Response, StatusCode};
use serde_json::json;
use tracing::{debug, info};

use super::auth::TokenStore;
use crate::error::{Error, Result};
use crate::media::Blob;

/// Body of a streaming response, read piece by piece
pub type EventBody = BoxStream<'static, Result<Vec<u8>>>;

/// Client for the assessment REST/SSE API
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenStore>,
}

impl ApiClient {
    /// Streaming responses are long-lived, so only connecting is time-limited
    pub fn new(base_url: &str, tokens: TokenStore, connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens: Arc::new(tokens),
        })
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// POST /api/assessments/{assignment_id}/start
    pub async fn start_stream(&self, assignment_id: &str) -> Result<EventBody> {
        let url = self.url(&format!("/api/assessments/{}/start", assignment_id));
        info!("Starting assessment for assignment {}", assignment_id);

        let request = self
            .client
            .post(url)
            .header(ACCEPT, "text/event-stream")
            .json(&json!({}));
        let response = self.send(request).await?;

        Ok(into_body(response))
    }

    /// POST /api/assessments/{attempt_id}/message
    pub async fn message_stream(&self, attempt_id: &str, content: &str) -> Result<EventBody> {
        let url = self.url(&format!("/api/assessments/{}/message", attempt_id));
        debug!("Sending message for attempt {} ({} chars)", attempt_id, content.len());

        let request = self
            .client
            .post(url)
            .header(ACCEPT, "text/event-stream")
            .json(&json!({ "content": content }));
        let response = self.send(request).await?;

        Ok(into_body(response))
    }

    /// GET /api/assessments/{attempt_id}/stream?token=...
    ///
    /// The EventSource transport carries the token in the query string.
    pub async fn event_source(&self, attempt_id: &str) -> Result<EventBody> {
        let url = self.url(&format!("/api/assessments/{}/stream", attempt_id));
        let token = self.bearer()?;

        let response = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .query(&[("token", token.as_str())])
            .send()
            .await?;

        Ok(into_body(check(response)?))
    }

    /// POST /api/assessments/{attempt_id}/video
    pub async fn upload_video(&self, attempt_id: &str, blob: &Blob) -> Result<()> {
        let url = self.url(&format!("/api/assessments/{}/video", attempt_id));
        let part = multipart::Part::bytes(blob.data.clone())
            .file_name("recording.webm")
            .mime_str(&blob.mime_type)?;
        let form = multipart::Form::new().part("video", part);

        self.send(self.client.post(url).multipart(form)).await?;
        info!("Uploaded recording for attempt {} ({} bytes)", attempt_id, blob.len());

        Ok(())
    }

    /// POST /api/assessments/{attempt_id}/video/chunks
    pub async fn upload_chunk(&self, attempt_id: &str, blob: &Blob, sequence: u64) -> Result<()> {
        let url = self.url(&format!("/api/assessments/{}/video/chunks", attempt_id));
        let part = multipart::Part::bytes(blob.data.clone())
            .file_name(format!("chunk-{:05}.webm", sequence))
            .mime_str(&blob.mime_type)?;
        let form = multipart::Form::new()
            .text("sequence", sequence.to_string())
            .part("chunk", part);

        self.send(self.client.post(url).multipart(form)).await?;
        debug!("Uploaded chunk {} for attempt {} ({} bytes)", sequence, attempt_id, blob.len());

        Ok(())
    }

    /// POST /api/assessments/{attempt_id}/complete
    pub async fn complete(&self, attempt_id: &str) -> Result<()> {
        let url = self.url(&format!("/api/assessments/{}/complete", attempt_id));
        self.send(self.client.post(url).json(&json!({}))).await?;
        info!("Attempt {} marked complete", attempt_id);
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn bearer(&self) -> Result<String> {
        self.tokens.load()?.ok_or(Error::Unauthorized)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let token = self.bearer()?;
        let response = request
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?;
        check(response)
    }
}

fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(Error::Unauthorized);
    }
    if !status.is_success() {
        return Err(Error::Http {
            status: status.as_u16(),
        });
    }
    Ok(response)
}

fn into_body(response: Response) -> EventBody {
    response
        .bytes_stream()
        .map(|item| item.map(|bytes| bytes.to_vec()).map_err(Error::from))
        .boxed()
}
