use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Client;
use tracker_types::{JobSnapshot, LayersPage, SubmitJobRequest, SubmitJobResponse};

use crate::error::{BackendError, Result};
use crate::sse::{decode_stream_event, parse_sse_frame, push_utf8_chunk};
use crate::{EventStream, JobBackend};

const AUTH_HEADER: &str = "authorization";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API root, e.g. `http://127.0.0.1:8000/api`
    pub base_url: String,
    /// Sent as a bearer token when present
    pub api_token: Option<String>,
    /// Timeout for plain REST calls; the event stream has none
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api".to_string(),
            api_token: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

fn default_headers(api_token: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(token) = api_token.map(str::trim).filter(|t| !t.is_empty()) {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
            headers.insert(AUTH_HEADER, value);
        }
    }
    headers
}

/// REST + SSE implementation of [`JobBackend`].
#[derive(Clone)]
pub struct HttpJobBackend {
    base_url: String,
    http_client: Client,
    stream_client: Client,
}

impl HttpJobBackend {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(BackendError::InvalidConfig("base_url is empty".to_string()));
        }

        let http_client = Client::builder()
            .default_headers(default_headers(config.api_token.as_deref()))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BackendError::InvalidConfig(format!("http client: {}", e)))?;

        let stream_client = Client::builder()
            .default_headers(default_headers(config.api_token.as_deref()))
            .http1_only()
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| BackendError::InvalidConfig(format!("stream client: {}", e)))?;

        Ok(Self {
            base_url,
            http_client,
            stream_client,
        })
    }

    fn job_url(&self, job_id: &str, suffix: &str) -> String {
        format!("{}/task-splitting/{}/{}", self.base_url, job_id, suffix)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        let url = response.url().to_string();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("Request to {} failed ({}): {}", url, status, truncate(&body, 500));
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Request(format!("Failed to read response body: {}", e)))?;

        tracing::debug!("Response from {}: {}", url, truncate(&body, 500));

        serde_json::from_str(&body).map_err(|e| {
            tracing::warn!("Failed to parse response from {}: {}", url, e);
            BackendError::Parse(format!(
                "Failed to parse response: {}. Body: {}",
                e,
                truncate(&body, 200)
            ))
        })
    }
}

#[async_trait]
impl JobBackend for HttpJobBackend {
    async fn status(&self, job_id: &str) -> Result<JobSnapshot> {
        let url = self.job_url(job_id, "status");
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| BackendError::Request(format!("Failed to fetch status: {}", e)))?;
        self.handle_response(response).await
    }

    async fn items(&self, job_id: &str, start: u32, page_size: u32) -> Result<LayersPage> {
        let url = self.job_url(job_id, "items");
        let response = self
            .http_client
            .get(&url)
            .query(&[("start", start), ("page_size", page_size)])
            .send()
            .await
            .map_err(|e| BackendError::Request(format!("Failed to fetch layers: {}", e)))?;
        self.handle_response(response).await
    }

    async fn create_pull_request(&self, job_id: &str) -> Result<()> {
        let url = self.job_url(job_id, "pull-request");
        let response = self
            .http_client
            .post(&url)
            .send()
            .await
            .map_err(|e| BackendError::Request(format!("Failed to request pull request: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn submit_job(&self, plan_item_id: &str, recipe_id: &str) -> Result<String> {
        let url = format!("{}/task-splitting", self.base_url);
        let request = SubmitJobRequest {
            plan_item_id: plan_item_id.to_string(),
            recipe_id: recipe_id.to_string(),
        };
        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| BackendError::Request(format!("Failed to submit job: {}", e)))?;
        let submitted: SubmitJobResponse = self.handle_response(response).await?;
        Ok(submitted.job_id)
    }

    async fn connect_stream(&self, job_id: &str) -> Result<EventStream> {
        let url = self.job_url(job_id, "stream");
        tracing::debug!("Subscribing to job stream at: {}", url);

        let response = self
            .stream_client
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| BackendError::Stream(format!("Failed to open stream: {}", e)))?;

        if !response.status().is_success() {
            return Err(BackendError::Stream(format!(
                "Stream subscription failed: {}",
                response.status()
            )));
        }

        let bytes = response.bytes_stream();

        Ok(Box::pin(async_stream::stream! {
            let mut buffer = String::new();
            let mut pending = Vec::new();
            futures::pin_mut!(bytes);

            while let Some(chunk_result) = bytes.next().await {
                match chunk_result {
                    Ok(chunk) => {
                        push_utf8_chunk(&mut pending, &mut buffer, &chunk);
                        while let Some(frame) = parse_sse_frame(&mut buffer) {
                            if let Some(event) = decode_stream_event(&frame) {
                                yield Ok(event);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Job stream error: {}", e);
                        yield Err(BackendError::Stream(e.to_string()));
                        break;
                    }
                }
            }
            tracing::debug!("Job stream ended");
        }))
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
