//! OpenAI HTTP client: chat completions, file upload, batch lifecycle.
//!
//! Written directly against reqwest rather than an SDK wrapper because the
//! retry classification in [`crate::error::ApiError`] needs the raw HTTP
//! status of every failure, and the Batch API surface (files + batches) is
//! small enough that three endpoints cover everything the pipeline uses.
//!
//! The realtime engine talks to the client through the [`VisionApi`] trait
//! so its retry policy can be tested against a scripted stub.

use crate::config::EngineConfig;
use crate::error::{ApiError, MoraqmanError};
use crate::pipeline::request::{ChatBody, ChatResponse};
use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Seam between the realtime engine and the HTTP client.
///
/// `extract` sends one chat body and returns the model's message content.
#[async_trait]
pub trait VisionApi: Send + Sync {
    async fn extract(&self, body: &ChatBody) -> Result<String, ApiError>;
}

/// A batch as reported by the remote API.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteBatch {
    pub id: String,
    pub status: String,
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub request_counts: RequestCounts,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestCounts {
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub completed: u32,
    #[serde(default)]
    pub failed: u32,
}

#[derive(Debug, Deserialize)]
struct FileUploadResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

/// HTTP client for the chat-completions, files, and batches endpoints.
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiClient {
    /// Build a client with the engine's per-call timeout.
    pub fn new(api_key: impl Into<String>, config: &EngineConfig) -> Result<Self, MoraqmanError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.api_timeout_secs))
            .build()
            .map_err(|e| MoraqmanError::Internal(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Point the client at a different endpoint (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Turn a non-success response into a classified [`ApiError`].
    async fn status_error(response: reqwest::Response) -> ApiError {
        let code = response.status().as_u16();
        let message = match response.text().await {
            Ok(body) => serde_json::from_str::<ErrorBody>(&body)
                .ok()
                .and_then(|b| b.error)
                .and_then(|e| e.message)
                .unwrap_or(body),
            Err(_) => String::new(),
        };
        ApiError::Status { code, message }
    }

    /// Send one chat-completion request and return the message content.
    pub async fn chat(&self, body: &ChatBody) -> Result<String, ApiError> {
        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        match parsed.content() {
            Some(content) => Ok(content.to_string()),
            None => Err(ApiError::InvalidResponse("no choices in response".into())),
        }
    }

    /// Upload a JSONL payload to the Files API with `purpose=batch`.
    ///
    /// Returns the file id for batch creation.
    pub async fn upload_batch_file(&self, jsonl: Vec<u8>) -> Result<String, ApiError> {
        let part = multipart::Part::bytes(jsonl)
            .file_name("batch.jsonl")
            .mime_str("application/jsonl")
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        let form = multipart::Form::new()
            .text("purpose", "batch")
            .part("file", part);

        let response = self
            .http
            .post(format!("{}/v1/files", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let parsed: FileUploadResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        debug!("Uploaded batch file: {}", parsed.id);
        Ok(parsed.id)
    }

    /// Create a batch over an uploaded input file.
    pub async fn create_batch(&self, input_file_id: &str) -> Result<RemoteBatch, ApiError> {
        let response = self
            .http
            .post(format!("{}/v1/batches", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "input_file_id": input_file_id,
                "endpoint": "/v1/chat/completions",
                "completion_window": "24h",
            }))
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    /// Fetch the current state of a batch.
    pub async fn retrieve_batch(&self, batch_id: &str) -> Result<RemoteBatch, ApiError> {
        let response = self
            .http
            .get(format!("{}/v1/batches/{batch_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    /// Download a file's content (the batch output JSONL).
    pub async fn file_content(&self, file_id: &str) -> Result<String, ApiError> {
        let response = self
            .http
            .get(format!("{}/v1/files/{file_id}/content", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        response
            .text()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl VisionApi for OpenAiClient {
    async fn extract(&self, body: &ChatBody) -> Result<String, ApiError> {
        self.chat(body).await
    }
}
