//! Request assembly: wire types for the chat-completions and Batch APIs,
//! and the builder turning a claimed job into a ready-to-send body.
//!
//! The same [`ChatBody`] is used by both engines: the realtime engine posts
//! it directly, the batch engine wraps it in a [`BatchRequestLine`] and
//! serialises one line per job into the JSONL upload.

use crate::config::EngineConfig;
use crate::error::MoraqmanError;
use crate::pipeline::encode::{encode_page, Detail};
use crate::pipeline::render::render_page_range;
use crate::prompts;
use crate::store::ClaimedJob;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CHAT_COMPLETIONS_URL: &str = "/v1/chat/completions";

// ── Request wire types ───────────────────────────────────────────────────

/// A chat-completions request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatBody {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    pub temperature: f32,
    pub max_completion_tokens: u32,
    pub response_format: ResponseFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Vec<ContentPart>,
}

/// One part of a multimodal user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: String,
}

impl ResponseFormat {
    pub fn json_object() -> Self {
        Self {
            kind: "json_object".to_string(),
        }
    }
}

/// One line of a Batch API JSONL upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequestLine {
    pub custom_id: String,
    pub method: String,
    pub url: String,
    pub body: ChatBody,
}

// ── Response wire types ──────────────────────────────────────────────────

/// A chat-completions response, reduced to what the pipeline reads.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceMessage {
    pub content: Option<String>,
}

impl ChatResponse {
    /// The first choice's message content, if any.
    pub fn content(&self) -> Option<&str> {
        self.choices.first()?.message.content.as_deref()
    }
}

/// One line of a Batch API output file.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchOutputLine {
    pub custom_id: String,
    pub response: Option<BatchOutputResponse>,
    pub error: Option<BatchOutputError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchOutputResponse {
    pub status_code: u16,
    pub body: ChatResponse,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchOutputError {
    pub message: Option<String>,
}

// ── Builders ─────────────────────────────────────────────────────────────

/// Build the chat body for one job: render the context window plus the
/// current page, encode each image, and fill the prompt template.
///
/// The context window is `[max(1, page - context_pages), page]`; the last
/// image is always the current page and the only one sent at high detail.
/// A rendering failure here is fatal for this job only — callers record it
/// on the job row and move on.
pub async fn build_page_request(
    job: &ClaimedJob,
    config: &EngineConfig,
) -> Result<ChatBody, MoraqmanError> {
    let first_page = job.page_num.saturating_sub(job.context_pages).max(1);
    let images = render_page_range(
        Path::new(&job.pdf_path),
        first_page,
        job.page_num,
        config.max_rendered_pixels,
    )
    .await?;

    let mut encoded = Vec::with_capacity(images.len());
    let last = images.len() - 1;
    for (i, img) in images.iter().enumerate() {
        let uri = encode_page(img)
            .map_err(|e| MoraqmanError::RasterisationFailed {
                page: first_page + i as u32,
                detail: format!("PNG encode failed: {e}"),
            })?;
        let detail = if i == last { Detail::High } else { Detail::Low };
        encoded.push((uri, detail));
    }

    let prompt = prompts::render(&job.prompt_name, job.context_pages, job.page_num);
    Ok(assemble_chat_body(prompt, encoded, config))
}

/// Assemble a chat body from a rendered prompt and pre-encoded images.
///
/// Split out of [`build_page_request`] so tests can exercise the message
/// layout without pdfium.
pub fn assemble_chat_body(
    prompt: String,
    images: Vec<(String, Detail)>,
    config: &EngineConfig,
) -> ChatBody {
    let mut content = vec![ContentPart::Text { text: prompt }];
    for (url, detail) in images {
        content.push(ContentPart::ImageUrl {
            image_url: ImageUrl {
                url,
                detail: detail.as_str().to_string(),
            },
        });
    }

    ChatBody {
        model: config.model.clone(),
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content,
        }],
        reasoning_effort: config.reasoning_effort.clone(),
        temperature: config.temperature,
        max_completion_tokens: config.max_completion_tokens,
        response_format: ResponseFormat::json_object(),
    }
}

/// Wrap a job's chat body into a Batch API JSONL line.
pub async fn build_batch_line(
    job: &ClaimedJob,
    config: &EngineConfig,
) -> Result<BatchRequestLine, MoraqmanError> {
    let body = build_page_request(job, config).await?;
    Ok(BatchRequestLine {
        custom_id: job.custom_id(),
        method: "POST".to_string(),
        url: CHAT_COMPLETIONS_URL.to_string(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EngineConfig {
        EngineConfig::default()
    }

    fn fake_images(n: usize) -> Vec<(String, Detail)> {
        (0..n)
            .map(|i| {
                let detail = if i == n - 1 { Detail::High } else { Detail::Low };
                (format!("data:image/png;base64,AAA{i}"), detail)
            })
            .collect()
    }

    #[test]
    fn chat_body_has_expected_shape() {
        let body = assemble_chat_body("extract this".to_string(), fake_images(3), &test_config());
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["model"], "gpt-5.1");
        assert_eq!(json["temperature"], 1.0);
        assert_eq!(json["max_completion_tokens"], 4096);
        assert_eq!(json["reasoning_effort"], "low");
        assert_eq!(json["response_format"]["type"], "json_object");

        let content = json["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 4);
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["image_url"]["detail"], "low");
        assert_eq!(content[2]["image_url"]["detail"], "low");
        assert_eq!(content[3]["image_url"]["detail"], "high");
    }

    #[test]
    fn reasoning_effort_omitted_when_none() {
        let mut config = test_config();
        config.reasoning_effort = None;
        let body = assemble_chat_body("p".to_string(), fake_images(1), &config);
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("reasoning_effort").is_none());
    }

    #[test]
    fn batch_output_line_parses_success_and_error() {
        let ok: BatchOutputLine = serde_json::from_str(
            r#"{"custom_id":"alqab_page_3","response":{"status_code":200,
               "body":{"choices":[{"message":{"content":"{\"a\":\"b\"}"}}]}}}"#,
        )
        .unwrap();
        assert_eq!(ok.custom_id, "alqab_page_3");
        assert_eq!(
            ok.response.unwrap().body.content(),
            Some("{\"a\":\"b\"}")
        );

        let err: BatchOutputLine = serde_json::from_str(
            r#"{"custom_id":"alqab_page_4","response":null,
               "error":{"message":"content policy"}}"#,
        )
        .unwrap();
        assert_eq!(err.error.unwrap().message.as_deref(), Some("content policy"));
    }
}
