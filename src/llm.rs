use crate::config::{require, GenerationConfig, GEMINI_API_KEY};
use crate::operations::OperationError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A model that turns instructions plus case content into text
#[async_trait]
pub trait ReportModel: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        system_instruction: &str,
        content: &str,
    ) -> Result<String, OperationError>;
}

/// Text generation through the Gemini `generateContent` API
pub struct GeminiClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    generation: GenerationConfig,
}

impl GeminiClient {
    pub fn new(base_url: &str, api_key: Option<String>, generation: GenerationConfig) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            generation,
        }
    }

    fn request_body<'a>(&self, system_instruction: &'a str, content: &'a str) -> GenerateRequest<'a> {
        GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part { text: system_instruction }],
            },
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part { text: content }],
            }],
            generation_config: GenerationParams {
                temperature: self.generation.temperature,
                top_p: self.generation.top_p,
                top_k: self.generation.top_k,
                max_output_tokens: self.generation.max_output_tokens,
                response_mime_type: "text/plain",
            },
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: Vec<Content<'a>>,
    generation_config: GenerationParams,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationParams {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
    response_mime_type: &'static str,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

impl GenerateResponse {
    fn into_text(self) -> Result<String, OperationError> {
        if let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(OperationError::terminal(format!("Prompt blocked: {}", reason)));
        }
        let text: String = self
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(OperationError::transient("Model returned an empty answer"));
        }
        Ok(text)
    }
}

#[async_trait]
impl ReportModel for GeminiClient {
    async fn generate(
        &self,
        model: &str,
        system_instruction: &str,
        content: &str,
    ) -> Result<String, OperationError> {
        let api_key = require(&self.api_key, GEMINI_API_KEY)?;
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        debug!(model = %model, chars = content.len(), "Requesting generation");

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&self.request_body(system_instruction, content))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OperationError::from_status(status.as_u16(), &body));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| OperationError::transient(format!("Malformed model response: {}", e)))?;
        parsed.into_text()
    }
}

/// Slice from the first `{` to the last `}`, dropping chatter and code
/// fences the model wraps around a JSON answer
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
