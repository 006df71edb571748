use crate::config::{require, VISION_API_KEY};
use crate::operations::OperationError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

/// Turns one rendered page image into text
#[async_trait]
pub trait PageRecognizer: Send + Sync {
    /// Text found on the page; `None` when the page has no text
    async fn recognize(&self, image: &[u8]) -> Result<Option<String>, OperationError>;
}

/// Google Cloud Vision `images:annotate` with TEXT_DETECTION
pub struct VisionClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl VisionClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[derive(Deserialize, Default)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<ImageResponse>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ImageResponse {
    #[serde(default)]
    text_annotations: Vec<TextAnnotation>,
    error: Option<Status>,
}

#[derive(Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct Status {
    #[serde(default)]
    message: String,
}

impl AnnotateResponse {
    /// The first annotation holds the page's full text
    fn into_text(self) -> Result<Option<String>, OperationError> {
        let Some(page) = self.responses.into_iter().next() else {
            return Err(OperationError::transient("Vision returned no response"));
        };
        if let Some(status) = page.error.filter(|s| !s.message.is_empty()) {
            return Err(OperationError::transient(format!(
                "Vision error: {}",
                status.message
            )));
        }
        Ok(page
            .text_annotations
            .into_iter()
            .next()
            .map(|a| a.description)
            .filter(|text| !text.trim().is_empty()))
    }
}

#[async_trait]
impl PageRecognizer for VisionClient {
    async fn recognize(&self, image: &[u8]) -> Result<Option<String>, OperationError> {
        let api_key = require(&self.api_key, VISION_API_KEY)?;
        let body = json!({
            "requests": [{
                "image": { "content": STANDARD.encode(image) },
                "features": [{ "type": "TEXT_DETECTION" }]
            }]
        });

        let response = self
            .http
            .post(format!("{}/images:annotate", self.base_url))
            .query(&[("key", api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(OperationError::from_status(status.as_u16(), &text));
        }

        let parsed: AnnotateResponse = response
            .json()
            .await
            .map_err(|e| OperationError::transient(format!("Malformed Vision response: {}", e)))?;
        parsed.into_text()
    }
}
