//! Vision-model OCR adapter
//!
//! For backends without a dedicated OCR endpoint: sends the page image to an
//! OpenAI-compatible chat completions endpoint with a transcription
//! instruction and treats the reply as the page markdown.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;

use crate::cancel::CancelToken;

use super::retry::{RetryPolicy, call_with_retries, retry_after_from_headers};
use super::types::OcrOutput;
use super::{OcrProvider, Provider, ProviderCore, ProviderError, ProviderSettings};

const DEFAULT_OCR_TIMEOUT: Duration = Duration::from_secs(500);

const OCR_INSTRUCTION: &str = "Transcribe this scanned book page to markdown. \
Preserve headings, paragraphs, and emphasis. Transcribe the text exactly as \
printed; do not summarize, annotate, or complete partial sentences. Output \
only the markdown.";

pub struct VisionOcrProvider {
    core: ProviderCore,
    model: String,
    api_key: String,
    base_url: String,
    http: reqwest::Client,
    input_price_per_mtok: Option<f64>,
    output_price_per_mtok: Option<f64>,
}

impl VisionOcrProvider {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        let api_key = settings.api_key()?;
        let model = settings
            .model
            .clone()
            .ok_or_else(|| ProviderError::InvalidResponse(format!("{}: model not configured", settings.name)))?;

        let http = reqwest::Client::builder()
            .timeout(settings.timeout_or(DEFAULT_OCR_TIMEOUT))
            .build()?;

        Ok(Self {
            core: ProviderCore::new(
                settings,
                RetryPolicy::ocr(settings.max_retries, Duration::from_millis(settings.retry_delay_ms)),
            ),
            model,
            api_key,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            http,
            input_price_per_mtok: settings.input_price_per_mtok,
            output_price_per_mtok: settings.output_price_per_mtok,
        })
    }

    async fn send_once(&self, image: &[u8], page_num: u64) -> Result<OcrOutput, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": OCR_INSTRUCTION },
                    {
                        "type": "image_url",
                        "image_url": { "url": format!("data:image/png;base64,{}", BASE64.encode(image)) },
                    },
                ],
            }],
            "usage": { "include": true },
        });
        let started = Instant::now();

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = retry_after_from_headers(response.headers());
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, retry_after, message));
        }

        let completion: VisionResponse = response.json().await?;
        let markdown = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse("vision OCR reply carried no content".to_string()))?;

        let usage = completion.usage.unwrap_or_default();
        let cost = self.input_price_per_mtok.unwrap_or(0.0) * usage.prompt_tokens as f64 / 1_000_000.0
            + self.output_price_per_mtok.unwrap_or(0.0) * usage.completion_tokens as f64 / 1_000_000.0;

        Ok(OcrOutput {
            markdown,
            page_num,
            width: None,
            height: None,
            regions: Vec::new(),
            cost_usd: cost,
            duration: started.elapsed(),
        })
    }
}

#[async_trait]
impl Provider for VisionOcrProvider {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self.http.get(&url).bearer_auth(&self.api_key).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProviderError::Api {
                status: response.status().as_u16(),
                message: "health check failed".to_string(),
            })
        }
    }
}

#[async_trait]
impl OcrProvider for VisionOcrProvider {
    async fn process_image(
        &self,
        image: &[u8],
        page_num: u64,
        cancel: &CancelToken,
    ) -> Result<OcrOutput, ProviderError> {
        call_with_retries(&self.core.name, &self.core.limiter, &self.core.retry_policy, cancel, async |_| {
            self.send_once(image, page_num).await
        })
        .await
    }
}

#[derive(Debug, Deserialize)]
struct VisionResponse {
    choices: Vec<VisionChoice>,
    usage: Option<VisionUsage>,
}

#[derive(Debug, Deserialize)]
struct VisionChoice {
    message: VisionMessage,
}

#[derive(Debug, Deserialize)]
struct VisionMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VisionUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_forbids_summaries() {
        assert!(OCR_INSTRUCTION.contains("do not summarize"));
    }

    #[test]
    fn test_response_parsing() {
        let raw = serde_json::json!({
            "choices": [{ "message": { "content": "# Page text" } }],
            "usage": { "prompt_tokens": 900, "completion_tokens": 120 }
        });

        let parsed: VisionResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("# Page text"));
        assert_eq!(parsed.usage.unwrap().completion_tokens, 120);
    }
}
