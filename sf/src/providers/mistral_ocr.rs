//! Mistral-style dedicated OCR adapter
//!
//! `POST /ocr` with a base64 image URL; the reply carries per-page markdown,
//! detected image regions, and usage info.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;

use crate::cancel::CancelToken;

use super::retry::{RetryPolicy, call_with_retries, retry_after_from_headers};
use super::types::{OcrOutput, OcrRegion};
use super::{OcrProvider, Provider, ProviderCore, ProviderError, ProviderSettings};

const DEFAULT_OCR_TIMEOUT: Duration = Duration::from_secs(500);

pub struct MistralOcrProvider {
    core: ProviderCore,
    model: String,
    api_key: String,
    base_url: String,
    http: reqwest::Client,
    price_per_page: Option<f64>,
}

impl MistralOcrProvider {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        let api_key = settings.api_key()?;
        let model = settings.model.clone().unwrap_or_else(|| "mistral-ocr-latest".to_string());

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
            price_per_page: settings.price_per_page,
        })
    }

    async fn send_once(&self, image: &[u8], page_num: u64) -> Result<OcrOutput, ProviderError> {
        let url = format!("{}/ocr", self.base_url);
        let body = json!({
            "model": self.model,
            "document": {
                "type": "image_url",
                "image_url": format!("data:image/png;base64,{}", BASE64.encode(image)),
            },
            "include_image_base64": false,
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

        let ocr: OcrResponse = response.json().await?;
        let page = ocr
            .pages
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("OCR response carried no pages".to_string()))?;

        let pages_processed = ocr.usage_info.map(|u| u.pages_processed).unwrap_or(1);

        Ok(OcrOutput {
            markdown: page.markdown,
            page_num,
            width: page.dimensions.as_ref().map(|d| d.width),
            height: page.dimensions.as_ref().map(|d| d.height),
            regions: page
                .images
                .into_iter()
                .map(|i| OcrRegion {
                    x: i.top_left_x,
                    y: i.top_left_y,
                    width: i.bottom_right_x.saturating_sub(i.top_left_x),
                    height: i.bottom_right_y.saturating_sub(i.top_left_y),
                })
                .collect(),
            cost_usd: self.price_per_page.unwrap_or(0.0) * pages_processed as f64,
            duration: started.elapsed(),
        })
    }
}

#[async_trait]
impl Provider for MistralOcrProvider {
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
impl OcrProvider for MistralOcrProvider {
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

// Wire response types

#[derive(Debug, Deserialize)]
struct OcrResponse {
    pages: Vec<OcrPage>,
    usage_info: Option<OcrUsage>,
}

#[derive(Debug, Deserialize)]
struct OcrPage {
    markdown: String,
    #[serde(default)]
    images: Vec<OcrImageRegion>,
    dimensions: Option<OcrDimensions>,
}

#[derive(Debug, Deserialize)]
struct OcrImageRegion {
    #[serde(default)]
    top_left_x: u32,
    #[serde(default)]
    top_left_y: u32,
    #[serde(default)]
    bottom_right_x: u32,
    #[serde(default)]
    bottom_right_y: u32,
}

#[derive(Debug, Deserialize)]
struct OcrDimensions {
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct OcrUsage {
    pages_processed: u64,
}
