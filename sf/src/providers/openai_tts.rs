//! OpenAI-style TTS adapter
//!
//! `POST /audio/speech` returning raw audio bytes. This wire contract has no
//! request-id stitching; consecutive chunks are independent generations.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use crate::cancel::CancelToken;

use super::retry::{RetryPolicy, call_with_retries, retry_after_from_headers};
use super::types::{TtsOutput, TtsRequest};
use super::{Provider, ProviderCore, ProviderError, ProviderSettings, TtsProvider};

const DEFAULT_TTS_TIMEOUT: Duration = Duration::from_secs(300);

pub struct OpenAiTtsProvider {
    core: ProviderCore,
    model: String,
    voice: String,
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl OpenAiTtsProvider {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        let api_key = settings.api_key()?;

        let http = reqwest::Client::builder()
            .timeout(settings.timeout_or(DEFAULT_TTS_TIMEOUT))
            .build()?;

        Ok(Self {
            core: ProviderCore::new(
                settings,
                RetryPolicy::llm(settings.max_retries, Duration::from_millis(settings.retry_delay_ms)),
            ),
            model: settings.model.clone().unwrap_or_else(|| "tts-1".to_string()),
            voice: settings.voice.clone().unwrap_or_else(|| "alloy".to_string()),
            api_key,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn send_once(&self, request: &TtsRequest) -> Result<TtsOutput, ProviderError> {
        let url = format!("{}/audio/speech", self.base_url);
        let body = json!({
            "model": self.model,
            "input": request.text,
            "voice": request.voice.as_deref().unwrap_or(&self.voice),
            "response_format": "mp3",
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

        let audio = response.bytes().await?.to_vec();

        Ok(TtsOutput {
            audio,
            format: "mp3".to_string(),
            sample_rate: 44_100,
            char_count: request.text.chars().count() as u64,
            request_id: None,
            cost_usd: 0.0,
            duration: started.elapsed(),
        })
    }
}

#[async_trait]
impl Provider for OpenAiTtsProvider {
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
impl TtsProvider for OpenAiTtsProvider {
    async fn generate(&self, request: TtsRequest, cancel: &CancelToken) -> Result<TtsOutput, ProviderError> {
        call_with_retries(&self.core.name, &self.core.limiter, &self.core.retry_policy, cancel, async |_| {
            self.send_once(&request).await
        })
        .await
    }
}
