//! ElevenLabs-style TTS adapter
//!
//! `POST /v1/text-to-speech/{voice}?output_format=…` returns raw audio bytes
//! plus a `request-id` header. Passing prior request ids back as
//! `previous_request_ids` stitches consecutive chunks into one continuous
//! stream.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use crate::cancel::CancelToken;

use super::retry::{RetryPolicy, call_with_retries, retry_after_from_headers};
use super::types::{TtsOutput, TtsRequest};
use super::{Provider, ProviderCore, ProviderError, ProviderSettings, TtsProvider};

const DEFAULT_TTS_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_OUTPUT_FORMAT: &str = "mp3_44100_128";

/// Providers accept at most this many stitch ids per request
const MAX_PREVIOUS_REQUEST_IDS: usize = 3;

pub struct ElevenLabsTtsProvider {
    core: ProviderCore,
    model: String,
    voice: String,
    api_key: String,
    base_url: String,
    http: reqwest::Client,
    output_format: String,
}

impl ElevenLabsTtsProvider {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        let api_key = settings.api_key()?;
        let voice = settings
            .voice
            .clone()
            .ok_or_else(|| ProviderError::InvalidResponse(format!("{}: voice not configured", settings.name)))?;

        let http = reqwest::Client::builder()
            .timeout(settings.timeout_or(DEFAULT_TTS_TIMEOUT))
            .build()?;

        Ok(Self {
            core: ProviderCore::new(
                settings,
                RetryPolicy::llm(settings.max_retries, Duration::from_millis(settings.retry_delay_ms)),
            ),
            model: settings.model.clone().unwrap_or_else(|| "eleven_multilingual_v2".to_string()),
            voice,
            api_key,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            http,
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
        })
    }

    fn sample_rate(&self) -> u32 {
        // Formats look like mp3_44100_128 / pcm_24000
        self.output_format
            .split('_')
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(44_100)
    }

    async fn send_once(&self, request: &TtsRequest) -> Result<TtsOutput, ProviderError> {
        let voice = request.voice.as_deref().unwrap_or(&self.voice);
        let url = format!(
            "{}/v1/text-to-speech/{}?output_format={}",
            self.base_url, voice, self.output_format
        );

        let mut body = json!({
            "text": request.text,
            "model_id": self.model,
        });
        if !request.previous_request_ids.is_empty() {
            let recent: Vec<&String> = request
                .previous_request_ids
                .iter()
                .rev()
                .take(MAX_PREVIOUS_REQUEST_IDS)
                .rev()
                .collect();
            body["previous_request_ids"] = json!(recent);
        }

        let started = Instant::now();
        let response = self
            .http
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = retry_after_from_headers(response.headers());
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, retry_after, message));
        }

        let request_id = response
            .headers()
            .get("request-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let audio = response.bytes().await?.to_vec();

        Ok(TtsOutput {
            audio,
            format: self.output_format.clone(),
            sample_rate: self.sample_rate(),
            char_count: request.text.chars().count() as u64,
            request_id,
            cost_usd: 0.0,
            duration: started.elapsed(),
        })
    }
}

#[async_trait]
impl Provider for ElevenLabsTtsProvider {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let url = format!("{}/v1/user", self.base_url);
        let response = self.http.get(&url).header("xi-api-key", &self.api_key).send().await?;
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
impl TtsProvider for ElevenLabsTtsProvider {
    async fn generate(&self, request: TtsRequest, cancel: &CancelToken) -> Result<TtsOutput, ProviderError> {
        call_with_retries(&self.core.name, &self.core.limiter, &self.core.retry_policy, cancel, async |_| {
            self.send_once(&request).await
        })
        .await
    }
}
