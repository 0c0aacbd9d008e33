//! Provider contracts, registry, and adapters
//!
//! Three provider kinds (LLM, OCR, TTS) behind small capability traits.
//! Each adapter owns its token-bucket limiter and retry policy; every call
//! runs through the shared retry fabric, which consumes one limiter token
//! per attempt.

mod elevenlabs;
pub mod error;
mod mistral_ocr;
mod openai;
mod openai_tts;
mod registry;
pub mod retry;
pub mod types;
mod vision_ocr;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::limiter::RateLimiter;
use crate::structured::SchemaTransport;

pub use elevenlabs::ElevenLabsTtsProvider;
pub use error::{ErrorClass, ProviderError, StructuredFailure};
pub use mistral_ocr::MistralOcrProvider;
pub use openai::OpenAiChatProvider;
pub use openai_tts::OpenAiTtsProvider;
pub use registry::{ProviderRegistry, ProvidersConfig};
pub use retry::RetryPolicy;
pub use types::{
    ChatMessage, ChatRequest, ChatResult, ImageData, OcrOutput, OcrRegion, ResponseFormat, Role, ToolInvocation,
    ToolSpec, TtsOutput, TtsRequest,
};
pub use vision_ocr::VisionOcrProvider;

/// Wire style an adapter speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderStyle {
    /// OpenAI-compatible chat completions (LLM)
    Openai,
    /// Mistral-style dedicated OCR endpoint
    MistralOcr,
    /// Vision-model OCR over chat completions
    VisionOcr,
    /// ElevenLabs-style TTS with request-id stitching
    Elevenlabs,
    /// OpenAI-style audio/speech TTS
    OpenaiTts,
}

/// One provider entry from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProviderSettings {
    pub name: String,
    pub style: ProviderStyle,
    pub base_url: String,

    /// Environment variable holding the API key (never the key itself)
    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub voice: Option<String>,

    #[serde(default = "default_rps")]
    pub rps: f64,

    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Per-request timeout; defaults depend on the provider kind
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Override the inferred structured-output transport
    #[serde(default)]
    pub schema_transport: Option<SchemaTransport>,

    #[serde(default)]
    pub input_price_per_mtok: Option<f64>,

    #[serde(default)]
    pub output_price_per_mtok: Option<f64>,

    /// OCR providers: price per processed page
    #[serde(default)]
    pub price_per_page: Option<f64>,
}

fn default_rps() -> f64 {
    1.0
}

fn default_concurrency() -> usize {
    2
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

impl ProviderSettings {
    /// Resolve the API key from the configured environment variable
    pub fn api_key(&self) -> Result<String, ProviderError> {
        let env = self
            .api_key_env
            .as_deref()
            .ok_or_else(|| ProviderError::MissingApiKey(format!("{}: api-key-env not configured", self.name)))?;
        std::env::var(env).map_err(|_| ProviderError::MissingApiKey(env.to_string()))
    }

    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }
}

/// State shared by every adapter: identity, limits, retry policy
pub struct ProviderCore {
    pub name: String,
    pub rps: f64,
    pub max_concurrency: usize,
    pub retry_policy: RetryPolicy,
    pub limiter: Arc<RateLimiter>,
}

impl ProviderCore {
    pub fn new(settings: &ProviderSettings, retry_policy: RetryPolicy) -> Self {
        Self {
            name: settings.name.clone(),
            rps: settings.rps,
            max_concurrency: settings.max_concurrency,
            limiter: Arc::new(RateLimiter::new(settings.rps)),
            retry_policy,
        }
    }
}

/// Capabilities common to all provider kinds
#[async_trait]
pub trait Provider: Send + Sync {
    fn core(&self) -> &ProviderCore;

    fn name(&self) -> &str {
        &self.core().name
    }

    fn requests_per_second(&self) -> f64 {
        self.core().rps
    }

    fn max_concurrency(&self) -> usize {
        self.core().max_concurrency
    }

    fn max_retries(&self) -> u32 {
        self.core().retry_policy.max_retries
    }

    fn retry_delay_base(&self) -> Duration {
        self.core().retry_policy.base_delay
    }

    /// The token bucket gating this provider's outbound calls
    fn limiter(&self) -> Arc<RateLimiter> {
        self.core().limiter.clone()
    }

    async fn health_check(&self) -> Result<(), ProviderError>;
}

/// Chat-capable language model provider
#[async_trait]
pub trait LlmProvider: Provider {
    async fn chat(&self, request: ChatRequest, cancel: &crate::cancel::CancelToken)
    -> Result<ChatResult, ProviderError>;

    async fn chat_with_tools(
        &self,
        request: ChatRequest,
        tools: &[ToolSpec],
        cancel: &crate::cancel::CancelToken,
    ) -> Result<ChatResult, ProviderError>;
}

/// Page-image OCR provider
#[async_trait]
pub trait OcrProvider: Provider {
    async fn process_image(
        &self,
        image: &[u8],
        page_num: u64,
        cancel: &crate::cancel::CancelToken,
    ) -> Result<OcrOutput, ProviderError>;
}

/// Text-to-speech provider
#[async_trait]
pub trait TtsProvider: Provider {
    async fn generate(&self, request: TtsRequest, cancel: &crate::cancel::CancelToken)
    -> Result<TtsOutput, ProviderError>;
}

#[cfg(test)]
pub mod mock {
    //! In-process fakes for scheduler, job, and agent tests

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cancel::CancelToken;

    fn test_settings(name: &str, rps: f64, concurrency: usize) -> ProviderSettings {
        ProviderSettings {
            name: name.to_string(),
            style: ProviderStyle::Openai,
            base_url: "http://localhost:0".to_string(),
            api_key_env: None,
            model: Some("mock".to_string()),
            voice: None,
            rps,
            max_concurrency: concurrency,
            max_retries: 2,
            retry_delay_ms: 1,
            timeout_ms: None,
            schema_transport: None,
            input_price_per_mtok: None,
            output_price_per_mtok: None,
            price_per_page: None,
        }
    }

    /// Scripted LLM provider: pops one canned result per call
    pub struct MockLlm {
        core: ProviderCore,
        replies: Mutex<VecDeque<Result<ChatResult, ProviderError>>>,
        calls: AtomicUsize,
    }

    impl MockLlm {
        pub fn new(name: &str, replies: Vec<Result<ChatResult, ProviderError>>) -> Self {
            let settings = test_settings(name, 1000.0, 4);
            Self {
                core: ProviderCore::new(&settings, RetryPolicy::llm(0, Duration::from_millis(1))),
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn with_text_replies(name: &str, texts: Vec<&str>) -> Self {
            Self::new(
                name,
                texts
                    .into_iter()
                    .map(|t| {
                        Ok(ChatResult {
                            content: t.to_string(),
                            ..Default::default()
                        })
                    })
                    .collect(),
            )
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for MockLlm {
        fn core(&self) -> &ProviderCore {
            &self.core
        }

        async fn health_check(&self) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    #[async_trait]
    impl LlmProvider for MockLlm {
        async fn chat(&self, _request: ChatRequest, _cancel: &CancelToken) -> Result<ChatResult, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::InvalidResponse("mock replies exhausted".to_string())))
        }

        async fn chat_with_tools(
            &self,
            request: ChatRequest,
            _tools: &[ToolSpec],
            cancel: &CancelToken,
        ) -> Result<ChatResult, ProviderError> {
            self.chat(request, cancel).await
        }
    }

    /// OCR provider returning fixed markdown per page
    pub struct MockOcr {
        core: ProviderCore,
    }

    impl MockOcr {
        pub fn new(name: &str) -> Self {
            let settings = test_settings(name, 1000.0, 2);
            Self {
                core: ProviderCore::new(&settings, RetryPolicy::ocr(0, Duration::from_millis(1))),
            }
        }
    }

    #[async_trait]
    impl Provider for MockOcr {
        fn core(&self) -> &ProviderCore {
            &self.core
        }

        async fn health_check(&self) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    #[async_trait]
    impl OcrProvider for MockOcr {
        async fn process_image(
            &self,
            _image: &[u8],
            page_num: u64,
            _cancel: &CancelToken,
        ) -> Result<OcrOutput, ProviderError> {
            Ok(OcrOutput {
                markdown: format!("# Page {page_num}"),
                page_num,
                ..Default::default()
            })
        }
    }
}
