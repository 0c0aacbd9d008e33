//! Retry fabric shared by provider adapters
//!
//! Every attempt waits for a limiter token first. 429s feed back into the
//! limiter and honour Retry-After when present; other transient failures
//! back off exponentially with jitter. 413/422 responses are retried with a
//! nonce injected into the last user-role message so upstream idempotency
//! caches do not replay the same failure.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::limiter::RateLimiter;

use super::error::ProviderError;
use super::types::{ChatMessage, ChatRequest, Role};

const JITTER_LOW: f64 = 0.8;
const JITTER_HIGH: f64 = 1.3;

/// Backoff policy for one provider
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// LLM default: short cap, providers answer quickly or not at all
    pub fn llm(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(10),
        }
    }

    /// OCR default: longer cap, page processing backends queue internally
    pub fn ocr(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(30),
        }
    }

    /// Exponential backoff with jitter for the given zero-based attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jitter = rand::rng().random_range(JITTER_LOW..JITTER_HIGH);
        Duration::from_secs_f64(capped * jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::llm(3, Duration::from_millis(500))
    }
}

/// Attempt metadata handed to the adapter's request closure
#[derive(Debug, Clone, Copy)]
pub struct Attempt {
    /// Zero-based attempt number
    pub number: u32,
    /// The previous attempt failed 413/422; the request must carry a nonce
    pub inject_nonce: bool,
}

/// Parse a Retry-After header (seconds form) from a provider response
pub(crate) fn retry_after_from_headers(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Append a retry nonce to the last user-role message. The marker is
/// non-semantic: stripping it recovers the canonical prompt. Requests with
/// no user message get the marker as a separate user turn instead.
pub fn inject_retry_nonce(request: &mut ChatRequest) {
    let marker = format!(" [retry:{}]", Uuid::now_v7());

    match request.messages.iter_mut().rev().find(|m| m.role == Role::User) {
        Some(message) => message.content.push_str(&marker),
        None => request.messages.push(ChatMessage::user(marker)),
    }
}

/// Run `op` under the provider's limiter and retry policy.
///
/// Each attempt consumes one limiter token. Retryable failures loop up to
/// `max_retries` additional attempts; non-retryable failures and
/// cancellation return immediately. When retries run out the last error is
/// wrapped so callers can still classify it.
pub async fn call_with_retries<T: Send, F>(
    provider: &str,
    limiter: &RateLimiter,
    policy: &RetryPolicy,
    cancel: &CancelToken,
    mut op: impl FnMut(Attempt) -> F,
) -> Result<T, ProviderError>
where
    F: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut inject_nonce = false;

    for attempt in 0..=policy.max_retries {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            _ = limiter.wait() => {}
        }

        let error = match op(Attempt {
            number: attempt,
            inject_nonce,
        })
        .await
        {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if let ProviderError::RateLimited { retry_after } = &error {
            limiter.record_429(*retry_after).await;
        }

        if !error.is_retryable() {
            return Err(error);
        }

        if attempt == policy.max_retries {
            warn!(provider, attempts = attempt + 1, error = %error, "Retries exhausted");
            return Err(ProviderError::RetriesExhausted {
                attempts: attempt + 1,
                last: Box::new(error),
            });
        }

        inject_nonce = error.needs_nonce();
        let delay = error.retry_after().unwrap_or_else(|| policy.backoff(attempt));
        debug!(provider, attempt, delay_ms = delay.as_millis() as u64, error = %error, "Retrying provider call");

        tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    unreachable!("retry loop returns from within")
}
