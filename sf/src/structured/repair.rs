//! Structured-output repair loop
//!
//! When a chat carries a `ResponseFormat`, the reply must parse and
//! validate against the canonical schema. On failure the model gets its own
//! offending turn back plus the schema and the exact error, for a bounded
//! number of rounds.

use serde_json::Value;
use tracing::{debug, warn};

use crate::providers::error::{ProviderError, StructuredFailure};
use crate::providers::types::{ChatMessage, ChatRequest, ChatResult};

use super::extract::extract_json;
use super::validate::validate;

/// Bounded repair rounds after the initial attempt
const MAX_REPAIR_ROUNDS: usize = 2;

/// Offending output is truncated to this many chars in the repair prompt
const OFFENDING_TRUNCATE_CHARS: usize = 2000;

/// Issue a chat request and coerce the reply into schema-valid JSON.
///
/// `issue` performs one full provider round trip (including its own retry
/// fabric). Requests without a `response_format` pass straight through.
/// Token counts and cost accumulate across repair rounds so the caller
/// sees the true spend.
pub async fn chat_with_repair<F>(
    request: ChatRequest,
    mut issue: impl FnMut(ChatRequest) -> F,
) -> Result<ChatResult, ProviderError>
where
    F: std::future::Future<Output = Result<ChatResult, ProviderError>>,
{
    let Some(format) = request.response_format.clone() else {
        return issue(request).await;
    };
    let canonical = format.schema;

    let mut working = request;
    let mut input_tokens = 0u64;
    let mut output_tokens = 0u64;
    let mut cost_usd = 0f64;

    for round in 0..=MAX_REPAIR_ROUNDS {
        let mut result = issue(working.clone()).await?;
        input_tokens += result.input_tokens;
        output_tokens += result.output_tokens;
        cost_usd += result.cost_usd;

        let (kind, error_text) = match candidate_json(&result) {
            Ok(value) => match validate(&canonical, &value) {
                Ok(()) => {
                    result.parsed = Some(value);
                    result.input_tokens = input_tokens;
                    result.output_tokens = output_tokens;
                    result.cost_usd = cost_usd;
                    if round > 0 {
                        debug!(round, "Structured output repaired");
                    }
                    return Ok(result);
                }
                Err(violation) => (StructuredFailure::SchemaValidation, violation.to_string()),
            },
            Err(parse_error) => (StructuredFailure::JsonParse, parse_error),
        };

        if round == MAX_REPAIR_ROUNDS {
            warn!(rounds = round + 1, kind = %kind, "Structured output repair exhausted");
            return Err(ProviderError::Structured {
                kind,
                message: error_text,
            });
        }

        debug!(round, kind = %kind, error = %error_text, "Structured output invalid, repairing");
        working
            .messages
            .push(ChatMessage::assistant(result.content.clone()));
        working
            .messages
            .push(ChatMessage::user(repair_prompt(&canonical, &result.content, &error_text)));
    }

    unreachable!("repair loop returns from within")
}

fn candidate_json(result: &ChatResult) -> Result<Value, String> {
    // Server-side structured output may have parsed already
    if let Some(parsed) = &result.parsed {
        return Ok(parsed.clone());
    }
    extract_json(&result.content)
}

fn repair_prompt(canonical: &Value, offending: &str, error: &str) -> String {
    format!(
        "Your previous output was not valid against the required schema.\n\n\
         Required JSON Schema:\n{}\n\n\
         Your output (possibly truncated):\n{}\n\n\
         Error: {}\n\n\
         Reply with a corrected JSON document only.",
        serde_json::to_string_pretty(canonical).unwrap_or_else(|_| canonical.to_string()),
        truncate_chars(offending, OFFENDING_TRUNCATE_CHARS),
        error,
    )
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let cut: String = text.chars().take(limit).collect();
        format!("{cut}…[truncated]")
    }
}
