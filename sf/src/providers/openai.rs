//! OpenAI-compatible chat completions adapter
//!
//! Speaks `POST /chat/completions` with messages, tools, and
//! `response_format`. Structured-output schemas are adapted per model
//! family on the way out; replies are validated against the canonical
//! schema (with repair rounds) on the way back in.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::cancel::CancelToken;
use crate::structured::{SchemaTransport, adapt_schema, chat_with_repair, schema_prompt_instruction, transport_for_model};

use super::retry::{Attempt, RetryPolicy, call_with_retries, inject_retry_nonce, retry_after_from_headers};
use super::types::{ChatMessage, ChatRequest, ChatResult, Role, ToolInvocation, ToolSpec};
use super::{LlmProvider, Provider, ProviderCore, ProviderError, ProviderSettings};

const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(120);

/// Chat completions client for any OpenAI-compatible endpoint
pub struct OpenAiChatProvider {
    core: ProviderCore,
    model: String,
    api_key: String,
    base_url: String,
    http: reqwest::Client,
    schema_transport: SchemaTransport,
    input_price_per_mtok: Option<f64>,
    output_price_per_mtok: Option<f64>,
}

impl OpenAiChatProvider {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        let api_key = settings.api_key()?;
        let model = settings
            .model
            .clone()
            .ok_or_else(|| ProviderError::InvalidResponse(format!("{}: model not configured", settings.name)))?;

        let http = reqwest::Client::builder()
            .timeout(settings.timeout_or(DEFAULT_LLM_TIMEOUT))
            .build()?;

        let schema_transport = settings.schema_transport.unwrap_or_else(|| transport_for_model(&model));

        Ok(Self {
            core: ProviderCore::new(
                settings,
                RetryPolicy::llm(settings.max_retries, Duration::from_millis(settings.retry_delay_ms)),
            ),
            model,
            api_key,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            http,
            schema_transport,
            input_price_per_mtok: settings.input_price_per_mtok,
            output_price_per_mtok: settings.output_price_per_mtok,
        })
    }

    fn convert_message(&self, message: &ChatMessage) -> Value {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };

        let mut body = if message.images.is_empty() {
            json!({ "role": role, "content": message.content })
        } else {
            // Vision requests carry text + image parts
            let mut parts = vec![json!({ "type": "text", "text": message.content })];
            for image in &message.images {
                parts.push(json!({
                    "type": "image_url",
                    "image_url": { "url": format!("data:{};base64,{}", image.media_type, image.base64) },
                }));
            }
            json!({ "role": role, "content": parts })
        };

        if !message.tool_calls.is_empty() {
            body["tool_calls"] = json!(
                message
                    .tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_string(),
                            },
                        })
                    })
                    .collect::<Vec<_>>()
            );
        }

        if let Some(call_id) = &message.tool_call_id {
            body["tool_call_id"] = json!(call_id);
        }

        body
    }

    fn build_body(&self, request: &ChatRequest, tools: &[ToolSpec]) -> Value {
        let mut messages: Vec<Value> = request.messages.iter().map(|m| self.convert_message(m)).collect();

        let mut body = json!({
            "model": self.model,
            "messages": [],
            "usage": { "include": true },
        });

        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        if !tools.is_empty() {
            body["tools"] = json!(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            },
                        })
                    })
                    .collect::<Vec<_>>()
            );
        }

        if let Some(format) = &request.response_format {
            match adapt_schema(self.schema_transport, &format.schema) {
                Some(wire_schema) => {
                    body["response_format"] = json!({
                        "type": "json_schema",
                        "json_schema": {
                            "name": format.name,
                            "schema": wire_schema,
                            "strict": true,
                        },
                    });
                }
                None => {
                    // Transport rejects server-side schemas; instruct via
                    // prompt and keep the canonical schema for validation
                    messages.push(json!({
                        "role": "user",
                        "content": schema_prompt_instruction(&format.schema),
                    }));
                }
            }
        }

        body["messages"] = json!(messages);
        body
    }

    fn cost_for(&self, usage: &CompletionUsage) -> f64 {
        if let Some(cost) = usage.cost {
            return cost;
        }
        let input = self.input_price_per_mtok.unwrap_or(0.0) * usage.prompt_tokens as f64 / 1_000_000.0;
        let output = self.output_price_per_mtok.unwrap_or(0.0) * usage.completion_tokens as f64 / 1_000_000.0;
        input + output
    }

    async fn send_once(&self, request: &ChatRequest, tools: &[ToolSpec]) -> Result<ChatResult, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(request, tools);
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

        let completion: CompletionResponse = response.json().await?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("completion carried no choices".to_string()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                let arguments = serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null);
                ToolInvocation {
                    id: call.id,
                    name: call.function.name,
                    arguments,
                }
            })
            .collect();

        let usage = completion.usage.unwrap_or_default();

        Ok(ChatResult {
            content: choice.message.content.unwrap_or_default(),
            parsed: None,
            tool_calls,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cost_usd: self.cost_for(&usage),
            duration: started.elapsed(),
            request_id: completion.id,
        })
    }

    /// One provider exchange under the retry fabric. Nonce injection kicks
    /// in when the previous attempt failed 413/422.
    async fn exchange(
        &self,
        request: ChatRequest,
        tools: &[ToolSpec],
        cancel: &CancelToken,
    ) -> Result<ChatResult, ProviderError> {
        call_with_retries(
            &self.core.name,
            &self.core.limiter,
            &self.core.retry_policy,
            cancel,
            async |attempt: Attempt| {
                let mut attempt_request = request.clone();
                if attempt.inject_nonce {
                    inject_retry_nonce(&mut attempt_request);
                }
                self.send_once(&attempt_request, tools).await
            },
        )
        .await
    }
}

#[async_trait]
impl Provider for OpenAiChatProvider {
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
impl LlmProvider for OpenAiChatProvider {
    async fn chat(&self, request: ChatRequest, cancel: &CancelToken) -> Result<ChatResult, ProviderError> {
        chat_with_repair(request, async |req| self.exchange(req, &[], cancel).await).await
    }

    async fn chat_with_tools(
        &self,
        request: ChatRequest,
        tools: &[ToolSpec],
        cancel: &CancelToken,
    ) -> Result<ChatResult, ProviderError> {
        chat_with_repair(request, async |req| self.exchange(req, tools, cancel).await).await
    }
}

// Wire response types

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    id: Option<String>,
    choices: Vec<CompletionChoice>,
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    cost: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderStyle;
    use serde_json::json;

    fn test_provider(model: &str, transport: Option<SchemaTransport>) -> OpenAiChatProvider {
        let settings = ProviderSettings {
            name: "test-llm".to_string(),
            style: ProviderStyle::Openai,
            base_url: "http://localhost:1234/v1".to_string(),
            api_key_env: None,
            model: Some(model.to_string()),
            voice: None,
            rps: 10.0,
            max_concurrency: 2,
            max_retries: 1,
            retry_delay_ms: 1,
            timeout_ms: None,
            schema_transport: transport,
            input_price_per_mtok: Some(3.0),
            output_price_per_mtok: Some(15.0),
            price_per_page: None,
        };

        OpenAiChatProvider {
            core: ProviderCore::new(&settings, RetryPolicy::llm(1, Duration::from_millis(1))),
            model: model.to_string(),
            api_key: "test-key".to_string(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            schema_transport: transport.unwrap_or_else(|| transport_for_model(model)),
            input_price_per_mtok: settings.input_price_per_mtok,
            output_price_per_mtok: settings.output_price_per_mtok,
        }
    }

    #[test]
    fn test_body_basic() {
        let provider = test_provider("gpt-4o", None);
        let request = ChatRequest {
            messages: vec![ChatMessage::system("sys"), ChatMessage::user("hi")],
            temperature: Some(0.2),
            max_tokens: Some(512),
            ..Default::default()
        };

        let body = provider.build_body(&request, &[]);

        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["usage"]["include"], true);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_body_with_image_parts() {
        let provider = test_provider("gpt-4o", None);
        let request = ChatRequest {
            messages: vec![ChatMessage::user("read this page").with_image("image/png", "QUJD")],
            ..Default::default()
        };

        let body = provider.build_body(&request, &[]);
        let content = &body["messages"][0]["content"];

        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[1]["image_url"]["url"], "data:image/png;base64,QUJD");
    }

    #[test]
    fn test_body_with_tools() {
        let provider = test_provider("gpt-4o", None);
        let tools = vec![ToolSpec {
            name: "load_page_image".to_string(),
            description: "Load a page scan".to_string(),
            parameters: json!({"type": "object"}),
        }];

        let body = provider.build_body(&ChatRequest::default(), &tools);

        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "load_page_image");
    }

    #[test]
    fn test_schema_on_wire_strips_bounds_for_gpt() {
        let provider = test_provider("gpt-4o", None);
        let request = ChatRequest {
            messages: vec![ChatMessage::user("classify")],
            response_format: Some(crate::providers::ResponseFormat {
                name: "level".to_string(),
                schema: json!({
                    "type": "object",
                    "properties": { "level": { "type": "integer", "minimum": 1, "maximum": 3 } }
                }),
            }),
            ..Default::default()
        };

        let body = provider.build_body(&request, &[]);
        let wire = &body["response_format"]["json_schema"]["schema"];

        assert!(wire["properties"]["level"].get("minimum").is_none());
    }

    #[test]
    fn test_prompt_transport_appends_instruction() {
        let provider = test_provider("meta-llama/Llama-3.3-70B", None);
        let request = ChatRequest {
            messages: vec![ChatMessage::user("classify")],
            response_format: Some(crate::providers::ResponseFormat {
                name: "level".to_string(),
                schema: json!({"type": "object"}),
            }),
            ..Default::default()
        };

        let body = provider.build_body(&request, &[]);

        assert!(body.get("response_format").is_none());
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert!(
            messages[1]["content"]
                .as_str()
                .unwrap()
                .contains("JSON Schema")
        );
    }

    #[test]
    fn test_cost_prefers_provider_reported() {
        let provider = test_provider("gpt-4o", None);
        let usage = CompletionUsage {
            prompt_tokens: 1_000_000,
            completion_tokens: 0,
            cost: Some(1.23),
        };
        assert_eq!(provider.cost_for(&usage), 1.23);
    }

    #[test]
    fn test_cost_falls_back_to_configured_prices() {
        let provider = test_provider("gpt-4o", None);
        let usage = CompletionUsage {
            prompt_tokens: 1_000_000,
            completion_tokens: 100_000,
            cost: None,
        };
        // $3 input + $1.50 output
        assert!((provider.cost_for(&usage) - 4.5).abs() < 1e-9);
    }

    #[test]
    fn test_tool_call_arguments_parsed_from_string() {
        let raw = json!({
            "id": "chatcmpl-1",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "function": { "name": "load_page_image", "arguments": "{\"page_num\": 7}" }
                    }]
                }
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 2 }
        });

        let parsed: CompletionResponse = serde_json::from_value(raw).unwrap();
        let call = &parsed.choices[0].message.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.function.name, "load_page_image");

        let args: Value = serde_json::from_str(&call.function.arguments).unwrap();
        assert_eq!(args["page_num"], 7);
    }
}
