//! Provider request/response types
//!
//! Modeled on the OpenAI-compatible wire shapes the adapters speak, but
//! provider-agnostic: adapters translate these into their own body format.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message role in a chat transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// An image attached to a chat message, carried as base64 with its MIME type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageData {
    pub media_type: String,
    pub base64: String,
}

/// A message in a chat request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,

    /// Images attached to this message (vision requests)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageData>,

    /// Tool calls issued by an assistant turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,

    /// For tool-role messages: the call this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    /// A tool-role message answering the given call id
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            images: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Attach an image to this message
    pub fn with_image(mut self, media_type: impl Into<String>, base64: impl Into<String>) -> Self {
        self.images.push(ImageData {
            media_type: media_type.into(),
            base64: base64.into(),
        });
        self
    }
}

/// Structured output request: a named JSON Schema the reply must satisfy.
/// `schema` is the canonical schema; adapters may send an adapted copy on
/// the wire but validation always runs against this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    pub name: String,
    pub schema: Value,
}

/// Everything needed for one chat call
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub response_format: Option<ResponseFormat>,
    /// Metrics key identifying the prompt that produced this request
    pub prompt_key: Option<String>,
}

/// A tool the model may call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments
    pub parameters: Value,
}

/// A tool call issued by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Result of a chat call
#[derive(Debug, Clone, Default)]
pub struct ChatResult {
    pub content: String,
    /// Parsed JSON when the request carried a `ResponseFormat`; validated
    /// against the canonical schema
    pub parsed: Option<Value>,
    pub tool_calls: Vec<ToolInvocation>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub duration: Duration,
    /// Provider-reported request id
    pub request_id: Option<String>,
}

/// A text region detected on a scanned page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Result of OCRing one page image
#[derive(Debug, Clone, Default)]
pub struct OcrOutput {
    pub markdown: String,
    pub page_num: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub regions: Vec<OcrRegion>,
    pub cost_usd: f64,
    pub duration: Duration,
}

/// A text-to-speech request. `previous_request_ids` stitches this chunk
/// onto earlier generations so the audio continues seamlessly.
#[derive(Debug, Clone, Default)]
pub struct TtsRequest {
    pub text: String,
    pub voice: Option<String>,
    pub previous_request_ids: Vec<String>,
}

/// Result of a TTS generation
#[derive(Debug, Clone, Default)]
pub struct TtsOutput {
    pub audio: Vec<u8>,
    pub format: String,
    pub sample_rate: u32,
    pub char_count: u64,
    /// Request id usable as `previous_request_ids` on the next chunk
    pub request_id: Option<String>,
    pub cost_usd: f64,
    pub duration: Duration,
}
