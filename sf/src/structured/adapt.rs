//! Outgoing schema adaptation per model family
//!
//! The canonical schema is authored once and always used for validation.
//! What goes on the wire depends on the model family: some reject integer
//! bound keywords, some reject server-side structured output entirely and
//! get the schema in the prompt instead.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a model family accepts structured-output schemas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchemaTransport {
    /// Full JSON Schema in `response_format`
    #[default]
    Schema,
    /// JSON Schema with integer bound keywords stripped
    SchemaNoBounds,
    /// No server-side structured output; schema is carried in the prompt
    Prompt,
}

/// Infer the transport from a model identifier. Config can override this
/// per provider; the inference covers the common hosted families.
pub fn transport_for_model(model: &str) -> SchemaTransport {
    let model = model.to_lowercase();

    if ["llama", "qwen", "deepseek", "mixtral"].iter().any(|f| model.contains(f)) {
        SchemaTransport::Prompt
    } else if model.starts_with("gpt-") || model.starts_with("o1") || model.starts_with("o3") {
        SchemaTransport::SchemaNoBounds
    } else {
        SchemaTransport::Schema
    }
}

/// Produce the wire schema for the given transport. `None` means the wire
/// request must omit `response_format` and instruct via prompt instead.
pub fn adapt_schema(transport: SchemaTransport, canonical: &Value) -> Option<Value> {
    match transport {
        SchemaTransport::Schema => Some(canonical.clone()),
        SchemaTransport::SchemaNoBounds => {
            let mut adapted = canonical.clone();
            strip_integer_bounds(&mut adapted);
            Some(adapted)
        }
        SchemaTransport::Prompt => None,
    }
}

/// Prompt fragment used when the transport rejects server-side schemas
pub fn schema_prompt_instruction(canonical: &Value) -> String {
    format!(
        "Respond with a single JSON document and nothing else. It must conform to this JSON Schema:\n{}",
        serde_json::to_string_pretty(canonical).unwrap_or_else(|_| canonical.to_string())
    )
}

const BOUND_KEYWORDS: [&str; 4] = ["minimum", "maximum", "exclusiveMinimum", "exclusiveMaximum"];

fn strip_integer_bounds(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            if map.get("type").and_then(Value::as_str) == Some("integer") {
                for key in BOUND_KEYWORDS {
                    map.remove(key);
                }
            }
            for value in map.values_mut() {
                strip_integer_bounds(value);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_integer_bounds(item);
            }
        }
        _ => {}
    }
}
