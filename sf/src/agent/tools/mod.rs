//! Agent tool system
//!
//! Tools are cheap local operations (store reads, text search, image loads)
//! executed synchronously in the orchestrator. Each tool declares a JSON
//! Schema for its arguments; the registry validates arguments with the same
//! validator used for structured output before dispatching.

mod builtin;
mod context;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::providers::types::{ImageData, ToolInvocation, ToolSpec};
use crate::structured::validate;

pub use builtin::standard_tools;
pub use context::{Observation, ToolContext, ViewedImage};

/// Result of one tool execution. `content` is always a JSON string;
/// errors are structured objects the model can read and act on.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
    /// Image to attach to the next model turn (image-loading tools)
    pub image: Option<ImageData>,
}

impl ToolOutcome {
    pub fn success(value: Value) -> Self {
        Self {
            content: value.to_string(),
            is_error: false,
            image: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: json!({ "error": message.into() }).to_string(),
            is_error: true,
            image: None,
        }
    }

    pub fn with_image(mut self, image: ImageData) -> Self {
        self.image = Some(image);
        self
    }
}

/// A tool the agent's model may call
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (matches the model's tool_use name)
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON Schema for the arguments
    fn parameters(&self) -> Value;

    /// Terminal tools end the agent loop when invoked with a parsable
    /// payload
    fn terminal(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome;
}

/// Name → tool lookup with schema validation on dispatch
pub struct ToolRegistry {
    tools: HashMap<&'static str, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Box<dyn Tool>>) -> Self {
        Self {
            tools: tools.into_iter().map(|t| (t.name(), t)).collect(),
        }
    }

    /// The standard book-agent tool set
    pub fn standard() -> Self {
        Self::new(standard_tools())
    }

    pub fn add(&mut self, tool: Box<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_terminal(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|t| t.terminal())
    }

    /// Wire specs for the model (marshalled once per request build)
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Execute one call: lookup, argument validation, dispatch
    pub async fn execute(&self, call: &ToolInvocation, ctx: &ToolContext) -> ToolOutcome {
        let Some(tool) = self.tools.get(call.name.as_str()) else {
            return ToolOutcome::error(format!("unknown tool: {}", call.name));
        };

        if let Err(violation) = validate(&tool.parameters(), &call.arguments) {
            debug!(tool = %call.name, error = %violation, "Tool arguments rejected");
            return ToolOutcome::error(format!("invalid arguments for {}: {violation}", call.name));
        }

        tool.execute(call.arguments.clone(), ctx).await
    }
}
