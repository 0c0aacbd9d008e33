//! Agent session: transcript, tool execution, termination
//!
//! One session drives one LLM-tool dialogue. The model's turns arrive as
//! `ChatResult`s (dispatched through the scheduler); tool calls execute
//! synchronously here because they are cheap local operations. The loop
//! ends when a terminal tool lands a parsable payload or the iteration
//! budget runs out.

use std::collections::HashSet;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::metrics::MetricsTag;
use crate::providers::types::{ChatMessage, ChatRequest, ChatResult, ImageData, ToolInvocation};
use crate::scheduler::WorkUnit;
use crate::sink::{WriteOp, WriteSink};

use super::tools::{ToolContext, ToolOutcome, ToolRegistry};

const DEFAULT_MAX_ITERATIONS: u32 = 24;

/// Agent session configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub llm_provider: String,
    pub system_prompt: String,
    pub max_iterations: u32,
    /// Book row updated by `update_progress` (optional)
    pub book_doc_id: Option<String>,
}

impl AgentConfig {
    pub fn new(llm_provider: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm_provider: llm_provider.into(),
            system_prompt: system_prompt.into(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            book_doc_id: None,
        }
    }
}

pub struct AgentSession {
    job_id: String,
    config: AgentConfig,
    tools: ToolRegistry,
    ctx: ToolContext,
    transcript: Vec<ChatMessage>,
    pending_images: Vec<ImageData>,
    seen_call_ids: HashSet<String>,
    iteration: u32,
    finished: bool,
    failure: Option<String>,
    sink: Option<std::sync::Arc<WriteSink>>,
}

impl AgentSession {
    pub fn new(
        job_id: impl Into<String>,
        config: AgentConfig,
        tools: ToolRegistry,
        ctx: ToolContext,
        initial_prompt: impl Into<String>,
    ) -> Self {
        let transcript = vec![
            ChatMessage::system(config.system_prompt.clone()),
            ChatMessage::user(initial_prompt),
        ];
        Self {
            job_id: job_id.into(),
            config,
            tools,
            ctx,
            transcript,
            pending_images: Vec::new(),
            seen_call_ids: HashSet::new(),
            iteration: 0,
            finished: false,
            failure: None,
            sink: None,
        }
    }

    /// Attach a sink for progress persistence
    pub fn with_sink(mut self, sink: std::sync::Arc<WriteSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Terminal tool payload, once the session finished successfully
    pub fn result(&self) -> Option<Value> {
        self.ctx.result()
    }

    /// The next work unit the agent needs: one LLM call with the current
    /// transcript and tool specs. `None` once finished or out of budget.
    pub fn next_work_unit(&mut self) -> Option<WorkUnit> {
        if self.finished {
            return None;
        }
        if self.iteration >= self.config.max_iterations {
            warn!(job_id = %self.job_id, iterations = self.iteration, "Agent iteration budget exhausted");
            self.finished = true;
            self.failure = Some("max iterations exhausted".to_string());
            return None;
        }
        self.iteration += 1;

        // Images loaded by the previous tool batch ride in on a user turn
        if !self.pending_images.is_empty() {
            let mut message = ChatMessage::user("Here is the page image you loaded.");
            message.images = std::mem::take(&mut self.pending_images);
            self.transcript.push(message);
        }

        let request = ChatRequest {
            messages: self.transcript.clone(),
            ..Default::default()
        };

        let tag = MetricsTag {
            job_id: self.job_id.clone(),
            book_id: self.ctx.book_id.clone(),
            stage: "agent".to_string(),
            item_key: format!("iteration:{}", self.iteration),
            prompt_key: Some("agent-loop".to_string()),
        };

        Some(WorkUnit::llm(
            self.job_id.clone(),
            self.config.llm_provider.clone(),
            request,
            self.tools.specs(),
            tag,
        ))
    }

    /// Consume one model turn: append it to the transcript and return the
    /// tool calls to execute (deduplicated by call id).
    pub fn handle_chat(&mut self, chat: &ChatResult) -> Vec<ToolInvocation> {
        let mut assistant = ChatMessage::assistant(chat.content.clone());
        assistant.tool_calls = chat.tool_calls.clone();
        self.transcript.push(assistant);

        let mut batch = Vec::new();
        for call in &chat.tool_calls {
            if !self.seen_call_ids.insert(call.id.clone()) {
                warn!(call_id = %call.id, "Duplicate tool call id, skipping");
                continue;
            }
            batch.push(call.clone());
        }

        if batch.is_empty() && !self.finished {
            // No tool call, no terminal write: nudge the model back on track
            self.transcript.push(ChatMessage::user(
                "Use the available tools to continue, and finish by calling a write_result tool.",
            ));
        }
        batch
    }

    /// Execute one tool call and return its JSON reply
    pub async fn execute_tool(&self, call: &ToolInvocation) -> ToolOutcome {
        self.tools.execute(call, &self.ctx).await
    }

    /// Append a tool result (or error) to the transcript
    pub fn handle_tool_result(&mut self, call_id: &str, outcome: ToolOutcome) {
        if let Some(image) = &outcome.image {
            self.pending_images.push(image.clone());
        }
        self.transcript
            .push(ChatMessage::tool_result(call_id, outcome.content.clone()));
    }

    /// Run a full tool batch: execute each call, record results, check for
    /// terminal completion, and persist progress.
    pub async fn execute_batch(&mut self, calls: Vec<ToolInvocation>) {
        for call in calls {
            let outcome = self.execute_tool(&call).await;

            let terminal_hit = self.tools.is_terminal(&call.name) && !outcome.is_error;
            self.handle_tool_result(&call.id, outcome);

            if terminal_hit && self.ctx.result().is_some() {
                debug!(job_id = %self.job_id, tool = %call.name, "Terminal tool invoked, session finished");
                self.finished = true;
            }
        }

        self.update_progress().await;
    }

    /// One complete turn: model reply in, tool batch out
    pub async fn step(&mut self, chat: &ChatResult) {
        let batch = self.handle_chat(chat);
        if !batch.is_empty() {
            self.execute_batch(batch).await;
        }
    }

    /// Persist observable agent state after each tool batch
    pub async fn update_progress(&self) {
        let (Some(sink), Some(book_doc_id)) = (&self.sink, &self.config.book_doc_id) else {
            return;
        };

        let viewed = self.ctx.viewed().map(|v| v.page_num);
        let observations = self.ctx.observations();
        let op = WriteOp::update(
            "Book",
            book_doc_id.clone(),
            json!({
                "agent_page": viewed,
                "agent_observation_count": observations.len(),
            }),
        );
        sink.send(op).await;
    }
}
