//! Agent loop: iterative LLM-tool dialogue
//!
//! The session owns the transcript and tool state; `AgentJob` adapts a
//! session to the scheduler so its LLM turns flow through the same queues,
//! limiters, and retry fabric as every other work unit. Tools run
//! synchronously in the orchestrator.

mod session;
pub mod tools;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::scheduler::{JobHandler, WorkOutput, WorkResult, WorkUnit};

pub use session::{AgentConfig, AgentSession};
pub use tools::{Observation, Tool, ToolContext, ToolOutcome, ToolRegistry, ViewedImage, standard_tools};

/// Drives an `AgentSession` through the scheduler: one LLM unit in flight
/// at a time, tool batches executed between turns.
pub struct AgentJob {
    job_id: String,
    session: Mutex<AgentSession>,
    expected_unit: Mutex<Option<String>>,
    done: AtomicBool,
}

impl AgentJob {
    pub fn new(session: AgentSession, job_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            job_id: job_id.into(),
            session: Mutex::new(session),
            expected_unit: Mutex::new(None),
            done: AtomicBool::new(false),
        })
    }

    /// Terminal payload once the loop finished
    pub async fn result(&self) -> Option<Value> {
        self.session.lock().await.result()
    }
}

#[async_trait]
impl JobHandler for AgentJob {
    fn id(&self) -> String {
        self.job_id.clone()
    }

    async fn start(&self) -> Vec<WorkUnit> {
        let mut session = self.session.lock().await;
        match session.next_work_unit() {
            Some(unit) => {
                *self.expected_unit.lock().await = Some(unit.id.clone());
                vec![unit]
            }
            None => {
                self.done.store(true, Ordering::SeqCst);
                Vec::new()
            }
        }
    }

    async fn on_complete(&self, result: WorkResult) -> Vec<WorkUnit> {
        {
            let mut expected = self.expected_unit.lock().await;
            if expected.as_deref() != Some(result.unit_id.as_str()) {
                debug!(unit_id = %result.unit_id, "Result for stale agent unit, ignoring");
                return Vec::new();
            }
            *expected = None;
        }

        let mut session = self.session.lock().await;

        match result.outcome {
            Ok(WorkOutput::Chat(chat)) => session.step(&chat).await,
            Ok(_) => {
                warn!(job_id = %self.job_id, "Agent unit produced a non-chat payload");
                self.done.store(true, Ordering::SeqCst);
                return Vec::new();
            }
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "Agent LLM call failed, ending session");
                self.done.store(true, Ordering::SeqCst);
                return Vec::new();
            }
        }

        match session.next_work_unit() {
            Some(unit) => {
                *self.expected_unit.lock().await = Some(unit.id.clone());
                vec![unit]
            }
            None => {
                self.done.store(true, Ordering::SeqCst);
                Vec::new()
            }
        }
    }

    fn done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn status(&self) -> Value {
        json!({ "job_id": self.job_id, "done": self.done.load(Ordering::SeqCst) })
    }
}
