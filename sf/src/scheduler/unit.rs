//! Typed work units and results
//!
//! A closed sum over the four work kinds. Workers dispatch on the payload
//! exactly once; adding a kind fails to compile until the dispatch site
//! handles it.

use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::metrics::MetricsTag;
use crate::providers::error::ProviderError;
use crate::providers::types::{ChatRequest, ChatResult, OcrOutput, TtsOutput, TtsRequest, ToolSpec};

/// Provider name used for local CPU work
pub const CPU_PROVIDER: &str = "cpu";

/// Scheduling class for a work unit. A provider's queue serves higher
/// classes first and is FIFO within a class; classes pre-empt at admission
/// only, a unit already running is never interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    /// Fill-in work nothing downstream is waiting on, like speculative
    /// OCR of back-matter pages or narration chunks
    Bulk,
    /// Regular phase work
    #[default]
    Standard,
    /// A unit an entire phase transition is blocked on, like the single
    /// extraction call that gates every chapter
    Expedite,
}

/// Work unit kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkKind {
    Llm,
    Ocr,
    Tts,
    Cpu,
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Llm => write!(f, "llm"),
            Self::Ocr => write!(f, "ocr"),
            Self::Tts => write!(f, "tts"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// Local CPU computation, run on the blocking pool
pub struct CpuTask(pub Box<dyn FnOnce() -> Result<Value, String> + Send>);

impl CpuTask {
    pub fn new(f: impl FnOnce() -> Result<Value, String> + Send + 'static) -> Self {
        Self(Box::new(f))
    }
}

impl std::fmt::Debug for CpuTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CpuTask")
    }
}

/// Typed request payload, one variant per work kind
#[derive(Debug)]
pub enum WorkPayload {
    Llm {
        request: ChatRequest,
        tools: Vec<ToolSpec>,
    },
    Ocr {
        image: Vec<u8>,
        page_num: u64,
    },
    Tts {
        request: TtsRequest,
    },
    Cpu {
        task: CpuTask,
    },
}

impl WorkPayload {
    pub fn kind(&self) -> WorkKind {
        match self {
            WorkPayload::Llm { .. } => WorkKind::Llm,
            WorkPayload::Ocr { .. } => WorkKind::Ocr,
            WorkPayload::Tts { .. } => WorkKind::Tts,
            WorkPayload::Cpu { .. } => WorkKind::Cpu,
        }
    }
}

/// A schedulable unit of work. Immutable once submitted.
#[derive(Debug)]
pub struct WorkUnit {
    pub id: String,
    pub job_id: String,
    /// Provider pool the unit routes to; `cpu` for local work
    pub provider: String,
    pub priority: Priority,
    pub payload: WorkPayload,
    pub tag: MetricsTag,
}

impl WorkUnit {
    fn new(job_id: impl Into<String>, provider: impl Into<String>, payload: WorkPayload, tag: MetricsTag) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            job_id: job_id.into(),
            provider: provider.into(),
            priority: Priority::default(),
            payload,
            tag,
        }
    }

    pub fn llm(
        job_id: impl Into<String>,
        provider: impl Into<String>,
        request: ChatRequest,
        tools: Vec<ToolSpec>,
        tag: MetricsTag,
    ) -> Self {
        Self::new(job_id, provider, WorkPayload::Llm { request, tools }, tag)
    }

    pub fn ocr(
        job_id: impl Into<String>,
        provider: impl Into<String>,
        image: Vec<u8>,
        page_num: u64,
        tag: MetricsTag,
    ) -> Self {
        Self::new(job_id, provider, WorkPayload::Ocr { image, page_num }, tag)
    }

    pub fn tts(job_id: impl Into<String>, provider: impl Into<String>, request: TtsRequest, tag: MetricsTag) -> Self {
        Self::new(job_id, provider, WorkPayload::Tts { request }, tag)
    }

    pub fn cpu(job_id: impl Into<String>, task: CpuTask, tag: MetricsTag) -> Self {
        Self::new(job_id, CPU_PROVIDER, WorkPayload::Cpu { task }, tag)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn kind(&self) -> WorkKind {
        self.payload.kind()
    }
}

/// Typed success payload, one variant per work kind
#[derive(Debug)]
pub enum WorkOutput {
    Chat(ChatResult),
    Ocr(OcrOutput),
    Tts(TtsOutput),
    Cpu(Value),
}

impl WorkOutput {
    pub fn cost_usd(&self) -> f64 {
        match self {
            WorkOutput::Chat(r) => r.cost_usd,
            WorkOutput::Ocr(r) => r.cost_usd,
            WorkOutput::Tts(r) => r.cost_usd,
            WorkOutput::Cpu(_) => 0.0,
        }
    }

    pub fn as_chat(&self) -> Option<&ChatResult> {
        match self {
            WorkOutput::Chat(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_ocr(&self) -> Option<&OcrOutput> {
        match self {
            WorkOutput::Ocr(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_tts(&self) -> Option<&TtsOutput> {
        match self {
            WorkOutput::Tts(r) => Some(r),
            _ => None,
        }
    }
}

/// Terminal result for one work unit. Exactly one is delivered to the
/// owning job's `on_complete` per submitted unit.
#[derive(Debug)]
pub struct WorkResult {
    pub unit_id: String,
    pub job_id: String,
    pub provider: String,
    pub kind: WorkKind,
    pub tag: MetricsTag,
    pub attempts: u32,
    pub duration: Duration,
    pub outcome: Result<WorkOutput, ProviderError>,
}

impl WorkResult {
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn cost_usd(&self) -> f64 {
        self.outcome.as_ref().map(WorkOutput::cost_usd).unwrap_or(0.0)
    }

    /// Build the cancellation result for a unit dropped from the queue
    pub fn cancelled(unit: &WorkUnit) -> Self {
        Self {
            unit_id: unit.id.clone(),
            job_id: unit.job_id.clone(),
            provider: unit.provider.clone(),
            kind: unit.kind(),
            tag: unit.tag.clone(),
            attempts: 0,
            duration: Duration::ZERO,
            outcome: Err(ProviderError::Cancelled),
        }
    }
}
