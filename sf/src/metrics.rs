//! Observability plumbing for work results
//!
//! Every work unit carries a `MetricsTag`; every terminal result is
//! reported to the configured `MetricsSink` with its tag, attempt count,
//! cost, and timing. The default sink emits structured tracing events.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Identifies where a work unit came from, for cost and progress rollups
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsTag {
    pub job_id: String,
    pub book_id: String,
    /// Pipeline stage, e.g. "extract" or "polish"
    pub stage: String,
    /// Item within the stage, e.g. "page:12" or "chapter:3"
    pub item_key: String,
    /// Prompt identity for LLM calls
    pub prompt_key: Option<String>,
}

/// One terminal work result, as reported to the metrics sink
#[derive(Debug, Clone)]
pub struct WorkEvent {
    pub provider: String,
    pub tag: MetricsTag,
    pub success: bool,
    pub attempts: u32,
    pub cost_usd: f64,
    pub duration: Duration,
}

/// Destination for work events
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: &WorkEvent);
}

/// Default sink: structured tracing events
#[derive(Debug, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record(&self, event: &WorkEvent) {
        info!(
            provider = %event.provider,
            job_id = %event.tag.job_id,
            book_id = %event.tag.book_id,
            stage = %event.tag.stage,
            item = %event.tag.item_key,
            prompt = event.tag.prompt_key.as_deref().unwrap_or(""),
            success = event.success,
            attempts = event.attempts,
            cost_usd = event.cost_usd,
            duration_ms = event.duration.as_millis() as u64,
            "work unit finished"
        );
    }
}

#[cfg(test)]
pub mod collect {
    //! Test sink that records every event

    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub struct CollectingMetrics {
        events: Mutex<Vec<WorkEvent>>,
    }

    impl CollectingMetrics {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<WorkEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl MetricsSink for CollectingMetrics {
        fn record(&self, event: &WorkEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
