//! Work scheduler
//!
//! Routes typed work units to per-provider worker pools. Each pool runs
//! `max_concurrency` workers over a bounded priority queue; CPU work gets a
//! fixed pool of its own. Workers dispatch through the provider registry
//! (the retry fabric waits on the provider's limiter per attempt), then
//! hand the result to the owning job's `on_complete` and re-enqueue
//! whatever follow-up units it returns.

mod queue;
mod unit;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::metrics::{MetricsSink, WorkEvent};
use crate::providers::error::ProviderError;
use crate::providers::ProviderRegistry;

pub use queue::{ProviderQueue, PushError};
pub use unit::{CPU_PROVIDER, CpuTask, Priority, WorkKind, WorkOutput, WorkPayload, WorkResult, WorkUnit};

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SchedulerConfig {
    /// Per-provider queue capacity
    pub queue_capacity: usize,
    /// Fixed pool size for local CPU work
    pub cpu_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            cpu_workers: 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no worker pool for provider: {0}")]
    UnknownProvider(String),

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("job {0} is cancelled")]
    JobCancelled(String),

    #[error("provider queue closed: {0}")]
    QueueClosed(String),
}

/// Per-provider (and per-job) progress counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressCounts {
    pub expected: u64,
    pub completed: u64,
}

/// Aggregate scheduler state for reporting
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub queue_depths: HashMap<String, usize>,
    pub active_jobs: usize,
    pub total_cost_usd: f64,
}

/// The scheduler's view of a job: it produces initial units, consumes every
/// result exactly once, and may return follow-up units.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn id(&self) -> String;

    /// Produce the initial work units (possibly none for a job that
    /// completes synchronously)
    async fn start(&self) -> Vec<WorkUnit>;

    /// Consume one result; returns follow-up units to enqueue
    async fn on_complete(&self, result: WorkResult) -> Vec<WorkUnit>;

    fn done(&self) -> bool;

    fn status(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolKind {
    Llm,
    Ocr,
    Tts,
    Cpu,
}

struct Pool {
    queue: Arc<ProviderQueue>,
    workers: Vec<JoinHandle<()>>,
}

struct JobEntry {
    handler: Arc<dyn JobHandler>,
    cancel: CancelToken,
    done_tx: watch::Sender<bool>,
}

struct Shared {
    registry: Arc<ProviderRegistry>,
    metrics: Arc<dyn MetricsSink>,
    config: SchedulerConfig,
    shutdown: CancelToken,
    pools: RwLock<HashMap<String, Pool>>,
    jobs: RwLock<HashMap<String, JobEntry>>,
    progress: Mutex<HashMap<(String, String), ProgressCounts>>,
    total_cost: Mutex<f64>,
}

/// The scheduler. Owns its worker pools and queues exclusively.
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(registry: Arc<ProviderRegistry>, metrics: Arc<dyn MetricsSink>, config: SchedulerConfig) -> Self {
        let shared = Arc::new(Shared {
            registry,
            metrics,
            config,
            shutdown: CancelToken::new(),
            pools: RwLock::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
            progress: Mutex::new(HashMap::new()),
            total_cost: Mutex::new(0.0),
        });

        let scheduler = Self { shared };
        scheduler.sync_pools();
        scheduler
    }

    /// Reconcile worker pools against the provider registry. New providers
    /// get a pool sized to their `max_concurrency`; providers gone from the
    /// registry get their pool closed and queued units cancelled.
    pub fn sync_pools(&self) {
        let mut desired: Vec<(String, PoolKind, usize)> =
            vec![(CPU_PROVIDER.to_string(), PoolKind::Cpu, self.shared.config.cpu_workers)];

        for name in self.shared.registry.list_llm() {
            if let Ok(p) = self.shared.registry.get_llm(&name) {
                desired.push((name, PoolKind::Llm, p.max_concurrency()));
            }
        }
        for name in self.shared.registry.list_ocr() {
            if let Ok(p) = self.shared.registry.get_ocr(&name) {
                desired.push((name, PoolKind::Ocr, p.max_concurrency()));
            }
        }
        for name in self.shared.registry.list_tts() {
            if let Ok(p) = self.shared.registry.get_tts(&name) {
                desired.push((name, PoolKind::Tts, p.max_concurrency()));
            }
        }

        let mut pools = self.shared.pools.write().expect("pools lock poisoned");

        // Close pools for providers that disappeared
        let desired_names: Vec<&str> = desired.iter().map(|(n, _, _)| n.as_str()).collect();
        let removed: Vec<String> = pools
            .keys()
            .filter(|name| !desired_names.contains(&name.as_str()))
            .cloned()
            .collect();
        for name in removed {
            if let Some(pool) = pools.remove(&name) {
                info!(provider = %name, "Closing worker pool");
                pool.queue.close();
                let mut orphans = Vec::new();
                while let Some(unit) = pool.queue.try_pop() {
                    orphans.push(unit);
                }
                if !orphans.is_empty() {
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        for unit in orphans {
                            let result = WorkResult::cancelled(&unit);
                            handle_result(&shared, result).await;
                        }
                    });
                }
            }
        }

        for (name, kind, workers) in desired {
            if pools.contains_key(&name) {
                continue;
            }
            debug!(provider = %name, ?kind, workers, "Starting worker pool");
            let pool = spawn_pool(&self.shared, name.clone(), kind, workers);
            pools.insert(name, pool);
        }
    }

    /// Register a job, run its `start`, and submit the produced units
    pub async fn run_job(&self, handler: Arc<dyn JobHandler>) -> Result<String, SchedulerError> {
        let job_id = handler.id();
        let (done_tx, _) = watch::channel(false);

        {
            let mut jobs = self.shared.jobs.write().expect("jobs lock poisoned");
            jobs.insert(
                job_id.clone(),
                JobEntry {
                    handler: handler.clone(),
                    cancel: CancelToken::new(),
                    done_tx,
                },
            );
        }

        info!(job_id = %job_id, "Starting job");
        let units = handler.start().await;

        if units.is_empty() && handler.done() {
            finalize_job(&self.shared, &job_id);
            return Ok(job_id);
        }

        for unit in units {
            self.submit(unit).await?;
        }
        Ok(job_id)
    }

    /// Submit one unit for its owning job
    pub async fn submit(&self, unit: WorkUnit) -> Result<(), SchedulerError> {
        submit(&self.shared, unit).await
    }

    /// Cancel a job: no new admissions, queued units drained to
    /// cancellation results, in-flight units see a cancelled token.
    pub async fn cancel_job(&self, job_id: &str) -> Result<(), SchedulerError> {
        let cancel = {
            let jobs = self.shared.jobs.read().expect("jobs lock poisoned");
            let entry = jobs.get(job_id).ok_or_else(|| SchedulerError::UnknownJob(job_id.to_string()))?;
            entry.cancel.clone()
        };
        cancel.cancel();

        let queues: Vec<Arc<ProviderQueue>> = {
            let pools = self.shared.pools.read().expect("pools lock poisoned");
            pools.values().map(|p| p.queue.clone()).collect()
        };

        let mut drained = Vec::new();
        for queue in queues {
            drained.extend(queue.drain_job(job_id));
        }

        info!(job_id, drained = drained.len(), "Job cancelled");
        for unit in drained {
            let result = WorkResult::cancelled(&unit);
            handle_result(&self.shared, result).await;
        }
        Ok(())
    }

    /// Wait until the job's handler reports done (and is finalized)
    pub async fn wait_for_job(&self, job_id: &str) {
        let mut rx = {
            let jobs = self.shared.jobs.read().expect("jobs lock poisoned");
            match jobs.get(job_id) {
                Some(entry) => entry.done_tx.subscribe(),
                // Already finalized (or never existed)
                None => return,
            }
        };
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Per-provider progress across all jobs
    pub fn progress(&self) -> HashMap<String, ProgressCounts> {
        let progress = self.shared.progress.lock().expect("progress lock poisoned");
        let mut by_provider: HashMap<String, ProgressCounts> = HashMap::new();
        for ((_job, provider), counts) in progress.iter() {
            let entry = by_provider.entry(provider.clone()).or_default();
            entry.expected += counts.expected;
            entry.completed += counts.completed;
        }
        by_provider
    }

    /// Per-provider progress for one job
    pub fn progress_for_job(&self, job_id: &str) -> HashMap<String, ProgressCounts> {
        let progress = self.shared.progress.lock().expect("progress lock poisoned");
        progress
            .iter()
            .filter(|((job, _), _)| job == job_id)
            .map(|((_, provider), counts)| (provider.clone(), *counts))
            .collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        let pools = self.shared.pools.read().expect("pools lock poisoned");
        let jobs = self.shared.jobs.read().expect("jobs lock poisoned");
        SchedulerStats {
            queue_depths: pools.iter().map(|(name, pool)| (name.clone(), pool.queue.len())).collect(),
            active_jobs: jobs.len(),
            total_cost_usd: *self.shared.total_cost.lock().expect("cost lock poisoned"),
        }
    }

    /// Stop all pools: idle workers exit immediately, in-flight units run
    /// to completion. Idempotent.
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut pools = self.shared.pools.write().expect("pools lock poisoned");
            pools
                .values_mut()
                .flat_map(|pool| {
                    pool.queue.close();
                    pool.workers.drain(..)
                })
                .collect()
        };

        for handle in handles {
            if let Err(e) = handle.await
                && !e.is_cancelled()
            {
                warn!(error = %e, "Worker task panicked");
            }
        }
        debug!("Scheduler stopped");
    }
}

fn spawn_pool(shared: &Arc<Shared>, name: String, kind: PoolKind, workers: usize) -> Pool {
    let queue = Arc::new(ProviderQueue::new(shared.config.queue_capacity));
    let handles = (0..workers.max(1))
        .map(|_| {
            let weak = Arc::downgrade(shared);
            let shutdown = shared.shutdown.clone();
            let queue = queue.clone();
            let provider = name.clone();
            tokio::spawn(worker_loop(weak, shutdown, provider, kind, queue))
        })
        .collect();

    Pool {
        queue,
        workers: handles,
    }
}

async fn worker_loop(
    weak: Weak<Shared>,
    shutdown: CancelToken,
    provider: String,
    kind: PoolKind,
    queue: Arc<ProviderQueue>,
) {
    loop {
        let unit = tokio::select! {
            _ = shutdown.cancelled() => break,
            unit = queue.pop() => match unit {
                Some(unit) => unit,
                None => break,
            },
        };

        let Some(shared) = weak.upgrade() else { break };

        let cancel = {
            let jobs = shared.jobs.read().expect("jobs lock poisoned");
            jobs.get(&unit.job_id).map(|entry| entry.cancel.clone())
        };

        let result = match cancel {
            // Job already cancelled: drop the unit with a cancellation result
            Some(cancel) if cancel.is_cancelled() => WorkResult::cancelled(&unit),
            Some(cancel) => dispatch(&shared, &provider, kind, unit, &cancel).await,
            // Job gone (finalized or never known); result will be logged and dropped
            None => WorkResult::cancelled(&unit),
        };

        handle_result(&shared, result).await;
    }
}

async fn dispatch(shared: &Shared, provider: &str, kind: PoolKind, unit: WorkUnit, cancel: &CancelToken) -> WorkResult {
    let WorkUnit {
        id: unit_id,
        job_id,
        payload,
        tag,
        ..
    } = unit;
    let work_kind = payload.kind();
    let started = Instant::now();

    let outcome: Result<WorkOutput, ProviderError> = match (kind, payload) {
        (PoolKind::Llm, WorkPayload::Llm { request, tools }) => match shared.registry.get_llm(provider) {
            Ok(llm) => {
                if tools.is_empty() {
                    llm.chat(request, cancel).await.map(WorkOutput::Chat)
                } else {
                    llm.chat_with_tools(request, &tools, cancel).await.map(WorkOutput::Chat)
                }
            }
            Err(e) => Err(e),
        },
        (PoolKind::Ocr, WorkPayload::Ocr { image, page_num }) => match shared.registry.get_ocr(provider) {
            Ok(ocr) => ocr.process_image(&image, page_num, cancel).await.map(WorkOutput::Ocr),
            Err(e) => Err(e),
        },
        (PoolKind::Tts, WorkPayload::Tts { request }) => match shared.registry.get_tts(provider) {
            Ok(tts) => tts.generate(request, cancel).await.map(WorkOutput::Tts),
            Err(e) => Err(e),
        },
        (PoolKind::Cpu, WorkPayload::Cpu { task }) => match tokio::task::spawn_blocking(move || (task.0)()).await {
            Ok(Ok(value)) => Ok(WorkOutput::Cpu(value)),
            Ok(Err(message)) => Err(ProviderError::InvalidResponse(message)),
            Err(join_err) => Err(ProviderError::InvalidResponse(format!("cpu task panicked: {join_err}"))),
        },
        // A unit can only land here through a submit bug; surface it typed
        (pool_kind, payload) => Err(ProviderError::InvalidResponse(format!(
            "unit kind {:?} routed to {pool_kind:?} pool",
            payload.kind()
        ))),
    };

    let attempts = match &outcome {
        Ok(_) => 1,
        Err(ProviderError::RetriesExhausted { attempts, .. }) => *attempts,
        Err(_) => 1,
    };

    WorkResult {
        unit_id,
        job_id,
        provider: provider.to_string(),
        kind: work_kind,
        tag,
        attempts,
        duration: started.elapsed(),
        outcome,
    }
}

async fn submit(shared: &Arc<Shared>, unit: WorkUnit) -> Result<(), SchedulerError> {
    let cancel = {
        let jobs = shared.jobs.read().expect("jobs lock poisoned");
        let entry = jobs
            .get(&unit.job_id)
            .ok_or_else(|| SchedulerError::UnknownJob(unit.job_id.clone()))?;
        if entry.cancel.is_cancelled() {
            return Err(SchedulerError::JobCancelled(unit.job_id.clone()));
        }
        entry.cancel.clone()
    };

    let queue = {
        let pools = shared.pools.read().expect("pools lock poisoned");
        pools
            .get(&unit.provider)
            .map(|pool| pool.queue.clone())
            .ok_or_else(|| SchedulerError::UnknownProvider(unit.provider.clone()))?
    };

    bump_expected(shared, &unit.job_id, &unit.provider);

    match queue.push(unit, &cancel).await {
        Ok(()) => Ok(()),
        Err((PushError::Cancelled, unit)) => {
            // Admission raced a cancel; account the unit as cancelled
            let result = WorkResult::cancelled(&unit);
            handle_result(shared, result).await;
            Err(SchedulerError::JobCancelled(unit.job_id))
        }
        Err((PushError::Closed, unit)) => {
            unbump_expected(shared, &unit.job_id, &unit.provider);
            Err(SchedulerError::QueueClosed(unit.provider))
        }
    }
}

fn bump_expected(shared: &Shared, job_id: &str, provider: &str) {
    let mut progress = shared.progress.lock().expect("progress lock poisoned");
    progress
        .entry((job_id.to_string(), provider.to_string()))
        .or_default()
        .expected += 1;
}

fn unbump_expected(shared: &Shared, job_id: &str, provider: &str) {
    let mut progress = shared.progress.lock().expect("progress lock poisoned");
    if let Some(counts) = progress.get_mut(&(job_id.to_string(), provider.to_string())) {
        counts.expected = counts.expected.saturating_sub(1);
    }
}

async fn handle_result(shared: &Arc<Shared>, result: WorkResult) {
    shared.metrics.record(&WorkEvent {
        provider: result.provider.clone(),
        tag: result.tag.clone(),
        success: result.success(),
        attempts: result.attempts,
        cost_usd: result.cost_usd(),
        duration: result.duration,
    });

    {
        let mut progress = shared.progress.lock().expect("progress lock poisoned");
        progress
            .entry((result.job_id.clone(), result.provider.clone()))
            .or_default()
            .completed += 1;
    }
    {
        let mut cost = shared.total_cost.lock().expect("cost lock poisoned");
        *cost += result.cost_usd();
    }

    let handler = {
        let jobs = shared.jobs.read().expect("jobs lock poisoned");
        jobs.get(&result.job_id).map(|entry| entry.handler.clone())
    };

    let Some(handler) = handler else {
        // Result for a finalized or unknown job: benign race, drop it
        debug!(job_id = %result.job_id, unit_id = %result.unit_id, "Dropping result for unknown job");
        return;
    };

    let job_id = result.job_id.clone();
    let follow_ups = handler.on_complete(result).await;

    for unit in follow_ups {
        if let Err(e) = Box::pin(submit(shared, unit)).await {
            debug!(job_id = %job_id, error = %e, "Follow-up unit not admitted");
        }
    }

    if handler.done() {
        finalize_job(shared, &job_id);
    }
}

fn finalize_job(shared: &Shared, job_id: &str) {
    let mut jobs = shared.jobs.write().expect("jobs lock poisoned");
    if let Some(entry) = jobs.remove(job_id) {
        info!(job_id, "Job finished");
        let _ = entry.done_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsTag;
    use crate::metrics::collect::CollectingMetrics;
    use crate::providers::mock::{MockLlm, MockOcr};
    use crate::providers::types::{ChatRequest, ChatResult};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Job that emits a fixed set of units and records every result
    struct TestJob {
        id: String,
        initial: Mutex<Vec<WorkUnit>>,
        results: Mutex<Vec<(String, String, bool)>>,
        remaining: AtomicUsize,
        done: AtomicBool,
    }

    impl TestJob {
        fn new(id: &str, units: Vec<WorkUnit>) -> Arc<Self> {
            let remaining = units.len();
            Arc::new(Self {
                id: id.to_string(),
                initial: Mutex::new(units),
                results: Mutex::new(Vec::new()),
                remaining: AtomicUsize::new(remaining),
                done: AtomicBool::new(remaining == 0),
            })
        }

        fn results(&self) -> Vec<(String, String, bool)> {
            self.results.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobHandler for TestJob {
        fn id(&self) -> String {
            self.id.clone()
        }

        async fn start(&self) -> Vec<WorkUnit> {
            std::mem::take(&mut self.initial.lock().unwrap())
        }

        async fn on_complete(&self, result: WorkResult) -> Vec<WorkUnit> {
            self.results
                .lock()
                .unwrap()
                .push((result.unit_id.clone(), result.provider.clone(), result.success()));
            if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.done.store(true, Ordering::SeqCst);
            }
            Vec::new()
        }

        fn done(&self) -> bool {
            self.done.load(Ordering::SeqCst)
        }
    }

    fn scheduler_with_llm(replies: Vec<&str>) -> (Scheduler, Arc<ProviderRegistry>) {
        let registry = Arc::new(ProviderRegistry::new());
        registry.register_llm("mock-llm", Arc::new(MockLlm::with_text_replies("mock-llm", replies)));
        let scheduler = Scheduler::new(
            registry.clone(),
            Arc::new(CollectingMetrics::new()),
            SchedulerConfig::default(),
        );
        (scheduler, registry)
    }

    fn llm_unit(job: &str) -> WorkUnit {
        WorkUnit::llm(job, "mock-llm", ChatRequest::default(), Vec::new(), MetricsTag::default())
    }

    #[tokio::test]
    async fn test_job_runs_to_completion() {
        let (scheduler, _) = scheduler_with_llm(vec!["one", "two"]);
        let job = TestJob::new("job-1", vec![llm_unit("job-1"), llm_unit("job-1")]);

        scheduler.run_job(job.clone()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), scheduler.wait_for_job("job-1"))
            .await
            .expect("job should finish");

        let results = job.results();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, _, ok)| *ok));

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_exactly_one_result_per_unit() {
        let (scheduler, _) = scheduler_with_llm(vec!["a", "b", "c"]);
        let units = vec![llm_unit("job-1"), llm_unit("job-1"), llm_unit("job-1")];
        let expected_ids: Vec<String> = units.iter().map(|u| u.id.clone()).collect();
        let job = TestJob::new("job-1", units);

        scheduler.run_job(job.clone()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), scheduler.wait_for_job("job-1"))
            .await
            .unwrap();

        let mut seen: Vec<String> = job.results().into_iter().map(|(id, _, _)| id).collect();
        seen.sort();
        let mut expected = expected_ids.clone();
        expected.sort();
        assert_eq!(seen, expected, "each unit id delivered exactly once");

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_submit_rejections() {
        let (scheduler, _) = scheduler_with_llm(vec![]);

        // Unknown job
        let unit = WorkUnit::llm("ghost", "mock-llm", ChatRequest::default(), Vec::new(), MetricsTag::default());
        let err = scheduler.submit(unit).await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownJob(_)));

        // Known job, unknown provider pool
        let pending = Arc::new(TestJob {
            id: "pending".to_string(),
            initial: Mutex::new(Vec::new()),
            results: Mutex::new(Vec::new()),
            remaining: AtomicUsize::new(1),
            done: AtomicBool::new(false),
        });
        scheduler.run_job(pending).await.unwrap();

        let unit = WorkUnit::llm("pending", "nope", ChatRequest::default(), Vec::new(), MetricsTag::default());
        let err = scheduler.submit(unit).await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownProvider(_)));

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_cpu_units_run_on_cpu_pool() {
        let registry = Arc::new(ProviderRegistry::new());
        let scheduler = Scheduler::new(
            registry,
            Arc::new(CollectingMetrics::new()),
            SchedulerConfig::default(),
        );

        let unit = WorkUnit::cpu(
            "job-1",
            CpuTask::new(|| Ok(json!({"paragraphs": 12}))),
            MetricsTag::default(),
        );
        let job = TestJob::new("job-1", vec![unit]);

        scheduler.run_job(job.clone()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), scheduler.wait_for_job("job-1"))
            .await
            .unwrap();

        let results = job.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1, CPU_PROVIDER);
        assert!(results[0].2);

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_progress_counts() {
        let (scheduler, _) = scheduler_with_llm(vec!["x", "y"]);
        let job = TestJob::new("job-1", vec![llm_unit("job-1"), llm_unit("job-1")]);

        scheduler.run_job(job).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), scheduler.wait_for_job("job-1"))
            .await
            .unwrap();

        let progress = scheduler.progress_for_job("job-1");
        let counts = progress.get("mock-llm").unwrap();
        assert_eq!(counts.expected, 2);
        assert_eq!(counts.completed, 2);

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_follow_up_units_are_submitted() {
        /// Emits one OCR unit; on completion emits one more, then finishes
        struct ChainJob {
            done: AtomicBool,
            rounds: AtomicUsize,
        }

        #[async_trait]
        impl JobHandler for ChainJob {
            fn id(&self) -> String {
                "chain".to_string()
            }

            async fn start(&self) -> Vec<WorkUnit> {
                vec![WorkUnit::ocr("chain", "mock-ocr", vec![0u8], 1, MetricsTag::default())]
            }

            async fn on_complete(&self, result: WorkResult) -> Vec<WorkUnit> {
                assert!(result.success());
                if self.rounds.fetch_add(1, Ordering::SeqCst) == 0 {
                    vec![WorkUnit::ocr("chain", "mock-ocr", vec![0u8], 2, MetricsTag::default())]
                } else {
                    self.done.store(true, Ordering::SeqCst);
                    Vec::new()
                }
            }

            fn done(&self) -> bool {
                self.done.load(Ordering::SeqCst)
            }
        }

        let registry = Arc::new(ProviderRegistry::new());
        registry.register_ocr("mock-ocr", Arc::new(MockOcr::new("mock-ocr")));
        let scheduler = Scheduler::new(
            registry,
            Arc::new(CollectingMetrics::new()),
            SchedulerConfig::default(),
        );

        let job = Arc::new(ChainJob {
            done: AtomicBool::new(false),
            rounds: AtomicUsize::new(0),
        });
        scheduler.run_job(job.clone()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), scheduler.wait_for_job("chain"))
            .await
            .expect("chained job should finish");

        assert_eq!(job.rounds.load(Ordering::SeqCst), 2);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_job_drains_queued_units() {
        // Slow LLM with a single worker so later units stay queued
        struct SlowLlm {
            inner: MockLlm,
        }

        #[async_trait]
        impl crate::providers::Provider for SlowLlm {
            fn core(&self) -> &crate::providers::ProviderCore {
                self.inner.core()
            }

            fn max_concurrency(&self) -> usize {
                1
            }

            async fn health_check(&self) -> Result<(), ProviderError> {
                Ok(())
            }
        }

        #[async_trait]
        impl crate::providers::LlmProvider for SlowLlm {
            async fn chat(&self, request: ChatRequest, cancel: &CancelToken) -> Result<ChatResult, ProviderError> {
                tokio::time::sleep(Duration::from_millis(250)).await;
                self.inner.chat(request, cancel).await
            }

            async fn chat_with_tools(
                &self,
                request: ChatRequest,
                _tools: &[crate::providers::ToolSpec],
                cancel: &CancelToken,
            ) -> Result<ChatResult, ProviderError> {
                self.chat(request, cancel).await
            }
        }

        let registry = Arc::new(ProviderRegistry::new());
        registry.register_llm(
            "slow",
            Arc::new(SlowLlm {
                inner: MockLlm::with_text_replies("slow", vec!["r1", "r2", "r3"]),
            }),
        );
        let scheduler = Scheduler::new(
            registry,
            Arc::new(CollectingMetrics::new()),
            SchedulerConfig::default(),
        );

        let mk = |job: &str| WorkUnit::llm(job, "slow", ChatRequest::default(), Vec::new(), MetricsTag::default());
        let job = TestJob::new("job-1", vec![mk("job-1"), mk("job-1"), mk("job-1")]);

        scheduler.run_job(job.clone()).await.unwrap();
        // Let the single worker pick up the first unit
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.cancel_job("job-1").await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), scheduler.wait_for_job("job-1"))
            .await
            .expect("cancelled job should still finalize");

        let results = job.results();
        assert_eq!(results.len(), 3, "every unit gets exactly one result");
        let cancelled = results.iter().filter(|(_, _, ok)| !ok).count();
        // The in-flight unit runs to its natural conclusion; the queued two
        // are drained as cancellations
        assert_eq!(cancelled, 2);

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (scheduler, _) = scheduler_with_llm(vec![]);
        scheduler.stop().await;
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_metrics_tagged_per_unit() {
        let registry = Arc::new(ProviderRegistry::new());
        registry.register_ocr("mock-ocr", Arc::new(MockOcr::new("mock-ocr")));
        let metrics = Arc::new(CollectingMetrics::new());
        let scheduler = Scheduler::new(registry, metrics.clone(), SchedulerConfig::default());

        let tag = MetricsTag {
            job_id: "job-1".to_string(),
            book_id: "book-9".to_string(),
            stage: "build".to_string(),
            item_key: "page:4".to_string(),
            prompt_key: None,
        };
        let unit = WorkUnit::ocr("job-1", "mock-ocr", vec![0u8], 4, tag);
        let job = TestJob::new("job-1", vec![unit]);

        scheduler.run_job(job).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), scheduler.wait_for_job("job-1"))
            .await
            .unwrap();

        let events = metrics.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tag.book_id, "book-9");
        assert_eq!(events[0].tag.item_key, "page:4");
        assert_eq!(events[0].provider, "mock-ocr");

        scheduler.stop().await;
    }
}
