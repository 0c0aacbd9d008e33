//! Job runtime: resumable multi-phase book jobs
//!
//! A job is a phase state machine (`build → extract → classify → polish →
//! finalize`). The phase marker is persisted before a phase produces work
//! units and intermediate rows are written as they become available, so a
//! restart reloads prior state and emits only the remaining work. One mutex
//! guards `start` and `on_complete`; the scheduler may call `on_complete`
//! from any worker.
//!
//! The machinery here is domain-blind: prompts, extraction schemas, and
//! boundary rules come from a [`BookPipeline`] client (see
//! [`crate::pipeline`] for the stock one).

mod phase;
mod tracker;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use docstore::StoreError;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::metrics::MetricsTag;
use crate::providers::error::ProviderError;
use crate::providers::types::{ChatRequest, ChatResult};
use crate::scheduler::{CpuTask, JobHandler, Priority, WorkOutput, WorkResult, WorkUnit};
use crate::sink::{WriteOp, WriteSink};

pub use phase::Phase;
pub use tracker::{UnitInfo, UnitKind, UnitTracker};

/// Persisted page state the job reloads on resume
#[derive(Debug, Clone)]
pub struct PageState {
    pub doc_id: String,
    pub page_num: u64,
    pub ocr_complete: bool,
    pub text: Option<String>,
}

/// Persisted chapter state the job reloads on resume
#[derive(Debug, Clone)]
pub struct ChapterState {
    pub doc_id: String,
    pub index: u64,
    pub title: String,
    pub start_page: u64,
    pub end_page: u64,
    pub polish_complete: bool,
}

/// Read surface the job needs for resume. Writes go through the sink.
#[async_trait]
pub trait BookStore: Send + Sync {
    async fn load_phase(&self, book_id: &str) -> Result<Option<Phase>, StoreError>;
    async fn load_pages(&self, book_id: &str) -> Result<Vec<PageState>, StoreError>;
    async fn load_chapters(&self, book_id: &str) -> Result<Vec<ChapterState>, StoreError>;
}

#[async_trait]
impl BookStore for docstore::GraphQlClient {
    async fn load_phase(&self, book_id: &str) -> Result<Option<Phase>, StoreError> {
        let docs = self
            .query_collection("Book", &["phase"], Some(json!({"_docID": {"_eq": book_id}})))
            .await?;
        Ok(docs
            .first()
            .and_then(|doc| doc["phase"].as_str())
            .and_then(|s| s.parse().ok()))
    }

    async fn load_pages(&self, book_id: &str) -> Result<Vec<PageState>, StoreError> {
        let docs = self
            .query_collection(
                "Page",
                &["page_num", "ocr_complete", "text"],
                Some(json!({"book_id": {"_eq": book_id}})),
            )
            .await?;
        Ok(docs
            .iter()
            .filter_map(|doc| {
                Some(PageState {
                    doc_id: doc["_docID"].as_str()?.to_string(),
                    page_num: doc["page_num"].as_u64()?,
                    ocr_complete: doc["ocr_complete"].as_bool().unwrap_or(false),
                    text: doc["text"].as_str().map(String::from),
                })
            })
            .collect())
    }

    async fn load_chapters(&self, book_id: &str) -> Result<Vec<ChapterState>, StoreError> {
        let docs = self
            .query_collection(
                "Chapter",
                &["index", "title", "start_page", "end_page", "polish_complete"],
                Some(json!({"book_id": {"_eq": book_id}})),
            )
            .await?;
        Ok(docs
            .iter()
            .filter_map(|doc| {
                Some(ChapterState {
                    doc_id: doc["_docID"].as_str()?.to_string(),
                    index: doc["index"].as_u64()?,
                    title: doc["title"].as_str().unwrap_or_default().to_string(),
                    start_page: doc["start_page"].as_u64().unwrap_or(0),
                    end_page: doc["end_page"].as_u64().unwrap_or(0),
                    polish_complete: doc["polish_complete"].as_bool().unwrap_or(false),
                })
            })
            .collect())
    }
}

/// Source of page scan images
pub trait PageImageSource: Send + Sync {
    fn page_image(&self, page_num: u64) -> std::io::Result<Vec<u8>>;
}

/// Reads `page_0001.png`-style files from a directory
pub struct DirImageSource {
    dir: PathBuf,
}

impl DirImageSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl PageImageSource for DirImageSource {
    fn page_image(&self, page_num: u64) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.dir.join(format!("page_{page_num:04}.png")))
    }
}

/// One table-of-contents row yielded by extraction
#[derive(Debug, Clone)]
pub struct TocRow {
    pub title: String,
    pub level: u64,
    pub page_num: u64,
}

/// Chapter skeleton derived from extraction, before boundaries are known
#[derive(Debug, Clone)]
pub struct ChapterSkeleton {
    pub index: u64,
    pub title: String,
    pub start_page: u64,
}

/// Parsed extraction output: the rows to persist and the chapters to build
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub toc: Vec<TocRow>,
    pub chapters: Vec<ChapterSkeleton>,
}

/// Page range assigned to one chapter by the boundary computation
#[derive(Debug, Clone, Copy)]
pub struct ChapterBounds {
    pub index: u64,
    pub start_page: u64,
    pub end_page: u64,
}

/// Domain logic a pipeline client supplies to the job machinery: what to
/// ask the model, how to read its answers, and how chapter boundaries are
/// derived. The job owns phases, tracking, persistence, and retries;
/// extractor algorithms stay outside the core.
pub trait BookPipeline: Send + Sync {
    /// Chat request that extracts the book's structure from page text
    fn extract_request(&self, page_texts: &BTreeMap<u64, String>) -> ChatRequest;

    /// Parse the extraction reply into ToC rows and chapter skeletons
    fn parse_extraction(&self, reply: &ChatResult) -> Result<Extraction, String>;

    /// CPU computation assigning a page range to each chapter
    fn boundary_task(&self, chapters: Vec<ChapterSkeleton>, total_pages: u64) -> CpuTask;

    /// Read the boundary computation's output back
    fn parse_bounds(&self, value: &Value) -> Vec<ChapterBounds>;

    /// Chat request that cleans one chapter's text
    fn polish_request(&self, title: &str, text: &str) -> ChatRequest;
}

/// Configuration for one book job
#[derive(Debug, Clone)]
pub struct BookJobConfig {
    pub book_id: String,
    /// docID of the Book row, target of phase-marker updates
    pub book_doc_id: String,
    pub total_pages: u64,
    pub ocr_provider: String,
    pub llm_provider: String,
    /// Job-level retries per unit on transient failure
    pub max_unit_retries: u32,
}

impl BookJobConfig {
    pub fn new(book_id: impl Into<String>, book_doc_id: impl Into<String>, total_pages: u64) -> Self {
        Self {
            book_id: book_id.into(),
            book_doc_id: book_doc_id.into(),
            total_pages,
            ocr_provider: "ocr".to_string(),
            llm_provider: "llm".to_string(),
            max_unit_retries: 2,
        }
    }
}

#[derive(Debug, Clone)]
struct ChapterRow {
    doc_id: String,
    index: u64,
    title: String,
    start_page: u64,
    end_page: u64,
    polished: bool,
}

struct JobState {
    phase: Phase,
    started: bool,
    tracker: UnitTracker,
    page_doc_ids: HashMap<u64, String>,
    page_texts: BTreeMap<u64, String>,
    pages_remaining: u64,
    skipped_pages: u64,
    chapters: Vec<ChapterRow>,
    polish_remaining: u64,
    skipped_chapters: u64,
    failed: Option<String>,
}

/// A resumable book reconstruction job
pub struct BookJob {
    job_id: String,
    config: BookJobConfig,
    pipeline: Arc<dyn BookPipeline>,
    images: Arc<dyn PageImageSource>,
    sink: Arc<WriteSink>,
    store: Arc<dyn BookStore>,
    cancel: CancelToken,
    done: AtomicBool,
    state: Mutex<JobState>,
}

impl BookJob {
    pub fn new(
        config: BookJobConfig,
        pipeline: Arc<dyn BookPipeline>,
        images: Arc<dyn PageImageSource>,
        sink: Arc<WriteSink>,
        store: Arc<dyn BookStore>,
    ) -> Self {
        Self {
            job_id: Uuid::now_v7().to_string(),
            config,
            pipeline,
            images,
            sink,
            store,
            cancel: CancelToken::new(),
            done: AtomicBool::new(false),
            state: Mutex::new(JobState {
                phase: Phase::Build,
                started: false,
                tracker: UnitTracker::new(),
                page_doc_ids: HashMap::new(),
                page_texts: BTreeMap::new(),
                pages_remaining: 0,
                skipped_pages: 0,
                chapters: Vec::new(),
                polish_remaining: 0,
                skipped_chapters: 0,
                failed: None,
            }),
        }
    }

    fn tag(&self, phase: Phase, item_key: String, prompt_key: Option<&str>) -> MetricsTag {
        MetricsTag {
            job_id: self.job_id.clone(),
            book_id: self.config.book_id.clone(),
            stage: phase.as_str().to_string(),
            item_key,
            prompt_key: prompt_key.map(String::from),
        }
    }

    /// Persist the phase marker before the phase produces any units
    async fn write_phase_marker(&self, phase: Phase) {
        let op = WriteOp::update(
            "Book",
            self.config.book_doc_id.clone(),
            json!({ "phase": phase.as_str() }),
        );
        match self.sink.send_sync(op, &self.cancel).await {
            Ok(result) if result.is_ok() => debug!(book = %self.config.book_id, phase = %phase, "Phase marker written"),
            Ok(result) => warn!(book = %self.config.book_id, error = ?result.error, "Phase marker write failed"),
            Err(e) => warn!(book = %self.config.book_id, error = %e, "Phase marker write failed"),
        }
    }

    fn ocr_unit(&self, state: &mut JobState, page_num: u64, retry_count: u32) -> Option<WorkUnit> {
        let image = match self.images.page_image(page_num) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(page_num, error = %e, "Page image unavailable, skipping");
                state.skipped_pages += 1;
                return None;
            }
        };

        let unit = WorkUnit::ocr(
            self.job_id.clone(),
            self.config.ocr_provider.clone(),
            image,
            page_num,
            self.tag(Phase::Build, format!("page:{page_num}"), None),
        );
        state.tracker.register(
            unit.id.clone(),
            UnitInfo {
                kind: UnitKind::OcrPage,
                phase: Phase::Build,
                subject_id: page_num,
                retry_count,
            },
        );
        Some(unit)
    }

    fn extract_unit(&self, state: &mut JobState, retry_count: u32) -> WorkUnit {
        let request = self.pipeline.extract_request(&state.page_texts);
        let prompt_key = request.prompt_key.clone();

        let unit = WorkUnit::llm(
            self.job_id.clone(),
            self.config.llm_provider.clone(),
            request,
            Vec::new(),
            self.tag(Phase::Extract, "structure".to_string(), prompt_key.as_deref()),
        )
        .with_priority(Priority::Expedite);
        state.tracker.register(
            unit.id.clone(),
            UnitInfo {
                kind: UnitKind::ExtractToc,
                phase: Phase::Extract,
                subject_id: 0,
                retry_count,
            },
        );
        unit
    }

    fn classify_unit(&self, state: &mut JobState) -> WorkUnit {
        let skeletons: Vec<ChapterSkeleton> = state
            .chapters
            .iter()
            .map(|ch| ChapterSkeleton {
                index: ch.index,
                title: ch.title.clone(),
                start_page: ch.start_page,
            })
            .collect();
        let task = self.pipeline.boundary_task(skeletons, self.config.total_pages);

        let unit = WorkUnit::cpu(
            self.job_id.clone(),
            task,
            self.tag(Phase::Classify, "boundaries".to_string(), None),
        );
        state.tracker.register(
            unit.id.clone(),
            UnitInfo {
                kind: UnitKind::ClassifyChapters,
                phase: Phase::Classify,
                subject_id: 0,
                retry_count: 0,
            },
        );
        unit
    }

    fn polish_unit(&self, state: &mut JobState, chapter_index: u64, retry_count: u32) -> WorkUnit {
        let chapter = state
            .chapters
            .iter()
            .find(|ch| ch.index == chapter_index)
            .expect("polish unit for unknown chapter");

        let text: String = state
            .page_texts
            .range(chapter.start_page..=chapter.end_page.max(chapter.start_page))
            .map(|(_, t)| t.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let request = self.pipeline.polish_request(&chapter.title, &text);
        let prompt_key = request.prompt_key.clone();

        let unit = WorkUnit::llm(
            self.job_id.clone(),
            self.config.llm_provider.clone(),
            request,
            Vec::new(),
            self.tag(
                Phase::Polish,
                format!("chapter:{chapter_index}"),
                prompt_key.as_deref(),
            ),
        );
        state.tracker.register(
            unit.id.clone(),
            UnitInfo {
                kind: UnitKind::PolishChapter,
                phase: Phase::Polish,
                subject_id: chapter_index,
                retry_count,
            },
        );
        unit
    }

    /// Record an LLM call audit row (fire-and-forget)
    async fn record_llm_call(&self, prompt_key: &str, chat: &ChatResult) {
        let call = docstore::LlmCall {
            doc_id: None,
            book_id: self.config.book_id.clone(),
            provider: self.config.llm_provider.clone(),
            model: String::new(),
            prompt_key: prompt_key.to_string(),
            input_tokens: chat.input_tokens,
            output_tokens: chat.output_tokens,
            cost_usd: chat.cost_usd,
            duration_ms: chat.duration.as_millis() as u64,
            request_id: chat.request_id.clone(),
        };
        if let Ok(op) = WriteOp::create_for(&call) {
            self.sink.send(op).await;
        }
    }

    async fn enter_extract(&self, state: &mut JobState) -> Vec<WorkUnit> {
        state.phase = Phase::Extract;
        self.write_phase_marker(Phase::Extract).await;
        vec![self.extract_unit(state, 0)]
    }

    async fn enter_classify(&self, state: &mut JobState) -> Vec<WorkUnit> {
        state.phase = Phase::Classify;
        self.write_phase_marker(Phase::Classify).await;
        vec![self.classify_unit(state)]
    }

    async fn enter_polish(&self, state: &mut JobState) -> Vec<WorkUnit> {
        state.phase = Phase::Polish;
        self.write_phase_marker(Phase::Polish).await;

        let pending: Vec<u64> = state
            .chapters
            .iter()
            .filter(|ch| !ch.polished)
            .map(|ch| ch.index)
            .collect();
        state.polish_remaining = pending.len() as u64;

        if pending.is_empty() {
            self.finalize(state).await;
            return Vec::new();
        }
        pending
            .into_iter()
            .map(|index| self.polish_unit(state, index, 0))
            .collect()
    }

    /// Terminal phase: atomic completion marker, then done
    async fn finalize(&self, state: &mut JobState) {
        state.phase = Phase::Finalize;
        self.write_phase_marker(Phase::Finalize).await;

        let op = WriteOp::update(
            "Book",
            self.config.book_doc_id.clone(),
            json!({ "complete": true }),
        );
        match self.sink.send_sync(op, &self.cancel).await {
            Ok(result) if result.is_ok() => {
                info!(book = %self.config.book_id, skipped_pages = state.skipped_pages,
                      skipped_chapters = state.skipped_chapters, "Book complete");
            }
            Ok(result) => warn!(book = %self.config.book_id, error = ?result.error, "Completion marker failed"),
            Err(e) => warn!(book = %self.config.book_id, error = %e, "Completion marker failed"),
        }
        self.done.store(true, Ordering::SeqCst);
    }

    fn fail(&self, state: &mut JobState, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(book = %self.config.book_id, reason = %reason, "Job failed");
        state.failed = Some(reason);
        self.done.store(true, Ordering::SeqCst);
    }

    async fn handle_ocr(&self, state: &mut JobState, info: UnitInfo, result: WorkResult) -> Vec<WorkUnit> {
        let page_num = info.subject_id;
        let mut units = Vec::new();

        match result.outcome {
            Ok(WorkOutput::Ocr(ocr)) => {
                if let Some(doc_id) = state.page_doc_ids.get(&page_num).cloned() {
                    let op = WriteOp::update(
                        "Page",
                        doc_id,
                        json!({ "text": ocr.markdown, "ocr_complete": true }),
                    );
                    self.sink.send(op).await;
                }
                state.page_texts.insert(page_num, ocr.markdown);
                state.pages_remaining = state.pages_remaining.saturating_sub(1);
            }
            Ok(_) => {
                self.fail(state, format!("page {page_num}: OCR unit produced a non-OCR payload"));
                return units;
            }
            Err(ProviderError::Cancelled) => {
                self.on_cancelled(state);
                return units;
            }
            Err(e) if e.is_retryable() && info.retry_count < self.config.max_unit_retries => {
                debug!(page_num, retry = info.retry_count + 1, error = %e, "Retrying page OCR");
                if let Some(unit) = self.ocr_unit(state, page_num, info.retry_count + 1) {
                    units.push(unit);
                } else {
                    state.pages_remaining = state.pages_remaining.saturating_sub(1);
                }
                return units;
            }
            Err(e) => {
                // Permanent: skip the page, the pipeline continues
                warn!(page_num, error = %e, "Page OCR failed permanently, skipping");
                state.skipped_pages += 1;
                state.pages_remaining = state.pages_remaining.saturating_sub(1);
            }
        }

        if state.pages_remaining == 0 && state.tracker.in_phase(Phase::Build) == 0 {
            units.extend(self.enter_extract(state).await);
        }
        units
    }

    async fn handle_extract(&self, state: &mut JobState, info: UnitInfo, result: WorkResult) -> Vec<WorkUnit> {
        let chat = match result.outcome {
            Ok(WorkOutput::Chat(chat)) => chat,
            Ok(_) => {
                self.fail(state, "extract unit produced a non-chat payload");
                return Vec::new();
            }
            Err(ProviderError::Cancelled) => {
                self.on_cancelled(state);
                return Vec::new();
            }
            Err(e) if e.is_retryable() && info.retry_count < self.config.max_unit_retries => {
                debug!(retry = info.retry_count + 1, error = %e, "Retrying structure extraction");
                return vec![self.extract_unit(state, info.retry_count + 1)];
            }
            Err(e) => {
                self.fail(state, format!("structure extraction failed: {e}"));
                return Vec::new();
            }
        };

        self.record_llm_call("extract", &chat).await;

        let extraction = match self.pipeline.parse_extraction(&chat) {
            Ok(extraction) if !extraction.chapters.is_empty() => extraction,
            Ok(_) => {
                self.fail(state, "extraction yielded no chapters");
                return Vec::new();
            }
            Err(e) => {
                self.fail(state, format!("extraction reply unusable: {e}"));
                return Vec::new();
            }
        };

        // Persist ToC rows as they exist now; chapter skeletons next
        for row in &extraction.toc {
            let toc = docstore::TocEntry {
                doc_id: None,
                book_id: self.config.book_id.clone(),
                title: row.title.clone(),
                level: row.level,
                page_num: row.page_num,
            };
            if let Ok(op) = WriteOp::create_for(&toc) {
                self.sink.send(op).await;
            }
        }

        let chapter_ops: Vec<WriteOp> = extraction
            .chapters
            .iter()
            .filter_map(|skeleton| {
                let chapter = docstore::Chapter {
                    doc_id: None,
                    book_id: self.config.book_id.clone(),
                    index: skeleton.index,
                    title: skeleton.title.clone(),
                    start_page: Some(skeleton.start_page),
                    end_page: None,
                    polish_complete: Some(false),
                };
                WriteOp::create_for(&chapter).ok()
            })
            .collect();

        match self.sink.send_many_sync(chapter_ops, &self.cancel).await {
            Ok(results) => {
                state.chapters = results
                    .iter()
                    .zip(extraction.chapters.iter())
                    .filter_map(|(r, skeleton)| {
                        Some(ChapterRow {
                            doc_id: r.doc_id.clone()?,
                            index: skeleton.index,
                            title: skeleton.title.clone(),
                            start_page: skeleton.start_page,
                            end_page: 0,
                            polished: false,
                        })
                    })
                    .collect();
            }
            Err(e) => {
                self.fail(state, format!("persisting chapter skeletons failed: {e}"));
                return Vec::new();
            }
        }

        info!(book = %self.config.book_id, chapters = state.chapters.len(), "Structure extracted");
        self.enter_classify(state).await
    }

    async fn handle_classify(&self, state: &mut JobState, _info: UnitInfo, result: WorkResult) -> Vec<WorkUnit> {
        let bounds = match result.outcome {
            Ok(WorkOutput::Cpu(value)) => self.pipeline.parse_bounds(&value),
            Ok(_) => {
                self.fail(state, "classify unit produced a non-CPU payload");
                return Vec::new();
            }
            Err(ProviderError::Cancelled) => {
                self.on_cancelled(state);
                return Vec::new();
            }
            Err(e) => {
                self.fail(state, format!("chapter boundary computation failed: {e}"));
                return Vec::new();
            }
        };

        for range in &bounds {
            if let Some(chapter) = state.chapters.iter_mut().find(|ch| ch.index == range.index) {
                chapter.start_page = range.start_page;
                chapter.end_page = range.end_page;
                let op = WriteOp::update(
                    "Chapter",
                    chapter.doc_id.clone(),
                    json!({ "start_page": range.start_page, "end_page": range.end_page }),
                );
                self.sink.send(op).await;
            }
        }

        self.enter_polish(state).await
    }

    async fn handle_polish(&self, state: &mut JobState, info: UnitInfo, result: WorkResult) -> Vec<WorkUnit> {
        let chapter_index = info.subject_id;

        match result.outcome {
            Ok(WorkOutput::Chat(chat)) => {
                self.record_llm_call("polish", &chat).await;

                if let Some(chapter) = state.chapters.iter_mut().find(|ch| ch.index == chapter_index) {
                    chapter.polished = true;
                    let op = WriteOp::update(
                        "Chapter",
                        chapter.doc_id.clone(),
                        json!({ "polish_complete": true }),
                    );
                    self.sink.send(op).await;
                }
                state.polish_remaining = state.polish_remaining.saturating_sub(1);
            }
            Ok(_) => {
                self.fail(state, format!("chapter {chapter_index}: polish unit produced a non-chat payload"));
                return Vec::new();
            }
            Err(ProviderError::Cancelled) => {
                self.on_cancelled(state);
                return Vec::new();
            }
            Err(e) if e.is_retryable() && info.retry_count < self.config.max_unit_retries => {
                debug!(chapter_index, retry = info.retry_count + 1, error = %e, "Retrying chapter polish");
                return vec![self.polish_unit(state, chapter_index, info.retry_count + 1)];
            }
            Err(e) => {
                warn!(chapter_index, error = %e, "Chapter polish failed permanently, skipping");
                state.skipped_chapters += 1;
                state.polish_remaining = state.polish_remaining.saturating_sub(1);
            }
        }

        if state.polish_remaining == 0 && state.tracker.in_phase(Phase::Polish) == 0 {
            self.finalize(state).await;
        }
        Vec::new()
    }

    /// A unit came back cancelled: stop emitting, finish once in-flight
    /// units have drained
    fn on_cancelled(&self, state: &mut JobState) {
        if state.failed.is_none() {
            state.failed = Some("cancelled".to_string());
        }
        if state.tracker.is_empty() {
            self.done.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl JobHandler for BookJob {
    fn id(&self) -> String {
        self.job_id.clone()
    }

    async fn start(&self) -> Vec<WorkUnit> {
        let mut state = self.state.lock().await;
        if state.started {
            return Vec::new();
        }
        state.started = true;

        let persisted = match self.store.load_phase(&self.config.book_id).await {
            Ok(phase) => phase,
            Err(e) => {
                warn!(error = %e, "Loading persisted phase failed, starting fresh");
                None
            }
        };
        let phase = persisted.unwrap_or(Phase::Build);
        state.phase = phase;
        info!(book = %self.config.book_id, phase = %phase, resumed = persisted.is_some(), "Job starting");

        // Reload prior rows (resume) or find nothing (fresh run)
        let pages = self
            .store
            .load_pages(&self.config.book_id)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Loading pages failed, treating as fresh");
                Vec::new()
            });
        for page in &pages {
            state.page_doc_ids.insert(page.page_num, page.doc_id.clone());
            if let Some(text) = &page.text {
                state.page_texts.insert(page.page_num, text.clone());
            }
        }

        match phase {
            Phase::Build => {
                self.write_phase_marker(Phase::Build).await;

                let existing_complete: Vec<u64> = pages
                    .iter()
                    .filter(|p| p.ocr_complete)
                    .map(|p| p.page_num)
                    .collect();

                if pages.is_empty() {
                    // Fresh run: create page rows in one batched write
                    let ops: Result<Vec<WriteOp>, _> = (1..=self.config.total_pages)
                        .map(|page_num| {
                            WriteOp::create_for(&docstore::Page {
                                doc_id: None,
                                book_id: self.config.book_id.clone(),
                                page_num,
                                text: None,
                                ocr_complete: Some(false),
                            })
                        })
                        .collect();

                    match ops {
                        Ok(ops) => match self.sink.send_many_sync(ops, &self.cancel).await {
                            Ok(results) => {
                                for (i, result) in results.iter().enumerate() {
                                    if let Some(doc_id) = &result.doc_id {
                                        state.page_doc_ids.insert(i as u64 + 1, doc_id.clone());
                                    }
                                }
                            }
                            Err(e) => {
                                self.fail(&mut state, format!("creating page rows failed: {e}"));
                                return Vec::new();
                            }
                        },
                        Err(e) => {
                            self.fail(&mut state, format!("serializing page rows failed: {e}"));
                            return Vec::new();
                        }
                    }
                }

                let to_ocr: Vec<u64> = (1..=self.config.total_pages)
                    .filter(|n| !existing_complete.contains(n))
                    .collect();
                state.pages_remaining = to_ocr.len() as u64;

                if to_ocr.is_empty() {
                    return self.enter_extract(&mut state).await;
                }

                let mut units = Vec::new();
                for page_num in to_ocr {
                    match self.ocr_unit(&mut state, page_num, 0) {
                        Some(unit) => units.push(unit),
                        None => state.pages_remaining = state.pages_remaining.saturating_sub(1),
                    }
                }
                if units.is_empty() {
                    return self.enter_extract(&mut state).await;
                }
                units
            }
            Phase::Extract => {
                self.write_phase_marker(Phase::Extract).await;
                vec![self.extract_unit(&mut state, 0)]
            }
            Phase::Classify | Phase::Polish => {
                match self.store.load_chapters(&self.config.book_id).await {
                    Ok(chapters) => {
                        state.chapters = chapters
                            .into_iter()
                            .map(|ch| ChapterRow {
                                doc_id: ch.doc_id,
                                index: ch.index,
                                title: ch.title,
                                start_page: ch.start_page,
                                end_page: ch.end_page,
                                polished: ch.polish_complete,
                            })
                            .collect();
                        state.chapters.sort_by_key(|ch| ch.index);
                    }
                    Err(e) => {
                        self.fail(&mut state, format!("loading chapters failed: {e}"));
                        return Vec::new();
                    }
                }

                if phase == Phase::Classify {
                    self.enter_classify(&mut state).await
                } else {
                    self.enter_polish(&mut state).await
                }
            }
            Phase::Finalize => {
                self.finalize(&mut state).await;
                Vec::new()
            }
        }
    }

    async fn on_complete(&self, result: WorkResult) -> Vec<WorkUnit> {
        let mut state = self.state.lock().await;

        let Some(info) = state.tracker.take(&result.unit_id) else {
            // Prior run or superseded phase: benign, drop it
            debug!(unit_id = %result.unit_id, "Result for untracked unit, ignoring");
            return Vec::new();
        };

        if self.done.load(Ordering::SeqCst) || state.failed.is_some() {
            self.on_cancelled(&mut state);
            return Vec::new();
        }

        match info.kind {
            UnitKind::OcrPage => self.handle_ocr(&mut state, info, result).await,
            UnitKind::ExtractToc => self.handle_extract(&mut state, info, result).await,
            UnitKind::ClassifyChapters => self.handle_classify(&mut state, info, result).await,
            UnitKind::PolishChapter => self.handle_polish(&mut state, info, result).await,
        }
    }

    fn done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn status(&self) -> Value {
        match self.state.try_lock() {
            Ok(state) => json!({
                "job_id": self.job_id,
                "book_id": self.config.book_id,
                "phase": state.phase.as_str(),
                "in_flight": state.tracker.len(),
                "pages_remaining": state.pages_remaining,
                "polish_remaining": state.polish_remaining,
                "skipped_pages": state.skipped_pages,
                "skipped_chapters": state.skipped_chapters,
                "failed": state.failed.clone(),
            }),
            Err(_) => json!({ "job_id": self.job_id, "busy": true }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::collect::CollectingMetrics;
    use crate::pipeline::TocPipeline;
    use crate::providers::mock::{MockLlm, MockOcr};
    use crate::providers::registry::ProviderRegistry;
    use crate::scheduler::{Scheduler, SchedulerConfig, WorkKind};
    use crate::sink::SinkConfig;
    use crate::sink::memstore::MemStore;
    use std::time::Duration;

    /// Scripted BookStore for resume tests
    #[derive(Default)]
    struct FakeBookStore {
        phase: Option<Phase>,
        pages: Vec<PageState>,
        chapters: Vec<ChapterState>,
    }

    #[async_trait]
    impl BookStore for FakeBookStore {
        async fn load_phase(&self, _book_id: &str) -> Result<Option<Phase>, StoreError> {
            Ok(self.phase)
        }

        async fn load_pages(&self, _book_id: &str) -> Result<Vec<PageState>, StoreError> {
            Ok(self.pages.clone())
        }

        async fn load_chapters(&self, _book_id: &str) -> Result<Vec<ChapterState>, StoreError> {
            Ok(self.chapters.clone())
        }
    }

    struct StaticImages;

    impl PageImageSource for StaticImages {
        fn page_image(&self, page_num: u64) -> std::io::Result<Vec<u8>> {
            Ok(format!("image-{page_num}").into_bytes())
        }
    }

    fn chapter_state(index: u64, polished: bool) -> ChapterState {
        ChapterState {
            doc_id: format!("ch-{index}"),
            index,
            title: format!("Chapter {index}"),
            start_page: index * 10 + 1,
            end_page: index * 10 + 10,
            polish_complete: polished,
        }
    }

    fn job_with(
        store: FakeBookStore,
        sink: Arc<WriteSink>,
        total_pages: u64,
    ) -> BookJob {
        let mut config = BookJobConfig::new("book-1", "book-doc-1", total_pages);
        config.ocr_provider = "mock-ocr".to_string();
        config.llm_provider = "mock-llm".to_string();
        BookJob::new(
            config,
            Arc::new(TocPipeline),
            Arc::new(StaticImages),
            sink,
            Arc::new(store),
        )
    }

    fn test_sink(store: Arc<MemStore>) -> Arc<WriteSink> {
        Arc::new(WriteSink::start(
            store,
            SinkConfig {
                batch_size: 10,
                flush_interval_ms: 10,
                queue_size: 100,
                concurrency: 2,
            },
        ))
    }

    #[tokio::test]
    async fn test_resume_polish_emits_only_unpolished_chapters() {
        let store = FakeBookStore {
            phase: Some(Phase::Polish),
            pages: Vec::new(),
            chapters: vec![
                chapter_state(0, true),
                chapter_state(1, false),
                chapter_state(2, true),
                chapter_state(3, false),
                chapter_state(4, false),
            ],
        };
        let mem = Arc::new(MemStore::new());
        let sink = test_sink(mem);
        let job = job_with(store, sink.clone(), 50);

        let units = job.start().await;

        // 2 of 5 chapters already polished: exactly 3 units
        assert_eq!(units.len(), 3);
        assert!(units.iter().all(|u| u.kind() == WorkKind::Llm));
        let keys: Vec<&str> = units.iter().map(|u| u.tag.item_key.as_str()).collect();
        assert!(keys.contains(&"chapter:1"));
        assert!(keys.contains(&"chapter:3"));
        assert!(keys.contains(&"chapter:4"));

        sink.stop().await;
    }

    #[tokio::test]
    async fn test_resume_build_skips_ocr_complete_pages() {
        let pages = vec![
            PageState {
                doc_id: "p1".to_string(),
                page_num: 1,
                ocr_complete: true,
                text: Some("# Page 1".to_string()),
            },
            PageState {
                doc_id: "p2".to_string(),
                page_num: 2,
                ocr_complete: false,
                text: None,
            },
            PageState {
                doc_id: "p3".to_string(),
                page_num: 3,
                ocr_complete: false,
                text: None,
            },
        ];
        let store = FakeBookStore {
            phase: Some(Phase::Build),
            pages,
            chapters: Vec::new(),
        };
        let mem = Arc::new(MemStore::new());
        let sink = test_sink(mem);
        let job = job_with(store, sink.clone(), 3);

        let units = job.start().await;

        assert_eq!(units.len(), 2);
        let keys: Vec<&str> = units.iter().map(|u| u.tag.item_key.as_str()).collect();
        assert!(keys.contains(&"page:2"));
        assert!(keys.contains(&"page:3"));

        sink.stop().await;
    }

    #[tokio::test]
    async fn test_untracked_result_is_ignored() {
        let mem = Arc::new(MemStore::new());
        let sink = test_sink(mem);
        let job = job_with(FakeBookStore::default(), sink.clone(), 1);
        let _ = job.start().await;

        let ghost = WorkResult {
            unit_id: "not-ours".to_string(),
            job_id: job.id(),
            provider: "mock-ocr".to_string(),
            kind: WorkKind::Ocr,
            tag: MetricsTag::default(),
            attempts: 1,
            duration: Duration::ZERO,
            outcome: Err(ProviderError::Cancelled),
        };

        let follow_ups = job.on_complete(ghost).await;
        assert!(follow_ups.is_empty());
        assert!(!job.done());

        sink.stop().await;
    }

    #[tokio::test]
    async fn test_transient_ocr_failure_retried_with_bumped_count() {
        let mem = Arc::new(MemStore::new());
        let sink = test_sink(mem);
        let job = job_with(FakeBookStore::default(), sink.clone(), 1);
        let units = job.start().await;
        assert_eq!(units.len(), 1);

        let failed = WorkResult {
            unit_id: units[0].id.clone(),
            job_id: job.id(),
            provider: "mock-ocr".to_string(),
            kind: WorkKind::Ocr,
            tag: units[0].tag.clone(),
            attempts: 3,
            duration: Duration::ZERO,
            outcome: Err(ProviderError::Api {
                status: 503,
                message: "unavailable".to_string(),
            }),
        };

        let retries = job.on_complete(failed).await;
        assert_eq!(retries.len(), 1, "transient failure re-emits the unit");
        assert_eq!(retries[0].tag.item_key, "page:1");

        // The retry carries a bumped count; after max retries the page is skipped
        let state = job.state.lock().await;
        let info = state.tracker.get(&retries[0].id);
        assert_eq!(info.unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn test_full_pipeline_with_scheduler() {
        let registry = Arc::new(ProviderRegistry::new());
        registry.register_ocr("mock-ocr", Arc::new(MockOcr::new("mock-ocr")));
        registry.register_llm(
            "mock-llm",
            Arc::new(MockLlm::with_text_replies(
                "mock-llm",
                vec![
                    // Extraction reply
                    r#"{"entries": [
                        {"title": "One", "level": 1, "page_num": 1},
                        {"title": "Two", "level": 1, "page_num": 2}
                    ]}"#,
                    // Polish replies
                    "Cleaned chapter one.",
                    "Cleaned chapter two.",
                ],
            )),
        );

        let scheduler = Scheduler::new(
            registry,
            Arc::new(CollectingMetrics::new()),
            SchedulerConfig::default(),
        );

        let mem = Arc::new(MemStore::new());
        let sink = test_sink(mem.clone());
        let job = Arc::new(job_with(FakeBookStore::default(), sink.clone(), 3));
        let job_id = job.id();

        scheduler.run_job(job.clone()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), scheduler.wait_for_job(&job_id))
            .await
            .expect("pipeline should finish");

        assert!(job.done());
        let status = job.status();
        assert_eq!(status["phase"], "finalize");
        assert!(status["failed"].is_null());

        // Page rows batched once, chapter skeletons persisted, completion
        // marker written
        let creates = mem.creates.lock().unwrap();
        let page_batch = creates.iter().find(|(c, _)| c == "Page").unwrap();
        assert_eq!(page_batch.1.len(), 3);
        assert!(creates.iter().any(|(c, _)| c == "Chapter"));
        drop(creates);

        let updates = mem.updates.lock().unwrap();
        let book_updates: Vec<&Value> = updates
            .iter()
            .filter(|(c, id, _)| c == "Book" && id == "book-doc-1")
            .map(|(_, _, v)| v)
            .collect();
        assert!(book_updates.iter().any(|v| v["phase"] == "extract"));
        assert!(book_updates.iter().any(|v| v["phase"] == "finalize"));
        assert!(book_updates.iter().any(|v| v["complete"] == true));
        drop(updates);

        scheduler.stop().await;
        sink.stop().await;
    }

    #[tokio::test]
    async fn test_polish_exhausted_retries_skips_chapter_and_finalizes() {
        let store = FakeBookStore {
            phase: Some(Phase::Polish),
            pages: Vec::new(),
            chapters: vec![chapter_state(0, false)],
        };
        let mem = Arc::new(MemStore::new());
        let sink = test_sink(mem);
        let mut config = BookJobConfig::new("book-1", "book-doc-1", 10);
        config.max_unit_retries = 0;
        config.llm_provider = "mock-llm".to_string();
        let job = BookJob::new(
            config,
            Arc::new(TocPipeline),
            Arc::new(StaticImages),
            sink.clone(),
            Arc::new(store),
        );

        let units = job.start().await;
        assert_eq!(units.len(), 1);

        let failed = WorkResult {
            unit_id: units[0].id.clone(),
            job_id: job.id(),
            provider: "mock-llm".to_string(),
            kind: WorkKind::Llm,
            tag: units[0].tag.clone(),
            attempts: 1,
            duration: Duration::ZERO,
            outcome: Err(ProviderError::Api {
                status: 503,
                message: "down".to_string(),
            }),
        };

        let follow_ups = job.on_complete(failed).await;
        assert!(follow_ups.is_empty());
        assert!(job.done(), "single skipped chapter still finalizes the job");
        assert_eq!(job.status()["skipped_chapters"], 1);

        sink.stop().await;
    }

}
