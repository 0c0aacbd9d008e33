//! Shared state for agent tool execution
//!
//! Holds the book data tools read, plus the single-slot viewed image. The
//! slot enforces the observation discipline: before the agent swaps in a
//! new page image it must record what it saw on the current one, otherwise
//! the visual evidence is lost when the old image leaves the context.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use serde_json::Value;

use crate::job::PageImageSource;

/// The image currently loaded into the agent's context
#[derive(Debug, Clone)]
pub struct ViewedImage {
    pub page_num: u64,
    pub observations_recorded: bool,
}

/// One recorded observation about a viewed page
#[derive(Debug, Clone)]
pub struct Observation {
    pub page_num: u64,
    pub text: String,
}

pub struct ToolContext {
    pub book_id: String,
    pub total_pages: u64,
    /// OCR text per page, for text tools
    pub pages: BTreeMap<u64, String>,
    /// (index, title) pairs for chapter listing
    pub chapters: Vec<(u64, String)>,
    pub images: Arc<dyn PageImageSource>,

    viewed: Mutex<Option<ViewedImage>>,
    observations: Mutex<Vec<Observation>>,
    result: Mutex<Option<Value>>,
}

impl ToolContext {
    pub fn new(book_id: impl Into<String>, total_pages: u64, images: Arc<dyn PageImageSource>) -> Self {
        Self {
            book_id: book_id.into(),
            total_pages,
            pages: BTreeMap::new(),
            chapters: Vec::new(),
            images,
            viewed: Mutex::new(None),
            observations: Mutex::new(Vec::new()),
            result: Mutex::new(None),
        }
    }

    pub fn with_pages(mut self, pages: BTreeMap<u64, String>) -> Self {
        self.pages = pages;
        self
    }

    pub fn with_chapters(mut self, chapters: Vec<(u64, String)>) -> Self {
        self.chapters = chapters;
        self
    }

    /// A page index is valid in [1, total_pages]
    pub fn valid_page(&self, page_num: u64) -> bool {
        page_num >= 1 && page_num <= self.total_pages
    }

    pub fn viewed(&self) -> Option<ViewedImage> {
        self.viewed.lock().expect("viewed lock poisoned").clone()
    }

    /// Swap in a new viewed image. Fails when the current image has no
    /// recorded observations yet, returning the page that needs them.
    pub fn swap_viewed(&self, page_num: u64) -> Result<(), u64> {
        let mut viewed = self.viewed.lock().expect("viewed lock poisoned");
        if let Some(current) = viewed.as_ref()
            && !current.observations_recorded
            && current.page_num != page_num
        {
            return Err(current.page_num);
        }
        *viewed = Some(ViewedImage {
            page_num,
            observations_recorded: false,
        });
        Ok(())
    }

    /// Record observations about the currently viewed page
    pub fn record_observation(&self, page_num: u64, text: impl Into<String>) {
        let mut viewed = self.viewed.lock().expect("viewed lock poisoned");
        if let Some(current) = viewed.as_mut()
            && current.page_num == page_num
        {
            current.observations_recorded = true;
        }
        drop(viewed);

        self.observations
            .lock()
            .expect("observations lock poisoned")
            .push(Observation {
                page_num,
                text: text.into(),
            });
    }

    pub fn observations(&self) -> Vec<Observation> {
        self.observations.lock().expect("observations lock poisoned").clone()
    }

    /// Store the terminal tool's payload
    pub fn set_result(&self, value: Value) {
        *self.result.lock().expect("result lock poisoned") = Some(value);
    }

    pub fn result(&self) -> Option<Value> {
        self.result.lock().expect("result lock poisoned").clone()
    }
}
