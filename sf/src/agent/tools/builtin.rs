//! Built-in agent tools

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};

use crate::providers::types::ImageData;

use super::context::ToolContext;
use super::{Tool, ToolOutcome};

const SEARCH_RESULT_LIMIT: usize = 10;
const SNIPPET_CONTEXT_CHARS: usize = 80;

/// The standard book-agent tool set
pub fn standard_tools() -> Vec<Box<dyn Tool>> {
    vec![
        Box::new(LoadPageImageTool),
        Box::new(RecordObservationsTool),
        Box::new(ReadPageTextTool),
        Box::new(SearchBookTextTool),
        Box::new(ListChaptersTool),
        Box::new(TerminalWriteTool::write_result()),
        Box::new(TerminalWriteTool::write_toc_result()),
        Box::new(TerminalWriteTool::write_fix()),
    ]
}

fn page_num_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "page_num": { "type": "integer", "minimum": 1 }
        },
        "required": ["page_num"]
    })
}

fn out_of_range(ctx: &ToolContext, page_num: u64) -> ToolOutcome {
    ToolOutcome::error(format!(
        "page {page_num} is out of range; this book has pages 1..={}",
        ctx.total_pages
    ))
}

/// Load a page scan into the single viewed-image slot
pub struct LoadPageImageTool;

#[async_trait]
impl Tool for LoadPageImageTool {
    fn name(&self) -> &'static str {
        "load_page_image"
    }

    fn description(&self) -> &'static str {
        "Load the scan image of a page for visual inspection. Only one image is kept; record observations about the current image before loading another."
    }

    fn parameters(&self) -> Value {
        page_num_schema()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let page_num = args["page_num"].as_u64().unwrap_or(0);
        if !ctx.valid_page(page_num) {
            return out_of_range(ctx, page_num);
        }

        if let Err(current) = ctx.swap_viewed(page_num) {
            return ToolOutcome::error(format!(
                "page {current} is still loaded and has no recorded observations; \
                 call record_observations for page {current} before loading page {page_num}"
            ));
        }

        let bytes = match ctx.images.page_image(page_num) {
            Ok(bytes) => bytes,
            Err(e) => return ToolOutcome::error(format!("page {page_num} image unavailable: {e}")),
        };

        ToolOutcome::success(json!({ "loaded_page": page_num })).with_image(ImageData {
            media_type: "image/png".to_string(),
            base64: BASE64.encode(&bytes),
        })
    }
}

/// Record textual observations about the currently viewed page
pub struct RecordObservationsTool;

#[async_trait]
impl Tool for RecordObservationsTool {
    fn name(&self) -> &'static str {
        "record_observations"
    }

    fn description(&self) -> &'static str {
        "Record what you observed on a viewed page image. Required before swapping to another page."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "page_num": { "type": "integer", "minimum": 1 },
                "observations": { "type": "string", "minLength": 1 }
            },
            "required": ["page_num", "observations"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let page_num = args["page_num"].as_u64().unwrap_or(0);
        if !ctx.valid_page(page_num) {
            return out_of_range(ctx, page_num);
        }

        let observations = args["observations"].as_str().unwrap_or_default();
        ctx.record_observation(page_num, observations);
        ToolOutcome::success(json!({ "recorded": true, "page_num": page_num }))
    }
}

/// Read the OCR text of a page
pub struct ReadPageTextTool;

#[async_trait]
impl Tool for ReadPageTextTool {
    fn name(&self) -> &'static str {
        "read_page_text"
    }

    fn description(&self) -> &'static str {
        "Read the OCR text of a page."
    }

    fn parameters(&self) -> Value {
        page_num_schema()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let page_num = args["page_num"].as_u64().unwrap_or(0);
        if !ctx.valid_page(page_num) {
            return out_of_range(ctx, page_num);
        }

        match ctx.pages.get(&page_num) {
            Some(text) => ToolOutcome::success(json!({ "page_num": page_num, "text": text })),
            None => ToolOutcome::error(format!("page {page_num} has no OCR text yet")),
        }
    }
}

/// Case-insensitive substring search across page texts
pub struct SearchBookTextTool;

#[async_trait]
impl Tool for SearchBookTextTool {
    fn name(&self) -> &'static str {
        "search_book_text"
    }

    fn description(&self) -> &'static str {
        "Search the book's OCR text for a phrase; returns matching pages with snippets."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "minLength": 1 }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let query = args["query"].as_str().unwrap_or_default().to_lowercase();
        let mut matches = Vec::new();

        for (page_num, text) in &ctx.pages {
            let lowered = text.to_lowercase();
            if let Some(pos) = lowered.find(&query) {
                let start = pos.saturating_sub(SNIPPET_CONTEXT_CHARS);
                let end = (pos + query.len() + SNIPPET_CONTEXT_CHARS).min(text.len());
                // Snap to char boundaries for the slice
                let start = (0..=start).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
                let end = (end..=text.len()).find(|i| text.is_char_boundary(*i)).unwrap_or(text.len());
                matches.push(json!({ "page_num": page_num, "snippet": &text[start..end] }));
                if matches.len() >= SEARCH_RESULT_LIMIT {
                    break;
                }
            }
        }

        ToolOutcome::success(json!({ "matches": matches }))
    }
}

/// List the chapters known so far
pub struct ListChaptersTool;

#[async_trait]
impl Tool for ListChaptersTool {
    fn name(&self) -> &'static str {
        "list_chapters"
    }

    fn description(&self) -> &'static str {
        "List the chapters recorded for this book."
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, ctx: &ToolContext) -> ToolOutcome {
        let chapters: Vec<Value> = ctx
            .chapters
            .iter()
            .map(|(index, title)| json!({ "index": index, "title": title }))
            .collect();
        ToolOutcome::success(json!({ "chapters": chapters }))
    }
}

/// Terminal tool family: `write_result`, `write_toc_result`, `write_fix`.
/// Invoking one with a parsable payload ends the agent loop.
pub struct TerminalWriteTool {
    name: &'static str,
    description: &'static str,
    parameters: Value,
}

impl TerminalWriteTool {
    pub fn write_result() -> Self {
        Self {
            name: "write_result",
            description: "Write the final result of this task and finish.",
            parameters: json!({
                "type": "object",
                "properties": { "result": { "type": "object" } },
                "required": ["result"]
            }),
        }
    }

    pub fn write_toc_result() -> Self {
        Self {
            name: "write_toc_result",
            description: "Write the extracted table of contents and finish.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "entries": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "title": { "type": "string" },
                                "level": { "type": "integer", "minimum": 1, "maximum": 3 },
                                "page_num": { "type": "integer", "minimum": 1 }
                            },
                            "required": ["title", "level", "page_num"]
                        }
                    }
                },
                "required": ["entries"]
            }),
        }
    }

    pub fn write_fix() -> Self {
        Self {
            name: "write_fix",
            description: "Write a correction for previously produced output and finish.",
            parameters: json!({
                "type": "object",
                "properties": { "fix": { "type": "object" } },
                "required": ["fix"]
            }),
        }
    }
}

#[async_trait]
impl Tool for TerminalWriteTool {
    fn name(&self) -> &'static str {
        self.name
    }

    fn description(&self) -> &'static str {
        self.description
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    fn terminal(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        ctx.set_result(json!({ "tool": self.name, "payload": args }));
        ToolOutcome::success(json!({ "written": true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::PageImageSource;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct StaticImages;

    impl PageImageSource for StaticImages {
        fn page_image(&self, page_num: u64) -> std::io::Result<Vec<u8>> {
            Ok(format!("img{page_num}").into_bytes())
        }
    }

    fn ctx() -> ToolContext {
        let mut pages = BTreeMap::new();
        pages.insert(1, "Contents\nChapter One .... 5".to_string());
        pages.insert(2, "Preface text".to_string());
        ToolContext::new("book-1", 10, Arc::new(StaticImages)).with_pages(pages)
    }

    #[tokio::test]
    async fn test_load_page_image_attaches_image() {
        let ctx = ctx();
        let outcome = LoadPageImageTool.execute(json!({"page_num": 6}), &ctx).await;

        assert!(!outcome.is_error);
        let image = outcome.image.unwrap();
        assert_eq!(image.media_type, "image/png");
        assert_eq!(image.base64, BASE64.encode(b"img6"));
        assert_eq!(ctx.viewed().unwrap().page_num, 6);
    }

    #[tokio::test]
    async fn test_swap_without_observations_names_current_page() {
        let ctx = ctx();
        LoadPageImageTool.execute(json!({"page_num": 6}), &ctx).await;

        let outcome = LoadPageImageTool.execute(json!({"page_num": 7}), &ctx).await;
        assert!(outcome.is_error);
        assert!(outcome.content.contains("page 6"), "error names the blocking page: {}", outcome.content);

        // Recording observations unblocks the swap
        RecordObservationsTool
            .execute(json!({"page_num": 6, "observations": "title page"}), &ctx)
            .await;
        let outcome = LoadPageImageTool.execute(json!({"page_num": 7}), &ctx).await;
        assert!(!outcome.is_error);
    }

    #[tokio::test]
    async fn test_out_of_range_page_is_structured_error() {
        let ctx = ctx();
        let outcome = ReadPageTextTool.execute(json!({"page_num": 99}), &ctx).await;
        assert!(outcome.is_error);
        assert!(outcome.content.contains("1..=10"));
    }

    #[tokio::test]
    async fn test_search_finds_snippets() {
        let ctx = ctx();
        let outcome = SearchBookTextTool
            .execute(json!({"query": "chapter one"}), &ctx)
            .await;

        assert!(!outcome.is_error);
        let value: Value = serde_json::from_str(&outcome.content).unwrap();
        assert_eq!(value["matches"][0]["page_num"], 1);
        assert!(value["matches"][0]["snippet"].as_str().unwrap().contains("Chapter One"));
    }

    #[tokio::test]
    async fn test_terminal_write_stores_result() {
        let ctx = ctx();
        let tool = TerminalWriteTool::write_toc_result();
        let payload = json!({"entries": [{"title": "One", "level": 1, "page_num": 5}]});

        let outcome = tool.execute(payload.clone(), &ctx).await;
        assert!(!outcome.is_error);

        let stored = ctx.result().unwrap();
        assert_eq!(stored["tool"], "write_toc_result");
        assert_eq!(stored["payload"], payload);
    }
}
