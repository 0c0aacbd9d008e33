//! Stock pipeline client for the job runtime
//!
//! The job machinery in [`crate::job`] is domain-blind; this module is a
//! client of that core. It supplies the concrete prompts, the
//! table-of-contents extraction schema, and the boundary rule used by the
//! standard book reconstruction pipeline. Alternative extractors implement
//! [`BookPipeline`] the same way and plug into `BookJob` unchanged.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::job::{BookPipeline, ChapterBounds, ChapterSkeleton, Extraction, TocRow};
use crate::providers::types::{ChatMessage, ChatRequest, ChatResult, ResponseFormat};
use crate::scheduler::CpuTask;
use crate::structured::extract_json;

const EXTRACT_PROMPT: &str = "Below is the OCR text of the opening pages of a scanned book. \
Find the table of contents and return every entry with its title, heading level, and printed page number.";

const POLISH_PROMPT: &str = "Clean the following OCR chapter text: fix hyphenation and obvious \
OCR errors, join broken lines into paragraphs, and drop running headers and page numbers. \
Return only the cleaned text.";

/// How much page text goes into the extraction prompt
const EXTRACT_CONTEXT_CHARS: usize = 20_000;

/// Canonical schema for the ToC extraction reply
fn toc_schema() -> Value {
    json!({
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
    })
}

/// Table-of-contents pipeline: top-level ToC entries become chapters, and
/// each chapter runs to the page before the next one starts.
#[derive(Debug, Default)]
pub struct TocPipeline;

impl BookPipeline for TocPipeline {
    fn extract_request(&self, page_texts: &BTreeMap<u64, String>) -> ChatRequest {
        let mut context = String::new();
        for (page_num, text) in page_texts {
            if context.chars().count() > EXTRACT_CONTEXT_CHARS {
                break;
            }
            context.push_str(&format!("\n--- page {page_num} ---\n{text}"));
        }

        ChatRequest {
            messages: vec![
                ChatMessage::system("You analyze scanned books."),
                ChatMessage::user(format!("{EXTRACT_PROMPT}\n{context}")),
            ],
            response_format: Some(ResponseFormat {
                name: "toc".to_string(),
                schema: toc_schema(),
            }),
            prompt_key: Some("extract-toc".to_string()),
            ..Default::default()
        }
    }

    fn parse_extraction(&self, reply: &ChatResult) -> Result<Extraction, String> {
        let parsed = match &reply.parsed {
            Some(parsed) => parsed.clone(),
            None => extract_json(&reply.content)?,
        };
        let entries = parsed["entries"]
            .as_array()
            .ok_or_else(|| "reply carried no entries array".to_string())?;

        let toc: Vec<TocRow> = entries
            .iter()
            .map(|entry| TocRow {
                title: entry["title"].as_str().unwrap_or_default().to_string(),
                level: entry["level"].as_u64().unwrap_or(1),
                page_num: entry["page_num"].as_u64().unwrap_or(1),
            })
            .collect();

        let chapters: Vec<ChapterSkeleton> = toc
            .iter()
            .filter(|row| row.level == 1)
            .enumerate()
            .map(|(index, row)| ChapterSkeleton {
                index: index as u64,
                title: row.title.clone(),
                start_page: row.page_num,
            })
            .collect();

        Ok(Extraction { toc, chapters })
    }

    fn boundary_task(&self, chapters: Vec<ChapterSkeleton>, total_pages: u64) -> CpuTask {
        CpuTask::new(move || {
            // Each chapter runs to the page before the next one starts;
            // the last one runs to the end of the book
            let mut ranges = Vec::new();
            for (i, chapter) in chapters.iter().enumerate() {
                let end = chapters
                    .get(i + 1)
                    .map(|next| next.start_page.saturating_sub(1))
                    .unwrap_or(total_pages);
                ranges.push(json!({
                    "index": chapter.index,
                    "start_page": chapter.start_page,
                    "end_page": end.max(chapter.start_page),
                }));
            }
            Ok(json!({ "ranges": ranges }))
        })
    }

    fn parse_bounds(&self, value: &Value) -> Vec<ChapterBounds> {
        value["ranges"]
            .as_array()
            .map(|ranges| {
                ranges
                    .iter()
                    .filter_map(|range| {
                        let index = range["index"].as_u64()?;
                        let start_page = range["start_page"].as_u64().unwrap_or(1);
                        Some(ChapterBounds {
                            index,
                            start_page,
                            end_page: range["end_page"].as_u64().unwrap_or(start_page),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn polish_request(&self, title: &str, text: &str) -> ChatRequest {
        ChatRequest {
            messages: vec![
                ChatMessage::system("You restore scanned book text."),
                ChatMessage::user(format!("{POLISH_PROMPT}\n\n# {title}\n\n{text}")),
            ],
            prompt_key: Some("polish-chapter".to_string()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(content: &str) -> ChatResult {
        ChatResult {
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_extract_request_carries_schema_and_pages() {
        let mut pages = BTreeMap::new();
        pages.insert(1, "Contents".to_string());
        pages.insert(2, "Chapter One .... 5".to_string());

        let request = TocPipeline.extract_request(&pages);

        let format = request.response_format.as_ref().unwrap();
        assert_eq!(format.name, "toc");
        assert_eq!(format.schema["required"][0], "entries");

        let prompt = &request.messages[1].content;
        assert!(prompt.contains("--- page 1 ---"));
        assert!(prompt.contains("Chapter One"));
        assert_eq!(request.prompt_key.as_deref(), Some("extract-toc"));
    }

    #[test]
    fn test_extract_context_truncated() {
        let mut pages = BTreeMap::new();
        for n in 1..=50 {
            pages.insert(n, "x".repeat(1000));
        }

        let request = TocPipeline.extract_request(&pages);
        let prompt = &request.messages[1].content;

        // Bounded: well under the full 50k of page text
        assert!(prompt.chars().count() < EXTRACT_CONTEXT_CHARS + 2000);
    }

    #[test]
    fn test_parse_extraction_top_level_entries_become_chapters() {
        let extraction = TocPipeline
            .parse_extraction(&reply(
                r#"{"entries": [
                    {"title": "One", "level": 1, "page_num": 5},
                    {"title": "A Section", "level": 2, "page_num": 7},
                    {"title": "Two", "level": 1, "page_num": 20}
                ]}"#,
            ))
            .unwrap();

        assert_eq!(extraction.toc.len(), 3);
        assert_eq!(extraction.chapters.len(), 2);
        assert_eq!(extraction.chapters[0].title, "One");
        assert_eq!(extraction.chapters[1].index, 1);
        assert_eq!(extraction.chapters[1].start_page, 20);
    }

    #[test]
    fn test_parse_extraction_accepts_prose_surrounded_json() {
        let extraction = TocPipeline
            .parse_extraction(&reply(
                r#"Here it is: {"entries": [{"title": "One", "level": 1, "page_num": 3}]} done."#,
            ))
            .unwrap();
        assert_eq!(extraction.chapters.len(), 1);
    }

    #[test]
    fn test_parse_extraction_rejects_non_json() {
        let err = TocPipeline.parse_extraction(&reply("I could not find a ToC.")).unwrap_err();
        assert!(err.contains("no parsable JSON"));
    }

    #[test]
    fn test_boundary_rule_runs_to_next_chapter() {
        let chapters = vec![
            ChapterSkeleton {
                index: 0,
                title: "One".to_string(),
                start_page: 5,
            },
            ChapterSkeleton {
                index: 1,
                title: "Two".to_string(),
                start_page: 20,
            },
        ];

        let task = TocPipeline.boundary_task(chapters, 60);
        let value = (task.0)().unwrap();
        let bounds = TocPipeline.parse_bounds(&value);

        assert_eq!(bounds.len(), 2);
        assert_eq!((bounds[0].start_page, bounds[0].end_page), (5, 19));
        // Last chapter runs to the end of the book
        assert_eq!((bounds[1].start_page, bounds[1].end_page), (20, 60));
    }

    #[test]
    fn test_parse_bounds_ignores_malformed_ranges() {
        let bounds = TocPipeline.parse_bounds(&json!({
            "ranges": [
                { "index": 0, "start_page": 1, "end_page": 4 },
                { "start_page": 9 },
            ]
        }));
        assert_eq!(bounds.len(), 1);
        assert_eq!(bounds[0].end_page, 4);
    }

    #[test]
    fn test_polish_request_shape() {
        let request = TocPipeline.polish_request("Chapter One", "raw ocr text");
        assert_eq!(request.prompt_key.as_deref(), Some("polish-chapter"));
        let prompt = &request.messages[1].content;
        assert!(prompt.contains("# Chapter One"));
        assert!(prompt.contains("raw ocr text"));
    }
}
