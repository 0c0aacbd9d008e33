//! Collection types stored in the document store
//!
//! Every document carries a stable `_docID` assigned by the store. Structs
//! serialize to mutation inputs directly; `doc_id` is skipped on create so
//! the store can assign one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A collection the sink can write to. `MATCH_FIELD` names the natural
/// identifying field returned by batched creates so out-of-order responses
/// can be matched back to their callers; collections without one fall back
/// to positional matching.
pub trait Collection {
    const NAME: &'static str;
    const MATCH_FIELD: Option<&'static str>;
}

/// A scanned book under reconstruction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    #[serde(rename = "_docID", skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    pub title: String,
    pub total_pages: u64,
    /// Current pipeline phase marker (build|extract|classify|polish|finalize)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Collection for Book {
    const NAME: &'static str = "Book";
    const MATCH_FIELD: Option<&'static str> = None;
}

/// A single scanned page with its OCR text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    #[serde(rename = "_docID", skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    pub book_id: String,
    pub page_num: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_complete: Option<bool>,
}

impl Collection for Page {
    const NAME: &'static str = "Page";
    const MATCH_FIELD: Option<&'static str> = Some("page_num");
}

/// A reconstructed chapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    #[serde(rename = "_docID", skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    pub book_id: String,
    pub index: u64,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_page: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_page: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polish_complete: Option<bool>,
}

impl Collection for Chapter {
    const NAME: &'static str = "Chapter";
    const MATCH_FIELD: Option<&'static str> = Some("index");
}

/// A cleaned paragraph of chapter text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paragraph {
    #[serde(rename = "_docID", skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    pub chapter_id: String,
    pub index: u64,
    pub text: String,
}

impl Collection for Paragraph {
    const NAME: &'static str = "Paragraph";
    const MATCH_FIELD: Option<&'static str> = Some("index");
}

/// An entry in the reconstructed table of contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TocEntry {
    #[serde(rename = "_docID", skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    pub book_id: String,
    pub title: String,
    pub level: u64,
    pub page_num: u64,
}

impl Collection for TocEntry {
    const NAME: &'static str = "TocEntry";
    const MATCH_FIELD: Option<&'static str> = Some("page_num");
}

/// Audit record of one LLM call (cost accounting and replay)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCall {
    #[serde(rename = "_docID", skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    pub book_id: String,
    pub provider: String,
    pub model: String,
    pub prompt_key: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Collection for LlmCall {
    const NAME: &'static str = "LLMCall";
    const MATCH_FIELD: Option<&'static str> = None;
}

/// Raw OCR output for one page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResult {
    #[serde(rename = "_docID", skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    pub book_id: String,
    pub page_num: u64,
    pub markdown: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u64>,
}

impl Collection for OcrResult {
    const NAME: &'static str = "OcrResult";
    const MATCH_FIELD: Option<&'static str> = Some("page_num");
}
