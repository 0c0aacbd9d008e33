//! DocStore - typed client for Shelf's document store
//!
//! The store speaks GraphQL over HTTP and assigns a stable `_docID` to every
//! document. This crate owns the wire protocol (queries, batched mutations,
//! schema DDL, health check), the collection types the pipeline persists,
//! and the optional sibling-container bootstrap used when no external store
//! is running.

pub mod client;
pub mod collections;
pub mod container;
pub mod error;

pub use client::{GraphQlClient, StoreHandle};
pub use collections::{Book, Chapter, Collection, LlmCall, OcrResult, Page, Paragraph, TocEntry};
pub use container::{ContainerConfig, StoreContainer};
pub use error::StoreError;
