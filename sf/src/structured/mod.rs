//! Structured output: schema adaptation, extraction, validation, repair
//!
//! The canonical schema (authored by the caller) never leaves this process;
//! adapters send an adapted copy when the model family needs one, and every
//! reply is validated against the canonical schema on the way back in.

mod adapt;
mod extract;
mod repair;
mod validate;

pub use adapt::{SchemaTransport, adapt_schema, schema_prompt_instruction, transport_for_model};
pub use extract::extract_json;
pub use repair::chat_with_repair;
pub use validate::{SchemaViolation, validate};
