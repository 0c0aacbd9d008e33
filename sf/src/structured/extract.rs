//! Candidate JSON extraction from model output
//!
//! Models return raw JSON, fenced code blocks, or JSON buried in prose.
//! Extraction tries each in turn; the bracket-matching fallback takes the
//! first/last `{…}` or `[…]` span.

use serde_json::Value;

/// Extract and parse the JSON document in `text`
pub fn extract_json(text: &str) -> Result<Value, String> {
    let trimmed = text.trim();

    // Raw JSON
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    // Fenced code block
    if let Some(fenced) = extract_fenced(trimmed)
        && let Ok(value) = serde_json::from_str::<Value>(fenced.trim())
    {
        return Ok(value);
    }

    // Bracket matching: object span preferred, then array span
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let Some(span) = bracket_span(trimmed, open, close)
            && let Ok(value) = serde_json::from_str::<Value>(span)
        {
            return Ok(value);
        }
    }

    Err(format!(
        "no parsable JSON found in {} chars of output",
        trimmed.chars().count()
    ))
}

fn extract_fenced(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    // Skip the info string (e.g. "json") up to the newline
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

fn bracket_span(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}
