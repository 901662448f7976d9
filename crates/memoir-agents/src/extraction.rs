//! Parsing of Stenographer extraction replies.
//!
//! The model is asked for a bare JSON object, but replies sometimes arrive
//! wrapped in fenced markers or prose, and either as the payload itself or
//! under a `memory_content` key. Both shapes are accepted; the payload is
//! recovered by locating the outermost balanced braces.

use memoir_store::types::ExtractionDelta;

use crate::error::{AgentError, Result};

/// Parse a raw reply into an extraction payload.
pub fn parse_extraction(raw: &str) -> Result<ExtractionDelta> {
    let block = extract_json_block(raw)
        .ok_or_else(|| AgentError::Malformed("no JSON object found in reply".to_string()))?;

    let value: serde_json::Value =
        serde_json::from_str(block).map_err(|e| AgentError::Malformed(e.to_string()))?;

    let inner = match value.get("memory_content") {
        Some(obj) if obj.is_object() => obj.clone(),
        _ => value,
    };

    serde_json::from_value(inner).map_err(|e| AgentError::Malformed(e.to_string()))
}

/// The outermost balanced `{ ... }` block, string-aware so braces inside
/// JSON strings do not confuse the depth count.
pub fn extract_json_block(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}
