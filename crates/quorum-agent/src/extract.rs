//! Defensive recovery of finding lists from free-form agent output.
//!
//! Agents wrap their answer in prose, markdown fences or a CLI event stream.
//! Everything here degrades to "no findings" rather than failing, and the
//! per-entry validation happens later in the orchestrator.

use serde::Deserialize;
use serde_json::Value;

/// The subset of `--output-format stream-json` events that carry text.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    Assistant {
        message: Option<AssistantMessage>,
    },
    Result {
        result: Option<String>,
        is_error: Option<bool>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

/// Final answer text from a CLI event stream.
///
/// Prefers the `result` event; falls back to concatenated assistant text, and
/// to the raw input when it is not an event stream at all. Returns `Err` with
/// the agent's message when the stream ends in an error result.
pub fn final_text(raw: &str) -> Result<String, String> {
    let mut result: Option<String> = None;
    let mut assistant = String::new();
    let mut saw_event = false;

    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(event) = serde_json::from_str::<StreamEvent>(line) else {
            continue;
        };
        saw_event = true;
        match event {
            StreamEvent::Assistant { message: Some(msg) } => {
                for block in msg.content {
                    if let ContentBlock::Text { text } = block {
                        if !assistant.is_empty() {
                            assistant.push('\n');
                        }
                        assistant.push_str(&text);
                    }
                }
            }
            StreamEvent::Result { result: text, is_error } => {
                let text = text.unwrap_or_default();
                if is_error == Some(true) {
                    return Err(text);
                }
                result = Some(text);
            }
            _ => {}
        }
    }

    if !saw_event {
        return Ok(raw.to_string());
    }
    match result {
        Some(text) if !text.trim().is_empty() => Ok(text),
        _ => Ok(assistant),
    }
}

/// Pull the finding array out of agent text.
///
/// Accepts a bare JSON array, an object with a `findings` array, either of
/// those inside a ```json fence, or the outermost `[...]` span of prose.
/// Returns `None` when nothing parseable is present.
pub fn extract_findings(text: &str) -> Option<Vec<Value>> {
    let trimmed = text.trim();
    if let Some(v) = as_findings(trimmed) {
        return Some(v);
    }
    for block in fenced_blocks(trimmed) {
        if let Some(v) = as_findings(block) {
            return Some(v);
        }
    }
    let start = trimmed.find('[')?;
    let end = trimmed.rfind(']')?;
    if end <= start {
        return None;
    }
    as_findings(&trimmed[start..=end])
}

fn as_findings(candidate: &str) -> Option<Vec<Value>> {
    match serde_json::from_str::<Value>(candidate.trim()).ok()? {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => match map.remove("findings") {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

/// Contents of each ``` fenced block, language tag stripped. The last block
/// is tried first since agents tend to put their final answer at the end.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
        let body = &after[body_start..];
        let Some(close) = body.find("```") else {
            break;
        };
        blocks.push(&body[..close]);
        rest = &body[close + 3..];
    }
    blocks.reverse();
    blocks
}
