//! Pull structured payloads out of free-form model replies

use flowsmith_core::{normalize_questions, FlowError, Result};
use serde_json::Value;

/// A document extracted from a reply, plus any questions it carried
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedWorkflow {
    pub yaml: String,
    pub questions: Vec<String>,
}

/// Content of the first fenced code block, or an empty string
pub fn extract_code_block(text: &str) -> String {
    let mut in_block = false;
    let mut block: Vec<&str> = Vec::new();
    for line in text.split('\n') {
        if line.trim().starts_with("```") {
            if in_block {
                return block.join("\n");
            }
            in_block = true;
            block.clear();
            continue;
        }
        if in_block {
            block.push(line);
        }
    }
    String::new()
}

/// JSON text found in a code block or at the start of the reply
pub fn extract_json_block(text: &str) -> String {
    let block = extract_code_block(text);
    let candidate = if block.is_empty() { text } else { &block };
    let trimmed = candidate.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        trimmed.to_string()
    } else {
        String::new()
    }
}

/// A fenced block if present, otherwise the whole reply
pub fn extract_yaml(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let block = extract_code_block(trimmed);
    if block.is_empty() {
        trimmed.to_string()
    } else {
        block.trim().to_string()
    }
}

/// Turn a model reply into document text
///
/// JSON payloads are converted to YAML, with a top-level `questions` array
/// lifted out of the document. Anything else falls back to [`extract_yaml`].
pub fn extract_workflow_yaml(reply: &str) -> Result<ExtractedWorkflow> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Err(FlowError::Parse("empty ai response".to_string()));
    }

    let json_text = extract_json_block(trimmed);
    if !json_text.is_empty() {
        if let Ok(mut payload) = serde_json::from_str::<Value>(&json_text) {
            let questions = take_questions(&mut payload);
            if let Ok(yaml) = serde_yaml::to_string(&payload) {
                return Ok(ExtractedWorkflow {
                    yaml: yaml.trim().to_string(),
                    questions,
                });
            }
        }
    }

    let fallback = extract_yaml(trimmed);
    if fallback.is_empty() {
        return Err(FlowError::Parse("unable to extract yaml".to_string()));
    }
    Ok(ExtractedWorkflow {
        yaml: fallback,
        questions: Vec::new(),
    })
}

fn take_questions(payload: &mut Value) -> Vec<String> {
    let Some(map) = payload.as_object_mut() else {
        return Vec::new();
    };
    match map.remove("questions") {
        Some(Value::Array(items)) => normalize_questions(
            items
                .iter()
                .filter_map(|q| q.as_str())
                .collect::<Vec<_>>(),
        ),
        _ => Vec::new(),
    }
}
