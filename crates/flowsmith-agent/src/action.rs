//! Decision parsed from one autonomous-loop reply

use crate::extract::extract_json_block;
use flowsmith_core::{normalize_questions, FlowError, Result};
use serde::Deserialize;
use serde_json::Value;

/// What the model decided to do this iteration
#[derive(Debug, Clone, PartialEq)]
pub enum LoopAction {
    /// Invoke a named tool with structured arguments
    ToolCall { tool: String, args: Value },
    /// Claim completion with a document (inline, in `result`, or in the reply)
    Final {
        yaml: String,
        result: String,
        message: String,
        questions: Vec<String>,
    },
    /// Stop and ask the user
    NeedMoreInfo {
        questions: Vec<String>,
        message: String,
    },
}

impl LoopAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolCall { .. } => "tool_call",
            Self::Final { .. } => "final",
            Self::NeedMoreInfo { .. } => "need_more_info",
        }
    }

    /// Tool name for tool calls, empty otherwise
    pub fn tool(&self) -> &str {
        match self {
            Self::ToolCall { tool, .. } => tool,
            _ => "",
        }
    }

    /// Free-text fields searched for a completion token
    pub fn texts(&self) -> Vec<&str> {
        match self {
            Self::ToolCall { .. } => Vec::new(),
            Self::Final {
                yaml,
                result,
                message,
                ..
            } => vec![message.as_str(), result.as_str(), yaml.as_str()],
            Self::NeedMoreInfo { message, .. } => vec![message.as_str()],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawLoopAction {
    action: String,
    tool: String,
    args: Value,
    result: String,
    yaml: String,
    questions: Vec<String>,
    message: String,
}

/// Parse a reply into a [`LoopAction`]
///
/// Malformed JSON is a [`FlowError::Parse`] (a retryable failure); a
/// well-formed reply naming an unknown action is a [`FlowError::Loop`].
pub fn parse_loop_action(reply: &str) -> Result<LoopAction> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Err(FlowError::Parse("empty loop response".to_string()));
    }
    let json_text = extract_json_block(trimmed);
    let candidate = if json_text.is_empty() {
        trimmed
    } else {
        json_text.as_str()
    };
    let raw: RawLoopAction = serde_json::from_str(candidate)
        .map_err(|e| FlowError::Parse(format!("invalid loop json: {}", e)))?;

    match raw.action.trim().to_lowercase().as_str() {
        "tool" | "tool_call" | "call_tool" => Ok(LoopAction::ToolCall {
            tool: raw.tool.trim().to_string(),
            args: raw.args,
        }),
        "final" | "done" | "finish" => Ok(LoopAction::Final {
            yaml: raw.yaml,
            result: raw.result,
            message: raw.message,
            questions: normalize_questions(raw.questions),
        }),
        "need_more_info" | "question" | "questions" => Ok(LoopAction::NeedMoreInfo {
            questions: normalize_questions(raw.questions),
            message: raw.message,
        }),
        _ => Err(FlowError::Loop(format!(
            "unknown loop action {:?}",
            raw.action
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_call() {
        let action =
            parse_loop_action(r#"{"action":"call_tool","tool":" risk_scan ","args":{"yaml":"x"}}"#)
                .unwrap();
        assert_eq!(
            action,
            LoopAction::ToolCall {
                tool: "risk_scan".to_string(),
                args: json!({"yaml": "x"}),
            }
        );
        assert_eq!(action.kind(), "tool_call");
    }

    #[test]
    fn test_final_in_code_block() {
        let reply = "```json\n{\"action\":\"done\",\"yaml\":\"steps: []\"}\n```";
        match parse_loop_action(reply).unwrap() {
            LoopAction::Final { yaml, .. } => assert_eq!(yaml, "steps: []"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_need_more_info_normalizes_questions() {
        let action = parse_loop_action(
            r#"{"action":"questions","questions":[" which host? ","","which host?"]}"#,
        )
        .unwrap();
        assert_eq!(
            action,
            LoopAction::NeedMoreInfo {
                questions: vec!["which host?".to_string()],
                message: String::new(),
            }
        );
    }

    #[test]
    fn test_errors() {
        assert!(matches!(parse_loop_action(""), Err(FlowError::Parse(_))));
        assert!(matches!(
            parse_loop_action("I think we should"),
            Err(FlowError::Parse(_))
        ));
        assert!(matches!(
            parse_loop_action(r#"{"action":"dance"}"#),
            Err(FlowError::Loop(_))
        ));
    }
}
