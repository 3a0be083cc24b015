//! Parsing of the agent's streaming output.
//!
//! The agent CLI's `--output-format stream-json` produces JSONL with these
//! event types:
//! - `system`/`init`: initialization message carrying the session id
//! - `assistant`: response content (text and tool_use blocks)
//! - `tool_use` / `tool_result`: tool call requests and results
//! - `result`: final summary with error flag, result text and token usage
//!
//! Parsing happens here, ahead of any control logic, so the runner only
//! ever looks at tagged variants.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RalphError, Result};

/// Token usage statistics from a result event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    /// Total tokens, counting cached input
    pub fn total(&self) -> u64 {
        self.input_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
            + self.output_tokens
    }
}

/// Content block within an assistant message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

/// Final summary emitted by the agent when a session ends
#[derive(Debug, Clone, Default)]
pub struct ResultEvent {
    pub subtype: Option<String>,
    pub is_error: bool,
    /// Final result text; on failure this carries the error message
    pub result: Option<String>,
    pub session_id: Option<String>,
    pub usage: TokenUsage,
    pub total_cost_usd: Option<f64>,
}

/// A parsed agent streaming event
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// System initialization
    Init { session_id: Option<String> },
    /// Assistant message content
    Assistant { content: Vec<ContentBlock> },
    /// Tool use request
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// Tool result
    ToolResult { id: String, content: String },
    /// Final result with error flag and usage statistics
    Result(ResultEvent),
    /// Unknown event type (for forward compatibility)
    Unknown { event_type: String, raw: Value },
}

impl AgentEvent {
    /// Parse a JSON line into an AgentEvent
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(RalphError::MalformedEvent("empty line".to_string()));
        }

        let value: Value = serde_json::from_str(line)
            .map_err(|e| RalphError::MalformedEvent(e.to_string()))?;

        let event_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("unknown");

        match event_type {
            "init" | "system" => Ok(AgentEvent::Init {
                session_id: str_field(&value, "session_id"),
            }),
            "assistant" => {
                let content = if let Some(message) = value.get("message") {
                    // Wrapped format: { type: "assistant", message: { content: [...] } }
                    message
                        .get("content")
                        .and_then(|c| serde_json::from_value(c.clone()).ok())
                        .unwrap_or_default()
                } else if let Some(content) = value.get("content") {
                    // Direct content array
                    serde_json::from_value(content.clone()).unwrap_or_default()
                } else {
                    Vec::new()
                };
                Ok(AgentEvent::Assistant { content })
            }
            "tool_use" => {
                let id = str_field(&value, "id").unwrap_or_default();
                let name = str_field(&value, "name").unwrap_or_default();
                let input = value.get("input").cloned().unwrap_or(Value::Null);
                Ok(AgentEvent::ToolUse { id, name, input })
            }
            "tool_result" => {
                let id = str_field(&value, "tool_use_id")
                    .or_else(|| str_field(&value, "id"))
                    .unwrap_or_default();
                let content = str_field(&value, "content").unwrap_or_default();
                Ok(AgentEvent::ToolResult { id, content })
            }
            "result" => {
                let usage = value
                    .get("usage")
                    .and_then(|u| serde_json::from_value(u.clone()).ok())
                    .unwrap_or_default();
                Ok(AgentEvent::Result(ResultEvent {
                    subtype: str_field(&value, "subtype"),
                    is_error: value
                        .get("is_error")
                        .and_then(|e| e.as_bool())
                        .unwrap_or(false),
                    result: str_field(&value, "result"),
                    session_id: str_field(&value, "session_id"),
                    usage,
                    total_cost_usd: value.get("total_cost_usd").and_then(|c| c.as_f64()),
                }))
            }
            _ => Ok(AgentEvent::Unknown {
                event_type: event_type.to_string(),
                raw: value,
            }),
        }
    }

    /// Extract plain text content from an assistant event
    pub fn extract_text(&self) -> Option<String> {
        match self {
            AgentEvent::Assistant { content } => {
                let texts: Vec<String> = content
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text { text } => Some(text.clone()),
                        _ => None,
                    })
                    .collect();
                if texts.is_empty() {
                    None
                } else {
                    Some(texts.join("\n"))
                }
            }
            _ => None,
        }
    }

    /// Get the event type as a string for logging
    pub fn event_type(&self) -> &str {
        match self {
            AgentEvent::Init { .. } => "init",
            AgentEvent::Assistant { .. } => "assistant",
            AgentEvent::ToolUse { .. } => "tool_use",
            AgentEvent::ToolResult { .. } => "tool_result",
            AgentEvent::Result(_) => "result",
            AgentEvent::Unknown { event_type, .. } => event_type,
        }
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_init_event() {
        let json = r#"{"type":"system","subtype":"init","session_id":"sess_abc"}"#;
        let event = AgentEvent::parse(json).unwrap();

        if let AgentEvent::Init { session_id } = event {
            assert_eq!(session_id, Some("sess_abc".to_string()));
        } else {
            panic!("Expected init event");
        }
    }

    #[test]
    fn test_parse_assistant_event() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello, world!"}]}}"#;
        let event = AgentEvent::parse(json).unwrap();

        if let AgentEvent::Assistant { content } = event {
            assert_eq!(content.len(), 1);
            if let ContentBlock::Text { text } = &content[0] {
                assert_eq!(text, "Hello, world!");
            } else {
                panic!("Expected text block");
            }
        } else {
            panic!("Expected assistant event");
        }
    }

    #[test]
    fn test_parse_tool_use_event() {
        let json =
            r#"{"type":"tool_use","id":"tool_123","name":"Read","input":{"file_path":"/test.rs"}}"#;
        let event = AgentEvent::parse(json).unwrap();

        if let AgentEvent::ToolUse { id, name, input } = event {
            assert_eq!(id, "tool_123");
            assert_eq!(name, "Read");
            assert_eq!(input["file_path"], "/test.rs");
        } else {
            panic!("Expected tool_use event");
        }
    }

    #[test]
    fn test_parse_success_result_event() {
        let json = r#"{"type":"result","subtype":"success","session_id":"sess_123","result":"done","usage":{"input_tokens":1000,"output_tokens":500},"total_cost_usd":0.05}"#;
        let event = AgentEvent::parse(json).unwrap();

        if let AgentEvent::Result(res) = event {
            assert_eq!(res.subtype.as_deref(), Some("success"));
            assert!(!res.is_error);
            assert_eq!(res.result.as_deref(), Some("done"));
            assert_eq!(res.session_id.as_deref(), Some("sess_123"));
            assert_eq!(res.usage.input_tokens, 1000);
            assert_eq!(res.usage.output_tokens, 500);
            assert_eq!(res.usage.total(), 1500);
            assert_eq!(res.total_cost_usd, Some(0.05));
        } else {
            panic!("Expected result event");
        }
    }

    #[test]
    fn test_parse_error_result_event() {
        let json = r#"{"type":"result","subtype":"error","is_error":true,"result":"You've hit your limit"}"#;
        let event = AgentEvent::parse(json).unwrap();

        if let AgentEvent::Result(res) = event {
            assert!(res.is_error);
            assert_eq!(res.result.as_deref(), Some("You've hit your limit"));
        } else {
            panic!("Expected result event");
        }
    }

    #[test]
    fn test_parse_unknown_event() {
        let json = r#"{"type":"future_event","data":"something"}"#;
        let event = AgentEvent::parse(json).unwrap();

        if let AgentEvent::Unknown { event_type, .. } = event {
            assert_eq!(event_type, "future_event");
        } else {
            panic!("Expected unknown event");
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(AgentEvent::parse("not json").is_err());
        assert!(AgentEvent::parse("").is_err());
        assert!(AgentEvent::parse("   ").is_err());
    }

    #[test]
    fn test_extract_text() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello"},{"type":"text","text":"World"}]}}"#;
        let event = AgentEvent::parse(json).unwrap();

        let text = event.extract_text().unwrap();
        assert_eq!(text, "Hello\nWorld");
    }

    #[test]
    fn test_extract_text_no_content() {
        let json = r#"{"type":"result","usage":{}}"#;
        let event = AgentEvent::parse(json).unwrap();

        assert!(event.extract_text().is_none());
    }

    #[test]
    fn test_token_usage_total_counts_cache() {
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
            cache_creation_input_tokens: 10,
            cache_read_input_tokens: 40,
        };
        assert_eq!(usage.total(), 200);
    }
}
