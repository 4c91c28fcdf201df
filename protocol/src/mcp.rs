//! Transport-agnostic mirrors of the MCP wire types the control plane moves
//! around internally.
//!
//! Keeping these here lets lower-level crates (the orchestrator in
//! particular) stay independent of the MCP SDK; the aggregator converts at
//! its boundary.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Result of a `tools/call`, with content objects kept as raw JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    pub content: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl CallToolResult {
    /// A successful result carrying a single text content object.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![text_content(text)],
            structured_content: None,
            is_error: None,
            meta: None,
        }
    }

    /// An `isError: true` result carrying a single text content object.
    /// Validation failures are returned this way rather than raised.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![text_content(text)],
            structured_content: None,
            is_error: Some(true),
            meta: None,
        }
    }

    /// A successful result whose payload is structured JSON. The text
    /// rendering is included for clients that ignore structured content.
    pub fn json(value: Value) -> Self {
        let text = serde_json::to_string_pretty(&value).unwrap_or_default();
        Self {
            content: vec![text_content(text)],
            structured_content: Some(value),
            is_error: None,
            meta: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.is_error != Some(true)
    }

    /// Concatenated text of all `text` content objects.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| {
                (c.get("type").and_then(Value::as_str) == Some("text"))
                    .then(|| c.get("text").and_then(Value::as_str))
                    .flatten()
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

fn text_content(text: impl Into<String>) -> Value {
    serde_json::json!({ "type": "text", "text": text.into() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn text_result_round_trips() {
        let result = CallToolResult::text("pong");
        assert!(result.is_success());
        assert_eq!(result.text_content(), "pong");

        let value = serde_json::to_value(&result).expect("serialize");
        assert_eq!(
            value,
            json!({ "content": [{ "type": "text", "text": "pong" }] })
        );
    }

    #[test]
    fn error_result_is_not_success() {
        let result = CallToolResult::error("tool not found: x");
        assert!(!result.is_success());
        assert_eq!(result.is_error, Some(true));
    }

    #[test]
    fn json_result_carries_structured_content() {
        let result = CallToolResult::json(json!({ "port": 8080 }));
        assert_eq!(result.structured_content, Some(json!({ "port": 8080 })));
        assert!(result.text_content().contains("8080"));
    }
}
