//! Transcript record shapes and bridge-side session types.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// File extension of Claude Code session transcripts.
pub const TRANSCRIPT_EXT: &str = "jsonl";

/// The `(sessionId, cwd)` pair currently selected as the target of user
/// messages. Persisted as a two-line marker file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedSession {
    pub session_id: String,
    pub cwd: String,
}

/// Snapshot of a session file taken immediately before injection. The turn
/// watcher ignores everything at or before `size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Baseline {
    pub file_path: PathBuf,
    pub session_id: String,
    pub size: u64,
}

/// One entry of the session picker: the newest session per project directory.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOverview {
    pub session_id: String,
    pub cwd: String,
    pub project_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    pub mtime: DateTime<Utc>,
}

/// An `assistant` transcript record, as far as the bridge cares.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantRecord {
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub message: AssistantMessage,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// Content blocks inside an assistant message. Unknown kinds are preserved as
/// `Other` and ignored downstream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

/// A tool invocation extracted from an assistant record.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub input: Value,
}

/// The `type` field of a raw transcript record, `""` when absent.
pub fn record_type(value: &Value) -> &str {
    value.get("type").and_then(|t| t.as_str()).unwrap_or("")
}

/// Tool name Claude Code emits when awaiting plan approval.
pub const EXIT_PLAN_MODE_TOOL: &str = "ExitPlanMode";

/// Tool name whose `file_path` input is how images enter the transcript.
pub const WRITE_TOOL: &str = "Write";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_block_tagged_parse() {
        let blocks: Vec<ContentBlock> = serde_json::from_str(
            r#"[
                {"type":"text","text":"hi"},
                {"type":"tool_use","name":"Bash","input":{"command":"ls"}},
                {"type":"thinking","thinking":"..."}
            ]"#,
        )
        .unwrap();

        assert!(matches!(&blocks[0], ContentBlock::Text { text } if text == "hi"));
        assert!(matches!(&blocks[1], ContentBlock::ToolUse { name, .. } if name == "Bash"));
        assert!(matches!(&blocks[2], ContentBlock::Other));
    }

    #[test]
    fn test_assistant_record_missing_fields() {
        let record: AssistantRecord = serde_json::from_str(r#"{"type":"assistant"}"#).unwrap();
        assert!(record.cwd.is_none());
        assert!(record.message.content.is_empty());
    }

    #[test]
    fn test_record_type() {
        let v: Value = serde_json::from_str(r#"{"type":"result"}"#).unwrap();
        assert_eq!(record_type(&v), "result");
        let v: Value = serde_json::from_str(r#"{"other":1}"#).unwrap();
        assert_eq!(record_type(&v), "");
    }
}
