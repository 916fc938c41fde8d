//! Tolerant newline-delimited JSON parsing for session transcripts.
//!
//! Every entry point here follows the same policy: empty lines are skipped,
//! lines that fail to parse are skipped, and errors never propagate out of a
//! single record. Active sessions append half-written lines all the time; the
//! incremental reader only ever consumes complete lines.

use std::path::Path;

use serde_json::Value;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader, SeekFrom};

use super::types::{record_type, AssistantRecord, ContentBlock, ToolCall, EXIT_PLAN_MODE_TOOL};

/// Max length of a session-list preview message.
pub const LAST_MESSAGE_MAX: usize = 200;

/// How far back from EOF the tail scans look. Large enough for any assistant
/// turn's trailing records.
const TAIL_SIZE: u64 = 256 * 1024;

/// Digest of a transcript produced from its lines.
#[derive(Debug, Clone, Default)]
pub struct TranscriptDigest {
    /// First non-empty `cwd` seen across assistant records.
    pub cwd: String,
    /// Most recent assistant text block, truncated for preview.
    pub last_message: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub all_messages: Vec<String>,
}

/// Parse a sequence of transcript lines. Only `assistant` records contribute;
/// `fallback_cwd` is used when no record carries a cwd.
pub fn digest_lines<'a, I>(lines: I, fallback_cwd: &str) -> TranscriptDigest
where
    I: IntoIterator<Item = &'a str>,
{
    let mut digest = TranscriptDigest {
        cwd: String::new(),
        ..Default::default()
    };

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if record_type(&value) != "assistant" {
            continue;
        }
        let record: AssistantRecord = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(_) => continue,
        };

        if digest.cwd.is_empty() {
            if let Some(cwd) = record.cwd.as_deref() {
                if !cwd.is_empty() {
                    digest.cwd = cwd.to_string();
                }
            }
        }

        for block in record.message.content {
            match block {
                ContentBlock::Text { text } => {
                    digest.last_message = Some(truncate_for_preview(&text));
                    digest.all_messages.push(text);
                }
                ContentBlock::ToolUse { name, input } => {
                    digest.tool_calls.push(ToolCall { name, input });
                }
                ContentBlock::Other => {}
            }
        }
    }

    if digest.cwd.is_empty() {
        digest.cwd = fallback_cwd.to_string();
    }
    digest
}

/// Collapse newlines and cap at [`LAST_MESSAGE_MAX`] chars.
pub fn truncate_for_preview(text: &str) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= LAST_MESSAGE_MAX {
        flat
    } else {
        flat.chars().take(LAST_MESSAGE_MAX).collect()
    }
}

/// The latest assistant state at the end of a transcript.
#[derive(Debug, Clone, Default)]
pub struct LastAssistantEntry {
    /// Latest assistant text block in the scanned window.
    pub text: Option<String>,
    /// Whether an `ExitPlanMode` tool_use appears in the window.
    pub has_exit_plan_mode: bool,
    /// The `input.plan` of that tool_use, when present.
    pub plan_text: Option<String>,
}

/// Scan backwards from EOF across assistant records, stopping at the first
/// `user` record (a turn boundary). Returns `None` only when the file cannot
/// be read at all.
pub async fn last_assistant_entry(path: &Path) -> Option<LastAssistantEntry> {
    let lines = read_tail_lines(path).await?;
    let mut entry = LastAssistantEntry::default();

    for line in lines.iter().rev() {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        match record_type(&value) {
            "user" => break,
            "assistant" => {}
            _ => continue,
        }
        let record: AssistantRecord = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(_) => continue,
        };
        for block in record.message.content {
            match block {
                ContentBlock::Text { text } => {
                    // Scanning backwards: the first text seen is the latest.
                    if entry.text.is_none() {
                        entry.text = Some(text);
                    }
                }
                ContentBlock::ToolUse { name, input } => {
                    if name == EXIT_PLAN_MODE_TOOL {
                        entry.has_exit_plan_mode = true;
                        if entry.plan_text.is_none() {
                            entry.plan_text = input
                                .get("plan")
                                .and_then(|p| p.as_str())
                                .map(|s| s.to_string());
                        }
                    }
                }
                ContentBlock::Other => {}
            }
        }
    }

    Some(entry)
}

/// Read the last [`TAIL_SIZE`] bytes of a file as whole lines, skipping the
/// partial first line when seeking into the middle.
async fn read_tail_lines(path: &Path) -> Option<Vec<String>> {
    let file = fs::File::open(path).await.ok()?;
    let metadata = file.metadata().await.ok()?;
    let file_size = metadata.len();

    let seek_pos = file_size.saturating_sub(TAIL_SIZE);
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(seek_pos)).await.ok()?;

    if seek_pos > 0 {
        let mut partial = String::new();
        reader.read_line(&mut partial).await.ok()?;
    }

    let mut lines = Vec::new();
    let mut reader_lines = reader.lines();
    while let Ok(Some(line)) = reader_lines.next_line().await {
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Some(lines)
}

/// Read records appended after `from_position`, consuming complete lines only.
///
/// Returns the parsed values and the new cursor position (end of the last
/// complete line). Bytes after the final newline stay unconsumed so a record
/// mid-flush is re-read whole on the next call.
pub async fn read_new_records(path: &Path, from_position: u64) -> anyhow::Result<(Vec<Value>, u64)> {
    let metadata = fs::metadata(path).await?;
    let file_size = metadata.len();

    if file_size <= from_position {
        return Ok((Vec::new(), from_position));
    }

    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(from_position)).await?;

    let mut buffer = vec![0u8; (file_size - from_position) as usize];
    file.read_exact(&mut buffer).await?;

    let complete = match buffer.iter().rposition(|&b| b == b'\n') {
        Some(idx) => idx + 1,
        None => return Ok((Vec::new(), from_position)),
    };

    let content = String::from_utf8_lossy(&buffer[..complete]);
    let mut records = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(line) {
            records.push(value);
        }
    }

    Ok((records, from_position + complete as u64))
}

/// File length in bytes, 0 when unreadable.
pub async fn file_size(path: &Path) -> u64 {
    fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn assistant_line(text: &str) -> String {
        format!(
            r#"{{"type":"assistant","cwd":"/tmp/p","message":{{"content":[{{"type":"text","text":"{}"}}]}}}}"#,
            text
        )
    }

    #[test]
    fn test_digest_skips_malformed_and_non_assistant() {
        let lines = [
            "",
            "not json at all",
            r#"{"type":"user","message":{"content":"hi"}}"#,
            r#"{"type":"assistant","cwd":"/work/repo","message":{"content":[{"type":"text","text":"First"}]}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"make"}}]}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Second"}]}}"#,
        ];

        let digest = digest_lines(lines, "/home/op");
        assert_eq!(digest.cwd, "/work/repo");
        assert_eq!(digest.all_messages, vec!["First", "Second"]);
        assert_eq!(digest.last_message.as_deref(), Some("Second"));
        assert_eq!(digest.tool_calls.len(), 1);
        assert_eq!(digest.tool_calls[0].name, "Bash");
    }

    #[test]
    fn test_digest_fallback_cwd() {
        let lines = [assistant_line("hello")];
        let digest = digest_lines(lines.iter().map(|s| s.as_str()), "/home/op");
        assert_eq!(digest.cwd, "/tmp/p");

        let digest = digest_lines(std::iter::empty(), "/home/op");
        assert_eq!(digest.cwd, "/home/op");
    }

    #[test]
    fn test_truncate_for_preview() {
        assert_eq!(truncate_for_preview("a\nb"), "a b");
        let long = "x".repeat(300);
        assert_eq!(truncate_for_preview(&long).chars().count(), LAST_MESSAGE_MAX);
    }

    #[tokio::test]
    async fn test_last_assistant_entry_stops_at_user() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        let content = [
            assistant_line("older answer"),
            r#"{"type":"user","message":{"content":"next question"}}"#.to_string(),
            assistant_line("newest answer"),
        ]
        .join("\n")
            + "\n";
        std::fs::write(&path, content).unwrap();

        let entry = last_assistant_entry(&path).await.unwrap();
        assert_eq!(entry.text.as_deref(), Some("newest answer"));
        assert!(!entry.has_exit_plan_mode);
    }

    #[tokio::test]
    async fn test_last_assistant_entry_exit_plan_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        let content = [
            r#"{"type":"user","message":{"content":"plan it"}}"#.to_string(),
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"ExitPlanMode","input":{"plan":"1. do the thing"}}]}}"#.to_string(),
            assistant_line("Here is my plan."),
        ]
        .join("\n")
            + "\n";
        std::fs::write(&path, content).unwrap();

        let entry = last_assistant_entry(&path).await.unwrap();
        assert!(entry.has_exit_plan_mode);
        assert_eq!(entry.plan_text.as_deref(), Some("1. do the thing"));
        assert_eq!(entry.text.as_deref(), Some("Here is my plan."));
    }

    #[tokio::test]
    async fn test_read_new_records_ignores_partial_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        let whole = assistant_line("done");
        std::fs::write(&path, format!("{}\n{{\"type\":\"assist", whole)).unwrap();

        let (records, pos) = read_new_records(&path, 0).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(pos as usize, whole.len() + 1);

        // Completing the line makes the record visible from the cursor.
        std::fs::write(
            &path,
            format!("{}\n{}\n", whole, assistant_line("later")),
        )
        .unwrap();
        let (records, _) = read_new_records(&path, pos).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_read_new_records_respects_baseline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        let first = assistant_line("old");
        std::fs::write(&path, format!("{}\n", first)).unwrap();
        let baseline = file_size(&path).await;

        let (records, pos) = read_new_records(&path, baseline).await.unwrap();
        assert!(records.is_empty());
        assert_eq!(pos, baseline);
    }
}
