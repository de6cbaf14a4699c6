//! Transcript (per-session JSONL) parsing.
//!
//! Transcript lines look like:
//! ```text
//! {"uuid":"..","parentUuid":"..","timestamp":"2026-01-25T16:42:56.852Z","type":"user",
//!  "message":{"role":"user","content":"hello"},"cwd":"/Users/foo/app"}
//! ```
//! `content` is either a plain string or an array of blocks. Only `text` and
//! `thinking` blocks become [`ChatTurn`]s; tool calls, tool results and any
//! future block types are ignored.

use chrono::DateTime;
use serde::Deserialize;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::error::ParseError;
use crate::paths::normalize_path;
use crate::types::{ChatTurn, Role, TurnKind, UserInput};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTranscriptLine {
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default, rename = "type")]
    entry_type: Option<String>,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    is_meta: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Option<RawContent>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<RawBlock>),
    Other(serde_json::Value),
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    #[serde(default, rename = "type")]
    block_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

/// Everything one transcript line contributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptRecord {
    /// Unix milliseconds, if the line carried a parseable timestamp.
    pub timestamp: Option<i64>,
    /// Embedded project path (`project`, else `cwd`).
    pub project: Option<String>,
    pub turns: Vec<ChatTurn>,
}

/// Aggregate view of a whole transcript, used by the directory scanner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptSummary {
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
    pub turn_count: usize,
    /// User-authored text turns, in file order.
    pub inputs: Vec<UserInput>,
    /// First embedded project path found in the file.
    pub project: Option<String>,
}

impl TranscriptSummary {
    fn absorb(&mut self, record: TranscriptRecord) {
        if self.project.is_none() {
            self.project = record.project.filter(|p| !p.trim().is_empty()).map(|p| normalize_path(&p));
        }
        if let Some(ts) = record.timestamp {
            self.first_timestamp = Some(self.first_timestamp.map_or(ts, |first| first.min(ts)));
            self.last_timestamp = Some(self.last_timestamp.map_or(ts, |last| last.max(ts)));
        }
        self.turn_count += record.turns.len();
        for turn in record.turns {
            if turn.role == Role::User && turn.kind == TurnKind::Text {
                self.inputs.push(UserInput {
                    display: turn.text,
                    timestamp: turn.timestamp,
                });
            }
        }
    }
}

/// Parse an RFC 3339 timestamp into Unix milliseconds.
pub fn parse_iso_millis(raw: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.timestamp_millis())
}

fn role_of(entry_type: &str) -> Option<Role> {
    match entry_type {
        "user" => Some(Role::User),
        "assistant" => Some(Role::Assistant),
        _ => None,
    }
}

/// Parse one transcript line. Returns `None` only for lines that are not JSON.
pub fn parse_transcript_line(line: &str) -> Option<TranscriptRecord> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let raw: RawTranscriptLine = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(error = %e, "Skipping malformed transcript line");
            return None;
        }
    };

    let timestamp = raw.timestamp.as_deref().and_then(parse_iso_millis);
    let mut record = TranscriptRecord {
        timestamp,
        project: raw.project.or(raw.cwd),
        turns: Vec::new(),
    };

    let (Some(ts), Some(role)) = (timestamp, raw.entry_type.as_deref().and_then(role_of)) else {
        return Some(record);
    };
    if raw.is_meta == Some(true) {
        return Some(record);
    }

    let turn = |text: String, kind: TurnKind| ChatTurn {
        role,
        text,
        timestamp: ts,
        kind,
        uuid: raw.uuid.clone(),
    };

    match raw.message.and_then(|m| m.content) {
        Some(RawContent::Text(text)) if !text.trim().is_empty() => {
            record.turns.push(turn(text, TurnKind::Text));
        }
        Some(RawContent::Blocks(blocks)) => {
            for block in blocks {
                match (block.block_type.as_deref(), block.text, block.thinking) {
                    (Some("text"), Some(text), _) if !text.trim().is_empty() => {
                        record.turns.push(turn(text, TurnKind::Text));
                    }
                    (Some("thinking"), _, Some(thinking)) if !thinking.trim().is_empty() => {
                        record.turns.push(turn(thinking, TurnKind::Reasoning));
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    Some(record)
}

/// Turns produced by a batch of lines, oldest line first.
pub fn turns_from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<ChatTurn> {
    let mut turns: Vec<ChatTurn> = lines
        .into_iter()
        .filter_map(parse_transcript_line)
        .flat_map(|record| record.turns)
        .collect();
    turns.sort_by_key(|turn| turn.timestamp);
    turns
}

/// Line reader that decodes each line on its own, replacing invalid UTF-8,
/// so one corrupt line never fails the rest of the file.
struct LossyLines {
    reader: BufReader<File>,
    buf: Vec<u8>,
}

impl LossyLines {
    async fn open(path: &Path) -> Result<Self, ParseError> {
        let file = File::open(path).await.map_err(|e| ParseError::io(path, e))?;
        Ok(Self {
            reader: BufReader::new(file),
            buf: Vec::new(),
        })
    }

    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.buf);
        Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
    }
}

/// Read every chat turn of a transcript, sorted ascending by timestamp.
pub async fn read_transcript(path: &Path) -> Result<Vec<ChatTurn>, ParseError> {
    let mut lines = LossyLines::open(path).await?;

    let mut turns = Vec::new();
    let mut line_number = 0usize;
    while let Some(line) = lines.next_line().await.map_err(|e| ParseError::io(path, e))? {
        line_number += 1;
        match parse_transcript_line(&line) {
            Some(record) => turns.extend(record.turns),
            None if !line.trim().is_empty() => {
                debug!(path = %path.display(), line = line_number, "Skipped transcript line");
            }
            None => {}
        }
    }

    turns.sort_by_key(|turn| turn.timestamp);
    Ok(turns)
}

/// Single pass over a transcript collecting what the scanner needs.
pub async fn summarize_transcript(path: &Path) -> Result<TranscriptSummary, ParseError> {
    let mut lines = LossyLines::open(path).await?;

    let mut summary = TranscriptSummary::default();
    while let Some(line) = lines.next_line().await.map_err(|e| ParseError::io(path, e))? {
        if let Some(record) = parse_transcript_line(&line) {
            summary.absorb(record);
        }
    }
    summary.inputs.sort_by_key(|input| input.timestamp);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const USER_LINE: &str = r#"{"uuid":"u1","parentUuid":null,"timestamp":"2026-01-25T16:42:56.000Z","type":"user","message":{"role":"user","content":"hello"},"cwd":"/Users/foo/app"}"#;
    const ASSISTANT_LINE: &str = r#"{"uuid":"a1","parentUuid":"u1","timestamp":"2026-01-25T16:42:58.000Z","type":"assistant","message":{"role":"assistant","content":[{"type":"thinking","thinking":"let me see"},{"type":"text","text":"hi there"},{"type":"tool_use","id":"t1","name":"Read","input":{}}]}}"#;

    #[test]
    fn test_parse_iso_millis() {
        assert_eq!(parse_iso_millis("1970-01-01T00:00:01.500Z"), Some(1_500));
        assert_eq!(parse_iso_millis("1970-01-01T01:00:00+01:00"), Some(0));
        assert_eq!(parse_iso_millis("yesterday"), None);
    }

    #[test]
    fn test_parse_user_string_content() {
        let record = parse_transcript_line(USER_LINE).unwrap();
        assert_eq!(record.project.as_deref(), Some("/Users/foo/app"));
        assert_eq!(record.turns.len(), 1);
        assert_eq!(record.turns[0].role, Role::User);
        assert_eq!(record.turns[0].text, "hello");
        assert_eq!(record.turns[0].kind, TurnKind::Text);
        assert_eq!(record.turns[0].uuid.as_deref(), Some("u1"));
    }

    #[test]
    fn test_parse_assistant_blocks() {
        let record = parse_transcript_line(ASSISTANT_LINE).unwrap();
        let kinds: Vec<_> = record.turns.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TurnKind::Reasoning, TurnKind::Text]);
        assert_eq!(record.turns[1].text, "hi there");
    }

    #[test]
    fn test_project_field_wins_over_cwd() {
        let line = r#"{"timestamp":"2026-01-25T16:42:56Z","type":"user","message":{"content":"x"},"project":"/real","cwd":"/elsewhere"}"#;
        assert_eq!(parse_transcript_line(line).unwrap().project.as_deref(), Some("/real"));
    }

    #[test]
    fn test_tool_result_and_meta_lines_yield_no_turns() {
        let tool_result = r#"{"timestamp":"2026-01-25T16:42:56Z","type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"}]}}"#;
        let meta = r#"{"timestamp":"2026-01-25T16:42:56Z","type":"user","isMeta":true,"message":{"content":"caveat"}}"#;
        let summary_line = r#"{"type":"summary","summary":"Fix bug"}"#;
        assert!(parse_transcript_line(tool_result).unwrap().turns.is_empty());
        assert!(parse_transcript_line(meta).unwrap().turns.is_empty());
        assert!(parse_transcript_line(summary_line).unwrap().turns.is_empty());
        assert!(parse_transcript_line("{not json").is_none());
    }

    #[test]
    fn test_undated_line_yields_no_turns() {
        let line = r#"{"type":"user","message":{"content":"hello"}}"#;
        let record = parse_transcript_line(line).unwrap();
        assert!(record.timestamp.is_none());
        assert!(record.turns.is_empty());
    }

    #[tokio::test]
    async fn test_read_transcript_sorted() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "{}", ASSISTANT_LINE).unwrap();
        writeln!(f, "garbage line").unwrap();
        writeln!(f, "{}", USER_LINE).unwrap();
        f.flush().unwrap();

        let turns = read_transcript(f.path()).await.unwrap();
        let texts: Vec<_> = turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "let me see", "hi there"]);
    }

    #[tokio::test]
    async fn test_read_transcript_missing_file() {
        let err = read_transcript(Path::new("/nonexistent/abc.jsonl")).await.unwrap_err();
        assert!(matches!(err, ParseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_summarize_transcript() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "{}", USER_LINE).unwrap();
        writeln!(f, "{}", ASSISTANT_LINE).unwrap();
        f.flush().unwrap();

        let summary = summarize_transcript(f.path()).await.unwrap();
        assert_eq!(summary.turn_count, 3);
        assert_eq!(summary.inputs.len(), 1);
        assert_eq!(summary.inputs[0].display, "hello");
        assert_eq!(summary.project.as_deref(), Some("/Users/foo/app"));
        assert_eq!(summary.first_timestamp, parse_iso_millis("2026-01-25T16:42:56Z"));
        assert_eq!(summary.last_timestamp, parse_iso_millis("2026-01-25T16:42:58Z"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_skipped_alone() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "{}", USER_LINE).unwrap();
        f.write_all(b"{\"type\":\"user\",\xff\xfe broken}\n").unwrap();
        writeln!(f, "{}", ASSISTANT_LINE).unwrap();
        f.flush().unwrap();

        let turns = read_transcript(f.path()).await.unwrap();
        let texts: Vec<_> = turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "let me see", "hi there"]);

        let summary = summarize_transcript(f.path()).await.unwrap();
        assert_eq!(summary.turn_count, 3);
        assert_eq!(summary.inputs.len(), 1);
    }
}
