//! Re-parsing of run logs written by the loop.
//!
//! A run log is append-only: `=== Iteration N/TOTAL ===` headers open
//! sections, raw JSON event lines follow, and plain non-JSON lines are
//! loop bookkeeping. A rate-limited retry re-emits the same-numbered
//! header, so same-numbered sections merge into one iteration with a
//! segment count. The parser is strictly read-only and never aborts on a
//! bad record: malformed JSON lines are skipped and counted.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use regex::Regex;
use serde_json::Value;

use crate::error::{OptimizerError, Result};

/// One tool invocation extracted from an assistant event
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub input: Value,
    /// Position in the iteration's tool-call sequence
    pub index: usize,
}

/// One iteration reassembled from its log section(s)
#[derive(Debug, Clone, Default)]
pub struct IterationRecord {
    pub number: u32,
    pub total: Option<u32>,
    pub timestamp: String,
    pub session_id: Option<String>,
    /// Appended segments: 1, plus one per backoff retry
    pub segments: u32,
    pub tool_calls: Vec<ToolCall>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Whether the final attempt ended with an error result
    pub is_error: bool,
    pub result: Option<String>,
    /// Malformed JSON lines within this iteration's sections
    pub unparseable: usize,
}

/// A fully parsed run log
#[derive(Debug, Clone)]
pub struct RunLogFile {
    pub path: PathBuf,
    pub iterations: Vec<IterationRecord>,
    /// Malformed JSON lines across the whole file
    pub unparseable_total: usize,
}

impl RunLogFile {
    pub fn error_count(&self) -> usize {
        self.iterations.iter().filter(|i| i.is_error).count()
    }
}

/// Accumulates one iteration across its segments before finalizing
#[derive(Default)]
struct SectionBuilder {
    number: u32,
    total: Option<u32>,
    timestamp: String,
    segments: u32,
    session_id: Option<String>,
    tool_calls: Vec<ToolCall>,
    assistant_input: u64,
    assistant_output: u64,
    result_input: u64,
    result_output: u64,
    result_events: u32,
    is_error: bool,
    result: Option<String>,
    unparseable: usize,
    tool_index: usize,
}

impl SectionBuilder {
    fn finish(self) -> IterationRecord {
        // Prefer the cumulative usage from result events; fall back to
        // per-message assistant usage for crashed segments without one
        let (input_tokens, output_tokens) = if self.result_events > 0 {
            (self.result_input, self.result_output)
        } else {
            (self.assistant_input, self.assistant_output)
        };
        IterationRecord {
            number: self.number,
            total: self.total,
            timestamp: self.timestamp,
            session_id: self.session_id,
            segments: self.segments,
            tool_calls: self.tool_calls,
            input_tokens,
            output_tokens,
            is_error: self.is_error,
            result: self.result,
            unparseable: self.unparseable,
        }
    }

    fn apply_event(&mut self, value: &Value) {
        match value.get("type").and_then(|t| t.as_str()) {
            Some("assistant") => {
                let message = value.get("message");
                if let Some(usage) = message.and_then(|m| m.get("usage")) {
                    self.assistant_input += u64_field(usage, "input_tokens")
                        + u64_field(usage, "cache_creation_input_tokens")
                        + u64_field(usage, "cache_read_input_tokens");
                    self.assistant_output += u64_field(usage, "output_tokens");
                }
                // Only top-level tool calls count; sub-agent calls carry a
                // parent_tool_use_id
                let is_top_level = value
                    .get("parent_tool_use_id")
                    .map_or(true, |p| p.is_null());
                let content = message
                    .and_then(|m| m.get("content"))
                    .and_then(|c| c.as_array());
                if let (true, Some(blocks)) = (is_top_level, content) {
                    for block in blocks {
                        if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                            self.tool_calls.push(ToolCall {
                                name: str_field(block, "name").unwrap_or_default(),
                                input: block.get("input").cloned().unwrap_or(Value::Null),
                                index: self.tool_index,
                            });
                            self.tool_index += 1;
                        }
                    }
                }
            }
            Some("system") | Some("init") => {
                if let Some(sid) = str_field(value, "session_id") {
                    self.session_id = Some(sid);
                }
            }
            Some("result") => {
                self.result_events += 1;
                // the final attempt's result decides the iteration outcome
                self.is_error = value
                    .get("is_error")
                    .and_then(|e| e.as_bool())
                    .unwrap_or(false);
                if let Some(text) = str_field(value, "result") {
                    self.result = Some(text);
                }
                if let Some(usage) = value.get("usage") {
                    self.result_input += u64_field(usage, "input_tokens")
                        + u64_field(usage, "cache_creation_input_tokens")
                        + u64_field(usage, "cache_read_input_tokens");
                    self.result_output += u64_field(usage, "output_tokens");
                }
            }
            _ => {}
        }
    }
}

fn u64_field(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(String::from)
}

/// Parse a run log file into iteration records
pub fn parse(path: &Path) -> Result<RunLogFile> {
    let content = std::fs::read_to_string(path)?;
    let header = Regex::new(r"^=== Iteration (\d+)/(\d+|\?) === (.+)$")
        .expect("invalid header regex");

    let mut iterations: Vec<IterationRecord> = Vec::new();
    let mut current: Option<SectionBuilder> = None;
    let mut unparseable_total = 0usize;

    for line in content.lines() {
        if let Some(caps) = header.captures(line) {
            let number: u32 = caps[1].parse().unwrap_or(0);
            let total: Option<u32> = caps[2].parse().ok();
            let timestamp = caps[3].to_string();

            match current.as_mut() {
                // retry segment of the same iteration
                Some(builder) if builder.number == number => {
                    builder.segments += 1;
                }
                _ => {
                    if let Some(done) = current.take() {
                        iterations.push(done.finish());
                    }
                    current = Some(SectionBuilder {
                        number,
                        total,
                        timestamp,
                        segments: 1,
                        ..SectionBuilder::default()
                    });
                }
            }
            continue;
        }

        if line.starts_with('{') {
            match serde_json::from_str::<Value>(line) {
                Ok(value) => {
                    if let Some(builder) = current.as_mut() {
                        builder.apply_event(&value);
                    }
                }
                Err(_) => {
                    unparseable_total += 1;
                    if let Some(builder) = current.as_mut() {
                        builder.unparseable += 1;
                    }
                }
            }
            continue;
        }

        // bookkeeping lines; "Result:" carries the final text when the
        // result event itself was not captured
        if let Some(rest) = line.strip_prefix("Result:") {
            if let Some(builder) = current.as_mut() {
                builder.result = Some(rest.trim().to_string());
            }
        }
    }

    if let Some(done) = current.take() {
        iterations.push(done.finish());
    }

    Ok(RunLogFile {
        path: path.to_path_buf(),
        iterations,
        unparseable_total,
    })
}

/// Most recently modified `ralph-*.log` in the given directory
pub fn find_latest_log(dir: &Path) -> Result<PathBuf> {
    if !dir.exists() {
        return Err(OptimizerError::NoLogsFound(dir.to_path_buf()));
    }

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with("ralph-") || !name.ends_with(".log") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
            newest = Some((modified, path));
        }
    }

    newest
        .map(|(_, p)| p)
        .ok_or_else(|| OptimizerError::NoLogsFound(dir.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_log(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    const SAMPLE: &str = r#"
=== Iteration 1/3 === 2026-01-10 09:00:00 | 2026-01-10 09:00:00 UTC | 1767862800.000
{"type":"system","subtype":"init","session_id":"sess-a"}
{"type":"assistant","message":{"usage":{"input_tokens":100,"output_tokens":20},"content":[{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"/src/lib.rs"}}]}}
{"type":"result","subtype":"success","result":"did the thing","usage":{"input_tokens":1000,"output_tokens":200}}

=== Iteration 2/3 === 2026-01-10 09:05:00 | 2026-01-10 09:05:00 UTC | 1767863100.000
{"type":"system","subtype":"init","session_id":"sess-b"}
{"type":"result","subtype":"error","is_error":true,"result":"You've hit your limit"}
Rate limited. Sleeping 5 minute(s): usage window resets at 2026-01-10 10:00:00 UTC
=== Iteration 2/3 === 2026-01-10 10:01:00 | 2026-01-10 10:01:00 UTC | 1767866460.000
{"type":"system","subtype":"init","session_id":"sess-c"}
{"type":"result","subtype":"success","result":"ok now","usage":{"input_tokens":500,"output_tokens":50}}

=== Iteration 3/3 === 2026-01-10 10:10:00 | 2026-01-10 10:10:00 UTC | 1767867000.000
{this is not valid json}
{"type":"assistant","message":{"usage":{"input_tokens":40,"output_tokens":10},"content":[]}}
"#;

    #[test]
    fn test_parses_iterations_and_numbers() {
        let dir = TempDir::new().unwrap();
        let path = write_log(&dir, "ralph-x.log", SAMPLE);
        let parsed = parse(&path).unwrap();

        let numbers: Vec<u32> = parsed.iterations.iter().map(|i| i.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(parsed.iterations[0].total, Some(3));
    }

    #[test]
    fn test_extracts_tool_calls_and_usage() {
        let dir = TempDir::new().unwrap();
        let path = write_log(&dir, "ralph-x.log", SAMPLE);
        let parsed = parse(&path).unwrap();

        let first = &parsed.iterations[0];
        assert_eq!(first.session_id.as_deref(), Some("sess-a"));
        assert_eq!(first.tool_calls.len(), 1);
        assert_eq!(first.tool_calls[0].name, "Read");
        assert_eq!(first.tool_calls[0].input["file_path"], "/src/lib.rs");
        // result-event usage wins over per-message usage
        assert_eq!(first.input_tokens, 1000);
        assert_eq!(first.output_tokens, 200);
        assert_eq!(first.result.as_deref(), Some("did the thing"));
        assert!(!first.is_error);
    }

    #[test]
    fn test_retry_segments_merge_into_one_iteration() {
        let dir = TempDir::new().unwrap();
        let path = write_log(&dir, "ralph-x.log", SAMPLE);
        let parsed = parse(&path).unwrap();

        let second = &parsed.iterations[1];
        assert_eq!(second.number, 2);
        assert_eq!(second.segments, 2);
        // the final attempt decides the outcome
        assert!(!second.is_error);
        assert_eq!(second.result.as_deref(), Some("ok now"));
        assert_eq!(second.session_id.as_deref(), Some("sess-c"));
        // usage sums across segments
        assert_eq!(second.input_tokens, 500);
    }

    #[test]
    fn test_malformed_records_counted_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = write_log(&dir, "ralph-x.log", SAMPLE);
        let parsed = parse(&path).unwrap();

        assert_eq!(parsed.unparseable_total, 1);
        let third = &parsed.iterations[2];
        assert_eq!(third.unparseable, 1);
        // crashed iteration without a result event falls back to
        // assistant usage
        assert_eq!(third.input_tokens, 40);
        assert_eq!(third.output_tokens, 10);
    }

    #[test]
    fn test_error_iteration_detected() {
        let dir = TempDir::new().unwrap();
        let log = r#"=== Iteration 1/1 === ts
{"type":"result","subtype":"error","is_error":true,"result":"Invalid API key"}
"#;
        let path = write_log(&dir, "ralph-e.log", log);
        let parsed = parse(&path).unwrap();
        assert_eq!(parsed.error_count(), 1);
        assert!(parsed.iterations[0].is_error);
    }

    #[test]
    fn test_result_note_line_used_as_fallback() {
        let dir = TempDir::new().unwrap();
        let log = r#"=== Iteration 1/1 === ts
Result: finished the refactor
"#;
        let path = write_log(&dir, "ralph-r.log", log);
        let parsed = parse(&path).unwrap();
        assert_eq!(
            parsed.iterations[0].result.as_deref(),
            Some("finished the refactor")
        );
    }

    #[test]
    fn test_sub_agent_tool_calls_excluded() {
        let dir = TempDir::new().unwrap();
        let log = r#"=== Iteration 1/1 === ts
{"type":"assistant","parent_tool_use_id":"t99","message":{"content":[{"type":"tool_use","id":"t2","name":"Read","input":{"file_path":"/a"}}]}}
{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t3","name":"Grep","input":{"pattern":"x"}}]}}
"#;
        let path = write_log(&dir, "ralph-s.log", log);
        let parsed = parse(&path).unwrap();
        let calls = &parsed.iterations[0].tool_calls;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "Grep");
    }

    #[test]
    fn test_find_latest_log() {
        let dir = TempDir::new().unwrap();
        write_log(&dir, "ralph-old.log", "x");
        std::thread::sleep(std::time::Duration::from_millis(20));
        let newest = write_log(&dir, "ralph-new.log", "y");
        write_log(&dir, "unrelated.txt", "z");

        let found = find_latest_log(dir.path()).unwrap();
        assert_eq!(found, newest);
    }

    #[test]
    fn test_find_latest_log_empty_dir() {
        let dir = TempDir::new().unwrap();
        match find_latest_log(dir.path()) {
            Err(OptimizerError::NoLogsFound(_)) => {}
            other => panic!("Expected NoLogsFound, got {:?}", other),
        }
    }
}
