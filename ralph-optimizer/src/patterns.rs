//! Detectors for wasteful behaviors in an iteration's tool-call stream.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::log_parser::{IterationRecord, ToolCall};

// Rough per-occurrence token waste used for ranking
const TOKENS_PER_REDUNDANT_READ: u64 = 500;
const TOKENS_PER_LATE_TEST: u64 = 5000;

/// A file read repeatedly within one iteration with no intervening edit
#[derive(Debug, Clone)]
pub struct RedundantRead {
    pub file_path: String,
    pub read_count: usize,
    pub wasted_reads: usize,
    pub wasted_tokens: u64,
}

/// A file read repeatedly with neither offset nor limit
#[derive(Debug, Clone)]
pub struct LargeFileRead {
    pub file_path: String,
    pub read_count: usize,
}

/// Tests run late (or never) after a pile of edits
#[derive(Debug, Clone)]
pub struct LateTestRun {
    pub edits_before_test: usize,
    /// Index of the first test command; None when no test ran at all
    pub first_test_index: Option<usize>,
    pub total_tool_calls: usize,
}

/// Aggregated finding across the analyzed iterations
#[derive(Debug, Clone, Serialize)]
pub struct Pattern {
    pub name: String,
    pub description: String,
    pub occurrences: usize,
    pub estimated_waste_tokens: u64,
    pub suggestion: String,
}

/// Finds repeated and wasteful behaviors in iteration tool-call streams.
/// The test-command heuristics are substring patterns and can be
/// extended for project-specific runners.
pub struct PatternDetector {
    test_patterns: Vec<String>,
    late_test_edit_threshold: usize,
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self {
            test_patterns: [
                "cargo test",
                "go test",
                "npm test",
                "pytest",
                "vitest",
                "verify-all",
                "test-backend",
                "test-frontend",
                "test-e2e",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            late_test_edit_threshold: 5,
        }
    }
}

impl PatternDetector {
    pub fn with_test_patterns(patterns: Vec<String>) -> Self {
        Self {
            test_patterns: patterns,
            ..Self::default()
        }
    }

    /// Files read more than once in this iteration without an edit of the
    /// same path between the reads
    pub fn find_redundant_reads(&self, iteration: &IterationRecord) -> Vec<RedundantRead> {
        let mut reads: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut edits: BTreeMap<String, Vec<usize>> = BTreeMap::new();

        for call in &iteration.tool_calls {
            let Some(path) = file_path_of(call) else {
                continue;
            };
            match call.name.as_str() {
                "Read" => reads.entry(path).or_default().push(call.index),
                "Edit" | "Write" => edits.entry(path).or_default().push(call.index),
                _ => {}
            }
        }

        let mut redundant = Vec::new();
        for (path, indices) in reads {
            if indices.len() <= 1 {
                continue;
            }
            let edit_indices = edits.get(&path).cloned().unwrap_or_default();
            let mut wasted_reads = 0;
            for pair in indices.windows(2) {
                let intervening_edit = edit_indices
                    .iter()
                    .any(|&e| pair[0] < e && e < pair[1]);
                if !intervening_edit {
                    wasted_reads += 1;
                }
            }
            if wasted_reads > 0 {
                redundant.push(RedundantRead {
                    file_path: path,
                    read_count: indices.len(),
                    wasted_reads,
                    wasted_tokens: wasted_reads as u64 * TOKENS_PER_REDUNDANT_READ,
                });
            }
        }

        redundant.sort_by(|a, b| b.wasted_tokens.cmp(&a.wasted_tokens));
        redundant
    }

    /// Files read multiple times with neither offset nor limit
    pub fn find_large_file_reads(&self, iteration: &IterationRecord) -> Vec<LargeFileRead> {
        let mut unbounded: BTreeMap<String, usize> = BTreeMap::new();
        for call in &iteration.tool_calls {
            if call.name != "Read" {
                continue;
            }
            let has_offset = call.input.get("offset").is_some();
            let has_limit = call.input.get("limit").is_some();
            if has_offset || has_limit {
                continue;
            }
            if let Some(path) = file_path_of(call) {
                *unbounded.entry(path).or_insert(0) += 1;
            }
        }

        let mut results: Vec<LargeFileRead> = unbounded
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(file_path, read_count)| LargeFileRead {
                file_path,
                read_count,
            })
            .collect();
        results.sort_by(|a, b| b.read_count.cmp(&a.read_count));
        results
    }

    /// Tests first run only after the edit threshold, or never despite edits
    pub fn find_late_test_run(&self, iteration: &IterationRecord) -> Option<LateTestRun> {
        let mut edit_count = 0;
        let mut first_test_index = None;

        for (i, call) in iteration.tool_calls.iter().enumerate() {
            match call.name.as_str() {
                "Edit" | "Write" => edit_count += 1,
                "Bash" => {
                    let command = call
                        .input
                        .get("command")
                        .and_then(|c| c.as_str())
                        .unwrap_or("");
                    if self.test_patterns.iter().any(|p| command.contains(p)) {
                        first_test_index = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }

        match first_test_index {
            None if edit_count > 0 => Some(LateTestRun {
                edits_before_test: edit_count,
                first_test_index: None,
                total_tool_calls: iteration.tool_calls.len(),
            }),
            Some(idx) if edit_count >= self.late_test_edit_threshold => Some(LateTestRun {
                edits_before_test: edit_count,
                first_test_index: Some(idx),
                total_tool_calls: iteration.tool_calls.len(),
            }),
            _ => None,
        }
    }

    /// Run all detectors across the analyzed iterations and aggregate
    pub fn detect_all(&self, iterations: &[IterationRecord]) -> Vec<Pattern> {
        let mut patterns = Vec::new();

        let mut total_redundant_reads = 0usize;
        let mut total_redundant_tokens = 0u64;
        let mut top_files: BTreeMap<String, usize> = BTreeMap::new();
        let mut late_test_iterations = 0usize;

        for iteration in iterations {
            for r in self.find_redundant_reads(iteration) {
                total_redundant_reads += r.wasted_reads;
                total_redundant_tokens += r.wasted_tokens;
                *top_files.entry(r.file_path).or_insert(0) += r.read_count;
            }
            if self.find_late_test_run(iteration).is_some() {
                late_test_iterations += 1;
            }
        }

        if total_redundant_reads > 0 {
            let mut ranked: Vec<(String, usize)> = top_files.into_iter().collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1));
            let file_list = ranked
                .iter()
                .take(3)
                .map(|(path, count)| {
                    let name = Path::new(path)
                        .file_name()
                        .map_or_else(|| path.clone(), |n| n.to_string_lossy().to_string());
                    format!("{} ({}x)", name, count)
                })
                .collect::<Vec<_>>()
                .join(", ");
            patterns.push(Pattern {
                name: "Redundant File Reads".to_string(),
                description: format!(
                    "{} redundant reads across {} iteration(s). Top: {}",
                    total_redundant_reads,
                    iterations.len(),
                    file_list
                ),
                occurrences: total_redundant_reads,
                estimated_waste_tokens: total_redundant_tokens,
                suggestion:
                    "Pre-load frequently read files into the prompt or use summaries"
                        .to_string(),
            });
        }

        if late_test_iterations > 0 {
            patterns.push(Pattern {
                name: "Late Test Execution".to_string(),
                description: format!(
                    "{} iteration(s) ran tests only after {}+ edits, or not at all",
                    late_test_iterations, self.late_test_edit_threshold
                ),
                occurrences: late_test_iterations,
                estimated_waste_tokens: late_test_iterations as u64 * TOKENS_PER_LATE_TEST,
                suggestion: "Run tests after every 2-3 edits to catch issues sooner".to_string(),
            });
        }

        patterns.sort_by(|a, b| b.estimated_waste_tokens.cmp(&a.estimated_waste_tokens));
        patterns
    }
}

fn file_path_of(call: &ToolCall) -> Option<String> {
    call.input
        .get("file_path")
        .and_then(|p| p.as_str())
        .filter(|p| !p.is_empty())
        .map(String::from)
}
