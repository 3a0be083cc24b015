//! Report generation: human summary, detailed per-iteration view, JSON.

use colored::Colorize;
use serde_json::json;

use crate::cost::CostBreakdown;
use crate::log_parser::{IterationRecord, RunLogFile, ToolCall};
use crate::patterns::Pattern;

/// Format token count with K/M suffix
pub fn format_tokens(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

/// Truncate a string to a maximum length
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len.saturating_sub(3)])
    }
}

/// Short one-line summary of a tool call's input
fn summarize_input(call: &ToolCall) -> String {
    let input = &call.input;
    match call.name.as_str() {
        "Read" | "Edit" | "Write" => input
            .get("file_path")
            .and_then(|p| p.as_str())
            .map_or_else(|| "(no path)".to_string(), |p| base_name(p)),
        "Bash" => {
            let cmd = input.get("command").and_then(|c| c.as_str()).unwrap_or("");
            truncate(cmd, 60)
        }
        "Grep" | "Glob" => {
            let pattern = input.get("pattern").and_then(|p| p.as_str()).unwrap_or("");
            format!("\"{}\"", pattern)
        }
        "Task" => input
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or("")
            .to_string(),
        _ => truncate(&input.to_string(), 60),
    }
}

fn base_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map_or_else(|| path.to_string(), |n| n.to_string_lossy().to_string())
}

/// Generates reports from analysis results
pub struct Reporter;

impl Reporter {
    /// Human-readable summary of the whole analyzed window
    pub fn summary(
        &self,
        log: &RunLogFile,
        costs: &[CostBreakdown],
        patterns: &[Pattern],
    ) -> String {
        let mut lines = vec![
            "Ralph Optimizer Report".bold().to_string(),
            "=".repeat(50),
            format!("Log: {}", log.path.display()),
            format!("Iterations analyzed: {}", log.iterations.len()),
        ];

        let total_cost: f64 = costs.iter().map(|c| c.estimated_cost_usd).sum();
        let total_input: u64 = costs.iter().map(|c| c.input_tokens).sum();
        let total_output: u64 = costs.iter().map(|c| c.output_tokens).sum();
        lines.push(format!("Total estimated cost: ${:.2}", total_cost));
        lines.push(format!(
            "Total tokens: {} input, {} output",
            format_tokens(total_input),
            format_tokens(total_output)
        ));

        let error_count = log.error_count();
        if error_count > 0 {
            lines.push(format!(
                "Error iterations: {}/{}",
                error_count.to_string().red(),
                log.iterations.len()
            ));
        }
        if log.unparseable_total > 0 {
            lines.push(format!(
                "Unparseable records: {} (skipped)",
                log.unparseable_total.to_string().yellow()
            ));
        }
        lines.push(String::new());

        if !costs.is_empty() {
            lines.push("Cost Per Iteration:".bold().to_string());
            for (iteration, cost) in log.iterations.iter().zip(costs) {
                let session = iteration
                    .session_id
                    .as_deref()
                    .map_or_else(|| "-".to_string(), |s| truncate(s, 11));
                let err = if iteration.is_error { " [ERROR]" } else { "" };
                let retries = if iteration.segments > 1 {
                    format!(" ({} segments)", iteration.segments)
                } else {
                    String::new()
                };
                lines.push(format!(
                    "  {:>3}. {} ${:.2} ({} tokens){}{}",
                    iteration.number,
                    session.dimmed(),
                    cost.estimated_cost_usd,
                    format_tokens(cost.total_tokens()),
                    err.red(),
                    retries.dimmed()
                ));
            }
            lines.push(String::new());
        }

        let mut merged_tools: std::collections::BTreeMap<&str, usize> = Default::default();
        for cost in costs {
            for (tool, count) in &cost.by_tool {
                *merged_tools.entry(tool.as_str()).or_insert(0) += count;
            }
        }
        if !merged_tools.is_empty() {
            let total_calls: usize = merged_tools.values().sum();
            lines.push(
                format!("Tool Call Distribution ({} total):", total_calls)
                    .bold()
                    .to_string(),
            );
            let mut ranked: Vec<(&str, usize)> = merged_tools.into_iter().collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1));
            for (tool, count) in ranked.into_iter().take(10) {
                let pct = count as f64 / total_calls as f64 * 100.0;
                lines.push(format!("  {:20} {:4} ({:.0}%)", tool, count, pct));
            }
            lines.push(String::new());
        }

        if patterns.is_empty() {
            lines.push("Recommendations:".bold().to_string());
            lines.push("  No significant waste patterns detected.".to_string());
        } else {
            lines.push("Detected Patterns:".bold().to_string());
            for (i, p) in patterns.iter().enumerate() {
                lines.push(format!(
                    "  {}. {} ({} occurrences, ~{} wasted)",
                    i + 1,
                    p.name.yellow(),
                    p.occurrences,
                    format_tokens(p.estimated_waste_tokens)
                ));
                lines.push(format!("     {}", p.description));
                lines.push(format!("     -> {}", p.suggestion.green()));
            }
        }
        lines.push(String::new());

        lines.join("\n")
    }

    /// Detailed view of one iteration
    pub fn detailed(&self, iteration: &IterationRecord, cost: &CostBreakdown) -> String {
        let mut lines = vec![
            format!(
                "Iteration {} ({})",
                iteration.number,
                iteration.session_id.as_deref().unwrap_or("no session")
            ),
            format!("  Input tokens:  {}", format_tokens(iteration.input_tokens)),
            format!("  Output tokens: {}", format_tokens(iteration.output_tokens)),
            format!("  Estimated cost: ${:.2}", cost.estimated_cost_usd),
            format!("  Tool calls: {}", iteration.tool_calls.len()),
            format!("  Segments: {}", iteration.segments),
        ];

        if !iteration.tool_calls.is_empty() {
            lines.push("  Tool call sequence:".to_string());
            for call in iteration.tool_calls.iter().take(50) {
                lines.push(format!(
                    "    [{:3}] {}: {}",
                    call.index,
                    call.name,
                    summarize_input(call)
                ));
            }
            if iteration.tool_calls.len() > 50 {
                lines.push(format!(
                    "    ... and {} more",
                    iteration.tool_calls.len() - 50
                ));
            }
        }

        lines.join("\n")
    }

    /// Machine-readable report
    pub fn json(
        &self,
        log: &RunLogFile,
        costs: &[CostBreakdown],
        patterns: &[Pattern],
    ) -> String {
        let report = json!({
            "log_path": log.path.display().to_string(),
            "iterations": log.iterations.len(),
            "total_cost_usd": costs.iter().map(|c| c.estimated_cost_usd).sum::<f64>(),
            "total_input_tokens": costs.iter().map(|c| c.input_tokens).sum::<u64>(),
            "total_output_tokens": costs.iter().map(|c| c.output_tokens).sum::<u64>(),
            "error_count": log.error_count(),
            "unparseable_records": log.unparseable_total,
            "per_iteration": log.iterations.iter().zip(costs).map(|(it, cost)| json!({
                "iteration": it.number,
                "session_id": it.session_id,
                "segments": it.segments,
                "is_error": it.is_error,
                "cost_usd": cost.estimated_cost_usd,
                "input_tokens": cost.input_tokens,
                "output_tokens": cost.output_tokens,
                "tool_calls": it.tool_calls.len(),
            })).collect::<Vec<_>>(),
            "patterns": patterns,
        });
        serde_json::to_string_pretty(&report).unwrap_or_else(|_| "{}".to_string())
    }
}
