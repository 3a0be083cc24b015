//! Append-only run logging.
//!
//! Each run writes one `ralph-<run-id>.log`. Iteration sections are
//! introduced by `=== Iteration N/TOTAL ===` headers; every raw agent
//! event line is mirrored into the current section as it is received,
//! flushed on write so a crash mid-iteration still leaves a partial,
//! inspectable log. A rate-limited retry re-emits the same-numbered
//! header, appending a second segment to the same iteration rather than
//! consuming a new number. Records are never rewritten; the offline
//! analyzer re-parses this file.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{Local, Utc};
use uuid::Uuid;

use crate::error::{RalphError, Result};

/// Generate a unique run ID in format: YYYYMMDD-HHMMSS-<short-uuid>
pub fn generate_run_id() -> String {
    let now = Utc::now();
    let uuid_short = Uuid::new_v4().to_string();
    format!("{}-{}", now.format("%Y%m%d-%H%M%S"), &uuid_short[..8])
}

/// Timestamp with local, UTC, and epoch forms, used in iteration headers
pub fn timestamp_now() -> String {
    let local = Local::now();
    let utc = Utc::now();
    let epoch = utc.timestamp_millis() as f64 / 1000.0;
    format!(
        "{} | {} | {:.3}",
        local.format("%Y-%m-%d %H:%M:%S"),
        utc.format("%Y-%m-%d %H:%M:%S UTC"),
        epoch
    )
}

/// Append-only writer for one run's log file
pub struct RunLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl RunLog {
    /// Create the log directory and open the run's log file for append
    pub fn create(log_dir: &Path, run_id: &str) -> Result<Self> {
        std::fs::create_dir_all(log_dir).map_err(RalphError::LogDir)?;
        let path = log_dir.join(format!("ralph-{}.log", run_id));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(RalphError::LogWrite)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a new section for an iteration (or a retry segment of the
    /// same iteration when called again with the same number)
    pub fn begin_iteration(&self, number: u32, total: Option<u32>) -> Result<()> {
        let total = total.map_or_else(|| "?".to_string(), |t| t.to_string());
        self.write_line(&format!(
            "\n=== Iteration {}/{} === {}",
            number,
            total,
            timestamp_now()
        ))
    }

    /// Append a loop bookkeeping message (non-JSON line)
    pub fn note(&self, msg: &str) -> Result<()> {
        self.write_line(msg)
    }

    /// Mirror one raw agent event line into the current section
    pub fn append_event(&self, raw_line: &str) -> Result<()> {
        self.write_line(raw_line.trim_end())
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let mut file = match self.file.lock() {
            Ok(f) => f,
            Err(poisoned) => poisoned.into_inner(),
        };
        writeln!(file, "{}", line).map_err(RalphError::LogWrite)?;
        file.flush().map_err(RalphError::LogWrite)
    }
}

/// Companion audit log recording consumed feedback alongside the git
/// state before and after the consuming iteration. Best-effort: callers
/// log and continue on errors here.
pub struct FeedbackAudit {
    path: PathBuf,
}

impl FeedbackAudit {
    pub fn new(log_dir: &Path, run_id: &str) -> Self {
        Self {
            path: log_dir.join(format!("feedback-{}.log", run_id)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record feedback content and git state before the iteration runs
    pub fn record_before(&self, content: &str) -> std::io::Result<()> {
        let mut file = self.open()?;
        writeln!(file, "=== {} ===", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"))?;
        writeln!(
            file,
            "git_commit_before: {}",
            git_head().as_deref().unwrap_or("unknown")
        )?;
        writeln!(file, "--- feedback content ---")?;
        write!(file, "{}", content)?;
        if !content.ends_with('\n') {
            writeln!(file)?;
        }
        writeln!(file, "---")?;
        file.flush()
    }

    /// Record git state after the feedback was processed
    pub fn record_after(&self) -> std::io::Result<()> {
        let mut file = self.open()?;
        writeln!(
            file,
            "git_commit_after: {}\n",
            git_head().as_deref().unwrap_or("unknown")
        )?;
        file.flush()
    }

    fn open(&self) -> std::io::Result<File> {
        OpenOptions::new().create(true).append(true).open(&self.path)
    }
}

/// Current git HEAD commit hash (short form), if available
fn git_head() -> Option<String> {
    let output = std::process::Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}
