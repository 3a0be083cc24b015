//! One agent invocation per call: spawn the process, stream its output,
//! classify how it ended.
//!
//! The runner never waits out a rate limit itself. It reports the parsed
//! reset time in its result and leaves the wait decision to the loop
//! controller and the backoff scheduler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, info, warn};

use crate::backoff::{is_rate_limited, is_server_error, parse_reset_marker};
use crate::config::Config;
use crate::error::{RalphError, Result};
use crate::events::{AgentEvent, ResultEvent, TokenUsage};
use crate::process::AgentProcess;
use crate::run_log::RunLog;

/// Classified outcome of one agent invocation
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Process exited zero without an error result
    Completed,
    /// Process ran but failed; the loop moves on to the next iteration
    Failed { exit_code: Option<i32> },
    /// The usage window is exhausted; reset instant if one was parseable
    RateLimited { reset: Option<DateTime<Utc>> },
    /// Transient API server error (500/529/overloaded class)
    ServerError,
}

/// Result of one runner invocation. Built once per call, handed to the
/// loop controller by value, never shared or mutated afterward.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub outcome: RunOutcome,
    /// Ordered parsed event stream (the raw lines live in the run log)
    pub events: Vec<AgentEvent>,
    pub session_id: Option<String>,
    /// Final result text from the agent, error message on failure
    pub result_text: Option<String>,
    pub usage: Option<TokenUsage>,
    pub elapsed: Duration,
}

impl RunResult {
    /// Bare result with the given outcome, used by mock agents in tests
    pub fn with_outcome(outcome: RunOutcome) -> Self {
        Self {
            outcome,
            events: Vec::new(),
            session_id: None,
            result_text: None,
            usage: None,
            elapsed: Duration::ZERO,
        }
    }
}

/// Trait for agent implementations (real CLI or mock)
#[async_trait]
pub trait Agent: Send + Sync {
    /// Run the agent once with the given prompt
    async fn run(&self, prompt: &str) -> Result<RunResult>;
}

/// Production agent that spawns the configured CLI, one process per call
pub struct CliAgent {
    config: Arc<Config>,
    log: Arc<RunLog>,
}

impl CliAgent {
    pub fn new(config: Arc<Config>, log: Arc<RunLog>) -> Self {
        Self { config, log }
    }
}

#[async_trait]
impl Agent for CliAgent {
    async fn run(&self, prompt: &str) -> Result<RunResult> {
        let started = Instant::now();

        debug!(
            "spawning agent: {} {:?}",
            self.config.agent_path, self.config.agent_args
        );
        let mut process = AgentProcess::spawn_with_stdin(
            &self.config.agent_path,
            &self.config.agent_args,
            prompt,
        )
        .await?;

        let stdout = process.stdout.take().expect("stdout not available");
        let stderr = process.stderr.take().expect("stderr not available");

        let log = Arc::clone(&self.log);
        let stdout_handle = tokio::spawn(consume_events(log, stdout));
        let stderr_handle = tokio::spawn(drain_stderr(stderr));

        let status = process.wait().await?;

        let (stdout_res, stderr_res) = tokio::join!(stdout_handle, stderr_handle);
        let summary = match stdout_res {
            Ok(summary) => summary?,
            Err(e) => return Err(RalphError::ProcessIo(std::io::Error::other(e))),
        };
        let stderr_text = stderr_res.unwrap_or_default();
        if !stderr_text.trim().is_empty() {
            warn!("agent stderr: {}", stderr_text.trim());
        }

        let exit_code = status.code();
        let outcome = classify(status.success(), exit_code, summary.final_result.as_ref());
        info!("agent exited ({:?}), outcome {:?}", exit_code, outcome);

        Ok(RunResult {
            outcome,
            events: summary.events,
            session_id: summary.session_id,
            result_text: summary.final_result.as_ref().and_then(|r| r.result.clone()),
            usage: summary.final_result.map(|r| r.usage),
            elapsed: started.elapsed(),
        })
    }
}

/// What the stdout monitor task collects over one process lifetime
#[derive(Default)]
struct StreamSummary {
    events: Vec<AgentEvent>,
    session_id: Option<String>,
    final_result: Option<ResultEvent>,
}

/// Read JSONL events from stdout, mirroring every raw line to the run
/// log as it arrives. Unparseable lines are still logged; only a failed
/// log write aborts the invocation.
async fn consume_events<R: AsyncRead + Unpin>(
    log: Arc<RunLog>,
    reader: BufReader<R>,
) -> Result<StreamSummary> {
    let mut summary = StreamSummary::default();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await.map_err(RalphError::ProcessIo)? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        log.append_event(trimmed)?;

        match AgentEvent::parse(trimmed) {
            Ok(event) => {
                match &event {
                    AgentEvent::Init { session_id } => {
                        if let Some(sid) = session_id {
                            debug!("captured session id: {}", sid);
                            summary.session_id = Some(sid.clone());
                        }
                    }
                    AgentEvent::Result(res) => {
                        if let Some(sid) = &res.session_id {
                            summary.session_id = Some(sid.clone());
                        }
                        summary.final_result = Some(res.clone());
                    }
                    _ => {
                        debug!("event: {}", event.event_type());
                    }
                }
                summary.events.push(event);
            }
            Err(e) => {
                debug!("skipping unparseable event line: {}", e);
            }
        }
    }

    Ok(summary)
}

/// stderr is plain informational text; collect it for a single warning
async fn drain_stderr<R: AsyncRead + Unpin>(reader: BufReader<R>) -> String {
    let mut collected = String::new();
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        collected.push_str(&line);
        collected.push('\n');
    }
    collected
}

/// Map exit status and final result event to an outcome.
///
/// An error result is inspected for the rate-limit marker first, then the
/// transient server-error patterns; anything else is an ordinary agent
/// failure. Without an error result the exit code decides.
fn classify(success: bool, exit_code: Option<i32>, final_result: Option<&ResultEvent>) -> RunOutcome {
    if let Some(res) = final_result {
        if res.is_error {
            let text = res.result.as_deref().unwrap_or("");
            if is_rate_limited(text) {
                let reset = parse_reset_marker(text).map(|spec| spec.next_occurrence(Utc::now()));
                return RunOutcome::RateLimited { reset };
            }
            if is_server_error(text) {
                return RunOutcome::ServerError;
            }
            return RunOutcome::Failed { exit_code };
        }
    }
    if success {
        RunOutcome::Completed
    } else {
        RunOutcome::Failed { exit_code }
    }
}
