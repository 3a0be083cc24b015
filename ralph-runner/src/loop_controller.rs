//! The loop controller: signal check, prompt assembly, agent invocation,
//! outcome handling, backoff waits, and per-iteration bookkeeping.
//!
//! One logical control thread drives the loop. The only suspension points
//! are the agent invocation itself and the cancellable backoff wait,
//! which polls the stop marker at a bounded interval so a requested
//! shutdown never blocks behind a long sleep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::backoff;
use crate::config::Config;
use crate::control::{ControlSignal, ControlStore, ControlWatcher};
use crate::error::{RalphError, Result};
use crate::run_log::{FeedbackAudit, RunLog};
use crate::runner::{Agent, RunOutcome};

/// How the run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopResult {
    /// The iteration budget was exhausted
    Completed { iterations: u32 },
    /// The stop marker was observed; bookkeeping was finished first
    Stopped { iterations: u32 },
}

/// Outcome of a cancellable wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    Elapsed,
    StopRequested,
}

/// Drives iterations against the agent until the budget runs out or a
/// stop is requested
pub struct LoopController<A: Agent, S: ControlStore> {
    config: Arc<Config>,
    agent: A,
    watcher: ControlWatcher<S>,
    log: Arc<RunLog>,
    audit: Option<FeedbackAudit>,
}

impl<A: Agent, S: ControlStore> LoopController<A, S> {
    pub fn new(
        config: Arc<Config>,
        agent: A,
        watcher: ControlWatcher<S>,
        log: Arc<RunLog>,
        audit: Option<FeedbackAudit>,
    ) -> Self {
        Self {
            config,
            agent,
            watcher,
            log,
            audit,
        }
    }

    /// Run the loop to a terminal state.
    ///
    /// A rate-limited or server-error attempt retries the same iteration
    /// slot; it made no forward progress and does not consume budget.
    /// Launch failures and log-write failures escalate as errors.
    pub async fn run(&self) -> Result<LoopResult> {
        let total = self.config.max_iterations;
        let mut iterations_done: u32 = 0;

        loop {
            if let Some(max) = total {
                if iterations_done >= max {
                    self.note(&format!("Completed {} iterations", max))?;
                    return Ok(LoopResult::Completed {
                        iterations: iterations_done,
                    });
                }
            }

            // Let the external script populate the feedback file before
            // signals are derived for this cycle
            self.run_fetch_script().await?;

            let pending_feedback = match self.watcher.check() {
                ControlSignal::StopRequested => {
                    self.note(&format!(
                        "Stop marker found, stopping after {} iteration(s)",
                        iterations_done
                    ))?;
                    return Ok(LoopResult::Stopped {
                        iterations: iterations_done,
                    });
                }
                ControlSignal::Feedback(text) => Some(text),
                ControlSignal::None => None,
            };

            let slot = iterations_done + 1;
            let prompt = self.assemble_prompt(pending_feedback.as_deref())?;

            self.log.begin_iteration(slot, total)?;
            match total {
                Some(max) => info!("Starting iteration {}/{}", slot, max),
                None => info!("Starting iteration {}", slot),
            }

            if let (Some(audit), Some(feedback)) = (&self.audit, &pending_feedback) {
                if let Err(e) = audit.record_before(feedback) {
                    warn!("feedback audit write failed: {}", e);
                }
            }

            let mut server_attempt: u32 = 0;
            let mut server_retry_start: Option<Instant> = None;

            // Attempt loop for this slot; only completed/failed leave it
            loop {
                let result = self.agent.run(&prompt).await?;

                if let Some(text) = &result.result_text {
                    self.note(&format!("Result: {}", text))?;
                }

                match result.outcome {
                    RunOutcome::Completed => {
                        if pending_feedback.is_some() {
                            match self.watcher.consume_feedback() {
                                Ok(()) => {
                                    if let Some(audit) = &self.audit {
                                        if let Err(e) = audit.record_after() {
                                            warn!("feedback audit write failed: {}", e);
                                        }
                                    }
                                }
                                Err(e) => warn!("failed to clear feedback file: {}", e),
                            }
                        }
                        debug!("iteration {} completed", slot);
                        iterations_done = slot;
                        break;
                    }
                    RunOutcome::Failed { exit_code } => {
                        // Feedback stays on disk for the next attempt
                        let code = exit_code.map_or("signal".to_string(), |c| c.to_string());
                        self.note(&format!("Iteration {} failed (exit {})", slot, code))?;
                        iterations_done = slot;
                        break;
                    }
                    RunOutcome::RateLimited { reset } => {
                        let plan = backoff::plan(reset, Utc::now(), &self.config.backoff);
                        self.note(&format!(
                            "Rate limited. Sleeping {} minute(s): {}",
                            plan.wait.as_secs() / 60,
                            plan.reason
                        ))?;
                        if self.wait_or_stop(plan.wait).await == WaitOutcome::StopRequested {
                            self.note("Stop marker found during backoff wait, stopping")?;
                            return Ok(LoopResult::Stopped {
                                iterations: iterations_done,
                            });
                        }
                        // Same slot, new segment
                        self.log.begin_iteration(slot, total)?;
                        info!("Retrying iteration {} after rate limit", slot);
                    }
                    RunOutcome::ServerError => {
                        let retry_start = *server_retry_start.get_or_insert_with(Instant::now);
                        let delay =
                            backoff::server_error_delay(server_attempt, &self.config.backoff);
                        let budget =
                            Duration::from_secs(self.config.backoff.max_retry_duration_secs);
                        if retry_start.elapsed() + delay > budget {
                            self.note(&format!(
                                "Server error retries exceeded {}h, recording iteration {} as failed",
                                budget.as_secs() / 3600,
                                slot
                            ))?;
                            iterations_done = slot;
                            break;
                        }
                        server_attempt += 1;
                        self.note(&format!(
                            "API server error (attempt {}). Retrying in {}s",
                            server_attempt,
                            delay.as_secs()
                        ))?;
                        if self.wait_or_stop(delay).await == WaitOutcome::StopRequested {
                            self.note("Stop marker found during backoff wait, stopping")?;
                            return Ok(LoopResult::Stopped {
                                iterations: iterations_done,
                            });
                        }
                        self.log.begin_iteration(slot, total)?;
                        info!("Retrying iteration {} after server error", slot);
                    }
                }
            }
        }
    }

    /// Read the prompt file fresh (it may have been edited between
    /// iterations) and prepend any pending feedback
    fn assemble_prompt(&self, feedback: Option<&str>) -> Result<String> {
        let base = std::fs::read_to_string(&self.config.prompt_file).map_err(|source| {
            RalphError::PromptFile {
                path: self.config.prompt_file.clone(),
                source,
            }
        })?;
        Ok(match feedback {
            Some(fb) => format!("{}\n\n{}", fb.trim_end(), base),
            None => base,
        })
    }

    /// Sleep in bounded chunks, aborting early when a stop is requested
    async fn wait_or_stop(&self, total: Duration) -> WaitOutcome {
        let poll = Duration::from_secs(self.config.backoff.stop_poll_interval_secs.max(1));
        let mut remaining = total;
        loop {
            if self.watcher.stop_requested() {
                return WaitOutcome::StopRequested;
            }
            if remaining.is_zero() {
                return WaitOutcome::Elapsed;
            }
            let chunk = remaining.min(poll);
            tokio::time::sleep(chunk).await;
            remaining = remaining.saturating_sub(chunk);
        }
    }

    /// Run the optional feedback-fetch script. Logs its result but never
    /// fails or blocks the loop (30s cap).
    async fn run_fetch_script(&self) -> Result<()> {
        let Some(script) = &self.config.fetch_feedback_script else {
            return Ok(());
        };
        if !script.exists() {
            return self.note(&format!("Feedback: {} not found, skipping", script.display()));
        }
        let output = tokio::time::timeout(
            Duration::from_secs(30),
            tokio::process::Command::new(script).output(),
        )
        .await;
        match output {
            Ok(Ok(out)) => match out.status.code() {
                Some(0) => self.note(&format!(
                    "Feedback: {}",
                    String::from_utf8_lossy(&out.stdout).trim()
                )),
                Some(1) => self.note("Feedback: no new feedback"),
                code => self.note(&format!(
                    "Feedback: fetch failed (exit {}): {}",
                    code.map_or("signal".to_string(), |c| c.to_string()),
                    String::from_utf8_lossy(&out.stderr).trim()
                )),
            },
            Ok(Err(e)) => self.note(&format!("Feedback: fetch error: {}", e)),
            Err(_) => self.note("Feedback: fetch timed out after 30s"),
        }
    }

    /// Print a bookkeeping message and persist it to the run log
    fn note(&self, msg: &str) -> Result<()> {
        info!("{}", msg);
        self.log.note(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunResult;
    use async_trait::async_trait;
    use regex::Regex;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Shared in-memory control store so tests can flip signals while the
    /// controller owns the watcher
    #[derive(Clone)]
    struct MemControlStore(Arc<MemInner>);

    struct MemInner {
        stop: AtomicBool,
        feedback: Mutex<Option<String>>,
    }

    impl MemControlStore {
        fn new() -> Self {
            Self(Arc::new(MemInner {
                stop: AtomicBool::new(false),
                feedback: Mutex::new(None),
            }))
        }

        fn set_stop(&self) {
            self.0.stop.store(true, Ordering::SeqCst);
        }

        fn set_feedback(&self, text: &str) {
            *self.0.feedback.lock().unwrap() = Some(text.to_string());
        }

        fn feedback(&self) -> Option<String> {
            self.0.feedback.lock().unwrap().clone()
        }
    }

    impl ControlStore for MemControlStore {
        fn stop_requested(&self) -> bool {
            self.0.stop.load(Ordering::SeqCst)
        }

        fn read_feedback(&self) -> io::Result<Option<String>> {
            Ok(self.0.feedback.lock().unwrap().clone())
        }

        fn clear_feedback(&self) -> io::Result<()> {
            *self.0.feedback.lock().unwrap() = None;
            Ok(())
        }
    }

    /// Mock agent replaying a scripted sequence of outcomes
    struct MockAgent {
        outcomes: Mutex<VecDeque<RunOutcome>>,
        calls: AtomicU32,
        prompts: Mutex<Vec<String>>,
        /// Optional store handle used to raise the stop flag mid-run
        stop_after_call: Option<MemControlStore>,
    }

    impl MockAgent {
        fn new(outcomes: Vec<RunOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicU32::new(0),
                prompts: Mutex::new(Vec::new()),
                stop_after_call: None,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Agent for MockAgent {
        async fn run(&self, prompt: &str) -> Result<RunResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt.to_string());
            if let Some(store) = &self.stop_after_call {
                store.set_stop();
            }
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(RunOutcome::Completed);
            Ok(RunResult::with_outcome(outcome))
        }
    }

    /// Agent whose binary cannot be started
    struct LaunchFailAgent;

    #[async_trait]
    impl Agent for LaunchFailAgent {
        async fn run(&self, _prompt: &str) -> Result<RunResult> {
            Err(RalphError::LaunchFailure(io::Error::new(
                io::ErrorKind::NotFound,
                "no such binary",
            )))
        }
    }

    struct Fixture {
        _dir: TempDir,
        config: Arc<Config>,
        store: MemControlStore,
        log: Arc<RunLog>,
    }

    fn fixture(max_iterations: Option<u32>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let prompt_file = dir.path().join("RALPH.md");
        std::fs::write(&prompt_file, "Pick a task and do it.\n").unwrap();

        let mut config = Config {
            prompt_file,
            max_iterations,
            log_dir: dir.path().join("logs"),
            ..Config::default()
        };
        // keep tests fast: no margins, immediate retries, tight polling
        config.backoff.safety_margin_secs = 0;
        config.backoff.rate_limit_fallback_secs = 0;
        config.backoff.initial_backoff_secs = 0;
        config.backoff.stop_poll_interval_secs = 1;

        let log = Arc::new(RunLog::create(&config.log_dir, "test-run").unwrap());
        Fixture {
            _dir: dir,
            config: Arc::new(config),
            store: MemControlStore::new(),
            log,
        }
    }

    fn controller<A: Agent>(f: &Fixture, agent: A) -> LoopController<A, MemControlStore> {
        LoopController::new(
            Arc::clone(&f.config),
            agent,
            ControlWatcher::new(f.store.clone()),
            Arc::clone(&f.log),
            None,
        )
    }

    fn header_numbers(log: &RunLog) -> Vec<u32> {
        let content = std::fs::read_to_string(log.path()).unwrap();
        let re = Regex::new(r"(?m)^=== Iteration (\d+)/").unwrap();
        re.captures_iter(&content)
            .map(|c| c[1].parse().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_runs_exact_iteration_budget() {
        let f = fixture(Some(3));
        let agent = MockAgent::new(vec![]);
        let ctrl = controller(&f, agent);

        let result = ctrl.run().await.unwrap();
        assert_eq!(result, LoopResult::Completed { iterations: 3 });
        assert_eq!(ctrl.agent.calls(), 3);
        // persisted numbers are strictly increasing with no gaps
        assert_eq!(header_numbers(&f.log), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_stop_marker_before_start_means_zero_invocations() {
        let f = fixture(Some(5));
        f.store.set_stop();
        let ctrl = controller(&f, MockAgent::new(vec![]));

        let result = ctrl.run().await.unwrap();
        assert_eq!(result, LoopResult::Stopped { iterations: 0 });
        assert_eq!(ctrl.agent.calls(), 0);
    }

    #[tokio::test]
    async fn test_stop_between_iterations() {
        let f = fixture(Some(5));
        let mut agent = MockAgent::new(vec![RunOutcome::Completed]);
        agent.stop_after_call = Some(f.store.clone());
        let ctrl = controller(&f, agent);

        let result = ctrl.run().await.unwrap();
        assert_eq!(result, LoopResult::Stopped { iterations: 1 });
        assert_eq!(ctrl.agent.calls(), 1);
    }

    #[tokio::test]
    async fn test_feedback_prepended_and_consumed_on_success() {
        let f = fixture(Some(1));
        f.store.set_feedback("Fix the typo in README");
        let ctrl = controller(&f, MockAgent::new(vec![RunOutcome::Completed]));

        let result = ctrl.run().await.unwrap();
        assert_eq!(result, LoopResult::Completed { iterations: 1 });

        let prompts = ctrl.agent.prompts.lock().unwrap();
        assert!(prompts[0].starts_with("Fix the typo in README"));
        assert!(prompts[0].contains("Pick a task and do it."));
        drop(prompts);

        // consumed after the successful iteration
        assert_eq!(f.store.feedback(), None);
    }

    #[tokio::test]
    async fn test_feedback_retained_when_iteration_fails() {
        let f = fixture(Some(1));
        f.store.set_feedback("Important steering");
        let ctrl = controller(
            &f,
            MockAgent::new(vec![RunOutcome::Failed { exit_code: Some(1) }]),
        );

        ctrl.run().await.unwrap();
        // still available for the next attempt
        assert_eq!(f.store.feedback(), Some("Important steering".to_string()));
    }

    #[tokio::test]
    async fn test_rate_limited_retry_reuses_iteration_slot() {
        let f = fixture(Some(1));
        let ctrl = controller(
            &f,
            MockAgent::new(vec![
                RunOutcome::RateLimited {
                    reset: Some(Utc::now()),
                },
                RunOutcome::Completed,
            ]),
        );

        let result = ctrl.run().await.unwrap();
        assert_eq!(result, LoopResult::Completed { iterations: 1 });
        assert_eq!(ctrl.agent.calls(), 2);

        // same number twice: one iteration, two appended segments
        assert_eq!(header_numbers(&f.log), vec![1, 1]);
        let content = std::fs::read_to_string(f.log.path()).unwrap();
        assert!(content.contains("Rate limited."));
    }

    #[tokio::test]
    async fn test_rate_limited_retry_does_not_consume_budget() {
        let f = fixture(Some(2));
        let ctrl = controller(
            &f,
            MockAgent::new(vec![
                RunOutcome::RateLimited { reset: None },
                RunOutcome::Completed,
                RunOutcome::Completed,
            ]),
        );

        let result = ctrl.run().await.unwrap();
        assert_eq!(result, LoopResult::Completed { iterations: 2 });
        assert_eq!(ctrl.agent.calls(), 3);
        assert_eq!(header_numbers(&f.log), vec![1, 1, 2]);
    }

    #[tokio::test]
    async fn test_stop_observed_during_backoff_wait() {
        let f = fixture(Some(1));
        let mut agent = MockAgent::new(vec![RunOutcome::RateLimited { reset: None }]);
        agent.stop_after_call = Some(f.store.clone());
        let ctrl = controller(&f, agent);

        // the stop flag is raised during the agent call; the wait must
        // observe it before sleeping and exit without a retry
        let started = Instant::now();
        let result = ctrl.run().await.unwrap();
        assert_eq!(result, LoopResult::Stopped { iterations: 0 });
        assert_eq!(ctrl.agent.calls(), 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_server_error_retries_then_completes() {
        let f = fixture(Some(1));
        let ctrl = controller(
            &f,
            MockAgent::new(vec![RunOutcome::ServerError, RunOutcome::Completed]),
        );

        let result = ctrl.run().await.unwrap();
        assert_eq!(result, LoopResult::Completed { iterations: 1 });
        assert_eq!(ctrl.agent.calls(), 2);
        assert_eq!(header_numbers(&f.log), vec![1, 1]);
    }

    #[tokio::test]
    async fn test_server_error_budget_exhausted_records_failure() {
        let f = fixture(Some(1));
        let mut config = (*f.config).clone();
        config.backoff.initial_backoff_secs = 1;
        config.backoff.max_retry_duration_secs = 0;
        let ctrl = LoopController::new(
            Arc::new(config),
            MockAgent::new(vec![RunOutcome::ServerError]),
            ControlWatcher::new(f.store.clone()),
            Arc::clone(&f.log),
            None,
        );

        let result = ctrl.run().await.unwrap();
        // slot is consumed as failed; the loop itself keeps going
        assert_eq!(result, LoopResult::Completed { iterations: 1 });
        assert_eq!(ctrl.agent.calls(), 1);
        let content = std::fs::read_to_string(f.log.path()).unwrap();
        assert!(content.contains("retries exceeded"));
    }

    #[tokio::test]
    async fn test_launch_failure_escalates() {
        let f = fixture(Some(3));
        let ctrl = controller(&f, LaunchFailAgent);

        match ctrl.run().await {
            Err(RalphError::LaunchFailure(_)) => {}
            other => panic!("Expected LaunchFailure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_prompt_file_is_fatal() {
        let f = fixture(Some(1));
        let mut config = (*f.config).clone();
        config.prompt_file = f.config.prompt_file.with_file_name("MISSING.md");
        let ctrl = LoopController::new(
            Arc::new(config),
            MockAgent::new(vec![]),
            ControlWatcher::new(f.store.clone()),
            Arc::clone(&f.log),
            None,
        );

        match ctrl.run().await {
            Err(RalphError::PromptFile { .. }) => {}
            other => panic!("Expected PromptFile error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_script_populates_feedback_before_signal_check() {
        let f = fixture(Some(1));
        // script writes nothing but exits 1 ("no new feedback")
        let script = f._dir.path().join("fetch.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 1\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut config = (*f.config).clone();
        config.fetch_feedback_script = Some(script);
        let ctrl = LoopController::new(
            Arc::new(config),
            MockAgent::new(vec![]),
            ControlWatcher::new(f.store.clone()),
            Arc::clone(&f.log),
            None,
        );

        ctrl.run().await.unwrap();
        let content = std::fs::read_to_string(f.log.path()).unwrap();
        assert!(content.contains("Feedback: no new feedback"));
    }
}
