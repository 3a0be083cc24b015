use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{RalphError, Result};

/// Timing knobs for rate-limit and server-error waits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Seconds added on top of a published reset time. Reset times are
    /// best-effort boundaries; waking exactly on the boundary risks
    /// re-hitting the limit.
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,
    /// Wait used when the rate-limit message carries no parseable reset time
    #[serde(default = "default_rate_limit_fallback_secs")]
    pub rate_limit_fallback_secs: u64,
    /// First delay of the server-error retry schedule
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,
    /// Cap for the doubling server-error schedule
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Total time budget for retrying one iteration through server errors
    #[serde(default = "default_max_retry_duration_secs")]
    pub max_retry_duration_secs: u64,
    /// How often a long wait re-checks the stop marker
    #[serde(default = "default_stop_poll_interval_secs")]
    pub stop_poll_interval_secs: u64,
}

fn default_safety_margin_secs() -> u64 {
    60
}

fn default_rate_limit_fallback_secs() -> u64 {
    3600
}

fn default_initial_backoff_secs() -> u64 {
    15
}

fn default_max_backoff_secs() -> u64 {
    240 // 4 minutes
}

fn default_max_retry_duration_secs() -> u64 {
    8 * 3600
}

fn default_stop_poll_interval_secs() -> u64 {
    15
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            safety_margin_secs: default_safety_margin_secs(),
            rate_limit_fallback_secs: default_rate_limit_fallback_secs(),
            initial_backoff_secs: default_initial_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            max_retry_duration_secs: default_max_retry_duration_secs(),
            stop_poll_interval_secs: default_stop_poll_interval_secs(),
        }
    }
}

/// Main configuration for the ralph runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Prompt file re-read at the start of every iteration
    #[serde(default = "default_prompt_file")]
    pub prompt_file: PathBuf,
    /// Maximum number of iterations (None = run until stopped)
    #[serde(default = "default_max_iterations")]
    pub max_iterations: Option<u32>,
    /// Path to the agent CLI executable
    #[serde(default = "default_agent_path")]
    pub agent_path: String,
    /// Arguments passed to the agent CLI
    #[serde(default = "default_agent_args")]
    pub agent_args: Vec<String>,
    /// Marker file whose existence requests a graceful stop
    #[serde(default = "default_stop_file")]
    pub stop_file: PathBuf,
    /// File whose non-empty content is injected ahead of the next prompt
    #[serde(default = "default_feedback_file")]
    pub feedback_file: PathBuf,
    /// Directory for run logs
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Optional script run between iterations to populate the feedback file
    #[serde(default)]
    pub fetch_feedback_script: Option<PathBuf>,
    /// Backoff timing configuration
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_prompt_file() -> PathBuf {
    PathBuf::from("RALPH.md")
}

fn default_max_iterations() -> Option<u32> {
    Some(10)
}

fn default_agent_path() -> String {
    "claude".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec![
        "--print".to_string(),
        "--verbose".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--dangerously-skip-permissions".to_string(),
    ]
}

fn default_stop_file() -> PathBuf {
    PathBuf::from("STOP_RALPH")
}

fn default_feedback_file() -> PathBuf {
    PathBuf::from("FEEDBACK.md")
}

fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ralph")
        .join("logs")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prompt_file: default_prompt_file(),
            max_iterations: default_max_iterations(),
            agent_path: default_agent_path(),
            agent_args: default_agent_args(),
            stop_file: default_stop_file(),
            feedback_file: default_feedback_file(),
            log_dir: default_log_dir(),
            fetch_feedback_script: None,
            backoff: BackoffConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| RalphError::Config(e.to_string()))?;
        toml::from_str(&content).map_err(|e| RalphError::Config(e.to_string()))
    }

    /// Merge CLI arguments into this configuration.
    /// CLI arguments take precedence over config file values.
    pub fn merge_cli_args(
        &mut self,
        prompt_file: Option<PathBuf>,
        max_iterations: Option<u32>,
        agent_path: Option<String>,
        stop_file: Option<PathBuf>,
        feedback_file: Option<PathBuf>,
        log_dir: Option<PathBuf>,
        fetch_feedback_script: Option<PathBuf>,
    ) {
        if let Some(p) = prompt_file {
            self.prompt_file = p;
        }
        if let Some(n) = max_iterations {
            // 0 on the command line means "run until stopped"
            self.max_iterations = if n == 0 { None } else { Some(n) };
        }
        if let Some(a) = agent_path {
            self.agent_path = a;
        }
        if let Some(s) = stop_file {
            self.stop_file = s;
        }
        if let Some(f) = feedback_file {
            self.feedback_file = f;
        }
        if let Some(d) = log_dir {
            self.log_dir = d;
        }
        if fetch_feedback_script.is_some() {
            self.fetch_feedback_script = fetch_feedback_script;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.prompt_file, PathBuf::from("RALPH.md"));
        assert_eq!(config.max_iterations, Some(10));
        assert_eq!(config.agent_path, "claude");
        assert_eq!(config.stop_file, PathBuf::from("STOP_RALPH"));
        assert_eq!(config.feedback_file, PathBuf::from("FEEDBACK.md"));
        assert_eq!(config.backoff.safety_margin_secs, 60);
        assert_eq!(config.backoff.initial_backoff_secs, 15);
        assert_eq!(config.backoff.max_backoff_secs, 240);
    }

    #[test]
    fn test_merge_cli_args_zero_iterations_means_unbounded() {
        let mut config = Config::default();
        config.merge_cli_args(None, Some(0), None, None, None, None, None);
        assert_eq!(config.max_iterations, None);
    }

    #[test]
    fn test_merge_cli_args_overrides() {
        let mut config = Config::default();
        config.merge_cli_args(
            Some(PathBuf::from("OTHER.md")),
            Some(3),
            Some("my-agent".to_string()),
            None,
            None,
            Some(PathBuf::from("/tmp/logs")),
            None,
        );
        assert_eq!(config.prompt_file, PathBuf::from("OTHER.md"));
        assert_eq!(config.max_iterations, Some(3));
        assert_eq!(config.agent_path, "my-agent");
        assert_eq!(config.log_dir, PathBuf::from("/tmp/logs"));
        // untouched fields keep their defaults
        assert_eq!(config.stop_file, PathBuf::from("STOP_RALPH"));
    }

    #[test]
    fn test_from_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ralph.toml");
        std::fs::write(
            &path,
            r#"
prompt_file = "TASK.md"
max_iterations = 25

[backoff]
safety_margin_secs = 30
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.prompt_file, PathBuf::from("TASK.md"));
        assert_eq!(config.max_iterations, Some(25));
        assert_eq!(config.backoff.safety_margin_secs, 30);
        // unspecified backoff fields still default
        assert_eq!(config.backoff.max_backoff_secs, 240);
    }
}
