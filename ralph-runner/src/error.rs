use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while driving the agent loop.
///
/// Agent-side failures (non-zero exit, rate limits, server errors) are not
/// errors: they come back from the runner as classified outcomes. Only
/// conditions that make further progress impossible are represented here.
#[derive(Error, Debug)]
pub enum RalphError {
    /// The agent process could not be started at all (missing binary,
    /// permission problem). Fatal for the run; never retried.
    #[error("failed to launch agent process: {0}")]
    LaunchFailure(#[source] std::io::Error),

    /// I/O error talking to a running agent process
    #[error("agent process I/O error: {0}")]
    ProcessIo(#[source] std::io::Error),

    /// Error reading or parsing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Error reading the prompt file
    #[error("failed to read prompt file {}: {source}", .path.display())]
    PromptFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error creating the log directory
    #[error("failed to create log directory: {0}")]
    LogDir(#[source] std::io::Error),

    /// Error writing to the run log
    #[error("failed to write run log: {0}")]
    LogWrite(#[source] std::io::Error),

    /// An event line could not be parsed
    #[error("malformed agent event: {0}")]
    MalformedEvent(String),

    /// Shutdown was requested (e.g., via Ctrl+C)
    #[error("shutdown requested")]
    ShutdownRequested,
}

/// Result type alias for loop operations
pub type Result<T> = std::result::Result<T, RalphError>;
