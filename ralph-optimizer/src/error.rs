//! Error types for the ralph-optimizer application.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while analyzing run logs
#[derive(Error, Debug)]
pub enum OptimizerError {
    /// Failed to read a file
    #[error("failed to read log file: {0}")]
    Io(#[from] std::io::Error),

    /// No run logs present in the search directory
    #[error("no run logs found in {}", .0.display())]
    NoLogsFound(PathBuf),

    /// The requested log file does not exist
    #[error("log file not found: {}", .0.display())]
    LogNotFound(PathBuf),

    /// The log file contains no iteration sections
    #[error("no iterations found in {}", .0.display())]
    NoIterations(PathBuf),
}

/// Result type alias for analyzer operations
pub type Result<T> = std::result::Result<T, OptimizerError>;
