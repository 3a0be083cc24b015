//! Operator control signals read from the filesystem.
//!
//! Two files coordinate a running loop with its operator: a stop marker
//! whose mere existence requests a graceful stop, and a feedback file
//! whose non-empty content is steering text for the next iteration.
//! Signals are recomputed from the store on every check, never cached;
//! the files may change between iterations.

use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Signal derived from the control files at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// No operator input
    None,
    /// The stop marker exists; finish bookkeeping and exit cleanly
    StopRequested,
    /// The feedback file has content to deliver ahead of the next prompt
    Feedback(String),
}

/// Access to the control files, behind a trait so tests can substitute
/// an in-memory fake
pub trait ControlStore: Send + Sync {
    fn stop_requested(&self) -> bool;
    fn read_feedback(&self) -> io::Result<Option<String>>;
    fn clear_feedback(&self) -> io::Result<()>;
}

/// Production store reading the two configured paths
pub struct FsControlStore {
    stop_path: PathBuf,
    feedback_path: PathBuf,
}

impl FsControlStore {
    pub fn new(stop_path: &Path, feedback_path: &Path) -> Self {
        Self {
            stop_path: stop_path.to_path_buf(),
            feedback_path: feedback_path.to_path_buf(),
        }
    }
}

impl ControlStore for FsControlStore {
    fn stop_requested(&self) -> bool {
        self.stop_path.exists()
    }

    fn read_feedback(&self) -> io::Result<Option<String>> {
        if !self.feedback_path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.feedback_path)?;
        if content.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(content))
        }
    }

    fn clear_feedback(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.feedback_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Derives a fresh `ControlSignal` per check. Stop takes precedence over
/// feedback when both files are present.
pub struct ControlWatcher<S: ControlStore> {
    store: S,
}

impl<S: ControlStore> ControlWatcher<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Full signal check, run at the start of every iteration
    pub fn check(&self) -> ControlSignal {
        if self.store.stop_requested() {
            return ControlSignal::StopRequested;
        }
        match self.store.read_feedback() {
            Ok(Some(text)) => ControlSignal::Feedback(text),
            Ok(None) => ControlSignal::None,
            Err(e) => {
                warn!("failed to read feedback file: {}", e);
                ControlSignal::None
            }
        }
    }

    /// Stop-only check, polled during long waits
    pub fn stop_requested(&self) -> bool {
        self.store.stop_requested()
    }

    /// Remove the feedback file after the iteration that consumed it
    /// completed successfully
    pub fn consume_feedback(&self) -> io::Result<()> {
        self.store.clear_feedback()
    }
}
