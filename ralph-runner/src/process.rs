use std::process::Stdio;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::error::{RalphError, Result};

/// Wrapper around one agent subprocess. One value per invocation; the
/// process is spawned in the constructor and owned until dropped.
pub struct AgentProcess {
    child: Child,
    pub stdout: Option<BufReader<ChildStdout>>,
    pub stderr: Option<BufReader<ChildStderr>>,
}

impl AgentProcess {
    /// Spawn the agent with the prompt delivered via stdin.
    ///
    /// A spawn error (missing binary, permission problem) is reported as
    /// the distinguishable launch failure; anything after a successful
    /// spawn is ordinary process I/O.
    pub async fn spawn_with_stdin(
        agent_path: &str,
        args: &[String],
        prompt: &str,
    ) -> Result<Self> {
        let mut cmd = Command::new(agent_path);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(RalphError::LaunchFailure)?;

        // Write prompt to stdin, then drop it to signal EOF
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(RalphError::ProcessIo)?;
            stdin.flush().await.map_err(RalphError::ProcessIo)?;
        }

        let stdout = child.stdout.take().map(BufReader::new);
        let stderr = child.stderr.take().map(BufReader::new);

        Ok(Self {
            child,
            stdout,
            stderr,
        })
    }

    /// Wait for the process to exit and return the exit status
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus> {
        self.child.wait().await.map_err(RalphError::ProcessIo)
    }

    /// Kill the process
    pub async fn kill(&mut self) -> Result<()> {
        self.child.kill().await.map_err(RalphError::ProcessIo)
    }

    /// Get the process ID
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}
