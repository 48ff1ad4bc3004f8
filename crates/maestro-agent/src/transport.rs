//! Child process transport.
//!
//! The client talks to its subprocess through [`ChildTransport`] so the
//! protocol logic can be driven by scripted frames in tests. The real
//! implementation wraps a `tokio::process::Child` with line-buffered
//! stdio.

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};

/// Bidirectional line transport to the agent subprocess.
#[async_trait]
pub trait ChildTransport: Send {
    /// Write one line to the child's stdin.
    async fn send_line(&mut self, line: &str) -> AgentResult<()>;

    /// Read one line from the child's stdout; `None` on EOF.
    async fn recv_line(&mut self) -> AgentResult<Option<String>>;

    /// Ask the child to stop (soft), escalating after `grace`.
    async fn terminate(&mut self, grace: Duration) -> AgentResult<()>;

    /// Reap the child, closing both ends.
    async fn close(&mut self) -> AgentResult<()>;
}

/// Spawns transports; the seam the connect retry loop goes through.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// The transport type produced.
    type Transport: ChildTransport;

    /// Spawn a child for `config`.
    async fn spawn(&self, config: &AgentConfig) -> AgentResult<Self::Transport>;
}

#[async_trait]
impl<F: TransportFactory> TransportFactory for std::sync::Arc<F> {
    type Transport = F::Transport;

    async fn spawn(&self, config: &AgentConfig) -> AgentResult<Self::Transport> {
        (**self).spawn(config).await
    }
}

/// Real subprocess transport.
pub struct ProcessTransport {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

#[async_trait]
impl ChildTransport for ProcessTransport {
    async fn send_line(&mut self, line: &str) -> AgentResult<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::Transient(format!("stdin write: {e}")))?;
        self.stdin
            .write_all(b"\n")
            .await
            .map_err(|e| AgentError::Transient(format!("stdin write: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| AgentError::Transient(format!("stdin flush: {e}")))?;
        Ok(())
    }

    async fn recv_line(&mut self) -> AgentResult<Option<String>> {
        let mut line = String::new();
        let read = self
            .stdout
            .read_line(&mut line)
            .await
            .map_err(|e| AgentError::Transient(format!("stdout read: {e}")))?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end().to_string()))
    }

    async fn terminate(&mut self, grace: Duration) -> AgentResult<()> {
        if let Some(pid) = self.child.id()
            && let Ok(raw) = i32::try_from(pid)
        {
            if let Err(e) = signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
                debug!(error = %e, "SIGTERM failed; child may already be gone");
            }
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(?status, "child exited after SIGTERM");
                Ok(())
            },
            Ok(Err(e)) => Err(AgentError::Fatal(format!("wait failed: {e}"))),
            Err(_) => {
                warn!("child ignored SIGTERM; escalating to SIGKILL");
                self.child
                    .kill()
                    .await
                    .map_err(|e| AgentError::Fatal(format!("kill failed: {e}")))?;
                Ok(())
            },
        }
    }

    async fn close(&mut self) -> AgentResult<()> {
        // Closing stdin signals end-of-input; then reap.
        let _ = self.stdin.shutdown().await;
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(AgentError::Fatal(format!("wait failed: {e}"))),
            Err(_) => {
                self.child
                    .kill()
                    .await
                    .map_err(|e| AgentError::Fatal(format!("kill failed: {e}")))?;
                Ok(())
            },
        }
    }
}

/// Factory spawning the real agent CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessFactory;

#[async_trait]
impl TransportFactory for ProcessFactory {
    type Transport = ProcessTransport;

    async fn spawn(&self, config: &AgentConfig) -> AgentResult<ProcessTransport> {
        let mut child = Command::new(&config.cli_path)
            .args(config.cli_args())
            .current_dir(&config.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    AgentError::Fatal(format!(
                        "cannot launch agent CLI {}: {e}",
                        config.cli_path.display()
                    ))
                },
                _ => AgentError::Transient(format!("spawn failed: {e}")),
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Fatal("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Fatal("child stdout not captured".into()))?;

        debug!(pid = child.id(), cli = %config.cli_path.display(), "agent subprocess spawned");
        Ok(ProcessTransport {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }
}
