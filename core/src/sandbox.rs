//! The narrow contract the rest of this crate treats as an untrusted
//! remote execution environment (spec.md §4.1).
//!
//! Every operation that might never return is expected to be wrapped in a
//! caller-side timeout: the trait itself makes no liveness promises, only
//! `codex-core::exec`-style bounded calls with an explicit duration.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub timeout: Option<Duration>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A lazy byte stream plus an exit-code future, mirroring
/// `codex-core::exec::ExecToolCallOutput` but for long-running processes
/// rather than run-to-completion calls.
pub struct SpawnedProcess {
    pub id: String,
    pub stdout: Pin<Box<dyn AsyncRead + Send>>,
    pub stderr: Pin<Box<dyn AsyncRead + Send>>,
    pub exited: tokio::sync::oneshot::Receiver<i32>,
}

/// The collaborator contract spec.md §4.1 calls the "sandbox interface".
///
/// Implementors are not trusted for liveness: callers must bound every
/// call with a timeout and treat every stream as possibly-truncated or
/// error-terminated.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run `command` to completion, returning its full output.
    async fn exec(&self, command: &[String], opts: ExecOptions) -> Result<ExecOutput>;

    /// Start a long-running process reading stdin from `stdin_pipe` (a
    /// path the caller has already created, typically a named FIFO).
    async fn start_process(
        &self,
        command: &[String],
        stdin_pipe: &Path,
        env: HashMap<String, String>,
    ) -> Result<SpawnedProcess>;

    async fn read_file(&self, path: &Path) -> Result<String>;

    async fn write_file(&self, path: &Path, content: &str) -> Result<()>;

    /// Send an OS-level kill signal to a previously started process.
    async fn kill_process(&self, id: &str) -> Result<()>;
}

/// Shells out with `tokio::process::Command`, the way
/// `codex-core::exec::exec` does for the non-sandboxed path: no seccomp or
/// seatbelt policy, full inherited environment plus overrides.
pub struct LocalSandbox;

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn exec(&self, command: &[String], opts: ExecOptions) -> Result<ExecOutput> {
        let Some((program, args)) = command.split_first() else {
            return Err(crate::error::CoreError::invalid_argument(
                "command",
                "must have at least one element",
            ));
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        cmd.envs(&opts.env);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let run = async {
            let output = cmd.output().await?;
            Ok::<_, crate::error::CoreError>(ExecOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        };

        match opts.timeout {
            Some(d) => tokio::time::timeout(d, run)
                .await
                .map_err(|_| crate::error::CoreError::Sandbox("exec timed out".to_string()))?,
            None => run.await,
        }
    }

    async fn start_process(
        &self,
        command: &[String],
        stdin_pipe: &Path,
        env: HashMap<String, String>,
    ) -> Result<SpawnedProcess> {
        let Some((program, args)) = command.split_first() else {
            return Err(crate::error::CoreError::invalid_argument(
                "command",
                "must have at least one element",
            ));
        };

        let pipe_file = tokio::fs::File::open(stdin_pipe).await?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        cmd.envs(&env);
        cmd.stdin(pipe_file.into_std().await);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn()?;
        let id = child
            .id()
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let stdout = child.stdout.take().ok_or_else(|| {
            crate::error::CoreError::Sandbox("spawned child has no stdout pipe".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            crate::error::CoreError::Sandbox("spawned child has no stderr pipe".to_string())
        })?;

        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let status = child.wait().await;
            let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedProcess {
            id,
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            exited: exit_rx,
        })
    }

    async fn read_file(&self, path: &Path) -> Result<String> {
        Ok(tokio::fs::read_to_string(path).await?)
    }

    async fn write_file(&self, path: &Path, content: &str) -> Result<()> {
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    async fn kill_process(&self, id: &str) -> Result<()> {
        let pid: i32 = id
            .parse()
            .map_err(|_| crate::error::CoreError::invalid_argument("id", "not a pid"))?;
        #[cfg(unix)]
        {
            nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            )
            .map_err(|e| crate::error::CoreError::Sandbox(e.to_string()))?;
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
        }
        Ok(())
    }
}

impl LocalSandbox {
    pub fn default_input_pipe_path(session_id: &str) -> PathBuf {
        std::env::temp_dir().join(format!("claude_input_{session_id}"))
    }
}
