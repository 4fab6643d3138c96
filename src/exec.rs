//! Command execution on service hosts
//!
//! [`RemoteExecutor`] launches a command on a host and hands back a
//! [`ProcessHandle`]. Synchronous commands are run to completion before the
//! handle is returned; background commands return as soon as the process has
//! been spawned.

use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use svcrig_config::{HostTarget, OutputMode};

use crate::error::ExecError;
use crate::poll::await_condition;

/// Grace period between SIGTERM and SIGKILL when destroying a local process
const DESTROY_GRACE: Duration = Duration::from_secs(5);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A command line plus how to run it
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub line: String,
    pub env: Vec<(String, String)>,
    pub workdir: Option<String>,
    /// wait for completion before returning
    pub synchronous: bool,
    pub stdout: OutputMode,
    pub stderr: OutputMode,
}

impl CommandSpec {
    /// Long-running launch, output discarded unless configured otherwise
    pub fn background(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            env: Vec::new(),
            workdir: None,
            synchronous: false,
            stdout: OutputMode::Discard,
            stderr: OutputMode::Discard,
        }
    }

    /// Short command run to completion with stdout captured
    pub fn sync(line: impl Into<String>) -> Self {
        Self {
            synchronous: true,
            stdout: OutputMode::Capture,
            ..Self::background(line)
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_workdir(mut self, workdir: Option<&str>) -> Self {
        self.workdir = workdir.map(str::to_string);
        self
    }

    pub fn with_output(mut self, stdout: OutputMode, stderr: OutputMode) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }
}

/// A launched process, local or remote
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// `None` while the process is still running
    async fn exit_code(&self) -> Result<Option<i32>, ExecError>;

    /// Terminate the process; a no-op once it has exited
    async fn destroy(&self) -> Result<(), ExecError>;

    /// Wait up to `limit` for the process to exit
    async fn wait_for(&self, limit: Duration) -> Result<Option<i32>, ExecError>;

    /// Captured stdout, if output was captured
    async fn output(&self) -> Option<String>;
}

/// Launches commands on hosts
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(
        &self,
        host: &HostTarget,
        spec: &CommandSpec,
    ) -> Result<Arc<dyn ProcessHandle>, ExecError>;
}

/// Handle for a command that has already finished
#[derive(Debug, Clone)]
pub struct CompletedHandle {
    code: i32,
    stdout: String,
}

impl CompletedHandle {
    pub fn new(code: i32, stdout: impl Into<String>) -> Self {
        Self {
            code,
            stdout: stdout.into(),
        }
    }
}

#[async_trait]
impl ProcessHandle for CompletedHandle {
    async fn exit_code(&self) -> Result<Option<i32>, ExecError> {
        Ok(Some(self.code))
    }

    async fn destroy(&self) -> Result<(), ExecError> {
        Ok(())
    }

    async fn wait_for(&self, _limit: Duration) -> Result<Option<i32>, ExecError> {
        Ok(Some(self.code))
    }

    async fn output(&self) -> Option<String> {
        Some(self.stdout.clone())
    }
}

/// Exit code, with death by signal reported shell-style as 128 + signal
pub fn status_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

/// Runs every command on this machine through `sh -c`, whatever the host name
#[derive(Debug, Default, Clone)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }

    fn command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.line)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());
        if let Some(ref dir) = spec.workdir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn execute(
        &self,
        host: &HostTarget,
        spec: &CommandSpec,
    ) -> Result<Arc<dyn ProcessHandle>, ExecError> {
        debug!(host = %host, command = %spec.line, sync = spec.synchronous, "executing locally");
        let mut cmd = Self::command(spec);

        if spec.synchronous {
            let output = cmd
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await?;
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                debug!(host = %host, stderr = %stderr.trim(), "command wrote to stderr");
            }
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            return Ok(Arc::new(CompletedHandle::new(
                status_code(output.status),
                stdout,
            )));
        }

        let mut child = cmd
            .stdout(stdio_for(spec.stdout))
            .stderr(stdio_for(spec.stderr))
            .spawn()?;
        let pid = child.id();
        info!(host = %host, pid = ?pid, "process launched");

        let captured = Arc::new(Mutex::new(String::new()));
        if let Some(stdout) = child.stdout.take() {
            relay(stdout, host, "stdout", spec.stdout, captured.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            relay(stderr, host, "stderr", spec.stderr, captured.clone());
        }

        Ok(Arc::new(LocalHandle {
            host: host.to_string(),
            pid,
            child: Mutex::new(child),
            captured: (spec.stdout == OutputMode::Capture || spec.stderr == OutputMode::Capture)
                .then_some(captured),
        }))
    }
}

fn stdio_for(mode: OutputMode) -> Stdio {
    match mode {
        OutputMode::Discard => Stdio::null(),
        OutputMode::Capture | OutputMode::Log => Stdio::piped(),
    }
}

/// Forward a child stream line by line to the log or into a capture buffer
fn relay<R>(reader: R, host: &HostTarget, stream: &'static str, mode: OutputMode, buf: Arc<Mutex<String>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let host = host.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match mode {
                OutputMode::Log => info!(host = %host, stream = stream, "{}", line),
                OutputMode::Capture => {
                    let mut buf = buf.lock().await;
                    buf.push_str(&line);
                    buf.push('\n');
                }
                OutputMode::Discard => {}
            }
        }
    });
}

/// A child process of this controller
pub struct LocalHandle {
    host: String,
    pid: Option<u32>,
    child: Mutex<Child>,
    captured: Option<Arc<Mutex<String>>>,
}

#[async_trait]
impl ProcessHandle for LocalHandle {
    async fn exit_code(&self) -> Result<Option<i32>, ExecError> {
        let mut child = self.child.lock().await;
        Ok(child.try_wait()?.map(status_code))
    }

    async fn destroy(&self) -> Result<(), ExecError> {
        if self.exit_code().await?.is_some() {
            return Ok(());
        }

        // send SIGTERM
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = self.pid {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        // the child lock is only taken per check, so liveness queries are
        // answered while the grace period runs
        if let Some(code) = self.wait_for(DESTROY_GRACE).await? {
            debug!(host = %self.host, code = code, "process terminated");
            return Ok(());
        }

        warn!(host = %self.host, pid = ?self.pid, "process ignored SIGTERM, killing");
        let mut child = self.child.lock().await;
        if child.try_wait()?.is_none() {
            child.start_kill()?;
            child.wait().await?;
        }
        Ok(())
    }

    async fn wait_for(&self, limit: Duration) -> Result<Option<i32>, ExecError> {
        let attempts = (limit.as_millis() / EXIT_POLL_INTERVAL.as_millis()) as u32 + 1;
        let exited = await_condition(
            move || async move { matches!(self.exit_code().await, Ok(Some(_))) },
            attempts,
            EXIT_POLL_INTERVAL,
        )
        .await;
        if exited {
            self.exit_code().await
        } else {
            Ok(None)
        }
    }

    async fn output(&self) -> Option<String> {
        match self.captured {
            Some(ref buf) => Some(buf.lock().await.clone()),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> HostTarget {
        HostTarget::new("localhost")
    }

    #[tokio::test]
    async fn test_sync_captures_stdout() {
        let exec = LocalExecutor::new();
        let spec = CommandSpec::sync("echo $GREETING").with_env(vec![(
            "GREETING".to_string(),
            "hello".to_string(),
        )]);
        let handle = exec.execute(&local(), &spec).await.unwrap();

        assert_eq!(handle.exit_code().await.unwrap(), Some(0));
        assert_eq!(handle.output().await.as_deref(), Some("hello\n"));
    }

    #[tokio::test]
    async fn test_sync_reports_exit_code() {
        let exec = LocalExecutor::new();
        let handle = exec
            .execute(&local(), &CommandSpec::sync("exit 3"))
            .await
            .unwrap();
        assert_eq!(handle.exit_code().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_background_destroy() {
        let exec = LocalExecutor::new();
        let handle = exec
            .execute(&local(), &CommandSpec::background("sleep 30"))
            .await
            .unwrap();

        assert_eq!(handle.exit_code().await.unwrap(), None);
        handle.destroy().await.unwrap();

        let code = handle.exit_code().await.unwrap();
        assert!(code.is_some(), "process should be gone after destroy");
        // destroying an exited process is a no-op
        handle.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_code_answers_during_destroy_grace() {
        let exec = LocalExecutor::new();
        let handle = exec
            .execute(
                &local(),
                &CommandSpec::background("trap '' TERM; while true; do sleep 0.1; done"),
            )
            .await
            .unwrap();
        // let the shell install its trap
        tokio::time::sleep(Duration::from_millis(300)).await;

        let destroying = handle.clone();
        let destroy = tokio::spawn(async move { destroying.destroy().await });
        tokio::time::sleep(Duration::from_millis(300)).await;

        let code = tokio::time::timeout(Duration::from_secs(1), handle.exit_code())
            .await
            .expect("exit_code must not wait for the destroy grace period")
            .unwrap();
        assert_eq!(code, None);

        destroy.await.unwrap().unwrap();
        assert!(handle.exit_code().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_background_exit_and_capture() {
        let exec = LocalExecutor::new();
        let spec = CommandSpec::background("echo started; exit 7")
            .with_output(OutputMode::Capture, OutputMode::Discard);
        let handle = exec.execute(&local(), &spec).await.unwrap();

        let code = handle.wait_for(Duration::from_secs(5)).await.unwrap();
        assert_eq!(code, Some(7));

        // give the relay task a moment to drain the pipe
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.output().await.as_deref(), Some("started\n"));
    }

    #[tokio::test]
    async fn test_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let exec = LocalExecutor::new();
        let spec = CommandSpec::sync("pwd").with_workdir(dir.path().to_str());
        let handle = exec.execute(&local(), &spec).await.unwrap();

        let out = handle.output().await.unwrap();
        let expected = dir.path().canonicalize().unwrap();
        let actual = std::path::Path::new(out.trim()).canonicalize().unwrap();
        assert_eq!(actual, expected);
    }
}
