//! SSH transport
//!
//! Runs commands and file operations on service hosts using the openssh
//! crate. Sessions are cached per destination and reused for every command
//! sent to the same host.

use async_trait::async_trait;
use bytes::BytesMut;
use openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use openssh_sftp_client::Sftp;
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::process::Output;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use svcrig_config::{HostTarget, OutputMode, SshSettings};

use crate::error::ExecError;
use crate::exec::{CommandSpec, CompletedHandle, ProcessHandle, RemoteExecutor};
use crate::poll::await_condition;
use crate::probe::HostProbe;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Cache of SSH sessions for connection reuse
pub type SessionCache = Arc<RwLock<HashMap<String, Arc<Session>>>>;

pub fn new_session_cache() -> SessionCache {
    Arc::new(RwLock::new(HashMap::new()))
}

fn quote(s: &str) -> Cow<'_, str> {
    shell_escape::escape(s.into())
}

/// Get or create an SSH session for a host
pub async fn get_session(
    settings: &SshSettings,
    host: &HostTarget,
    cache: &SessionCache,
) -> Result<Arc<Session>, openssh::Error> {
    let destination = settings.destination(host);
    let key = match settings.port {
        Some(port) => format!("{}:{}", destination, port),
        None => destination.clone(),
    };

    // check cache first
    {
        let cache_read = cache.read().await;
        if let Some(session) = cache_read.get(&key) {
            return Ok(session.clone());
        }
    }

    info!(host = %host.name, user = ?settings.user, "establishing SSH connection");

    let mut builder = SessionBuilder::default();
    builder.known_hosts_check(KnownHosts::Accept);

    if let Some(port) = settings.port {
        builder.port(port);
    }

    if let Some(ref identity) = settings.identity {
        // expand ~ to home directory
        let path = match (identity.strip_prefix('~'), dirs::home_dir()) {
            (Some(rest), Some(home)) => format!("{}{}", home.to_string_lossy(), rest),
            _ => identity.clone(),
        };
        builder.keyfile(&path);
    }

    let session = Arc::new(builder.connect(&destination).await?);

    {
        let mut cache_write = cache.write().await;
        cache_write.insert(key, session.clone());
    }

    Ok(session)
}

/// Run a shell line to completion on the remote host
async fn run_shell(session: &Session, line: &str) -> Result<Output, openssh::Error> {
    let mut cmd = session.command("sh");
    cmd.arg("-c").arg(line);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.output().await
}

/// Exports and working directory change prefixed to a launched line
fn prelude(spec: &CommandSpec) -> String {
    let mut prefix = String::new();
    for (key, value) in &spec.env {
        prefix.push_str(&format!("export {}={}; ", key, quote(value)));
    }
    if let Some(ref dir) = spec.workdir {
        prefix.push_str(&format!("cd {} && ", quote(dir)));
    }
    prefix
}

/// Follow a remote file, forwarding each line to the log
fn spawn_tail(session: Arc<Session>, host: String, path: String) -> JoinHandle<()> {
    use tokio::io::{AsyncBufReadExt, BufReader};

    tokio::spawn(async move {
        let mut cmd = session.command("tail");
        cmd.arg("-F").arg(&path);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());

        let Ok(mut child) = cmd.spawn().await else {
            return;
        };
        if let Some(stdout) = child.stdout().take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(host = %host, stream = "stdout", "{}", line);
            }
        }
        let _ = child.wait().await;
    })
}

pub struct SshExecutor {
    settings: SshSettings,
    sessions: SessionCache,
    service: String,
    seq: AtomicU64,
}

impl SshExecutor {
    pub fn new(service: &str, settings: SshSettings, sessions: SessionCache) -> Self {
        Self {
            settings,
            sessions,
            service: service.to_string(),
            seq: AtomicU64::new(0),
        }
    }

    /// Unique path prefix for a launch's exit status and output files
    fn scratch_prefix(&self, host: &HostTarget) -> String {
        format!(
            "/tmp/svcrig-{}-{}-{}-{}",
            self.service,
            host.name,
            std::process::id(),
            self.seq.fetch_add(1, Ordering::Relaxed)
        )
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(
        &self,
        host: &HostTarget,
        spec: &CommandSpec,
    ) -> Result<Arc<dyn ProcessHandle>, ExecError> {
        let session = get_session(&self.settings, host, &self.sessions).await?;
        let line = format!("{}{}", prelude(spec), spec.line);

        if spec.synchronous {
            debug!(host = %host, command = %spec.line, "executing remote command");
            let output = run_shell(&session, &line).await?;
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                debug!(host = %host, stderr = %stderr.trim(), "command wrote to stderr");
            }
            return Ok(Arc::new(CompletedHandle::new(
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stdout),
            )));
        }

        let prefix = self.scratch_prefix(host);
        let exit_file = format!("{}.exit", prefix);
        let out_file = format!("{}.out", prefix);
        let stdout = match spec.stdout {
            OutputMode::Discard => "/dev/null",
            _ => out_file.as_str(),
        };
        let stderr_redirect = match (spec.stdout, spec.stderr) {
            (_, OutputMode::Discard) => "2>/dev/null".to_string(),
            (OutputMode::Discard, _) => format!("2>{}", out_file),
            _ => "2>&1".to_string(),
        };

        // wrapper records the exit status so liveness survives reconnects;
        // subshell fully detaches the process from the SSH session
        let inner = format!("{}; echo $? > {}", line, exit_file);
        let wrapper = format!(
            "( nohup sh -c {} </dev/null >{} {} & echo $! )",
            quote(&inner),
            stdout,
            stderr_redirect
        );
        info!(host = %host, command = %spec.line, "launching remote process");

        let output = run_shell(&session, &wrapper).await?;
        if !output.status.success() {
            return Err(ExecError::remote(host, "failed to launch remote process"));
        }
        let raw = String::from_utf8_lossy(&output.stdout);
        let pid: u32 = raw
            .trim()
            .parse()
            .map_err(|_| ExecError::remote(host, format!("could not parse remote pid '{}'", raw.trim())))?;
        info!(host = %host, pid = pid, "captured remote pid");

        let uses_out = spec.stdout != OutputMode::Discard || spec.stderr != OutputMode::Discard;
        let tail = (spec.stdout == OutputMode::Log || spec.stderr == OutputMode::Log)
            .then(|| spawn_tail(session.clone(), host.to_string(), out_file.clone()));
        let captured = spec.stdout == OutputMode::Capture || spec.stderr == OutputMode::Capture;

        Ok(Arc::new(RemoteHandle {
            session,
            host: host.to_string(),
            pid,
            exit_file,
            out_file: uses_out.then_some(out_file),
            captured,
            tail: Mutex::new(tail),
        }))
    }
}

/// A process launched in the background on a remote host
pub struct RemoteHandle {
    session: Arc<Session>,
    host: String,
    pid: u32,
    exit_file: String,
    out_file: Option<String>,
    captured: bool,
    tail: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteHandle {
    async fn stop_tail(&self) {
        if let Some(tail) = self.tail.lock().await.take() {
            tail.abort();
        }
    }
}

#[async_trait]
impl ProcessHandle for RemoteHandle {
    async fn exit_code(&self) -> Result<Option<i32>, ExecError> {
        let check = format!(
            "if [ -f {exit} ]; then cat {exit}; elif kill -0 {pid} 2>/dev/null; then echo running; else echo gone; fi",
            exit = quote(&self.exit_file),
            pid = self.pid
        );
        let output = run_shell(&self.session, &check).await?;
        let text = String::from_utf8_lossy(&output.stdout);
        match text.trim() {
            "running" => Ok(None),
            "gone" | "" => Ok(Some(-1)),
            code => code
                .parse::<i32>()
                .map(Some)
                .map_err(|_| ExecError::remote(&self.host, format!("unreadable exit status '{}'", code))),
        }
    }

    async fn destroy(&self) -> Result<(), ExecError> {
        self.stop_tail().await;
        if self.exit_code().await?.is_some() {
            return Ok(());
        }
        info!(host = %self.host, pid = self.pid, "terminating remote process");
        let kill_cmd = format!(
            "pkill -TERM -P {pid} 2>/dev/null; kill {pid} 2>/dev/null; true",
            pid = self.pid
        );
        run_shell(&self.session, &kill_cmd).await?;
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
        if !self.captured {
            return None;
        }
        let path = self.out_file.as_ref()?;
        let output = run_shell(&self.session, &format!("cat {} 2>/dev/null", quote(path)))
            .await
            .ok()?;
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Host file access over SSH: shell commands for checks, SFTP for contents
pub struct SshProbe {
    settings: SshSettings,
    sessions: SessionCache,
}

impl SshProbe {
    pub fn new(settings: SshSettings, sessions: SessionCache) -> Self {
        Self { settings, sessions }
    }

    async fn shell(&self, host: &HostTarget, line: &str) -> Result<Output, ExecError> {
        let session = get_session(&self.settings, host, &self.sessions).await?;
        Ok(run_shell(&session, line).await?)
    }

    async fn download(&self, host: &HostTarget, remote: &str) -> Result<Vec<u8>, ExecError> {
        let session = get_session(&self.settings, host, &self.sessions).await?;
        let sftp = Sftp::from_clonable_session(session, Default::default()).await?;
        let mut remote_file = sftp.open(remote).await?;

        let mut contents = Vec::new();
        loop {
            let buf = BytesMut::with_capacity(8192);
            match remote_file.read(8192, buf).await? {
                Some(data) => contents.extend_from_slice(&data),
                None => break,
            }
        }
        remote_file.close().await?;
        sftp.close().await?;
        Ok(contents)
    }
}

#[async_trait]
impl HostProbe for SshProbe {
    async fn exists(&self, host: &HostTarget, path: &str) -> Result<bool, ExecError> {
        let output = self.shell(host, &format!("test -e {}", quote(path))).await?;
        Ok(output.status.success())
    }

    async fn delete(&self, host: &HostTarget, path: &str) -> Result<bool, ExecError> {
        let line = format!(
            "if [ -e {p} ]; then rm -f {p} && echo deleted; fi",
            p = quote(path)
        );
        let output = self.shell(host, &line).await?;
        if !output.status.success() {
            return Err(ExecError::remote(host, format!("could not delete {}", path)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).contains("deleted"))
    }

    async fn delete_matching(
        &self,
        host: &HostTarget,
        dir: &str,
        pattern: &str,
    ) -> Result<bool, ExecError> {
        let line = format!(
            "find {} -maxdepth 1 -type f -name {} -exec rm -f {{}} +",
            quote(dir),
            quote(pattern)
        );
        Ok(self.shell(host, &line).await?.status.success())
    }

    async fn copy_to_local(
        &self,
        host: &HostTarget,
        remote: &str,
        local: &Path,
    ) -> Result<bool, ExecError> {
        if !self.exists(host, remote).await? {
            return Ok(false);
        }
        debug!(host = %host, remote = %remote, local = %local.display(), "downloading file");
        let contents = self.download(host, remote).await?;

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local, &contents).await?;
        debug!(local = %local.display(), bytes = contents.len(), "download complete");
        Ok(true)
    }

    async fn truncate(&self, host: &HostTarget, path: &str) -> Result<(), ExecError> {
        let output = self.shell(host, &format!(": > {}", quote(path))).await?;
        if !output.status.success() {
            return Err(ExecError::remote(host, format!("could not truncate {}", path)));
        }
        Ok(())
    }

    async fn read_file(&self, host: &HostTarget, path: &str) -> Result<Vec<u8>, ExecError> {
        self.download(host, path).await
    }
}
