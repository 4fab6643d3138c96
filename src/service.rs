//! Service lifecycle controller
//!
//! Starts a service on every configured host, watches it for unexpected
//! exits and stops it again. Each host is handled by its own task; a failure
//! on one host never aborts its siblings. Outcomes are accumulated into a
//! [`PerHostResult`] and the caller decides what overall success means.
//!
//! Readiness and shutdown are both observed through the configured probe:
//! start polls until the probe reports the service up, stop terminates the
//! process and polls until the same probe reports it down.

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use svcrig_config::{HostTarget, ListenerConfig, PollBudget, Probe, Properties, ServiceConfig, Termination};

use crate::env::launch_env;
use crate::error::{ExecError, LifecycleError};
use crate::exec::{CommandSpec, ProcessHandle, RemoteExecutor};
use crate::poll::{CancelSignal, PollOutcome, poll_until};
use crate::probe::HostProbe;
use crate::registry::{HandleRegistry, Role};

/// Controller state; `Failed` is absorbing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Unconfigured,
    Configured,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Unconfigured => "unconfigured",
            LifecycleState::Configured => "configured",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// What the registered handle says about a host's process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// no handle registered, or the handle could not be queried
    Unknown,
    Running,
    ExitedUnexpectedly(i32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostOutcome {
    Running,
    Stopped,
    Failed(LifecycleError),
}

/// Per-host outcomes in host-list order
#[derive(Debug, Clone, Default)]
pub struct PerHostResult {
    outcomes: Vec<(HostTarget, HostOutcome)>,
}

impl PerHostResult {
    fn push(&mut self, host: HostTarget, outcome: HostOutcome) {
        self.outcomes.push((host, outcome));
    }

    pub fn get(&self, host: &HostTarget) -> Option<&HostOutcome> {
        self.outcomes
            .iter()
            .find(|(h, _)| h == host)
            .map(|(_, outcome)| outcome)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HostTarget, &HostOutcome)> {
        self.outcomes.iter().map(|(h, o)| (h, o))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&HostTarget, &LifecycleError)> {
        self.outcomes.iter().filter_map(|(h, o)| match o {
            HostOutcome::Failed(e) => Some((h, e)),
            _ => None,
        })
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Up,
    Down,
}

/// Everything a per-host task needs, cloned into each task
#[derive(Clone)]
struct HostContext {
    config: Arc<ServiceConfig>,
    executor: Arc<dyn RemoteExecutor>,
    probe: Arc<dyn HostProbe>,
    registry: HandleRegistry,
    cancel: CancelSignal,
}

impl HostContext {
    async fn start_host(&self, host: &HostTarget) -> HostOutcome {
        let config = &self.config;
        let spec = CommandSpec::background(config.command_for(host))
            .with_env(launch_env(config, host))
            .with_workdir(config.working_dir())
            .with_output(config.stdout, config.stderr);

        info!(service = %config.name, host = %host, progress = "start", "starting");
        let handle = match self.executor.execute(host, &spec).await {
            Ok(handle) => handle,
            Err(e) => return self.remote_failure(host, "launch failed", &e),
        };

        let outcome = self
            .wait_until(host, &config.ready, Expect::Up, config.startup)
            .await;
        match outcome {
            PollOutcome::Ready { attempts } => {
                self.registry.insert(host, Role::Primary, handle).await;
                info!(service = %config.name, host = %host, attempts = attempts, progress = "ready", "ready");
            }
            PollOutcome::TimedOut { attempts } => {
                self.registry.insert(host, Role::Primary, handle).await;
                error!(
                    service = %config.name,
                    host = %host,
                    attempts = attempts,
                    probe = %config.ready.describe(),
                    progress = "failed",
                    "service did not become ready"
                );
                return HostOutcome::Failed(LifecycleError::ReadinessTimeout {
                    host: host.to_string(),
                    role: Role::Primary,
                    attempts,
                });
            }
            PollOutcome::Cancelled => {
                if let Err(e) = handle.destroy().await {
                    debug!(host = %host, error = ?e, "could not destroy cancelled launch");
                }
                warn!(service = %config.name, host = %host, progress = "failed", "start cancelled");
                return HostOutcome::Failed(LifecycleError::Cancelled {
                    host: host.to_string(),
                });
            }
        }

        match config.listener {
            Some(ref listener) => self.start_listener(host, listener).await,
            None => HostOutcome::Running,
        }
    }

    /// Bring up the secondary process once the primary is running
    async fn start_listener(&self, host: &HostTarget, listener: &ListenerConfig) -> HostOutcome {
        let status = Probe::Status {
            cmd: listener.status.clone(),
        };
        if let Ok(true) = self.matches(host, &status, Expect::Up).await {
            info!(service = %self.config.name, host = %host, "listener already running");
            return HostOutcome::Running;
        }

        let spec = CommandSpec::background(self.config.render(&listener.start, host))
            .with_env(launch_env(&self.config, host))
            .with_workdir(self.config.working_dir());
        info!(service = %self.config.name, host = %host, "starting listener");
        let handle = match self.executor.execute(host, &spec).await {
            Ok(handle) => handle,
            Err(e) => return self.remote_failure(host, "listener launch failed", &e),
        };

        match self
            .wait_until(host, &status, Expect::Up, self.config.startup)
            .await
        {
            PollOutcome::Ready { .. } => {
                self.registry.insert(host, Role::Listener, handle).await;
                HostOutcome::Running
            }
            PollOutcome::TimedOut { attempts } => {
                self.registry.insert(host, Role::Listener, handle).await;
                error!(service = %self.config.name, host = %host, attempts = attempts, progress = "failed", "listener did not become ready");
                HostOutcome::Failed(LifecycleError::ReadinessTimeout {
                    host: host.to_string(),
                    role: Role::Listener,
                    attempts,
                })
            }
            PollOutcome::Cancelled => {
                if let Err(e) = handle.destroy().await {
                    debug!(host = %host, error = ?e, "could not destroy cancelled listener launch");
                }
                warn!(service = %self.config.name, host = %host, progress = "failed", "listener start cancelled");
                HostOutcome::Failed(LifecycleError::Cancelled {
                    host: host.to_string(),
                })
            }
        }
    }

    async fn stop_host(&self, host: &HostTarget) -> HostOutcome {
        let config = &self.config;
        let listener_error = match config.listener {
            Some(ref listener) => self.stop_listener(host, listener).await,
            None => None,
        };

        let handle = self.registry.handle(host, Role::Primary).await;
        let liveness = liveness_of(host, handle.as_ref()).await;

        let already_down = match self.matches(host, &config.ready, Expect::Down).await {
            Ok(down) => down,
            Err(e) => return self.remote_failure(host, "could not probe", &e),
        };
        if already_down && liveness != Liveness::Running {
            self.registry.take(host, Role::Primary).await;
            info!(service = %config.name, host = %host, progress = "stopped", "not running");
            return listener_error.map_or(HostOutcome::Stopped, HostOutcome::Failed);
        }

        info!(service = %config.name, host = %host, progress = "stopping", "stopping");
        if let Err(e) = self.terminate(host, handle.as_ref(), liveness).await {
            return self.remote_failure(host, "termination failed", &e);
        }

        match self
            .wait_until(host, &config.ready, Expect::Down, config.shutdown)
            .await
        {
            PollOutcome::Ready { attempts } => {
                self.registry.take(host, Role::Primary).await;
                info!(service = %config.name, host = %host, attempts = attempts, progress = "stopped", "stopped");
                listener_error.map_or(HostOutcome::Stopped, HostOutcome::Failed)
            }
            PollOutcome::TimedOut { attempts } => {
                error!(
                    service = %config.name,
                    host = %host,
                    attempts = attempts,
                    progress = "failed",
                    "service did not go down"
                );
                HostOutcome::Failed(LifecycleError::TerminationTimeout {
                    host: host.to_string(),
                    role: Role::Primary,
                    attempts,
                })
            }
            PollOutcome::Cancelled => HostOutcome::Failed(LifecycleError::Cancelled {
                host: host.to_string(),
            }),
        }
    }

    /// Stop the secondary process ahead of the primary
    async fn stop_listener(&self, host: &HostTarget, listener: &ListenerConfig) -> Option<LifecycleError> {
        let status = Probe::Status {
            cmd: listener.status.clone(),
        };
        match self.matches(host, &status, Expect::Up).await {
            Ok(true) => {}
            Ok(false) => {
                self.registry.take(host, Role::Listener).await;
                return None;
            }
            Err(e) => {
                debug!(host = %host, error = ?e, "listener status unavailable");
                return None;
            }
        }

        info!(service = %self.config.name, host = %host, "stopping listener");
        let stop = CommandSpec::sync(self.config.render(&listener.stop, host))
            .with_env(launch_env(&self.config, host))
            .with_workdir(self.config.working_dir());
        if let Err(e) = self.executor.execute(host, &stop).await {
            warn!(host = %host, error = %e, "listener stop command failed");
            debug!(host = %host, error = ?e, "listener stop error");
        }

        match self
            .wait_until(host, &status, Expect::Down, self.config.shutdown)
            .await
        {
            PollOutcome::Ready { .. } => {
                self.registry.take(host, Role::Listener).await;
                None
            }
            PollOutcome::TimedOut { attempts } => {
                error!(service = %self.config.name, host = %host, attempts = attempts, "listener did not go down");
                Some(LifecycleError::TerminationTimeout {
                    host: host.to_string(),
                    role: Role::Listener,
                    attempts,
                })
            }
            PollOutcome::Cancelled => Some(LifecycleError::Cancelled {
                host: host.to_string(),
            }),
        }
    }

    async fn terminate(
        &self,
        host: &HostTarget,
        handle: Option<&Arc<dyn ProcessHandle>>,
        liveness: Liveness,
    ) -> Result<(), ExecError> {
        match self.config.stop {
            Termination::Handle => match handle {
                Some(handle) if liveness == Liveness::Running => {
                    debug!(host = %host, "destroying process handle");
                    handle.destroy().await
                }
                _ => self.kill_by_pid(host).await,
            },
            Termination::Pid => self.kill_by_pid(host).await,
            Termination::Command { ref cmd } => {
                let spec = CommandSpec::sync(self.config.render(cmd, host))
                    .with_env(launch_env(&self.config, host))
                    .with_workdir(self.config.working_dir());
                let done = self.executor.execute(host, &spec).await?;
                if let Ok(Some(code)) = done.exit_code().await
                    && code != 0
                {
                    debug!(host = %host, code = code, "stop command exited non-zero");
                }
                Ok(())
            }
        }
    }

    /// Send `kill` to the pid recorded in the host's pid file. The kill's own
    /// exit status is not checked; the shutdown poll decides the outcome.
    async fn kill_by_pid(&self, host: &HostTarget) -> Result<(), ExecError> {
        let pid_file = self
            .config
            .pid_file_for(host)
            .ok_or_else(|| ExecError::remote(host, "no pid file configured"))?;
        let raw = self.probe.read_file(host, &pid_file).await?;
        let text = String::from_utf8_lossy(&raw);
        let first = text.lines().next().unwrap_or("").trim();
        // 0 would signal our own process group, 1 is init
        let pid = first
            .parse::<u32>()
            .ok()
            .filter(|pid| *pid > 1)
            .ok_or_else(|| ExecError::remote(host, format!("invalid pid '{}' in {}", first, pid_file)))?;

        info!(host = %host, pid = pid, "killing process");
        self.executor
            .execute(host, &CommandSpec::sync(format!("kill {}", pid)))
            .await?;
        Ok(())
    }

    /// Evaluate a probe once against the expected direction
    async fn matches(&self, host: &HostTarget, probe: &Probe, expect: Expect) -> Result<bool, ExecError> {
        let up = match probe {
            Probe::PidFile => {
                let path = self
                    .config
                    .pid_file_for(host)
                    .ok_or_else(|| ExecError::remote(host, "no pid file configured"))?;
                self.probe.exists(host, &path).await?
            }
            Probe::Status { cmd } => {
                let spec = CommandSpec::sync(self.config.render(cmd, host))
                    .with_env(launch_env(&self.config, host));
                let done = self.executor.execute(host, &spec).await?;
                done.output()
                    .await
                    .is_some_and(|out| !out.trim().is_empty())
            }
            Probe::LogMessage {
                path,
                started,
                stopped,
            } => {
                let path = self.config.render(path, host);
                if !self.probe.exists(host, &path).await? {
                    return Ok(expect == Expect::Down);
                }
                let contents = self.probe.read_file(host, &path).await?;
                let contents = String::from_utf8_lossy(&contents);
                // a log probe is one-sided in each direction
                return Ok(match expect {
                    Expect::Up => contents.contains(started.as_str()),
                    Expect::Down => contents.contains(stopped.as_str()),
                });
            }
        };
        Ok(up == (expect == Expect::Up))
    }

    async fn wait_until(&self, host: &HostTarget, probe: &Probe, expect: Expect, budget: PollBudget) -> PollOutcome {
        let name = &self.config.name;
        let max_attempts = budget.attempts;
        let mut attempt = 0u32;
        poll_until(
            move || {
                attempt += 1;
                let current = attempt;
                async move {
                    debug!(service = %name, host = %host, attempt = current, max_attempts = max_attempts, "polling");
                    match self.matches(host, probe, expect).await {
                        Ok(matched) => matched,
                        Err(e) => {
                            debug!(host = %host, error = ?e, "probe failed");
                            false
                        }
                    }
                }
            },
            budget,
            &self.cancel,
        )
        .await
    }

    fn remote_failure(&self, host: &HostTarget, what: &str, err: &ExecError) -> HostOutcome {
        warn!(service = %self.config.name, host = %host, error = %err, progress = "failed", "{}", what);
        debug!(host = %host, error = ?err, "remote execution error");
        HostOutcome::Failed(LifecycleError::remote(host, err))
    }
}

async fn liveness_of(host: &HostTarget, handle: Option<&Arc<dyn ProcessHandle>>) -> Liveness {
    let Some(handle) = handle else {
        return Liveness::Unknown;
    };
    match handle.exit_code().await {
        Ok(None) => Liveness::Running,
        Ok(Some(code)) => Liveness::ExitedUnexpectedly(code),
        Err(e) => {
            debug!(host = %host, error = ?e, "could not query exit code");
            Liveness::Unknown
        }
    }
}

/// Run one task per host and gather outcomes in host order
async fn per_host<F, Fut>(hosts: &[HostTarget], op: F) -> PerHostResult
where
    F: Fn(HostTarget) -> Fut,
    Fut: Future<Output = HostOutcome> + Send + 'static,
{
    let tasks: Vec<_> = hosts
        .iter()
        .map(|host| (host.clone(), tokio::spawn(op(host.clone()))))
        .collect();

    let mut result = PerHostResult::default();
    for (host, task) in tasks {
        let outcome = task.await.unwrap_or_else(|e| {
            HostOutcome::Failed(LifecycleError::RemoteExecution {
                host: host.to_string(),
                message: format!("host task failed: {}", e),
            })
        });
        result.push(host, outcome);
    }
    result
}

/// Owns one service's configuration, handle registry and lifecycle state
pub struct ServiceController {
    config: Option<Arc<ServiceConfig>>,
    executor: Arc<dyn RemoteExecutor>,
    probe: Arc<dyn HostProbe>,
    registry: HandleRegistry,
    state: Arc<RwLock<LifecycleState>>,
    cancel: CancelSignal,
}

impl ServiceController {
    pub fn new(executor: Arc<dyn RemoteExecutor>, probe: Arc<dyn HostProbe>) -> Self {
        Self {
            config: None,
            executor,
            probe,
            registry: HandleRegistry::new(),
            state: Arc::new(RwLock::new(LifecycleState::Unconfigured)),
            cancel: CancelSignal::never(),
        }
    }

    /// Abandon in-flight polls when `cancel` fires
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validate properties and take the resulting configuration
    pub async fn configure(&mut self, props: &Properties) -> Result<(), LifecycleError> {
        self.check_configurable().await?;
        let config = ServiceConfig::from_properties(props).inspect_err(|e| {
            error!(error = %e, "invalid service configuration");
        })?;
        self.install(config).await;
        Ok(())
    }

    /// Take an already validated configuration
    pub async fn configure_with(&mut self, config: ServiceConfig) -> Result<(), LifecycleError> {
        self.check_configurable().await?;
        self.install(config).await;
        Ok(())
    }

    async fn check_configurable(&self) -> Result<(), LifecycleError> {
        let state = *self.state.read().await;
        match state {
            LifecycleState::Unconfigured | LifecycleState::Configured | LifecycleState::Stopped => Ok(()),
            _ => Err(LifecycleError::InvalidState {
                operation: "configure",
                state,
            }),
        }
    }

    async fn install(&mut self, config: ServiceConfig) {
        info!(
            service = %config.name,
            hosts = config.hosts.len(),
            ready = %config.ready.describe(),
            "service configured"
        );
        self.config = Some(Arc::new(config));
        *self.state.write().await = LifecycleState::Configured;
    }

    pub fn config(&self) -> Option<&Arc<ServiceConfig>> {
        self.config.as_ref()
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.read().await
    }

    fn context(&self, operation: &'static str) -> Result<HostContext, LifecycleError> {
        let config = self.config.clone().ok_or(LifecycleError::InvalidState {
            operation,
            state: LifecycleState::Unconfigured,
        })?;
        Ok(HostContext {
            config,
            executor: self.executor.clone(),
            probe: self.probe.clone(),
            registry: self.registry.clone(),
            cancel: self.cancel.clone(),
        })
    }

    /// Move to `to` if the current state is one of `from`, returning the old state
    async fn transition(
        &self,
        operation: &'static str,
        from: &[LifecycleState],
        to: LifecycleState,
    ) -> Result<LifecycleState, LifecycleError> {
        let mut state = self.state.write().await;
        if !from.contains(&*state) {
            return Err(LifecycleError::InvalidState {
                operation,
                state: *state,
            });
        }
        let previous = *state;
        *state = to;
        Ok(previous)
    }

    /// Start the service on every configured host
    pub async fn start(&self) -> Result<PerHostResult, LifecycleError> {
        let ctx = self.context("start")?;
        self.start_hosts(&ctx.config.hosts).await
    }

    pub async fn start_hosts(&self, hosts: &[HostTarget]) -> Result<PerHostResult, LifecycleError> {
        let ctx = self.context("start")?;
        self.transition(
            "start",
            &[LifecycleState::Configured, LifecycleState::Stopped],
            LifecycleState::Starting,
        )
        .await?;

        let result = per_host(hosts, |host| {
            let ctx = ctx.clone();
            async move { ctx.start_host(&host).await }
        })
        .await;

        let next = if result.iter().all(|(_, o)| *o == HostOutcome::Running) {
            LifecycleState::Running
        } else {
            LifecycleState::Failed
        };
        *self.state.write().await = next;
        Ok(result)
    }

    /// Query a host's registered handle without blocking
    pub async fn is_alive(&self, host: &HostTarget) -> Liveness {
        let handle = self.registry.handle(host, Role::Primary).await;
        let liveness = liveness_of(host, handle.as_ref()).await;
        if let Liveness::ExitedUnexpectedly(code) = liveness {
            warn!(host = %host, code = code, progress = "exited", "process exited unexpectedly");
            let mut state = self.state.write().await;
            if *state == LifecycleState::Running {
                *state = LifecycleState::Failed;
            }
        }
        liveness
    }

    /// Liveness of every host in the configured host list
    pub async fn check_all(&self) -> Vec<(HostTarget, Liveness)> {
        let hosts = self.config.as_ref().map(|c| c.hosts.clone()).unwrap_or_default();
        let mut result = Vec::with_capacity(hosts.len());
        for host in hosts {
            let liveness = self.is_alive(&host).await;
            result.push((host, liveness));
        }
        result
    }

    /// Unexpected exits among the registered hosts
    pub async fn monitor(&self) -> Vec<LifecycleError> {
        self.check_all()
            .await
            .into_iter()
            .filter_map(|(host, liveness)| match liveness {
                Liveness::ExitedUnexpectedly(code) => Some(LifecycleError::UnexpectedExit {
                    host: host.to_string(),
                    role: Role::Primary,
                    code,
                }),
                _ => None,
            })
            .collect()
    }

    /// Evaluate the readiness probe once
    pub async fn is_up(&self, host: &HostTarget) -> Result<bool, LifecycleError> {
        let ctx = self.context("probe")?;
        ctx.matches(host, &ctx.config.ready, Expect::Up)
            .await
            .map_err(|e| LifecycleError::remote(host, &e))
    }

    /// Stop the service on every configured host
    pub async fn stop(&self) -> Result<PerHostResult, LifecycleError> {
        match self.config {
            Some(ref config) => {
                let hosts = config.hosts.clone();
                self.stop_hosts(&hosts).await
            }
            None => Ok(PerHostResult::default()),
        }
    }

    pub async fn stop_hosts(&self, hosts: &[HostTarget]) -> Result<PerHostResult, LifecycleError> {
        let current = self.state().await;
        if matches!(current, LifecycleState::Unconfigured | LifecycleState::Stopped) {
            debug!(state = %current, "nothing to stop");
            return Ok(PerHostResult::default());
        }

        let ctx = self.context("stop")?;
        let previous = self
            .transition(
                "stop",
                &[
                    LifecycleState::Configured,
                    LifecycleState::Running,
                    LifecycleState::Stopping,
                    LifecycleState::Failed,
                ],
                LifecycleState::Stopping,
            )
            .await?;

        let result = per_host(hosts, |host| {
            let ctx = ctx.clone();
            async move { ctx.stop_host(&host).await }
        })
        .await;

        // hosts that did not confirm termination keep the stop retryable
        let next = if !result.is_success() {
            match previous {
                LifecycleState::Failed => LifecycleState::Failed,
                _ => LifecycleState::Stopping,
            }
        } else if self.registry.is_empty().await {
            LifecycleState::Stopped
        } else {
            previous
        };
        *self.state.write().await = next;
        Ok(result)
    }
}
