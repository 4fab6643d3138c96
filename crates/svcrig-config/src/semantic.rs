//! Validated service model

use serde::Serialize;
use std::time::Duration;

use crate::host::HostTarget;

/// How commands and file probes reach a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Transport {
    Local,
    Ssh,
}

impl Transport {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Transport::Local),
            "ssh" => Some(Transport::Ssh),
            _ => None,
        }
    }
}

/// SSH connection parameters shared by every host of a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SshSettings {
    /// optional username (defaults to current user)
    pub user: Option<String>,
    /// optional port (defaults to 22)
    pub port: Option<u16>,
    /// optional identity file path
    pub identity: Option<String>,
}

impl SshSettings {
    pub fn destination(&self, host: &HostTarget) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, host.name),
            None => host.name.clone(),
        }
    }
}

/// Readiness predicate kind.
///
/// The same probe answers both "has it come up" and, inverted, "has it gone
/// down".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Probe {
    /// up while the pid file exists
    PidFile,
    /// up while the status command prints something
    Status { cmd: String },
    /// up once the log contains `started`, down once it contains `stopped`
    LogMessage {
        path: String,
        started: String,
        stopped: String,
    },
}

impl Probe {
    /// parse "pidfile", "cmd:<status command>" or "log:<message>";
    /// log probes are completed by the validator with their path
    pub fn parse(s: &str) -> Option<Self> {
        if s == "pidfile" {
            Some(Probe::PidFile)
        } else if let Some(rest) = s.strip_prefix("cmd:") {
            let cmd = rest.trim().trim_matches('"').to_string();
            (!cmd.is_empty()).then_some(Probe::Status { cmd })
        } else if let Some(rest) = s.strip_prefix("log:") {
            let started = rest.trim().trim_matches('"').to_string();
            (!started.is_empty()).then_some(Probe::LogMessage {
                path: String::new(),
                started,
                stopped: String::new(),
            })
        } else {
            None
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Probe::PidFile => "pidfile".to_string(),
            Probe::Status { cmd } => format!("cmd:{}", cmd),
            Probe::LogMessage { path, started, .. } => format!("log:{}@{}", started, path),
        }
    }
}

/// How a running instance is told to go away
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Termination {
    /// destroy the held handle; kill by pid when the handle is gone or exited
    Handle,
    /// always kill the pid recorded in the pid file
    Pid,
    /// run a stop command on the host
    Command { cmd: String },
}

impl Termination {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "handle" => Some(Termination::Handle),
            "pid" => Some(Termination::Pid),
            _ => {
                let cmd = s.strip_prefix("cmd:")?.trim().trim_matches('"').to_string();
                (!cmd.is_empty()).then_some(Termination::Command { cmd })
            }
        }
    }
}

/// What happens to a launched process's stdout or stderr
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum OutputMode {
    #[default]
    Discard,
    /// buffered and readable through the process handle
    Capture,
    /// forwarded line by line to the log
    Log,
}

impl OutputMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discard" => Some(OutputMode::Discard),
            "capture" => Some(OutputMode::Capture),
            "log" => Some(OutputMode::Log),
            _ => None,
        }
    }
}

/// Attempt count and fixed interval bounding a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollBudget {
    pub attempts: u32,
    #[serde(serialize_with = "serialize_duration")]
    pub interval: Duration,
}

impl PollBudget {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// worst-case sleeping time: sleeps happen between evaluations only
    pub fn max_wait(&self) -> Duration {
        self.interval * self.attempts.saturating_sub(1)
    }
}

impl Default for PollBudget {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval: Duration::from_secs(1),
        }
    }
}

/// A remote file fetched into the run output directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogArtifact {
    /// local file name is `<prefix>.<host>`
    pub prefix: String,
    /// remote path template
    pub path: String,
    /// truncate the remote file after a successful copy
    pub truncate: bool,
}

impl LogArtifact {
    /// parse "prefix:path"
    pub fn parse(s: &str, truncate: bool) -> Option<Self> {
        let (prefix, path) = s.split_once(':')?;
        let (prefix, path) = (prefix.trim(), path.trim());
        if prefix.is_empty() || path.is_empty() {
            return None;
        }
        Some(Self {
            prefix: prefix.to_string(),
            path: path.to_string(),
            truncate,
        })
    }
}

/// Secondary process that depends on the primary (e.g. a database listener)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerConfig {
    pub start: String,
    pub status: String,
    pub stop: String,
}

/// Validated service description
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceConfig {
    pub name: String,
    pub hosts: Vec<HostTarget>,
    pub transport: Transport,
    pub ssh: SshSettings,
    /// command template
    pub command: String,
    pub home: Option<String>,
    pub data_dir: Option<String>,
    pub pid_dir: Option<String>,
    pub workdir: Option<String>,
    /// pid file template
    pub pid_file: Option<String>,
    /// port used for hosts listed without one
    pub default_port: Option<u16>,
    pub flags: String,
    pub env: Vec<(String, String)>,
    pub ready: Probe,
    pub stop: Termination,
    pub startup: PollBudget,
    pub shutdown: PollBudget,
    pub stdout: OutputMode,
    pub stderr: OutputMode,
    pub logs: Vec<LogArtifact>,
    pub clear: Vec<String>,
    /// (directory, glob pattern) pairs
    pub clear_patterns: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listener: Option<ListenerConfig>,
}

impl ServiceConfig {
    /// Substitute `{{placeholder}}` values for one host.
    /// Unknown placeholders are left as they are.
    pub fn render(&self, template: &str, host: &HostTarget) -> String {
        let mut result = template.to_string();
        if let Some(ref pid_file) = self.pid_file {
            result = result.replace("{{pid_file}}", pid_file);
        }
        for (name, value) in self.variables(host) {
            let pattern = format!("{{{{{}}}}}", name);
            result = result.replace(&pattern, &value);
        }
        result
    }

    fn variables(&self, host: &HostTarget) -> Vec<(&'static str, String)> {
        let port = host
            .port
            .or(self.default_port)
            .map(|p| p.to_string())
            .unwrap_or_default();
        vec![
            ("host", host.name.clone()),
            ("port", port),
            ("name", self.name.clone()),
            ("home", self.home.clone().unwrap_or_default()),
            ("data_dir", self.data_dir.clone().unwrap_or_default()),
            ("pid_dir", self.pid_dir.clone().unwrap_or_default()),
            ("flags", self.flags.clone()),
        ]
    }

    pub fn command_for(&self, host: &HostTarget) -> String {
        self.render(&self.command, host)
    }

    pub fn pid_file_for(&self, host: &HostTarget) -> Option<String> {
        self.pid_file.as_ref().map(|p| self.render(p, host))
    }

    /// effective port for a host, if any
    pub fn port_for(&self, host: &HostTarget) -> Option<u16> {
        host.port.or(self.default_port)
    }

    pub fn working_dir(&self) -> Option<&str> {
        self.workdir.as_deref().or(self.home.as_deref())
    }
}

fn serialize_duration<S>(dur: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_str(&humantime::format_duration(*dur).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_parse() {
        assert_eq!(Probe::parse("pidfile"), Some(Probe::PidFile));
        assert_eq!(
            Probe::parse("cmd:\"lsnrctl status\""),
            Some(Probe::Status {
                cmd: "lsnrctl status".to_string()
            })
        );
        match Probe::parse("log:resuming normal operations") {
            Some(Probe::LogMessage { started, .. }) => {
                assert_eq!(started, "resuming normal operations")
            }
            other => panic!("expected log probe, got {:?}", other),
        }
        assert_eq!(Probe::parse("cmd:"), None);
        assert_eq!(Probe::parse("tcp:1"), None);
    }

    #[test]
    fn test_termination_parse() {
        assert_eq!(Termination::parse("handle"), Some(Termination::Handle));
        assert_eq!(Termination::parse("pid"), Some(Termination::Pid));
        assert_eq!(
            Termination::parse("cmd:apachectl stop"),
            Some(Termination::Command {
                cmd: "apachectl stop".to_string()
            })
        );
        assert_eq!(Termination::parse("sigterm"), None);
    }

    #[test]
    fn test_log_artifact_parse() {
        let log = LogArtifact::parse("mysql_err.log:{{data_dir}}{{host}}.err", true).unwrap();
        assert_eq!(log.prefix, "mysql_err.log");
        assert_eq!(log.path, "{{data_dir}}{{host}}.err");
        assert!(log.truncate);
        assert!(LogArtifact::parse("noprefix", true).is_none());
    }

    #[test]
    fn test_ssh_destination() {
        let host = HostTarget::new("db1");
        assert_eq!(SshSettings::default().destination(&host), "db1");
        let ssh = SshSettings {
            user: Some("bench".to_string()),
            ..Default::default()
        };
        assert_eq!(ssh.destination(&host), "bench@db1");
    }

    #[test]
    fn test_budget_max_wait() {
        let budget = PollBudget::new(60, Duration::from_secs(1));
        assert_eq!(budget.max_wait(), Duration::from_secs(59));
        let budget = PollBudget::new(1, Duration::from_secs(5));
        assert_eq!(budget.max_wait(), Duration::ZERO);
    }
}
