//! Property validation - converts a property set into a ServiceConfig

use std::time::Duration;
use tracing::debug;

use crate::error::ConfigError;
use crate::host::{parse_host_list, split_list};
use crate::properties::Properties;
use crate::semantic::{
    ListenerConfig, LogArtifact, OutputMode, PollBudget, Probe, ServiceConfig, SshSettings,
    Termination, Transport,
};

const DEFAULT_STOPPED_MESSAGE: &str = "shutting down";

/// Ensure a directory path ends with exactly one separator
pub fn normalize_dir(path: &str) -> String {
    format!("{}/", path.trim().trim_end_matches('/'))
}

/// Read-only view over a property set with required/optional accessors
pub struct Validator<'a> {
    props: &'a Properties,
}

impl<'a> Validator<'a> {
    pub fn new(props: &'a Properties) -> Self {
        Self { props }
    }

    /// Fail on the first missing or blank key, in the order given
    pub fn require(&self, keys: &[&str]) -> Result<(), ConfigError> {
        match keys.iter().find(|k| !self.props.contains(k)) {
            Some(key) => Err(ConfigError::missing(*key)),
            None => Ok(()),
        }
    }

    pub fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.props
            .get_trimmed(key)
            .map(str::to_string)
            .ok_or_else(|| ConfigError::missing(key))
    }

    pub fn optional(&self, key: &str) -> Option<String> {
        self.props.get_trimmed(key).map(str::to_string)
    }

    pub fn path(&self, key: &str) -> Option<String> {
        self.props.get_trimmed(key).map(normalize_dir)
    }

    /// Parse an optional value, logging the default when it is used
    pub fn optional_or<T, F>(&self, key: &str, default: T, parse: F) -> Result<T, ConfigError>
    where
        T: std::fmt::Debug,
        F: Fn(&str) -> Result<T, String>,
    {
        match self.props.get_trimmed(key) {
            Some(value) => parse(value).map_err(|e| ConfigError::invalid(key, e)),
            None => {
                debug!(property = key, default = ?default, "property not set, using default");
                Ok(default)
            }
        }
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    s.parse::<humantime::Duration>()
        .map(|d| d.into())
        .map_err(|e| format!("invalid duration '{}': {}", s, e))
}

fn parse_attempts(s: &str) -> Result<u32, String> {
    match s.parse::<u32>() {
        Ok(0) => Err("attempts must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(_) => Err(format!("invalid attempt count '{}'", s)),
    }
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(format!("invalid boolean '{}'", s)),
    }
}

fn parse_env(s: &str) -> Result<Vec<(String, String)>, String> {
    s.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| format!("invalid environment entry '{}'", entry))
        })
        .collect()
}

fn parse_artifacts(s: &str, truncate: bool) -> Result<Vec<LogArtifact>, String> {
    split_list(s)
        .map(|entry| {
            LogArtifact::parse(entry, truncate)
                .ok_or_else(|| format!("expected prefix:path, got '{}'", entry))
        })
        .collect()
}

fn parse_patterns(s: &str) -> Result<Vec<(String, String)>, String> {
    split_list(s)
        .map(|entry| match entry.rsplit_once('/') {
            Some((dir, pattern)) if !pattern.is_empty() => {
                let dir = if dir.is_empty() { "/" } else { dir };
                Ok((normalize_dir(dir), pattern.to_string()))
            }
            _ => Err(format!("expected dir/pattern, got '{}'", entry)),
        })
        .collect()
}

impl ServiceConfig {
    /// Validate a property set into a service description.
    ///
    /// Required keys depend on the readiness probe, termination strategy and
    /// listener setting; they are checked in a fixed order before any other
    /// value is interpreted.
    pub fn from_properties(props: &Properties) -> Result<ServiceConfig, ConfigError> {
        let v = Validator::new(props);

        let ready = v.optional_or("ready", Probe::PidFile, |s| {
            Probe::parse(s).ok_or_else(|| format!("unknown readiness check '{}'", s))
        })?;
        let stop = v.optional_or("stop", Termination::Handle, |s| {
            Termination::parse(s).ok_or_else(|| format!("unknown stop strategy '{}'", s))
        })?;
        let with_listener = v.optional_or("listener", false, parse_bool)?;

        let explicit_pid_file = props.contains("pid_file");
        let mut required = vec!["hosts", "command"];
        // handle and pid termination both fall back to the pid file
        let needs_pid_file =
            ready == Probe::PidFile || !matches!(stop, Termination::Command { .. });
        if !explicit_pid_file && needs_pid_file {
            required.push("pid_dir");
        }
        if matches!(ready, Probe::LogMessage { .. }) {
            required.push("ready_log");
        }
        if with_listener {
            required.extend(["listener_start", "listener_status", "listener_stop"]);
        }
        v.require(&required)?;

        let hosts = parse_host_list(&v.required("hosts")?)
            .map_err(|e| ConfigError::invalid("hosts", e))?;
        if hosts.is_empty() {
            return Err(ConfigError::missing("hosts"));
        }

        let ready = match ready {
            Probe::LogMessage { started, .. } => Probe::LogMessage {
                path: v.required("ready_log")?,
                started,
                stopped: v.optional_or(
                    "stopped_message",
                    DEFAULT_STOPPED_MESSAGE.to_string(),
                    |s| Ok(s.trim_matches('"').to_string()),
                )?,
            },
            other => other,
        };

        let pid_dir = v.path("pid_dir");
        let pid_file = match v.optional("pid_file") {
            Some(file) => Some(file),
            None => pid_dir.as_ref().map(|_| "{{pid_dir}}{{host}}.pid".to_string()),
        };

        let listener = if with_listener {
            Some(ListenerConfig {
                start: v.required("listener_start")?,
                status: v.required("listener_status")?,
                stop: v.required("listener_stop")?,
            })
        } else {
            None
        };

        let startup = PollBudget::new(
            v.optional_or("startup_attempts", 60, parse_attempts)?,
            v.optional_or("startup_interval", Duration::from_secs(1), parse_duration)?,
        );
        let shutdown = PollBudget::new(
            v.optional_or("shutdown_attempts", 60, parse_attempts)?,
            v.optional_or("shutdown_interval", Duration::from_secs(1), parse_duration)?,
        );

        let output_mode = |s: &str| {
            OutputMode::parse(s).ok_or_else(|| format!("unknown output mode '{}'", s))
        };

        let mut logs = v.optional_or("logs", Vec::new(), |s| parse_artifacts(s, true))?;
        logs.extend(v.optional_or("snapshots", Vec::new(), |s| parse_artifacts(s, false))?);

        Ok(ServiceConfig {
            name: v.optional_or("name", "service".to_string(), |s| Ok(s.to_string()))?,
            hosts,
            transport: v.optional_or("transport", Transport::Ssh, |s| {
                Transport::parse(s).ok_or_else(|| format!("unknown transport '{}'", s))
            })?,
            ssh: SshSettings {
                user: v.optional("ssh_user"),
                port: v
                    .optional("ssh_port")
                    .map(|p| p.parse::<u16>())
                    .transpose()
                    .map_err(|_| ConfigError::invalid("ssh_port", "invalid port number"))?,
                identity: v.optional("ssh_identity"),
            },
            command: v.required("command")?,
            home: v.path("home"),
            data_dir: v.path("data_dir"),
            pid_dir,
            workdir: v.path("workdir"),
            pid_file,
            default_port: v
                .optional("port")
                .map(|p| p.parse::<u16>())
                .transpose()
                .map_err(|_| ConfigError::invalid("port", "invalid port number"))?,
            flags: v.optional("flags").unwrap_or_default(),
            env: v.optional_or("environment", Vec::new(), parse_env)?,
            ready,
            stop,
            startup,
            shutdown,
            stdout: v.optional_or("stdout", OutputMode::Discard, output_mode)?,
            stderr: v.optional_or("stderr", OutputMode::Discard, output_mode)?,
            logs,
            clear: v
                .optional("clear")
                .map(|s| split_list(&s).map(str::to_string).collect())
                .unwrap_or_default(),
            clear_patterns: v.optional_or("clear_patterns", Vec::new(), parse_patterns)?,
            listener,
        })
    }
}
