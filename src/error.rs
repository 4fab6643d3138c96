//! Error types for remote execution and service lifecycle

use svcrig_config::ConfigError;
use thiserror::Error;

use crate::registry::Role;
use crate::service::LifecycleState;

/// Failure talking to a host, either running a command or touching a file
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ssh error: {0}")]
    Ssh(#[from] openssh::Error),
    #[error("sftp error: {0}")]
    Sftp(#[from] openssh_sftp_client::Error),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("{host}: {message}")]
    Remote { host: String, message: String },
}

impl ExecError {
    pub fn remote(host: impl ToString, message: impl Into<String>) -> Self {
        ExecError::Remote {
            host: host.to_string(),
            message: message.into(),
        }
    }
}

/// Host-scoped (or, for configuration, run-scoped) lifecycle failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifecycleError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("{role} on {host} not ready after {attempts} attempts")]
    ReadinessTimeout {
        host: String,
        role: Role,
        attempts: u32,
    },
    #[error("{role} on {host} exited unexpectedly with code {code}")]
    UnexpectedExit { host: String, role: Role, code: i32 },
    #[error("{role} on {host} still up after {attempts} attempts")]
    TerminationTimeout {
        host: String,
        role: Role,
        attempts: u32,
    },
    #[error("remote execution failed on {host}: {message}")]
    RemoteExecution { host: String, message: String },
    #[error("could not copy {remote} from {host} to {local}")]
    LogCollection {
        host: String,
        remote: String,
        local: String,
    },
    #[error("operation on {host} cancelled")]
    Cancelled { host: String },
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },
}

impl LifecycleError {
    pub fn remote(host: impl ToString, err: &ExecError) -> Self {
        LifecycleError::RemoteExecution {
            host: host.to_string(),
            message: err.to_string(),
        }
    }
}
