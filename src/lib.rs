//! Remote service lifecycle orchestration.
//!
//! A [`service::ServiceController`] starts one service on a set of hosts,
//! waits for each instance to report ready, watches for unexpected exits and
//! stops the instances again. Commands reach the hosts through a
//! [`exec::RemoteExecutor`] and files through a [`probe::HostProbe`]; both
//! have a local and an SSH implementation. [`logs::LogCollector`] fetches
//! the service's logs into a local output directory.

pub mod env;
pub mod error;
pub mod exec;
pub mod logs;
pub mod poll;
pub mod probe;
pub mod progress;
pub mod registry;
pub mod service;
pub mod ssh;

pub use error::{ExecError, LifecycleError};
pub use service::{HostOutcome, LifecycleState, Liveness, PerHostResult, ServiceController};
