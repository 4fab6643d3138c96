//! Service description types and validation for svcrig.
//!
//! A service is described by a flat set of properties (usually loaded from a
//! dotenv-style file). Validation turns those properties into an immutable
//! [`ServiceConfig`] or fails with a [`ConfigError`] naming the first missing
//! or malformed key.
//!
//! # Example
//!
//! ```
//! use svcrig_config::{Properties, ServiceConfig};
//!
//! let props = Properties::from_pairs([
//!     ("hosts", "db1, db2"),
//!     ("command", "{{home}}bin/mysqld_safe --pid-file={{pid_file}}"),
//!     ("home", "/opt/mysql"),
//!     ("pid_dir", "/opt/mysql/data"),
//! ]);
//!
//! let config = ServiceConfig::from_properties(&props).unwrap();
//! assert_eq!(config.hosts.len(), 2);
//! assert_eq!(config.home.as_deref(), Some("/opt/mysql/"));
//! ```

pub mod error;
pub mod host;
pub mod properties;
pub mod semantic;
pub mod validate;

pub use error::{ConfigError, ConfigErrorKind};
pub use host::{HostTarget, parse_host_list, split_list};
pub use properties::Properties;
pub use semantic::{
    ListenerConfig, LogArtifact, OutputMode, PollBudget, Probe, ServiceConfig, SshSettings,
    Termination, Transport,
};
pub use validate::{Validator, normalize_dir};
