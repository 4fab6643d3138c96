//! Service file loading and launch environment

use std::path::Path;
use tracing::{debug, info};

use svcrig_config::{HostTarget, Properties, ServiceConfig};

/// Environment variables under this prefix override service file properties
const OVERRIDE_PREFIX: &str = "SVCRIG_";
/// Prefix of the variables handed to launched processes
const LAUNCH_PREFIX: &str = "SVCRIG_SVC_";

/// Load a dotenv-syntax service file, then apply environment overrides
pub fn load_properties(path: &Path) -> Result<Properties, String> {
    let mut props = read_properties(path)?;
    apply_overrides(&mut props, std::env::vars());
    Ok(props)
}

/// Parse a service file without looking at the environment.
///
/// Keys are lowercased. Single-quoted values are taken literally; unquoted
/// and double-quoted values go through dotenv `$VAR` substitution.
pub fn read_properties(path: &Path) -> Result<Properties, String> {
    if !path.exists() {
        return Err(format!("service file not found: {}", path.display()));
    }

    let iter = dotenvy::from_path_iter(path)
        .map_err(|e| format!("failed to load {}: {}", path.display(), e))?;

    let mut props = Properties::new();
    for item in iter {
        let (key, value) = item.map_err(|e| format!("failed to parse {}: {}", path.display(), e))?;
        props.set(key.to_lowercase(), value);
    }

    info!(path = %path.display(), properties = props.len(), "loaded service file");
    Ok(props)
}

/// Apply `SVCRIG_<KEY>` variables as `<key>` overrides
pub fn apply_overrides<I>(props: &mut Properties, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (name, value) in vars {
        if name.starts_with(LAUNCH_PREFIX) {
            continue;
        }
        let Some(key) = name.strip_prefix(OVERRIDE_PREFIX) else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        let key = key.to_lowercase();
        debug!(property = %key, "property overridden from environment");
        props.set(key, value);
    }
}

/// Environment for a process launched on `host`: the configured
/// `environment` entries followed by the `SVCRIG_SVC_*` variables
pub fn launch_env(config: &ServiceConfig, host: &HostTarget) -> Vec<(String, String)> {
    let mut vars = config.env.clone();
    let mut push = |name: &str, value: String| vars.push((format!("{}{}", LAUNCH_PREFIX, name), value));

    push("NAME", config.name.clone());
    push("HOST", host.name.clone());
    if let Some(port) = config.port_for(host) {
        push("PORT", port.to_string());
    }
    if let Some(pid_file) = config.pid_file_for(host) {
        push("PID_FILE", pid_file);
    }
    vars
}
