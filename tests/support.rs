//! Shared fixtures: a service script and service files pointing at it

use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Writes its pid file, logs a start line, and removes the pid file on TERM
const SERVER_SCRIPT: &str = r#"echo $$ > "$1"
echo started >> "$2"
trap 'echo stopping >> "$2"; rm -f "$1"; exit 0' TERM
while true; do sleep 0.1; done
"#;

#[allow(deprecated)]
pub fn svcrig_cmd() -> Command {
    Command::cargo_bin("svcrig").unwrap()
}

pub fn write_service_file(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("svcrig.env");
    fs::write(&path, content).unwrap();
    path
}

/// Service file managing the test script on localhost
pub fn local_service(dir: &TempDir, extra: &str) -> PathBuf {
    fs::write(dir.path().join("server.sh"), SERVER_SCRIPT).unwrap();
    let home = dir.path().display();
    let content = format!(
        r#"name=testsvc
hosts=localhost
transport=local
home={home}
pid_dir={home}
command='exec sh {{{{home}}}}server.sh {{{{pid_file}}}} {{{{home}}}}server.log'
startup_attempts=50
startup_interval=100ms
shutdown_attempts=50
shutdown_interval=100ms
{extra}
"#
    );
    write_service_file(dir, &content)
}

pub fn pid_file(dir: &TempDir) -> PathBuf {
    dir.path().join("localhost.pid")
}

/// Kill whatever the pid file points at, for cleanup after a failed test
pub fn kill_leftover(dir: &TempDir) {
    if let Ok(pid) = fs::read_to_string(pid_file(dir)) {
        let _ = std::process::Command::new("kill").arg(pid.trim()).status();
    }
}

pub fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}
