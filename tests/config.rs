//! Service file validation through the CLI

use predicates::prelude::*;
use tempfile::TempDir;

use crate::support::{svcrig_cmd, write_service_file};

#[test]
fn test_validate_ok() {
    let dir = TempDir::new().unwrap();
    let config = write_service_file(
        &dir,
        r#"
name=mysql
hosts='db1 db2:3307'
home=/opt/mysql
pid_dir=/opt/mysql/data
command='{{home}}bin/mysqld_safe --pid-file={{pid_file}}'
"#,
    );

    svcrig_cmd()
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Service file is valid!"))
        .stdout(predicate::str::contains("db1, db2:3307"))
        .stdout(predicate::str::contains("pidfile"));
}

#[test]
fn test_validate_missing_pid_dir() {
    let dir = TempDir::new().unwrap();
    let config = write_service_file(
        &dir,
        r#"
hosts=db1
command='mysqld_safe --pid-file={{pid_file}}'
"#,
    );

    svcrig_cmd()
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing property 'pid_dir'"));
}

#[test]
fn test_validate_invalid_attempts() {
    let dir = TempDir::new().unwrap();
    let config = write_service_file(
        &dir,
        r#"
hosts=db1
pid_dir=/var/run
command=mysqld
startup_attempts=0
"#,
    );

    svcrig_cmd()
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid property 'startup_attempts'"));
}

#[test]
fn test_validate_json() {
    let dir = TempDir::new().unwrap();
    let config = write_service_file(
        &dir,
        r#"
name=httpd
hosts=web1
command='apachectl start'
ready=log:resuming
ready_log=/var/log/httpd/error_log
stop='cmd:apachectl stop'
startup_interval=2s
"#,
    );

    let output = svcrig_cmd()
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .arg("--format")
        .arg("json")
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["name"], "httpd");
    assert_eq!(json["hosts"][0]["name"], "web1");
    assert_eq!(json["startup"]["interval"], "2s");
}

#[test]
fn test_validate_unknown_format() {
    let dir = TempDir::new().unwrap();
    let config = write_service_file(
        &dir,
        r#"
hosts=db1
pid_dir=/var/run
command=mysqld
"#,
    );

    svcrig_cmd()
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .arg("--format")
        .arg("yaml")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown format: yaml"));
}

#[test]
fn test_validate_default_stop_without_pid_dir() {
    let dir = TempDir::new().unwrap();
    let config = write_service_file(
        &dir,
        r#"
hosts=cache1
command='memcached -d'
ready='cmd:pgrep memcached'
"#,
    );

    svcrig_cmd()
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing property 'pid_dir'"));
}

#[test]
fn test_missing_service_file() {
    let dir = TempDir::new().unwrap();

    svcrig_cmd()
        .arg("-c")
        .arg(dir.path().join("nope.env"))
        .arg("validate")
        .assert()
        .failure();
}

#[test]
fn test_environment_override() {
    let dir = TempDir::new().unwrap();
    let config = write_service_file(
        &dir,
        r#"
hosts=db1
command=mysqld
"#,
    );

    svcrig_cmd()
        .env("SVCRIG_PID_DIR", "/var/run/mysql")
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .assert()
        .success();
}
