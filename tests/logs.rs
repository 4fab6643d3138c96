//! Log collection and cleanup through the CLI

use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

use crate::support::{local_service, read, svcrig_cmd};

#[test]
fn test_collect_logs_and_snapshots() {
    let dir = TempDir::new().unwrap();
    let config = local_service(
        &dir,
        "logs=app.log:{{home}}app.log\nsnapshots=app.conf:{{home}}app.conf",
    );
    fs::write(dir.path().join("app.log"), "request served\n").unwrap();
    fs::write(dir.path().join("app.conf"), "workers=4\n").unwrap();
    let out = dir.path().join("out");

    svcrig_cmd()
        .arg("-c")
        .arg(&config)
        .arg("-o")
        .arg(&out)
        .arg("logs")
        .assert()
        .success()
        .stdout(predicate::str::contains("app.log.localhost"));

    assert_eq!(read(&out.join("app.log.localhost")), "request served\n");
    assert_eq!(read(&out.join("app.conf.localhost")), "workers=4\n");
    assert_eq!(read(&dir.path().join("app.log")), "");
    assert_eq!(read(&dir.path().join("app.conf")), "workers=4\n");
}

#[test]
fn test_absent_log_is_not_an_error() {
    let dir = TempDir::new().unwrap();
    let config = local_service(&dir, "logs=app.log:{{home}}app.log");
    let out = dir.path().join("out");

    svcrig_cmd()
        .arg("-c")
        .arg(&config)
        .arg("-o")
        .arg(&out)
        .arg("logs")
        .assert()
        .success();

    assert!(!out.join("app.log.localhost").exists());
}

#[test]
fn test_clear_logs() {
    let dir = TempDir::new().unwrap();
    let config = local_service(
        &dir,
        "clear={{home}}access.log\nclear_patterns={{home}}/core.*",
    );
    for name in ["access.log", "core.101", "core.102", "keep.log"] {
        fs::write(dir.path().join(name), "x").unwrap();
    }

    svcrig_cmd()
        .arg("-c")
        .arg(&config)
        .arg("clear-logs")
        .assert()
        .success();

    assert!(!dir.path().join("access.log").exists());
    assert!(!dir.path().join("core.101").exists());
    assert!(!dir.path().join("core.102").exists());
    assert!(dir.path().join("keep.log").exists());
}
