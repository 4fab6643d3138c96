//! Log collection and cleanup
//!
//! Copies each configured remote artifact into the run output directory as
//! `<prefix>.<host>`. A remote file is truncated only after its copy has
//! succeeded; snapshots (configuration files and the like) are never
//! truncated.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use svcrig_config::{HostTarget, LogArtifact, ServiceConfig};

use crate::error::LifecycleError;
use crate::probe::HostProbe;

#[derive(Debug, Clone, PartialEq)]
pub enum LogOutcome {
    Collected { prefix: String, local: PathBuf },
    /// the remote file does not exist on this host
    Absent { prefix: String },
    Failed(LifecycleError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostLogs {
    pub host: HostTarget,
    pub outcomes: Vec<LogOutcome>,
}

impl HostLogs {
    pub fn is_success(&self) -> bool {
        !self
            .outcomes
            .iter()
            .any(|o| matches!(o, LogOutcome::Failed(_)))
    }
}

pub struct LogCollector {
    config: Arc<ServiceConfig>,
    probe: Arc<dyn HostProbe>,
    out_dir: PathBuf,
}

impl LogCollector {
    pub fn new(config: Arc<ServiceConfig>, probe: Arc<dyn HostProbe>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            probe,
            out_dir: out_dir.into(),
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Local file for an artifact; hosts listed with a port get it appended
    pub fn local_path(&self, prefix: &str, host: &HostTarget) -> PathBuf {
        let name = match host.port {
            Some(port) => format!("{}.{}_{}", prefix, host.name, port),
            None => format!("{}.{}", prefix, host.name),
        };
        self.out_dir.join(name)
    }

    /// Collect every artifact from one host
    pub async fn collect(&self, host: &HostTarget) -> HostLogs {
        let mut outcomes = Vec::with_capacity(self.config.logs.len());
        for artifact in &self.config.logs {
            outcomes.push(self.collect_one(host, artifact).await);
        }
        HostLogs {
            host: host.clone(),
            outcomes,
        }
    }

    /// Collect from every configured host; one host's failure does not stop
    /// the others
    pub async fn collect_all(&self) -> Vec<HostLogs> {
        let mut result = Vec::with_capacity(self.config.hosts.len());
        for host in &self.config.hosts {
            result.push(self.collect(host).await);
        }
        result
    }

    async fn collect_one(&self, host: &HostTarget, artifact: &LogArtifact) -> LogOutcome {
        let remote = self.config.render(&artifact.path, host);
        let local = self.local_path(&artifact.prefix, host);

        match self.probe.exists(host, &remote).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(host = %host, remote = %remote, "log not present, skipping");
                return LogOutcome::Absent {
                    prefix: artifact.prefix.clone(),
                };
            }
            Err(e) => {
                warn!(host = %host, remote = %remote, error = %e, "could not check log");
                return LogOutcome::Failed(LifecycleError::remote(host, &e));
            }
        }

        let copied = match self.probe.copy_to_local(host, &remote, &local).await {
            Ok(copied) => copied,
            Err(e) => {
                debug!(host = %host, error = ?e, "copy error");
                false
            }
        };
        if !copied {
            warn!(host = %host, remote = %remote, local = %local.display(), "could not copy log");
            return LogOutcome::Failed(LifecycleError::LogCollection {
                host: host.to_string(),
                remote,
                local: local.display().to_string(),
            });
        }

        if artifact.truncate
            && let Err(e) = self.probe.truncate(host, &remote).await
        {
            warn!(host = %host, remote = %remote, error = %e, "copied log but could not truncate it");
        }

        info!(host = %host, local = %local.display(), "collected log");
        LogOutcome::Collected {
            prefix: artifact.prefix.clone(),
            local,
        }
    }

    /// Delete the configured files and pattern matches on one host before a run
    pub async fn clear(&self, host: &HostTarget) -> Result<(), LifecycleError> {
        let mut first_error = None;

        for template in &self.config.clear {
            let path = self.config.render(template, host);
            match self.probe.delete(host, &path).await {
                Ok(true) => debug!(host = %host, path = %path, "deleted"),
                Ok(false) => {}
                Err(e) => {
                    warn!(host = %host, path = %path, error = %e, "could not delete");
                    first_error.get_or_insert(LifecycleError::remote(host, &e));
                }
            }
        }

        for (dir, pattern) in &self.config.clear_patterns {
            let dir = self.config.render(dir, host);
            match self.probe.delete_matching(host, &dir, pattern).await {
                Ok(true) => {}
                Ok(false) => warn!(host = %host, dir = %dir, pattern = %pattern, "some matches were not deleted"),
                Err(e) => {
                    warn!(host = %host, dir = %dir, pattern = %pattern, error = %e, "could not delete matches");
                    first_error.get_or_insert(LifecycleError::remote(host, &e));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!(host = %host, "logs cleared");
                Ok(())
            }
        }
    }

    pub async fn clear_all(&self) -> Vec<(HostTarget, Result<(), LifecycleError>)> {
        let mut result = Vec::with_capacity(self.config.hosts.len());
        for host in &self.config.hosts {
            result.push((host.clone(), self.clear(host).await));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecError;
    use crate::probe::LocalProbe;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use svcrig_config::Properties;
    use tempfile::TempDir;

    /// LocalProbe that counts truncations and can be told to fail copies
    #[derive(Default)]
    struct RecordingProbe {
        inner: LocalProbe,
        fail_copy: bool,
        truncates: AtomicU32,
    }

    #[async_trait]
    impl HostProbe for RecordingProbe {
        async fn exists(&self, host: &HostTarget, path: &str) -> Result<bool, ExecError> {
            self.inner.exists(host, path).await
        }

        async fn delete(&self, host: &HostTarget, path: &str) -> Result<bool, ExecError> {
            self.inner.delete(host, path).await
        }

        async fn delete_matching(&self, host: &HostTarget, dir: &str, pattern: &str) -> Result<bool, ExecError> {
            self.inner.delete_matching(host, dir, pattern).await
        }

        async fn copy_to_local(&self, host: &HostTarget, remote: &str, local: &Path) -> Result<bool, ExecError> {
            if self.fail_copy {
                return Err(ExecError::remote(host, "connection reset"));
            }
            self.inner.copy_to_local(host, remote, local).await
        }

        async fn truncate(&self, host: &HostTarget, path: &str) -> Result<(), ExecError> {
            self.truncates.fetch_add(1, Ordering::SeqCst);
            self.inner.truncate(host, path).await
        }

        async fn read_file(&self, host: &HostTarget, path: &str) -> Result<Vec<u8>, ExecError> {
            self.inner.read_file(host, path).await
        }
    }

    fn config(dir: &TempDir) -> Arc<ServiceConfig> {
        let home = dir.path().display().to_string();
        let props = Properties::from_pairs([
            ("hosts", "localhost"),
            ("command", "true"),
            ("home", home.as_str()),
            ("pid_dir", home.as_str()),
            ("transport", "local"),
            ("logs", "err.log:{{home}}{{host}}.err"),
            ("snapshots", "conf.log:{{home}}my.cnf"),
            ("clear", "{{home}}access_log"),
            ("clear_patterns", format!("{}/sess*", home).as_str()),
        ]);
        Arc::new(ServiceConfig::from_properties(&props).unwrap())
    }

    #[tokio::test]
    async fn test_collect_truncates_logs_not_snapshots() {
        let dir = TempDir::new().unwrap();
        let err = dir.path().join("localhost.err");
        let conf = dir.path().join("my.cnf");
        std::fs::write(&err, "[ERROR] disk full\n").unwrap();
        std::fs::write(&conf, "[mysqld]\n").unwrap();

        let out = dir.path().join("out");
        let probe = Arc::new(RecordingProbe::default());
        let collector = LogCollector::new(config(&dir), probe.clone(), &out);

        let logs = collector.collect(&HostTarget::new("localhost")).await;
        assert!(logs.is_success());
        assert_eq!(
            std::fs::read_to_string(out.join("err.log.localhost")).unwrap(),
            "[ERROR] disk full\n"
        );
        assert_eq!(
            std::fs::read_to_string(out.join("conf.log.localhost")).unwrap(),
            "[mysqld]\n"
        );
        assert_eq!(std::fs::metadata(&err).unwrap().len(), 0);
        assert_eq!(std::fs::read_to_string(&conf).unwrap(), "[mysqld]\n");
        assert_eq!(probe.truncates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_copy_never_truncates() {
        let dir = TempDir::new().unwrap();
        let err = dir.path().join("localhost.err");
        std::fs::write(&err, "[ERROR] disk full\n").unwrap();

        let probe = Arc::new(RecordingProbe {
            fail_copy: true,
            ..Default::default()
        });
        let collector = LogCollector::new(config(&dir), probe.clone(), dir.path().join("out"));

        let logs = collector.collect(&HostTarget::new("localhost")).await;
        assert!(matches!(
            logs.outcomes[0],
            LogOutcome::Failed(LifecycleError::LogCollection { .. })
        ));
        assert_eq!(std::fs::read_to_string(&err).unwrap(), "[ERROR] disk full\n");
        assert_eq!(probe.truncates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_absent_artifact_is_skipped() {
        let dir = TempDir::new().unwrap();
        let probe = Arc::new(RecordingProbe::default());
        let collector = LogCollector::new(config(&dir), probe.clone(), dir.path().join("out"));

        let logs = collector.collect_all().await;
        assert_eq!(logs.len(), 1);
        assert!(logs[0].is_success());
        assert!(
            logs[0]
                .outcomes
                .iter()
                .all(|o| matches!(o, LogOutcome::Absent { .. }))
        );
        assert_eq!(probe.truncates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = TempDir::new().unwrap();
        for name in ["access_log", "sess_1", "sess_2", "my.cnf"] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }
        let collector = LogCollector::new(config(&dir), Arc::new(LocalProbe::new()), dir.path());

        collector.clear(&HostTarget::new("localhost")).await.unwrap();
        assert!(!dir.path().join("access_log").exists());
        assert!(!dir.path().join("sess_1").exists());
        assert!(!dir.path().join("sess_2").exists());
        assert!(dir.path().join("my.cnf").exists());

        // nothing left to delete is not an error
        collector.clear(&HostTarget::new("localhost")).await.unwrap();
    }

    #[test]
    fn test_local_path_includes_port() {
        let dir = TempDir::new().unwrap();
        let collector = LogCollector::new(config(&dir), Arc::new(LocalProbe::new()), "/out");
        assert_eq!(
            collector.local_path("err.log", &HostTarget::new("db1")),
            PathBuf::from("/out/err.log.db1")
        );
        assert_eq!(
            collector.local_path("err.log", &HostTarget::with_port("cache1", 11211)),
            PathBuf::from("/out/err.log.cache1_11211")
        );
    }
}
