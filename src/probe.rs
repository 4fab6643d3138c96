//! File operations on service hosts

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

use svcrig_config::HostTarget;

use crate::error::ExecError;

/// File-level access to a host: readiness artifacts, pid files and logs
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn exists(&self, host: &HostTarget, path: &str) -> Result<bool, ExecError>;

    /// `Ok(false)` when there was nothing to delete
    async fn delete(&self, host: &HostTarget, path: &str) -> Result<bool, ExecError>;

    /// Delete every file in `dir` whose name matches the glob `pattern`;
    /// `Ok(false)` when at least one match could not be removed
    async fn delete_matching(
        &self,
        host: &HostTarget,
        dir: &str,
        pattern: &str,
    ) -> Result<bool, ExecError>;

    /// `Ok(false)` when the remote file could not be read
    async fn copy_to_local(
        &self,
        host: &HostTarget,
        remote: &str,
        local: &Path,
    ) -> Result<bool, ExecError>;

    async fn truncate(&self, host: &HostTarget, path: &str) -> Result<(), ExecError>;

    async fn read_file(&self, host: &HostTarget, path: &str) -> Result<Vec<u8>, ExecError>;
}

/// Probe for the local transport; host names are ignored
#[derive(Debug, Default, Clone)]
pub struct LocalProbe;

impl LocalProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HostProbe for LocalProbe {
    async fn exists(&self, _host: &HostTarget, path: &str) -> Result<bool, ExecError> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn delete(&self, _host: &HostTarget, path: &str) -> Result<bool, ExecError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_matching(
        &self,
        _host: &HostTarget,
        dir: &str,
        pattern: &str,
    ) -> Result<bool, ExecError> {
        let full = format!("{}/{}", dir.trim_end_matches('/'), pattern);
        let mut all_removed = true;
        for entry in glob::glob(&full)? {
            match entry {
                Ok(path) if path.is_file() => {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        debug!(path = %path.display(), error = %e, "could not delete");
                        all_removed = false;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "unreadable glob match");
                    all_removed = false;
                }
            }
        }
        Ok(all_removed)
    }

    async fn copy_to_local(
        &self,
        _host: &HostTarget,
        remote: &str,
        local: &Path,
    ) -> Result<bool, ExecError> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::copy(remote, local).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn truncate(&self, _host: &HostTarget, path: &str) -> Result<(), ExecError> {
        tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)
            .await?;
        Ok(())
    }

    async fn read_file(&self, _host: &HostTarget, path: &str) -> Result<Vec<u8>, ExecError> {
        Ok(tokio::fs::read(path).await?)
    }
}
