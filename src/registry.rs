//! Process handle registry
//!
//! Holds the handle of every process this controller launched, keyed by host.
//! An entry is created when a start attempt on a host gets past its readiness
//! poll and is removed only once a stop on that host has confirmed the
//! process is down.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

use svcrig_config::HostTarget;

use crate::exec::ProcessHandle;

/// Which of a host's processes a handle belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Listener,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Listener => write!(f, "listener"),
        }
    }
}

#[derive(Clone, Default)]
pub struct HostEntry {
    pub primary: Option<Arc<dyn ProcessHandle>>,
    pub listener: Option<Arc<dyn ProcessHandle>>,
}

impl HostEntry {
    fn slot(&mut self, role: Role) -> &mut Option<Arc<dyn ProcessHandle>> {
        match role {
            Role::Primary => &mut self.primary,
            Role::Listener => &mut self.listener,
        }
    }

    fn is_empty(&self) -> bool {
        self.primary.is_none() && self.listener.is_none()
    }
}

/// Shared host -> handles map. Locks are held only for map operations, never
/// across a remote call.
#[derive(Clone, Default)]
pub struct HandleRegistry {
    entries: Arc<Mutex<HashMap<HostTarget, HostEntry>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, host: &HostTarget, role: Role, handle: Arc<dyn ProcessHandle>) {
        let mut entries = self.entries.lock().await;
        *entries.entry(host.clone()).or_default().slot(role) = Some(handle);
    }

    pub async fn handle(&self, host: &HostTarget, role: Role) -> Option<Arc<dyn ProcessHandle>> {
        let mut entries = self.entries.lock().await;
        entries.get_mut(host).and_then(|e| e.slot(role).clone())
    }

    /// Drop one role's handle, removing the entry once it holds nothing
    pub async fn take(&self, host: &HostTarget, role: Role) -> Option<Arc<dyn ProcessHandle>> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(host)?;
        let handle = entry.slot(role).take();
        if entry.is_empty() {
            entries.remove(host);
        }
        handle
    }

    pub async fn remove(&self, host: &HostTarget) -> Option<HostEntry> {
        self.entries.lock().await.remove(host)
    }

    pub async fn contains(&self, host: &HostTarget) -> bool {
        self.entries.lock().await.contains_key(host)
    }

    pub async fn hosts(&self) -> Vec<HostTarget> {
        self.entries.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CompletedHandle;

    #[tokio::test]
    async fn test_take_removes_empty_entry() {
        let registry = HandleRegistry::new();
        let host = HostTarget::new("db1");

        registry
            .insert(&host, Role::Primary, Arc::new(CompletedHandle::new(0, "")))
            .await;
        registry
            .insert(&host, Role::Listener, Arc::new(CompletedHandle::new(0, "")))
            .await;
        assert_eq!(registry.len().await, 1);

        assert!(registry.take(&host, Role::Listener).await.is_some());
        assert!(registry.contains(&host).await);
        assert!(registry.handle(&host, Role::Listener).await.is_none());

        assert!(registry.take(&host, Role::Primary).await.is_some());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_hosts_are_independent() {
        let registry = HandleRegistry::new();
        let a = HostTarget::new("a");
        let b = HostTarget::with_port("a", 11212);

        registry
            .insert(&a, Role::Primary, Arc::new(CompletedHandle::new(0, "")))
            .await;
        registry
            .insert(&b, Role::Primary, Arc::new(CompletedHandle::new(1, "")))
            .await;

        assert_eq!(registry.len().await, 2);
        assert!(registry.remove(&a).await.is_some());
        assert!(!registry.contains(&a).await);
        assert!(registry.contains(&b).await);
    }
}
