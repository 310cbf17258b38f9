use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use crate::error::HostError;
use crate::process::{HostConfig, HostHandle, HostProcessActor, HostState, StopSignal};

/// Unique identifier for a managed host process
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct HostId(pub u64);

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "host-{}", self.0)
    }
}

/// Events emitted by managed host processes
#[derive(Clone, Debug)]
pub enum HostEvent {
    Exited { id: HostId, exit_code: Option<i32> },
}

/// Keeps track of every running host process.
///
/// Exited hosts are removed automatically and announced on the event channel.
pub struct HostManager {
    hosts: Arc<RwLock<HashMap<HostId, HostHandle>>>,
    next_id: AtomicU64,
    event_tx: broadcast::Sender<HostEvent>,
}

impl Default for HostManager {
    fn default() -> Self {
        Self::new()
    }
}

impl HostManager {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            hosts: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            event_tx,
        }
    }

    /// Spawn a new host process with the given configuration
    pub async fn spawn(&self, config: HostConfig) -> Result<HostId, HostError> {
        self.spawn_handle(config).await.map(|(id, _)| id)
    }

    /// Like [`HostManager::spawn`], also returning the handle. The handle
    /// stays usable after a fast exit has already removed the host.
    pub async fn spawn_handle(
        &self,
        config: HostConfig,
    ) -> Result<(HostId, HostHandle), HostError> {
        let id = HostId(self.next_id.fetch_add(1, Ordering::SeqCst));

        debug!("Spawning host {} with program: {}", id, config.program);

        let handle = HostProcessActor::spawn(config)?;
        self.hosts.write().await.insert(id, handle.clone());

        let hosts = self.hosts.clone();
        let event_tx = self.event_tx.clone();
        let watched = handle.clone();
        tokio::spawn(async move {
            let exit = watched.wait_exit().await;
            hosts.write().await.remove(&id);
            let _ = event_tx.send(HostEvent::Exited {
                id,
                exit_code: exit.code,
            });
        });

        Ok((id, handle))
    }

    /// Get a clone of the handle for a host
    pub async fn handle(&self, id: HostId) -> Result<HostHandle, HostError> {
        self.hosts
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(HostError::NotFound(id.0))
    }

    pub async fn state(&self, id: HostId) -> Result<HostState, HostError> {
        self.handle(id).await?.state().await
    }

    pub async fn stop(&self, id: HostId, signal: StopSignal) -> Result<(), HostError> {
        self.handle(id).await?.stop(signal).await
    }

    /// Signal every running host to stop
    pub async fn stop_all(&self, signal: StopSignal) {
        let handles: Vec<HostHandle> = self.hosts.read().await.values().cloned().collect();
        for handle in handles {
            if let Err(e) = handle.stop(signal).await {
                debug!("Failed to stop host {:?}: {}", handle.pid(), e);
            }
        }
    }

    /// Subscribe to events from all hosts
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.event_tx.subscribe()
    }

    /// List all running host ids
    pub async fn list(&self) -> Vec<HostId> {
        self.hosts.read().await.keys().copied().collect()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn shell(script: &str) -> HostConfig {
        HostConfig {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_exit_event_and_removal() {
        let manager = HostManager::new();
        let mut events = manager.subscribe();

        let id = manager.spawn(shell("exit 7")).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        let HostEvent::Exited {
            id: exited,
            exit_code,
        } = event;
        assert_eq!(exited, id);
        assert_eq!(exit_code, Some(7));
        assert!(manager.list().await.is_empty());
        assert!(matches!(
            manager.state(id).await,
            Err(HostError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_all() {
        let manager = HostManager::new();
        let mut events = manager.subscribe();
        manager.spawn(shell("sleep 30")).await.unwrap();
        manager.spawn(shell("sleep 30")).await.unwrap();
        assert_eq!(manager.list().await.len(), 2);

        manager.stop_all(StopSignal::Terminate).await;

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
        }
        assert!(manager.list().await.is_empty());
    }
}
