use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::manager::{NewSession, SessionHandle, SessionPolicy, spawn_session};
use crate::metrics::GatewayMetrics;
use crate::session::{SessionId, SessionInfo};
use crate::transport::HostLauncher;

/// Every live session, keyed by id.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    policy: SessionPolicy,
    launcher: Arc<dyn HostLauncher>,
    metrics: Arc<GatewayMetrics>,
}

impl SessionRegistry {
    pub fn new(
        policy: SessionPolicy,
        launcher: Arc<dyn HostLauncher>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            policy,
            launcher,
            metrics,
        }
    }

    pub async fn create(&self, request: NewSession) -> SessionHandle {
        let handle = spawn_session(
            request,
            self.policy.clone(),
            self.launcher.clone(),
            self.metrics.clone(),
        );
        self.sessions
            .write()
            .await
            .insert(handle.id(), handle.clone());
        debug!(session = %handle.id(), "session registered");
        handle
    }

    pub async fn get(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Newest first.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut list: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(SessionHandle::info)
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    /// Drop sessions that ended more than `linger` ago.
    pub async fn reap(&self, linger: Duration) -> usize {
        let linger = chrono::Duration::from_std(linger).unwrap_or(chrono::Duration::zero());
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, handle| {
            let info = handle.info();
            let expired = info
                .ended_at
                .is_some_and(|ended| now.signed_duration_since(ended) >= linger);
            if expired {
                debug!(session = %id, "reaping terminated session");
            }
            !expired
        });
        before - sessions.len()
    }

    /// Periodically reap terminated sessions until cancelled.
    pub fn spawn_reaper(
        self: Arc<Self>,
        interval: Duration,
        linger: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = self.reap(linger).await;
                        if reaped > 0 {
                            info!(reaped, "reaped terminated sessions");
                        }
                    }
                }
            }
        })
    }

    /// Close every session and wait up to `grace` for their hosts to exit.
    pub async fn shutdown_all(&self, grace: Duration) {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "closing all sessions");
        for handle in &handles {
            handle.shutdown().await;
        }
        let all_done = futures::future::join_all(handles.iter().map(|h| h.wait_terminated()));
        if tokio::time::timeout(grace, all_done).await.is_err() {
            info!("some sessions did not terminate within {:?}", grace);
        }
    }
}
