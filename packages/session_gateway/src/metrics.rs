//! Gateway metrics for observability

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Gateway-wide metrics
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    // Sessions
    pub active_sessions: AtomicU64,
    pub total_sessions_created: AtomicU64,
    pub sessions_terminated: AtomicU64,

    // Push transports (websocket, event stream)
    pub active_push: AtomicU64,
    pub total_push: AtomicU64,

    // Updates
    /// Frames indexed into a cache
    pub updates_received: AtomicU64,
    /// Updates handed to push transports
    pub updates_pushed: AtomicU64,
    /// Updates a lagging push transport could not take
    pub updates_dropped: AtomicU64,
    /// Region frames discarded while a fullscreen refresh was pending
    pub updates_discarded: AtomicU64,
    /// Updates left out of a batch because they expired first
    pub updates_skipped_expired: AtomicU64,

    // Commands
    pub commands_forwarded: AtomicU64,
    pub commands_dropped_protocol: AtomicU64,
    pub commands_dropped_state: AtomicU64,
    pub commands_dropped_permission: AtomicU64,

    // Errors
    pub bridge_failures: AtomicU64,
    pub frame_errors: AtomicU64,
    pub join_rejections: AtomicU64,

    start_time: Option<Instant>,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn session_created(&self) {
        bump(&self.active_sessions);
        bump(&self.total_sessions_created);
    }

    pub fn session_terminated(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        bump(&self.sessions_terminated);
    }

    pub fn push_opened(&self) {
        bump(&self.active_push);
        bump(&self.total_push);
    }

    pub fn push_closed(&self) {
        self.active_push.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn update_received(&self) {
        bump(&self.updates_received);
    }

    pub fn updates_pushed(&self, delivered: usize, dropped: usize) {
        self.updates_pushed
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.updates_dropped
            .fetch_add(dropped as u64, Ordering::Relaxed);
    }

    pub fn update_discarded(&self) {
        bump(&self.updates_discarded);
    }

    pub fn updates_skipped_expired(&self, count: u64) {
        self.updates_skipped_expired
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn command_forwarded(&self) {
        bump(&self.commands_forwarded);
    }

    pub fn command_dropped_protocol(&self) {
        bump(&self.commands_dropped_protocol);
    }

    pub fn command_dropped_state(&self) {
        bump(&self.commands_dropped_state);
    }

    pub fn command_dropped_permission(&self) {
        bump(&self.commands_dropped_permission);
    }

    pub fn bridge_failure(&self) {
        bump(&self.bridge_failures);
    }

    pub fn frame_error(&self) {
        bump(&self.frame_errors);
    }

    pub fn join_rejected(&self) {
        bump(&self.join_rejections);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            sessions: SessionMetrics {
                active: load(&self.active_sessions),
                total_created: load(&self.total_sessions_created),
                terminated: load(&self.sessions_terminated),
            },
            push: PushMetrics {
                active: load(&self.active_push),
                total: load(&self.total_push),
            },
            updates: UpdateMetrics {
                received: load(&self.updates_received),
                pushed: load(&self.updates_pushed),
                dropped: load(&self.updates_dropped),
                discarded: load(&self.updates_discarded),
                skipped_expired: load(&self.updates_skipped_expired),
            },
            commands: CommandMetrics {
                forwarded: load(&self.commands_forwarded),
                dropped_protocol: load(&self.commands_dropped_protocol),
                dropped_state: load(&self.commands_dropped_state),
                dropped_permission: load(&self.commands_dropped_permission),
            },
            errors: ErrorMetrics {
                bridge: load(&self.bridge_failures),
                frames: load(&self.frame_errors),
                join_rejections: load(&self.join_rejections),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub sessions: SessionMetrics,
    pub push: PushMetrics,
    pub updates: UpdateMetrics,
    pub commands: CommandMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub active: u64,
    pub total_created: u64,
    pub terminated: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMetrics {
    pub received: u64,
    pub pushed: u64,
    pub dropped: u64,
    pub discarded: u64,
    pub skipped_expired: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMetrics {
    pub forwarded: u64,
    pub dropped_protocol: u64,
    pub dropped_state: u64,
    pub dropped_permission: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub bridge: u64,
    pub frames: u64,
    pub join_rejections: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub sessions: SessionHealth,
    pub push_connections: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHealth {
    pub total: u64,
    pub connected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_tracking() {
        let metrics = GatewayMetrics::new();
        metrics.session_created();
        metrics.session_created();
        metrics.session_terminated();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions.active, 1);
        assert_eq!(snapshot.sessions.total_created, 2);
        assert_eq!(snapshot.sessions.terminated, 1);
    }

    #[test]
    fn test_push_tracking() {
        let metrics = GatewayMetrics::new();
        metrics.push_opened();
        metrics.push_opened();
        metrics.push_closed();
        assert_eq!(metrics.active_push.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_push.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_snapshot_counts_drops_separately() {
        let metrics = GatewayMetrics::new();
        metrics.command_forwarded();
        metrics.command_dropped_state();
        metrics.command_dropped_state();
        metrics.command_dropped_permission();
        metrics.updates_pushed(3, 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.commands.forwarded, 1);
        assert_eq!(snapshot.commands.dropped_state, 2);
        assert_eq!(snapshot.commands.dropped_permission, 1);
        assert_eq!(snapshot.commands.dropped_protocol, 0);
        assert_eq!(snapshot.updates.pushed, 3);
        assert_eq!(snapshot.updates.dropped, 1);
    }
}
