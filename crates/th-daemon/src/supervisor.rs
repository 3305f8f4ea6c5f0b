use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use th_bridge::hub::ConnectionHub;
use th_core::config::SupervisorConfig;
use th_core::shutdown::ShutdownSignal;
use th_core::types::SessionId;
use tracing::{debug, info};

/// Result of a single sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    /// Sessions torn down because nobody had been attached for `idle_timeout`.
    pub idle_destroyed: Vec<SessionId>,
    /// Connections closed for missing their liveness deadline.
    pub connections_reaped: usize,
    pub timestamp: DateTime<Utc>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.idle_destroyed.is_empty() && self.connections_reaped == 0
    }
}

/// Periodic housekeeping over the hub and its registry.
pub struct Supervisor {
    hub: Arc<ConnectionHub>,
    idle_timeout: Duration,
    ping_timeout: Duration,
}

impl Supervisor {
    pub fn new(hub: Arc<ConnectionHub>, idle_timeout: Duration, ping_timeout: Duration) -> Self {
        Self {
            hub,
            idle_timeout,
            ping_timeout,
        }
    }

    pub fn from_config(hub: Arc<ConnectionHub>, config: &SupervisorConfig) -> Self {
        Self::new(hub, config.idle_timeout(), config.ping_timeout())
    }

    /// Destroy idle sessions and close silent connections.
    pub async fn sweep(&self) -> SweepReport {
        let registry = self.hub.registry();
        let mut idle_destroyed = Vec::new();
        for session in registry.list_idle(self.idle_timeout) {
            let id = session.id();
            let state = session.state();
            if registry.destroy_if_idle(id, self.idle_timeout).await {
                info!(session_id = %id, key = %session.key(), %state, "destroyed idle session");
                idle_destroyed.push(id);
            }
        }

        let connections_reaped = self.hub.reap_dead_connections(self.ping_timeout);

        let report = SweepReport {
            idle_destroyed,
            connections_reaped,
            timestamp: Utc::now(),
        };
        if report.is_empty() {
            debug!("sweep found nothing to do");
        } else {
            info!(
                idle_destroyed = report.idle_destroyed.len(),
                connections_reaped = report.connections_reaped,
                "sweep complete"
            );
        }
        report
    }

    /// Sweep every `interval` until shutdown.
    pub async fn run(self, interval: Duration, shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it.
        ticker.tick().await;
        info!(
            interval_secs = interval.as_secs(),
            idle_timeout_secs = self.idle_timeout.as_secs(),
            ping_timeout_secs = self.ping_timeout.as_secs(),
            "supervisor started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.cancelled() => {
                    info!("shutdown signal received, stopping supervisor");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use th_bridge::auth::JwtAuthenticator;
    use th_bridge::hub::{ConnectionHandle, HubConfig};
    use th_bridge::protocol::{ClientEvent, CloseReason, ServerEvent};
    use th_core::collab::ProjectDirResolver;
    use th_core::types::{ScopeKey, UserId};
    use th_session::registry::{RegistryConfig, SessionRegistry};
    use th_session::testing::ScriptedBackend;

    struct Fixture {
        _root: tempfile::TempDir,
        backend: Arc<ScriptedBackend>,
        hub: Arc<ConnectionHub>,
        auth: JwtAuthenticator,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("blog")).unwrap();
        let backend = Arc::new(ScriptedBackend::new());
        let registry = Arc::new(SessionRegistry::new(
            backend.clone(),
            Arc::new(ProjectDirResolver::new(root.path(), root.path())),
            RegistryConfig::default(),
        ));
        let auth = JwtAuthenticator::new("supervisor-secret");
        let hub = ConnectionHub::new(registry, Arc::new(auth.clone()), HubConfig::default());
        Fixture {
            _root: root,
            backend,
            hub,
            auth,
        }
    }

    async fn recv(conn: &ConnectionHandle) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(2), conn.recv())
            .await
            .expect("timed out")
            .expect("connection closed")
    }

    async fn join(fx: &Fixture, scope: &str) -> ConnectionHandle {
        let conn = fx.hub.connect();
        conn.send(ClientEvent::Join {
            scope: scope.into(),
            token: fx
                .auth
                .issue_token(&UserId::new("alice"), "alice", Duration::from_secs(60))
                .unwrap(),
            resume: None,
            fresh: false,
        });
        assert!(matches!(recv(&conn).await, ServerEvent::Joined { .. }));
        conn
    }

    fn blog() -> ScopeKey {
        ScopeKey::project(UserId::new("alice"), "blog")
    }

    #[tokio::test]
    async fn sweep_destroys_detached_sessions() {
        let fx = fixture();
        let conn = join(&fx, "blog").await;
        conn.send(ClientEvent::Leave);
        assert_eq!(
            recv(&conn).await,
            ServerEvent::Closed {
                reason: CloseReason::Left
            }
        );
        let session = fx.hub.registry().find(&blog()).unwrap();
        for _ in 0..200 {
            if session.subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let supervisor = Supervisor::new(fx.hub.clone(), Duration::ZERO, Duration::from_secs(60));
        let report = supervisor.sweep().await;
        assert_eq!(report.idle_destroyed, vec![session.id()]);
        assert!(fx.hub.session_status(&blog()).is_none());
        assert!(fx.backend.last_handle().unwrap().was_terminated());
    }

    #[tokio::test]
    async fn sweep_leaves_attached_sessions_alone() {
        let fx = fixture();
        let _conn = join(&fx, "blog").await;

        let supervisor = Supervisor::new(fx.hub.clone(), Duration::ZERO, Duration::from_secs(60));
        let report = supervisor.sweep().await;
        assert!(report.is_empty());
        assert!(fx.hub.session_status(&blog()).is_some());
    }

    #[tokio::test]
    async fn sweep_reaps_silent_connections() {
        let fx = fixture();
        let conn = join(&fx, "blog").await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let supervisor = Supervisor::new(
            fx.hub.clone(),
            Duration::from_secs(3600),
            Duration::from_millis(1),
        );
        let report = supervisor.sweep().await;
        assert_eq!(report.connections_reaped, 1);
        assert!(report.idle_destroyed.is_empty());
        assert_eq!(
            recv(&conn).await,
            ServerEvent::Closed {
                reason: CloseReason::Timeout
            }
        );
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let fx = fixture();
        let shutdown = ShutdownSignal::new();
        let supervisor = Supervisor::new(fx.hub.clone(), Duration::from_secs(60), Duration::from_secs(60));
        let task = tokio::spawn(supervisor.run(Duration::from_millis(5), shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("supervisor did not stop")
            .unwrap();
    }
}
