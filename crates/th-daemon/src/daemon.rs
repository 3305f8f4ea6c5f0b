use std::sync::Arc;

use anyhow::{Context, Result};
use th_bridge::auth::JwtAuthenticator;
use th_bridge::http_api::{router, AppState};
use th_bridge::hub::{ConnectionHub, HubConfig};
use th_bridge::protocol::CloseReason;
use th_core::collab::{Authenticator, ProjectDirResolver};
use th_core::config::{BackendKind, Config};
use th_core::shutdown::ShutdownSignal;
use th_session::pty_backend::PtyBackend;
use th_session::pty_pool::PtyPool;
use th_session::registry::{RegistryConfig, SessionRegistry};
use th_session::tmux::TmuxBackend;
use th_session::SessionBackend;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::supervisor::Supervisor;

/// The termhub server: websocket hub, REST API and supervisor loop.
///
/// Shuts down gracefully when the `ShutdownSignal` is triggered (e.g. via
/// ctrl-c). Connected clients receive `closed{shutdown}`; tmux sessions are
/// left running for the next start, everything else is terminated.
pub struct Daemon {
    config: Config,
    shutdown: ShutdownSignal,
    auth: JwtAuthenticator,
    hub: Arc<ConnectionHub>,
}

impl Daemon {
    /// Build the daemon from config, reading the signing secret from the
    /// environment variable named in `[auth]`.
    pub fn new(config: Config) -> Result<Self> {
        let secret = config.auth.secret().with_context(|| {
            format!(
                "token signing secret not set; export {}",
                config.auth.secret_env
            )
        })?;
        let auth = JwtAuthenticator::new(secret);
        let backend = build_backend(&config);
        Ok(Self::with_parts(config, backend, auth))
    }

    /// Assemble a daemon around an explicit backend and authenticator.
    pub fn with_parts(
        config: Config,
        backend: Arc<dyn SessionBackend>,
        auth: JwtAuthenticator,
    ) -> Self {
        let resolver = Arc::new(ProjectDirResolver::new(
            config.projects.root_path(),
            config.projects.global_path(),
        ));
        let registry = Arc::new(SessionRegistry::new(
            backend,
            resolver,
            RegistryConfig::from(&config.session),
        ));
        let hub_config = HubConfig {
            subscriber_queue: config.session.subscriber_queue,
            ..HubConfig::default()
        };
        let authenticator: Arc<dyn Authenticator> = Arc::new(auth.clone());
        let hub = ConnectionHub::new(registry, authenticator, hub_config);
        Self {
            config,
            shutdown: ShutdownSignal::new(),
            auth,
            hub,
        }
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    pub fn authenticator(&self) -> &JwtAuthenticator {
        &self.auth
    }

    /// Bind `daemon.host:daemon.port` and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.daemon.host, self.config.daemon.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already-bound listener until shutdown.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        let supervisor_cfg = &self.config.supervisor;
        let app = router(AppState::new(
            self.hub.clone(),
            &self.config.security.allowed_origins,
            supervisor_cfg.ping_interval(),
        ));

        let supervisor = Supervisor::from_config(self.hub.clone(), supervisor_cfg);
        let sweep_interval = supervisor_cfg.sweep_interval();
        let supervisor_task = tokio::spawn(supervisor.run(sweep_interval, self.shutdown.clone()));

        info!(
            addr = %local,
            backend = ?self.config.session.backend,
            projects = %self.config.projects.root_path().display(),
            "termhub listening"
        );

        // Websocket handlers only return once their connection actor stops,
        // so close every connection before axum waits on them.
        let shutdown = self.shutdown.clone();
        let hub = self.hub.clone();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                hub.close_all(CloseReason::Shutdown);
            })
            .await;

        self.hub.abort_all();
        self.hub.registry().shutdown().await;
        supervisor_task.abort();

        if let Err(e) = served {
            error!(error = %e, "server error");
            return Err(e).context("http server failed");
        }
        info!("termhub stopped");
        Ok(())
    }
}

fn build_backend(config: &Config) -> Arc<dyn SessionBackend> {
    let session = &config.session;
    match session.backend {
        BackendKind::Pty => Arc::new(PtyBackend::new(
            PtyPool::new(session.max_sessions),
            session.shell.clone(),
        )),
        BackendKind::Tmux => Arc::new(TmuxBackend::new(session.buffer_max_lines)),
    }
}
