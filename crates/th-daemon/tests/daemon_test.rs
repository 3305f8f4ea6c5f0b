use std::sync::Arc;
use std::time::Duration;

use th_bridge::auth::JwtAuthenticator;
use th_bridge::client::{ClientOptions, ReconnectPolicy, ReconnectingClient};
use th_bridge::protocol::{CloseReason, ServerEvent};
use th_core::config::Config;
use th_core::types::UserId;
use th_daemon::Daemon;
use th_session::testing::ScriptedBackend;

fn config(root: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.projects.root = root.path().display().to_string();
    config.projects.global_dir = Some(root.path().display().to_string());
    config
}

#[test]
fn missing_secret_names_the_env_var() {
    let root = tempfile::tempdir().unwrap();
    let mut config = config(&root);
    config.auth.secret_env = "TERMHUB_DAEMON_TEST_NEVER_SET".into();

    let err = Daemon::new(config).err().expect("daemon built without a secret");
    assert!(err.to_string().contains("TERMHUB_DAEMON_TEST_NEVER_SET"), "{err}");
}

#[tokio::test]
async fn shutdown_closes_clients_and_stops_sessions() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("blog")).unwrap();
    let backend = Arc::new(ScriptedBackend::new());
    let auth = JwtAuthenticator::new("daemon-test-secret");
    let daemon = Daemon::with_parts(config(&root), backend.clone(), auth.clone());
    let shutdown = daemon.shutdown_handle();
    let hub = daemon.hub().clone();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move { daemon.run_with_listener(listener).await });

    let mut client = ReconnectingClient::new(ClientOptions {
        url: format!("ws://{addr}/ws"),
        origin: Some("http://localhost".into()),
        scope: "blog".into(),
        token: auth.issue_token(&UserId::new("alice"), "alice", Duration::from_secs(60)).unwrap(),
        policy: ReconnectPolicy::default(),
    });
    assert!(matches!(
        client.connect().await.unwrap(),
        ServerEvent::Joined { resumed: false, .. }
    ));
    assert_eq!(hub.connection_count(), 1);

    shutdown.trigger();
    let event = tokio::time::timeout(Duration::from_secs(5), client.next_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        ServerEvent::Closed {
            reason: CloseReason::Shutdown
        }
    );

    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("daemon did not stop")
        .unwrap()
        .unwrap();
    assert!(backend.last_handle().unwrap().was_terminated());
    assert!(hub.registry().is_empty());
}

#[tokio::test]
async fn surviving_sessions_are_detached_on_shutdown() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("blog")).unwrap();
    let backend = Arc::new(ScriptedBackend::new().surviving_restart());
    let auth = JwtAuthenticator::new("daemon-test-secret");
    let daemon = Daemon::with_parts(config(&root), backend.clone(), auth.clone());
    let shutdown = daemon.shutdown_handle();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move { daemon.run_with_listener(listener).await });

    let mut client = ReconnectingClient::new(ClientOptions {
        url: format!("ws://{addr}/ws"),
        origin: Some("http://127.0.0.1".into()),
        scope: "blog".into(),
        token: auth.issue_token(&UserId::new("alice"), "alice", Duration::from_secs(60)).unwrap(),
        policy: ReconnectPolicy::default(),
    });
    client.connect().await.unwrap();

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("daemon did not stop")
        .unwrap()
        .unwrap();
    assert!(!backend.last_handle().unwrap().was_terminated());
}
