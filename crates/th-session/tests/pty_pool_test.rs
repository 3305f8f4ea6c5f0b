use std::time::Duration;

use th_session::error::SessionError;
use th_session::pty_backend::PtyBackend;
use th_session::pty_pool::{PtyPool, PtySpawn};
use th_session::{Input, SessionBackend, SpawnRequest};

fn read_until(handle: &th_session::pty_pool::PtyHandle, needle: &str) -> String {
    let mut text = String::new();
    for _ in 0..40 {
        while let Ok(chunk) = handle.reader.try_recv() {
            text.push_str(&String::from_utf8_lossy(&chunk));
        }
        if text.contains(needle) {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    text
}

#[test]
fn pool_creation_and_capacity() {
    let pool = PtyPool::new(4);
    assert_eq!(pool.max_ptys(), 4);
    assert_eq!(pool.active_count(), 0);
}

#[test]
fn spawn_simple_process() {
    let pool = PtyPool::new(4);
    let handle = pool
        .spawn(&PtySpawn::new("/bin/echo").arg("hello").arg("world"))
        .expect("failed to spawn echo");
    assert_eq!(pool.active_count(), 1);

    let text = read_until(&handle, "hello world");
    assert!(
        text.contains("hello world"),
        "expected 'hello world' in output, got: {text:?}"
    );
}

#[test]
fn working_dir_and_env_are_applied() {
    let tmp = tempfile::tempdir().unwrap();
    let pool = PtyPool::new(4);
    let handle = pool
        .spawn(
            &PtySpawn::new("/bin/sh")
                .arg("-c")
                .arg("echo \"$PROJECT_NAME in $(pwd)\"")
                .env("PROJECT_NAME", "blog")
                .cwd(tmp.path()),
        )
        .expect("failed to spawn sh");

    let text = read_until(&handle, "blog in");
    assert!(text.contains("blog in"), "missing env in: {text:?}");
    let dir_name = tmp.path().file_name().unwrap().to_string_lossy().into_owned();
    assert!(text.contains(&dir_name), "missing cwd in: {text:?}");
}

#[test]
fn capacity_limit_enforced() {
    let pool = PtyPool::new(2);

    let _h1 = pool.spawn(&PtySpawn::new("/bin/cat")).expect("spawn 1");
    let _h2 = pool.spawn(&PtySpawn::new("/bin/cat")).expect("spawn 2");
    assert_eq!(pool.active_count(), 2);

    match pool.spawn(&PtySpawn::new("/bin/cat")) {
        Err(SessionError::AtCapacity { max }) => assert_eq!(max, 2),
        other => panic!("expected AtCapacity, got: {other:?}"),
    }
}

#[test]
fn dropping_handle_releases_slot() {
    let pool = PtyPool::new(1);
    let handle = pool.spawn(&PtySpawn::new("/bin/cat")).expect("spawn");
    assert_eq!(pool.active_count(), 1);
    drop(handle);
    assert_eq!(pool.active_count(), 0);
    let _again = pool.spawn(&PtySpawn::new("/bin/cat")).expect("respawn");
}

#[test]
fn failed_spawn_does_not_leak_slot() {
    let pool = PtyPool::new(1);
    let result = pool.spawn(&PtySpawn::new("/nonexistent/program-xyz"));
    assert!(result.is_err());
    assert_eq!(pool.active_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn send_and_read_interactive() {
    let pool = PtyPool::new(4);
    let handle = pool
        .spawn(&PtySpawn::new("/bin/cat"))
        .expect("failed to spawn cat");

    handle.send_line("hello from test").await.expect("send failed");
    let text = read_until(&handle, "hello from test");
    assert!(
        text.contains("hello from test"),
        "expected echoed input in: {text:?}"
    );

    handle.kill().expect("kill failed");
}

#[tokio::test(flavor = "multi_thread")]
async fn backend_input_reaches_the_shell() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = PtyBackend::new(PtyPool::new(2), "/bin/cat");
    let handle = backend
        .spawn(&SpawnRequest {
            name: "termhub-test".into(),
            working_dir: tmp.path().to_path_buf(),
            env: Vec::new(),
        })
        .await
        .expect("spawn failed");
    let stream = handle.output_stream().expect("pty handles stream output");

    handle
        .send(&Input::Line("typed through the backend".into()))
        .await
        .expect("send failed");
    let mut text = String::new();
    while !text.contains("typed through the backend") {
        let chunk = tokio::time::timeout(Duration::from_secs(2), stream.recv_async())
            .await
            .expect("timed out")
            .expect("stream closed");
        text.push_str(&String::from_utf8_lossy(&chunk));
    }
    handle.terminate().await.expect("terminate failed");
}

#[tokio::test(flavor = "multi_thread")]
async fn send_after_kill_is_session_dead() {
    let pool = PtyPool::new(4);
    let handle = pool.spawn(&PtySpawn::new("/bin/cat")).expect("spawn");
    handle.kill().expect("kill failed");
    for _ in 0..40 {
        if !handle.is_alive() {
            break;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    assert!(matches!(
        handle.send_line("late").await,
        Err(SessionError::SessionDead)
    ));
    // Killing twice is harmless.
    handle.kill().expect("second kill failed");
}

#[test]
fn resize_pty_succeeds() {
    let pool = PtyPool::new(4);
    let handle = pool
        .spawn(&PtySpawn::new("/bin/cat"))
        .expect("failed to spawn cat");

    handle.resize(120, 40).expect("resize to 120x40 failed");
    handle.resize(80, 24).expect("resize to 80x24 failed");
}
