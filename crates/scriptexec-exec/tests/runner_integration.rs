use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::io::AsyncReadExt;

use scriptexec_exec::*;
use scriptexec_script::{LazyScript, Script};

static LS: LazyScript = LazyScript::new("ls", "sh", "ls {{.Path}}\n");

#[derive(Serialize)]
struct LsArguments {
    #[serde(rename = "Path")]
    path: String,
}

fn manifest_dir() -> String {
    env!("CARGO_MANIFEST_DIR").to_string()
}

/// Port with nothing listening on it
fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_local_ls_existing_directory() {
    let mut runner = scriptexec_exec::new(
        &Connection::local(),
        &LS,
        &LsArguments {
            path: manifest_dir(),
        },
    )
    .await
    .unwrap();

    let mut stdout = runner.stdout_pipe().unwrap();
    let mut stderr = runner.stderr_pipe().unwrap();
    runner.start().await.unwrap();

    let mut out = String::new();
    stdout.read_to_string(&mut out).await.unwrap();
    let mut err = String::new();
    stderr.read_to_string(&mut err).await.unwrap();
    runner.wait().await.unwrap();

    assert_eq!(runner.exit_code(), 0);
    assert!(out.contains("Cargo.toml"));
    assert!(err.is_empty());

    runner.close().await;
    runner.close().await;
    assert_eq!(runner.state(), RunnerState::Closed);
}

#[tokio::test]
async fn test_local_ls_missing_directory() {
    let stdout = SharedBuffer::new();
    let stderr = SharedBuffer::new();

    let err = scriptexec_exec::run(
        &Connection::local(),
        &LS,
        &LsArguments {
            path: format!("{}/does-not-exist", manifest_dir()),
        },
        RunOutput::new()
            .with_stdout(stdout.writer())
            .with_stderr(stderr.writer()),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, RunnerError::ExecutionFailed { .. }));
    assert!(err.exit_code() > 0);
    assert!(stdout.contents().is_empty());
    assert!(!stderr.contents().is_empty());
}

#[tokio::test]
async fn test_connection_from_string_map() {
    let conn = Connection::from_map(&HashMap::from([("Type", "Local")])).unwrap();
    let script = Script::parse("echo", "sh", "echo {{.A}}-{{.B}}\n").unwrap();
    let stdout = SharedBuffer::new();

    scriptexec_exec::run(
        &conn,
        &script,
        &json!({"A": 1, "B": "two"}),
        RunOutput::new().with_stdout(stdout.writer()),
    )
    .await
    .unwrap();

    assert_eq!(stdout.to_string_lossy(), "1-two\n");
}

#[tokio::test]
async fn test_unknown_connection_type() {
    let err = Connection::from_value(json!({"type": "telnet"})).unwrap_err();
    assert!(matches!(err, RunnerError::UnknownConnectionType(_)));
    assert_eq!(err.exit_code(), -1);
}

#[tokio::test]
async fn test_render_error_surfaces_at_construction() {
    let err = scriptexec_exec::new(&Connection::local(), &LS, &json!({"Dir": "/"}))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RunnerError::Script(_)));
}

#[tokio::test]
async fn test_script_reused_across_runners() {
    let script = Script::parse("count", "sh", "echo {{.N}}\n").unwrap();

    for n in 0..3 {
        let stdout = SharedBuffer::new();
        scriptexec_exec::run(
            &Connection::local(),
            &script,
            &json!({"N": n}),
            RunOutput::new().with_stdout(stdout.writer()),
        )
        .await
        .unwrap();
        assert_eq!(stdout.to_string_lossy(), format!("{n}\n"));
    }
}

#[tokio::test]
async fn test_ssh_unreachable_host() {
    let conn = Connection::from(
        SshConnection::new("127.0.0.1", "me", "my-password")
            .with_port(closed_port())
            .insecure()
            .with_connect_timeout(Duration::from_secs(5)),
    );

    let err = scriptexec_exec::new(&conn, &LS, &LsArguments { path: "/".into() })
        .await
        .err()
        .unwrap();

    assert!(matches!(err, RunnerError::ConnectionFailed(_)));
    assert!(err.is_connection_error());
    assert_eq!(err.exit_code(), -1);
}

#[tokio::test]
async fn test_ssh_unreadable_known_hosts() {
    let conn = Connection::from(
        SshConnection::new("127.0.0.1", "me", "my-password")
            .with_port(closed_port())
            .with_known_hosts("/nonexistent/known_hosts"),
    );

    let err = scriptexec_exec::new(&conn, &LS, &LsArguments { path: "/".into() })
        .await
        .err()
        .unwrap();

    assert!(matches!(err, RunnerError::HostKey(_)));
}

#[tokio::test]
async fn test_ssh_broken_script_never_dials() {
    static BROKEN: LazyScript = LazyScript::new("broken", "sh", "{{range .X}}");
    let conn = Connection::from(SshConnection::new("192.0.2.1", "me", "pw").insecure());

    let err = scriptexec_exec::new(&conn, &BROKEN, &()).await.err().unwrap();

    assert!(matches!(err, RunnerError::Script(_)));
}

/// Needs `SCRIPTEXEC_SSH_HOST`, `SCRIPTEXEC_SSH_USER` and `SCRIPTEXEC_SSH_PASSWORD`
#[tokio::test]
#[ignore = "requires SSH server"]
async fn test_ssh_ls_existing_directory() {
    let env = |key: &str| std::env::var(key).unwrap();
    let conn = Connection::from(
        SshConnection::new(
            env("SCRIPTEXEC_SSH_HOST"),
            env("SCRIPTEXEC_SSH_USER"),
            env("SCRIPTEXEC_SSH_PASSWORD"),
        )
        .insecure(),
    );

    let mut runner = scriptexec_exec::new(&conn, &LS, &LsArguments { path: "/".into() })
        .await
        .unwrap();
    let mut stdout = runner.stdout_pipe().unwrap();
    let mut stderr = runner.stderr_pipe().unwrap();
    runner.start().await.unwrap();

    let mut out = String::new();
    stdout.read_to_string(&mut out).await.unwrap();
    let mut err = String::new();
    stderr.read_to_string(&mut err).await.unwrap();
    runner.wait().await.unwrap();
    runner.close().await;

    assert_eq!(runner.runner_type(), "ssh");
    assert_eq!(runner.exit_code(), 0);
    assert!(!out.is_empty());
    assert!(err.is_empty());
}
