//! Process backend against a shell-script engine and an in-test
//! management server.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use workvpn_core::{ConnectionState, Credentials, VpnErrorKind, VpnEvent};
use workvpn_tunnel::tunnel::config::parse;
use workvpn_tunnel::tunnel::*;

const SAMPLE: &str =
    "remote vpn.example.com 1194\nproto udp\nauth-user-pass /etc/openvpn/creds.txt\n<ca>\nX\n</ca>\n";
const PASSWORD: &str = "correct-horse-battery";

fn write_engine(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-openvpn");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn settings(engine: PathBuf, work_dir: PathBuf, port: Option<u16>) -> ProcessSettings {
    ProcessSettings {
        engine_path: Some(engine),
        work_dir: Some(work_dir),
        control_port: port,
        control_connect_timeout_secs: 5,
        query_timeout_ms: 500,
        ..Default::default()
    }
}

fn orchestrator(settings: ProcessSettings) -> Orchestrator {
    let backend = ProcessBackend::with_locator(
        settings.clone(),
        EngineLocator::exact(settings.engine_path.clone().unwrap()),
    );
    Orchestrator::spawn(
        Box::new(backend),
        OrchestratorSettings {
            connect_timeout_secs: 10,
            disconnect_grace_secs: 1,
            stats_interval_ms: 100,
            event_capacity: 256,
        },
    )
}

fn files_contain(dir: &Path, needle: &str) -> bool {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .any(|e| {
            std::fs::read(e.path())
                .map(|b| String::from_utf8_lossy(&b).contains(needle))
                .unwrap_or(false)
        })
}

/// Minimal management server: prompts for credentials, reports CONNECTED
/// once the password arrives and answers stats queries.
async fn management_server(listener: TcpListener, seen: mpsc::UnboundedSender<String>) {
    let Ok((sock, _)) = listener.accept().await else {
        return;
    };
    let (r, mut w) = sock.into_split();
    let mut lines = BufReader::new(r).lines();
    let _ = w
        .write_all(b">INFO:OpenVPN Management Interface Version 5\n>PASSWORD:Need 'Auth' username/password\n")
        .await;
    while let Ok(Some(line)) = lines.next_line().await {
        let _ = seen.send(line.clone());
        let reply: &[u8] = if line.starts_with("password ") {
            b"SUCCESS: 'Auth' password entered, but not yet verified\n>STATE:1700000000,CONNECTED,SUCCESS,10.8.0.6,203.0.113.1,,\n"
        } else if line == "bytecount" {
            b">BYTECOUNT:1000,500\n"
        } else if line == "state" {
            b"1700000000,CONNECTED,SUCCESS,10.8.0.6,203.0.113.1,,\nEND\n"
        } else {
            b"SUCCESS: ok\n"
        };
        if w.write_all(reply).await.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn exit_code_fails_attempt_and_cleans_up() {
    let bin_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();
    let engine = write_engine(bin_dir.path(), "echo 'Options error: bad config' >&2\nexit 1");

    // Nothing listens on this port; the engine dies before it would matter.
    let port = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let orch = orchestrator(settings(engine, work_dir.path().to_path_buf(), Some(port)));
    let mut rx = orch.subscribe();

    let err = orch.connect(parse(SAMPLE).unwrap(), None).await.unwrap_err();
    assert_eq!(err.kind, VpnErrorKind::ProcessExit);
    let reason = orch.status().failure_reason().unwrap().to_string();
    assert!(reason.contains("code 1"), "{reason}");

    while let Ok(ev) = rx.try_recv() {
        if let VpnEvent::StatusChanged(c) = ev {
            assert_ne!(c.state, ConnectionState::Connected);
        }
    }
    assert_eq!(std::fs::read_dir(work_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn credentials_only_travel_over_the_control_socket() {
    let bin_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();
    let args_file = bin_dir.path().join("args.txt");
    let engine = write_engine(
        bin_dir.path(),
        &format!(
            "echo \"$@\" > '{}'\necho 'Initialization in progress'\nexec sleep 30",
            args_file.display()
        ),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(management_server(listener, seen_tx));

    let orch = orchestrator(settings(engine, work_dir.path().to_path_buf(), Some(port)));
    let mut rx = orch.subscribe();
    orch.connect(
        parse(SAMPLE).unwrap(),
        Some(Credentials::new("alice", PASSWORD)),
    )
    .await
    .unwrap();
    assert_eq!(orch.status(), ConnectionState::Connected);
    assert_eq!(orch.snapshot().local_ip.as_deref(), Some("10.8.0.6"));

    // The management socket saw the full exchange.
    let mut seen = Vec::new();
    while let Ok(line) = seen_rx.try_recv() {
        seen.push(line);
    }
    assert_eq!(seen.first().map(String::as_str), Some("hold release"));
    assert!(seen.contains(&"username \"Auth\" alice".to_string()));
    assert!(seen.contains(&format!("password \"Auth\" {PASSWORD}")));

    // Neither argv nor anything written to disk holds the secret.
    let args = std::fs::read_to_string(&args_file).unwrap();
    assert!(args.contains("--management 127.0.0.1"));
    assert!(args.contains("--management-query-passwords"));
    assert!(!args.contains(PASSWORD));
    assert!(!files_contain(work_dir.path(), PASSWORD));
    assert!(!files_contain(work_dir.path(), "creds.txt"));
    assert!(!files_contain(bin_dir.path(), PASSWORD));

    // Stats arrive through the poller.
    let mut got_stats = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !got_stats && tokio::time::Instant::now() < deadline {
        if let Ok(Ok(VpnEvent::StatsUpdate(s))) =
            tokio::time::timeout(Duration::from_secs(1), rx.recv()).await
        {
            got_stats = s.bytes_in == 1000 && s.bytes_out == 500;
        }
    }
    assert!(got_stats);

    // The script ignores SIGTERM over the socket; the grace period bounds it.
    let started = tokio::time::Instant::now();
    orch.disconnect().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(orch.status(), ConnectionState::Idle);
    assert_eq!(std::fs::read_dir(work_dir.path()).unwrap().count(), 0);
}
