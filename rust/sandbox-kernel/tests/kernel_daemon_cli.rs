use std::fs;
use std::process::Command;

use serde_json::{json, Value};

#[test]
fn kernel_daemon_runs_programs_and_writes_outputs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let program = dir.path().join("hello.json");
    let body = json!({
        "slices": [
            {"cpuMs": 2, "calls": [{"call": "write", "args": {"fd": 1, "data": "hello from pid"}}]},
            {"cpuMs": 1, "calls": [{"call": "mkdir", "args": {"path": "/tmp/out"}}]}
        ],
        "exitCode": 3
    });
    fs::write(&program, serde_json::to_string(&body).expect("program json")).expect("write program");

    let events_path = dir.path().join("events.jsonl");
    let snapshot_path = dir.path().join("machine.json");

    let output = Command::new(env!("CARGO_BIN_EXE_kernel_daemon"))
        .arg("--program")
        .arg(&program)
        .arg("--events-out")
        .arg(&events_path)
        .arg("--snapshot-out")
        .arg(&snapshot_path)
        .output()
        .expect("run kernel_daemon");

    assert!(
        output.status.success(),
        "daemon failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("[1] hello from pid"), "stdout: {stdout}");
    assert!(stdout.contains("exited"), "stdout: {stdout}");

    let events = fs::read_to_string(&events_path).expect("events file");
    let kinds: Vec<String> = events
        .lines()
        .map(|line| {
            let event: Value = serde_json::from_str(line).expect("event json");
            event["kind"].as_str().unwrap_or_default().to_string()
        })
        .collect();
    assert!(kinds.iter().any(|kind| kind == "booted"), "kinds: {kinds:?}");
    assert!(kinds.iter().any(|kind| kind == "exited"), "kinds: {kinds:?}");

    let snapshot: Value =
        serde_json::from_str(&fs::read_to_string(&snapshot_path).expect("snapshot file"))
            .expect("snapshot json");
    assert_eq!(snapshot["version"], 1);
    assert_eq!(snapshot["fs"]["kind"], "Map");
    assert_eq!(snapshot["tcp"]["kind"], "TcpState");
}

#[test]
fn kernel_daemon_reports_missing_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = Command::new(env!("CARGO_BIN_EXE_kernel_daemon"))
        .arg("--config")
        .arg(dir.path().join("absent.json"))
        .output()
        .expect("run kernel_daemon");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("absent.json"), "stderr: {stderr}");
}
