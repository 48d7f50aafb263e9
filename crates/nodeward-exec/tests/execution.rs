//! End-to-end execution tests through the public engine API.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use nodeward_exec::privilege::is_root;
use nodeward_exec::{
    ExecutionEngine, ExecutionRequest, ExecutionResult, decode_env_payload, write_facts_file,
};
use serde_json::json;
use std::os::unix::fs::PermissionsExt;

#[tokio::test]
async fn echo_hello() {
    let result = ExecutionEngine::default()
        .execute_command("echo hello", &ExecutionRequest::new())
        .await;
    assert_eq!(result, ExecutionResult::new(0, "hello\n", ""));
}

#[tokio::test]
async fn missing_file_reports_launch_failure() {
    let result = ExecutionEngine::default()
        .execute_file(
            std::path::Path::new("/nonexistent/nodeward/script.sh"),
            &ExecutionRequest::new(),
        )
        .await;
    assert_eq!(result.code, 255);
    assert_eq!(result.stdout, "");
    assert!(!result.stderr.is_empty());
}

#[tokio::test]
async fn execute_file_sets_mode_and_uses_request() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("script.cmd");
    std::fs::write(
        &script,
        "#!/bin/sh\nread line\necho \"$line from $(basename \"$(pwd -P)\") with $GREETING\"\n",
    )
    .unwrap();

    let payload = STANDARD.encode(json!({"GREETING": "hola"}).to_string());
    let request = ExecutionRequest::new()
        .stdin("input\n")
        .workdir(dir.path())
        .env(decode_env_payload(Some(&payload)));
    let result = ExecutionEngine::default().execute_file(&script, &request).await;

    let dir_name = dir.path().file_name().unwrap().to_string_lossy().into_owned();
    assert_eq!(result.code, 0, "stderr: {}", result.stderr);
    assert_eq!(result.stdout, format!("input from {} with hola\n", dir_name));

    let mode = std::fs::metadata(&script).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o700);
}

#[tokio::test]
async fn env_payload_none_means_inherited_environment() {
    let request = ExecutionRequest::new().env(decode_env_payload(None));
    let result = ExecutionEngine::default()
        .execute_command("sh -c 'test -n \"$PATH\" && echo ok'", &request)
        .await;
    assert_eq!(result.stdout, "ok\n");
}

#[tokio::test]
async fn run_as_switches_user() {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let request = ExecutionRequest::new().run_as(Some("root".to_string()));
    let result = ExecutionEngine::default()
        .execute_command("id -un", &request)
        .await;
    assert_eq!(result.code, 0, "stderr: {}", result.stderr);
    assert_eq!(result.stdout.trim(), "root");
}

#[test]
fn facts_snapshot_is_sorted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("facts/node_info");
    let facts = json!({"b": "2", "a": "1"});
    write_facts_file(&path, facts.as_object().unwrap()).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "a:1\nb:2\n");
}
