//! Tests for treeline-codex: JSONL event filtering and the CLI runner
//! lifecycle (exercised with stub shell commands instead of the real CLI).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use treeline_codex::runner::interesting_event_message;
use treeline_codex::{CodexRunner, TerminationChecker};

// ===========================================================================
// JSONL filtering
// ===========================================================================

#[test]
fn filters_error_and_turn_events() {
    let msg = interesting_event_message(r#"{"type":"error","message":"boom"}"#).unwrap();
    assert!(msg.starts_with("[codex:error]"));

    let msg = interesting_event_message(r#"{"type":"turn.completed"}"#).unwrap();
    assert!(msg.starts_with("[codex:turn.completed]"));

    let msg = interesting_event_message(r#"{"type":"thread.started","thread_id":"t1"}"#).unwrap();
    assert!(msg.starts_with("[codex:thread.started]"));
}

#[test]
fn forwards_agent_messages_as_plain_text() {
    let line = r#"{"type":"item.completed","item":{"type":"agent_message","text":"working on it"}}"#;
    assert_eq!(
        interesting_event_message(line).unwrap(),
        "[codex:agent_message] working on it"
    );
}

#[test]
fn forwards_command_executions_with_status() {
    let line = r#"{"type":"item.completed","item":{"type":"command_execution","command":"python  train.py","status":"completed"}}"#;
    let msg = interesting_event_message(line).unwrap();
    assert_eq!(msg, "[codex:cmd:completed] python train.py");
}

#[test]
fn truncates_long_commands() {
    let cmd = "x".repeat(1000);
    let line = format!(
        r#"{{"type":"item.completed","item":{{"type":"command_execution","command":"{}","status":"running"}}}}"#,
        cmd
    );
    let msg = interesting_event_message(&line).unwrap();
    assert!(msg.len() < 450);
}

#[test]
fn ignores_low_signal_records() {
    assert!(interesting_event_message(r#"{"type":"item.updated","item":{"type":"reasoning"}}"#).is_none());
    assert!(interesting_event_message("not json at all").is_none());
    assert!(interesting_event_message(r#"{"type":"token_count"}"#).is_none());
}

// ===========================================================================
// Runner lifecycle
// ===========================================================================

fn write_task(dir: &std::path::Path) -> std::path::PathBuf {
    let task = dir.join("codex_task.md");
    std::fs::write(&task, "# task\n").unwrap();
    task
}

/// A runner whose "codex" is `sh -c <script>`; the task prompt lands in $0
/// and is ignored by the script.
fn sh_runner(dir: &std::path::Path, script: &str, timeout: Duration) -> CodexRunner {
    CodexRunner::new(
        dir,
        timeout,
        vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        HashMap::from([("PATH".to_string(), std::env::var("PATH").unwrap_or_default())]),
    )
}

#[tokio::test]
async fn clean_exit_collects_jsonl_events() {
    let dir = tempfile::tempdir().unwrap();
    let task = write_task(dir.path());
    let script = r#"printf '{"type":"thread.started"}\n{"type":"turn.completed"}\n'"#;
    let runner = sh_runner(dir.path(), script, Duration::from_secs(30));

    let streamed: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
    let sink = streamed.clone();
    let outcome = runner
        .run(
            &task,
            None,
            None,
            Some(Arc::new(move |msg| sink.lock().unwrap().push(msg))),
        )
        .await;

    assert!(outcome.succeeded());
    assert_eq!(outcome.term_out.len(), 2);
    assert!(outcome.term_out[0].contains("thread.started"));
    assert!(dir.path().join("codex_events.jsonl").exists());
    assert!(dir.path().join("codex_session.log").exists());
    let streamed = streamed.lock().unwrap();
    assert!(streamed.iter().any(|m| m.contains("thread.started")));
}

#[tokio::test]
async fn nonzero_exit_yields_codex_error_with_returncode() {
    let dir = tempfile::tempdir().unwrap();
    let task = write_task(dir.path());
    let runner = sh_runner(dir.path(), "exit 3", Duration::from_secs(30));
    let outcome = runner.run(&task, None, None, None).await;
    assert_eq!(outcome.exc_type.as_deref(), Some("CodexError"));
    assert_eq!(outcome.exc_info.unwrap()["returncode"], 3);
}

#[tokio::test]
async fn stderr_lines_reach_the_stream_callback() {
    let dir = tempfile::tempdir().unwrap();
    let task = write_task(dir.path());
    let runner = sh_runner(dir.path(), "echo progress >&2", Duration::from_secs(30));
    let streamed: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
    let sink = streamed.clone();
    let outcome = runner
        .run(
            &task,
            None,
            None,
            Some(Arc::new(move |msg| sink.lock().unwrap().push(msg))),
        )
        .await;
    assert!(outcome.succeeded());
    let streamed = streamed.lock().unwrap();
    assert!(streamed.iter().any(|m| m == "[codex:stderr] progress"));
}

#[tokio::test]
async fn wall_clock_timeout_kills_the_child() {
    let dir = tempfile::tempdir().unwrap();
    let task = write_task(dir.path());
    let runner = sh_runner(dir.path(), "sleep 30", Duration::from_millis(300));
    let started = std::time::Instant::now();
    let outcome = runner.run(&task, None, None, None).await;
    assert_eq!(outcome.exc_type.as_deref(), Some("TimeoutError"));
    // SIGTERM + 1 s grace + SIGKILL; well under the sleep duration.
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn termination_checker_aborts_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let task = write_task(dir.path());
    let runner = sh_runner(dir.path(), "sleep 30", Duration::from_secs(60));

    let flag = Arc::new(AtomicBool::new(false));
    let checker_flag = flag.clone();
    let checker: TerminationChecker = Arc::new(move || checker_flag.load(Ordering::SeqCst));

    let trip = flag.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trip.store(true, Ordering::SeqCst);
    });

    let started = std::time::Instant::now();
    let outcome = runner.run(&task, None, Some(checker), None).await;
    assert_eq!(outcome.exc_type.as_deref(), Some("Terminated"));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn pid_callback_reports_the_child_pid() {
    let dir = tempfile::tempdir().unwrap();
    let task = write_task(dir.path());
    let runner = sh_runner(dir.path(), "true", Duration::from_secs(30));
    let seen: Arc<std::sync::Mutex<Option<u32>>> = Arc::default();
    let sink = seen.clone();
    let outcome = runner
        .run(
            &task,
            Some(Arc::new(move |pid| *sink.lock().unwrap() = Some(pid))),
            None,
            None,
        )
        .await;
    assert!(outcome.succeeded());
    assert!(seen.lock().unwrap().unwrap() > 0);
}

#[tokio::test]
async fn missing_binary_reports_runner_error() {
    let dir = tempfile::tempdir().unwrap();
    let task = write_task(dir.path());
    let runner = CodexRunner::new(
        dir.path(),
        Duration::from_secs(5),
        vec!["definitely-not-a-real-binary-42".to_string()],
        HashMap::new(),
    );
    let outcome = runner.run(&task, None, None, None).await;
    assert_eq!(outcome.exc_type.as_deref(), Some("CodexRunnerError"));
}

#[tokio::test]
async fn custom_log_names_are_honored() {
    let dir = tempfile::tempdir().unwrap();
    let task = write_task(dir.path());
    let script = r#"printf '{"type":"turn.started"}\n'"#;
    let runner = sh_runner(dir.path(), script, Duration::from_secs(30))
        .with_log_names("codex_session__metrics.log", "codex_events__metrics.jsonl");
    let outcome = runner.run(&task, None, None, None).await;
    assert!(outcome.succeeded());
    assert!(dir.path().join("codex_events__metrics.jsonl").exists());
    assert!(!dir.path().join("codex_events.jsonl").exists());
}
