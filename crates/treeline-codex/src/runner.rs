//! Non-interactive Codex CLI runner.
//!
//! Invokes `codex exec --yolo --skip-git-repo-check --json <TASK>` inside a
//! workspace, mirrors stderr into a session log, tees stdout JSONL into an
//! events file, forwards high-signal records to a stream callback, and
//! enforces a wall-clock timeout plus an external termination check.

use crate::process::terminate_process_group;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default argv prefix; the rendered task markdown is appended as the final
/// element.
pub const DEFAULT_CODEX_ARGV: [&str; 5] =
    ["codex", "exec", "--yolo", "--skip-git-repo-check", "--json"];

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

pub type PidCallback = Arc<dyn Fn(u32) + Send + Sync>;
pub type TerminationChecker = Arc<dyn Fn() -> bool + Send + Sync>;
pub type StreamCallback = Arc<dyn Fn(String) + Send + Sync>;

/// `(term_out, exec_time, exc_type, exc_info)` in struct form. `exc_type` is
/// `None` on a clean exit, otherwise one of `Terminated`, `TimeoutError`,
/// `CodexError`, `CodexRunnerError`.
#[derive(Clone, Debug)]
pub struct CodexRunOutcome {
    pub term_out: Vec<String>,
    pub exec_time: f64,
    pub exc_type: Option<String>,
    pub exc_info: Option<Value>,
}

impl CodexRunOutcome {
    pub fn succeeded(&self) -> bool {
        self.exc_type.is_none()
    }
}

pub struct CodexRunner {
    workspace_dir: PathBuf,
    session_log_name: String,
    events_log_name: String,
    timeout: Duration,
    argv: Vec<String>,
    env: HashMap<String, String>,
}

impl CodexRunner {
    pub fn new(
        workspace_dir: impl Into<PathBuf>,
        timeout: Duration,
        argv: Vec<String>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            session_log_name: "codex_session.log".to_string(),
            events_log_name: "codex_events.jsonl".to_string(),
            timeout,
            argv,
            env,
        }
    }

    /// Override the session/events file names (the metrics sub-pass uses its
    /// own pair so artifacts from the two Codex invocations stay separate).
    pub fn with_log_names(
        mut self,
        session_log_name: impl Into<String>,
        events_log_name: impl Into<String>,
    ) -> Self {
        self.session_log_name = session_log_name.into();
        self.events_log_name = events_log_name.into();
        self
    }

    pub async fn run(
        &self,
        task_file: &Path,
        pid_callback: Option<PidCallback>,
        termination_checker: Option<TerminationChecker>,
        stream_callback: Option<StreamCallback>,
    ) -> CodexRunOutcome {
        let started_at = Instant::now();
        let events_path = self.workspace_dir.join(&self.events_log_name);
        let session_path = self.workspace_dir.join(&self.session_log_name);

        let prompt = match tokio::fs::read_to_string(task_file).await {
            Ok(text) => text,
            Err(e) => {
                warn!("failed to read Codex task file {}: {}", task_file.display(), e);
                return self
                    .outcome_from_events(
                        &events_path,
                        started_at,
                        Some("CodexRunnerError"),
                        Some(serde_json::json!({ "reason": e.to_string() })),
                    )
                    .await;
            }
        };

        let (program, rest) = match self.argv.split_first() {
            Some(split) => split,
            None => {
                return self
                    .outcome_from_events(
                        &events_path,
                        started_at,
                        Some("CodexRunnerError"),
                        Some(serde_json::json!({ "reason": "empty argv" })),
                    )
                    .await;
            }
        };
        info!(
            "Starting Codex CLI: {} {} (cwd={})",
            program,
            rest.join(" "),
            self.workspace_dir.display()
        );

        let mut command = Command::new(program);
        command
            .args(rest)
            .arg(&prompt)
            .current_dir(&self.workspace_dir)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // New session/process group so SIGTERM reaches grandchildren.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Codex CLI spawn failed: {}", e);
                return self
                    .outcome_from_events(
                        &events_path,
                        started_at,
                        Some("CodexRunnerError"),
                        Some(serde_json::json!({ "reason": e.to_string() })),
                    )
                    .await;
            }
        };

        let pid = child.id().unwrap_or(0);
        if let Some(cb) = &pid_callback {
            cb(pid);
        }

        let stderr_task = child.stderr.take().map(|stderr| {
            spawn_stderr_reader(stderr, session_path.clone(), stream_callback.clone())
        });
        let stdout_task = child.stdout.take().map(|stdout| {
            spawn_stdout_reader(
                stdout,
                session_path.clone(),
                events_path.clone(),
                stream_callback.clone(),
            )
        });

        let mut exc_type: Option<String> = None;
        let mut exc_info: Option<Value> = None;
        loop {
            if let Some(checker) = &termination_checker {
                if checker() {
                    info!("Codex run terminated by external request (pid={})", pid);
                    terminate_process_group(pid, TERMINATE_GRACE).await;
                    exc_type = Some("Terminated".to_string());
                    exc_info = Some(serde_json::json!({ "reason": "terminated" }));
                    break;
                }
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    let code = status.code().unwrap_or(-1);
                    if code == 0 {
                        exc_info = Some(serde_json::json!({ "returncode": code }));
                    } else {
                        exc_type = Some("CodexError".to_string());
                        exc_info = Some(serde_json::json!({ "returncode": code }));
                    }
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    terminate_process_group(pid, TERMINATE_GRACE).await;
                    exc_type = Some("CodexRunnerError".to_string());
                    exc_info = Some(serde_json::json!({ "reason": e.to_string() }));
                    break;
                }
            }

            if started_at.elapsed() > self.timeout {
                info!(
                    "Codex run timed out after {}s (pid={})",
                    self.timeout.as_secs(),
                    pid
                );
                terminate_process_group(pid, TERMINATE_GRACE).await;
                exc_type = Some("TimeoutError".to_string());
                exc_info = Some(serde_json::json!({
                    "reason": "timeout",
                    "timeout_seconds": self.timeout.as_secs(),
                }));
                break;
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }

        // Let the readers drain whatever the pipes still hold.
        if let Some(task) = stdout_task {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        if let Some(task) = stderr_task {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }

        self.outcome_from_events(&events_path, started_at, exc_type.as_deref(), exc_info)
            .await
    }

    /// Rebuild `term_out` from the events file so downstream consumers see
    /// the same content regardless of how the run ended.
    async fn outcome_from_events(
        &self,
        events_path: &Path,
        started_at: Instant,
        exc_type: Option<&str>,
        exc_info: Option<Value>,
    ) -> CodexRunOutcome {
        let exec_time = started_at.elapsed().as_secs_f64();
        let term_out = match tokio::fs::read_to_string(events_path).await {
            Ok(text) => text.lines().map(|l| format!("{}\n", l)).collect(),
            Err(_) => Vec::new(),
        };
        CodexRunOutcome {
            term_out,
            exec_time,
            exc_type: exc_type.map(str::to_string),
            exc_info,
        }
    }
}

fn append_line(path: &Path, line: &str) {
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{}", line));
    if let Err(e) = result {
        debug!("failed appending to {}: {}", path.display(), e);
    }
}

fn spawn_stderr_reader(
    stderr: tokio::process::ChildStderr,
    session_path: PathBuf,
    stream_callback: Option<StreamCallback>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            append_line(&session_path, &line);
            if let Some(cb) = &stream_callback {
                cb(format!("[codex:stderr] {}", line.trim_end()));
            }
        }
    })
}

fn spawn_stdout_reader(
    stdout: tokio::process::ChildStdout,
    session_path: PathBuf,
    events_path: PathBuf,
    stream_callback: Option<StreamCallback>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            append_line(&session_path, &line);
            append_line(&events_path, &line);
            if let Some(cb) = &stream_callback {
                if let Some(msg) = interesting_event_message(&line) {
                    cb(msg);
                }
            }
        }
    })
}

/// Filter a stdout JSONL record down to the high-signal items worth
/// forwarding to the outer UI. The full stream is always available in
/// `codex_events.jsonl`.
pub fn interesting_event_message(line: &str) -> Option<String> {
    let obj: Value = serde_json::from_str(line).ok()?;
    let obj = obj.as_object()?;
    let typ = obj.get("type").and_then(Value::as_str);
    match typ {
        Some("error") => return Some(format!("[codex:error] {}", line)),
        Some(t @ ("thread.started" | "turn.started" | "turn.completed" | "turn.failed")) => {
            return Some(format!("[codex:{}] {}", t, line));
        }
        _ => {}
    }
    let item = obj.get("item")?.as_object()?;
    match item.get("type").and_then(Value::as_str)? {
        "agent_message" => {
            let text = item.get("text").and_then(Value::as_str)?;
            Some(format!("[codex:agent_message] {}", text))
        }
        "command_execution" => {
            let cmd = item.get("command").and_then(Value::as_str)?;
            let status = item
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let cmd_one_line = cmd.split_whitespace().collect::<Vec<_>>().join(" ");
            let truncated: String = cmd_one_line.chars().take(400).collect();
            Some(format!("[codex:cmd:{}] {}", status, truncated))
        }
        _ => None,
    }
}
