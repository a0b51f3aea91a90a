use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::ExitStatus,
    sync::Arc,
    time::Duration,
};

use agentic_process::{OutputTail, RunStatus, ToolKey, ToolStatus, tail_chars};
use anyhow::Context;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
};

use crate::{now_unix_ms, store::StateStore};

// Grandchildren may keep the pipes open after the direct child exits.
const READER_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// How a finished child is reported back into the tool's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReport {
    /// `success` on exit code zero, `error` (with the output tail) otherwise.
    Outcome { success_message: Option<String> },
    /// Long-running servers return to `idle` whatever the exit code.
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FinalReport {
    pub tool_status: ToolStatus,
    pub run_status: RunStatus,
    pub message: String,
    pub run_output: String,
}

fn exit_line(status: Option<&ExitStatus>) -> String {
    let Some(status) = status else {
        return "Process exited (status unavailable)".to_string();
    };
    if let Some(code) = status.code() {
        return format!("Process exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return format!("Process terminated by signal {sig}");
        }
    }
    "Process exited".to_string()
}

impl ExitReport {
    pub(crate) fn describe(
        &self,
        status: Option<&ExitStatus>,
        tail: &str,
        max_chars: usize,
    ) -> FinalReport {
        let succeeded = status.is_some_and(|s| s.success());
        let line = exit_line(status);
        let with_tail = if tail.trim().is_empty() {
            line.clone()
        } else {
            // Exit line goes last so the window never cuts it off.
            let joined = format!("{}\n{line}", tail.trim_end());
            tail_chars(&joined, max_chars).to_string()
        };
        let run_status = if succeeded {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };

        match self {
            ExitReport::Outcome { success_message } if succeeded => FinalReport {
                tool_status: ToolStatus::Success,
                run_status,
                message: success_message.clone().unwrap_or(line),
                run_output: with_tail,
            },
            ExitReport::Outcome { .. } => FinalReport {
                tool_status: ToolStatus::Error,
                run_status,
                message: with_tail.clone(),
                run_output: with_tail,
            },
            ExitReport::Idle => FinalReport {
                tool_status: ToolStatus::Idle,
                run_status,
                message: line,
                run_output: with_tail,
            },
        }
    }
}

/// Everything needed to launch one tool invocation.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub tool: ToolKey,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub exit_report: ExitReport,
}

impl SpawnSpec {
    pub fn command_line(&self) -> String {
        let mut out = self.program.clone();
        for a in &self.args {
            out.push(' ');
            if a.is_empty() || a.contains(char::is_whitespace) {
                out.push_str(&format!("{a:?}"));
            } else {
                out.push_str(a);
            }
        }
        out
    }
}

/// A child that is already running on its own. Dropping or detaching the
/// handle never stops the process.
#[derive(Debug)]
pub struct DetachedProcess {
    pub pid: u32,
    pub log_file: PathBuf,
    release: oneshot::Sender<Option<String>>,
}

impl DetachedProcess {
    /// Lets the completion task report the exit. Call after any optimistic
    /// "running" write so the final status cannot be overwritten by it.
    pub fn detach(self, run_id: Option<String>) {
        let _ = self.release.send(run_id);
    }
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    store: StateStore,
    log_dir: PathBuf,
    tail_chars: usize,
}

impl ProcessRunner {
    pub fn new(store: StateStore, log_dir: impl Into<PathBuf>, tail_chars: usize) -> Self {
        Self {
            store,
            log_dir: log_dir.into(),
            tail_chars,
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Starts `spec` in a new session with stdout/stderr teed into a fresh
    /// log file and an in-memory tail. Returns as soon as the pid is known.
    pub async fn spawn(&self, spec: SpawnSpec) -> anyhow::Result<DetachedProcess> {
        let (log_path, log_file) = create_log_file(&self.log_dir, spec.tool).await?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        #[cfg(unix)]
        {
            // New session: the child must outlive this server and its process
            // group doubles as the stop target.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = match cmd.spawn().with_context(|| {
            format!(
                "spawn {} (cwd {})",
                spec.command_line(),
                spec.cwd.display()
            )
        }) {
            Ok(c) => c,
            Err(e) => {
                drop(log_file);
                let _ = tokio::fs::remove_file(&log_path).await;
                return Err(e);
            }
        };
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("{} exited before reporting a pid", spec.program))?;

        tracing::info!(
            tool = %spec.tool,
            pid,
            log = %log_path.display(),
            "spawned detached process"
        );

        let (log_tx, log_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer = tokio::spawn(write_log(log_file, log_rx));
        let _ = log_tx.send(
            format!(
                "[agentic] exec: {} (cwd {}) pid={pid}\n",
                spec.command_line(),
                spec.cwd.display()
            )
            .into_bytes(),
        );

        let tail = Arc::new(Mutex::new(OutputTail::new(self.tail_chars)));
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(pump(out, log_tx.clone(), tail.clone())));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(pump(err, log_tx.clone(), tail.clone())));
        }

        let (release_tx, release_rx) = oneshot::channel();
        tokio::spawn(supervise(Supervision {
            child,
            pid,
            tool: spec.tool,
            exit_report: spec.exit_report,
            store: self.store.clone(),
            tail,
            tail_chars: self.tail_chars,
            readers,
            log_tx,
            writer,
            release: release_rx,
        }));

        Ok(DetachedProcess {
            pid,
            log_file: log_path,
            release: release_tx,
        })
    }
}

struct Supervision {
    child: Child,
    pid: u32,
    tool: ToolKey,
    exit_report: ExitReport,
    store: StateStore,
    tail: Arc<Mutex<OutputTail>>,
    tail_chars: usize,
    readers: Vec<JoinHandle<()>>,
    log_tx: mpsc::UnboundedSender<Vec<u8>>,
    writer: JoinHandle<()>,
    release: oneshot::Receiver<Option<String>>,
}

async fn supervise(mut s: Supervision) {
    let run_id = s.release.await.ok().flatten();
    let status = s.child.wait().await;
    if let Err(e) = &status {
        tracing::warn!(tool = %s.tool, pid = s.pid, error = %e, "failed to wait for child");
    }

    for mut reader in s.readers {
        if tokio::time::timeout(READER_DRAIN_GRACE, &mut reader)
            .await
            .is_err()
        {
            reader.abort();
        }
    }

    let status = status.ok();
    let _ = s
        .log_tx
        .send(format!("[agentic] {}\n", exit_line(status.as_ref())).into_bytes());
    drop(s.log_tx);
    let _ = s.writer.await;

    let tail = s.tail.lock().await.as_str().to_string();
    let report = s
        .exit_report
        .describe(status.as_ref(), &tail, s.tail_chars);
    tracing::info!(
        tool = %s.tool,
        pid = s.pid,
        status = ?report.tool_status,
        "detached process finished"
    );

    let (tool, pid) = (s.tool, s.pid);
    s.store
        .update(move |state| {
            // A stop or a newer start already owns this entry.
            if state.tool(tool).and_then(|t| t.pid) == Some(pid) {
                state.set_tool(tool, report.tool_status, report.message, None);
            } else {
                tracing::debug!(%tool, pid, "tool entry moved on; keeping it");
            }
            if let Some(id) = run_id {
                state.finish_run(&id, report.run_status, report.run_output);
            }
        })
        .await;
}

async fn pump<R>(reader: R, log_tx: mpsc::UnboundedSender<Vec<u8>>, tail: Arc<Mutex<OutputTail>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                tail.lock().await.push(&String::from_utf8_lossy(&buf));
                let _ = log_tx.send(buf.clone());
            }
        }
    }
}

async fn write_log(mut file: tokio::fs::File, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = file.write_all(&chunk).await {
            tracing::warn!(error = %e, "failed to write run log");
            break;
        }
    }
    let _ = file.flush().await;
}

async fn create_log_file(dir: &Path, tool: ToolKey) -> anyhow::Result<(PathBuf, tokio::fs::File)> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create log dir {}", dir.display()))?;

    let stamp = now_unix_ms();
    for attempt in 0..100u32 {
        let name = if attempt == 0 {
            format!("{tool}-{stamp}.log")
        } else {
            format!("{tool}-{stamp}-{attempt}.log")
        };
        let path = dir.join(name);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(f) => return Ok((path, f)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("create log file {}", path.display()));
            }
        }
    }
    anyhow::bail!("could not allocate a log file name in {}", dir.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_dir_for;
    use agentic_process::DashboardState;

    fn sh(tool: ToolKey, script: &str, report: ExitReport) -> SpawnSpec {
        SpawnSpec {
            tool,
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
            env: BTreeMap::new(),
            exit_report: report,
        }
    }

    async fn wait_until(store: &StateStore, f: impl Fn(&DashboardState) -> bool) -> DashboardState {
        for _ in 0..200 {
            let s = store.load().await;
            if f(&s) {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached");
    }

    fn exit_status(code: i32) -> ExitStatus {
        std::process::Command::new("sh")
            .args(["-c", &format!("exit {code}")])
            .status()
            .unwrap()
    }

    #[test]
    fn describe_success_uses_success_message() {
        let r = ExitReport::Outcome {
            success_message: Some("Spec created successfully".to_string()),
        }
        .describe(Some(&exit_status(0)), "some output", 1000);
        assert_eq!(r.tool_status, ToolStatus::Success);
        assert_eq!(r.run_status, RunStatus::Completed);
        assert_eq!(r.message, "Spec created successfully");
    }

    #[test]
    fn describe_failure_keeps_exit_code_within_window() {
        let tail = "x".repeat(5000);
        let r = ExitReport::Outcome {
            success_message: None,
        }
        .describe(Some(&exit_status(2)), &tail, 1000);
        assert_eq!(r.tool_status, ToolStatus::Error);
        assert_eq!(r.run_status, RunStatus::Failed);
        assert!(r.message.ends_with("Process exited with code 2"));
        assert_eq!(r.message.chars().count(), 1000);
    }

    #[test]
    fn describe_idle_ignores_exit_code() {
        let r = ExitReport::Idle.describe(Some(&exit_status(1)), "", 1000);
        assert_eq!(r.tool_status, ToolStatus::Idle);
        assert_eq!(r.message, "Process exited with code 1");
        assert_eq!(r.run_status, RunStatus::Failed);
    }

    #[test]
    fn command_line_quotes_spaced_args() {
        let spec = SpawnSpec {
            tool: ToolKey::ContinuousClaude,
            program: "continuous-claude".to_string(),
            args: vec!["--prompt".to_string(), "fix lint".to_string()],
            cwd: PathBuf::from("/"),
            env: BTreeMap::new(),
            exit_report: ExitReport::Idle,
        };
        assert_eq!(spec.command_line(), "continuous-claude --prompt \"fix lint\"");
    }

    #[tokio::test]
    async fn spawn_logs_output_and_reports_success() {
        let dir = temp_dir_for("runner-success");
        let store = StateStore::new(dir.join("state.json"));
        let runner = ProcessRunner::new(store.clone(), dir.join("logs"), 1000);

        let p = runner
            .spawn(sh(
                ToolKey::AutoClaude,
                "echo hello; echo oops >&2",
                ExitReport::Outcome {
                    success_message: Some("done".to_string()),
                },
            ))
            .await
            .unwrap();
        let name = p.log_file.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("auto-claude-"));
        assert!(name.ends_with(".log"));

        store
            .upsert_tool(ToolKey::AutoClaude, ToolStatus::Running, "go", Some(p.pid))
            .await;
        let run_id = store.prepend_run("Auto-Claude", "t", RunStatus::Running).await;
        let log_file = p.log_file.clone();
        p.detach(Some(run_id));

        let state = wait_until(&store, |s| {
            s.tool(ToolKey::AutoClaude).unwrap().status == ToolStatus::Success
        })
        .await;
        let tool = state.tool(ToolKey::AutoClaude).unwrap();
        assert_eq!(tool.output, "done");
        assert_eq!(tool.pid, None);
        assert_eq!(state.runs[0].status, RunStatus::Completed);
        assert!(state.runs[0].output.contains("hello"));

        let log = std::fs::read_to_string(&log_file).unwrap();
        assert!(log.contains("[agentic] exec: sh -c"));
        assert!(log.contains("hello"));
        assert!(log.contains("oops"));
        assert!(log.contains("Process exited with code 0"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn spawn_reports_nonzero_exit_as_error() {
        let dir = temp_dir_for("runner-error");
        let store = StateStore::new(dir.join("state.json"));
        let runner = ProcessRunner::new(store.clone(), dir.join("logs"), 1000);

        let p = runner
            .spawn(sh(
                ToolKey::ContinuousClaude,
                "echo failing; exit 4",
                ExitReport::Outcome {
                    success_message: None,
                },
            ))
            .await
            .unwrap();
        store
            .upsert_tool(ToolKey::ContinuousClaude, ToolStatus::Running, "go", Some(p.pid))
            .await;
        p.detach(None);

        let state = wait_until(&store, |s| {
            s.tool(ToolKey::ContinuousClaude).unwrap().status == ToolStatus::Error
        })
        .await;
        let out = &state.tool(ToolKey::ContinuousClaude).unwrap().output;
        assert!(out.contains("failing"));
        assert!(out.ends_with("Process exited with code 4"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn completion_does_not_clobber_a_stopped_entry() {
        let dir = temp_dir_for("runner-stopped");
        let store = StateStore::new(dir.join("state.json"));
        let runner = ProcessRunner::new(store.clone(), dir.join("logs"), 1000);

        let p = runner
            .spawn(sh(
                ToolKey::ContinuousClaude,
                "sleep 0.2; exit 1",
                ExitReport::Outcome {
                    success_message: None,
                },
            ))
            .await
            .unwrap();
        store
            .upsert_tool(ToolKey::ContinuousClaude, ToolStatus::Running, "go", Some(p.pid))
            .await;
        let run_id = store.prepend_run("Continuous Claude", "p", RunStatus::Running).await;
        p.detach(Some(run_id));
        store
            .upsert_tool(ToolKey::ContinuousClaude, ToolStatus::Idle, "Stopped by user", None)
            .await;

        let state = wait_until(&store, |s| s.runs[0].status != RunStatus::Running).await;
        assert_eq!(state.runs[0].status, RunStatus::Failed);
        let tool = state.tool(ToolKey::ContinuousClaude).unwrap();
        assert_eq!(tool.status, ToolStatus::Idle);
        assert_eq!(tool.output, "Stopped by user");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawned_child_leads_its_own_session() {
        let dir = temp_dir_for("runner-session");
        let store = StateStore::new(dir.join("state.json"));
        let runner = ProcessRunner::new(store.clone(), dir.join("logs"), 1000);

        let p = runner
            .spawn(sh(ToolKey::Automaker, "sleep 1", ExitReport::Idle))
            .await
            .unwrap();
        let pgid = unsafe { libc::getpgid(p.pid as i32) };
        assert_eq!(pgid, p.pid as i32);
        assert!(crate::probe::is_alive(p.pid));
        assert!(crate::probe::terminate_group(p.pid));
        p.detach(None);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn spawn_failure_leaves_no_log_file() {
        let dir = temp_dir_for("runner-missing");
        let store = StateStore::new(dir.join("state.json"));
        let logs = dir.join("logs");
        let runner = ProcessRunner::new(store, &logs, 1000);

        let mut spec = sh(ToolKey::AutoClaude, "", ExitReport::Idle);
        spec.program = "agentic-definitely-missing-binary".to_string();
        let err = runner.spawn(spec).await.unwrap_err();
        assert!(crate::format_error_chain(&err).contains("agentic-definitely-missing-binary"));
        assert_eq!(std::fs::read_dir(&logs).unwrap().count(), 0);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
