//! Adapters for the supervised tools. Each turns a start/stop request into a
//! concrete command line and keeps the state document in step with it.

pub mod acfs;
pub mod auto_claude;
pub mod automaker;
pub mod continuous_claude;

use std::path::Path;

use agentic_process::{RunStatus, ToolKey, ToolStatus, tail_chars};
use agentic_supervisor::{SpawnSpec, format_error_chain};
use serde::Serialize;

use crate::{error::ApiError, state::AppState};

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

pub(crate) fn required<'a>(
    field: &'static str,
    value: Option<&'a str>,
    message: &str,
) -> Result<&'a str, ApiError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ApiError::validation(field, message)),
    }
}

pub(crate) async fn ensure_dir(path: &Path, message: &str, hint: &str) -> Result<(), ApiError> {
    match tokio::fs::metadata(path).await {
        Ok(m) if m.is_dir() => Ok(()),
        _ => Err(ApiError::precondition(
            message,
            format!("{hint} (expected {})", path.display()),
        )),
    }
}

/// Spawns `spec`, records it as running, appends a run and hands the child
/// to its completion task. A spawn failure is reported in the body (HTTP 200)
/// and recorded as an `error` status; only the background work failed.
pub(crate) async fn launch(
    state: &AppState,
    spec: SpawnSpec,
    prompt: &str,
    running_message: String,
) -> StartResponse {
    let key = spec.tool;
    let name = key.display_name();

    match state.runner.spawn(spec).await {
        Ok(child) => {
            let pid = child.pid;
            let log_file = child.log_file.display().to_string();
            state
                .store
                .upsert_tool(key, ToolStatus::Running, running_message, Some(pid))
                .await;
            let run_id = state
                .store
                .prepend_run(name, prompt, RunStatus::Running)
                .await;
            child.detach(Some(run_id));

            StartResponse {
                message: format!("{name} started with PID {pid}"),
                pid: Some(pid),
                log_file: Some(log_file),
                ..StartResponse::default()
            }
        }
        Err(e) => {
            let error = format_error_chain(&e);
            tracing::warn!(tool = %key, error = %error, "failed to start tool");
            let output = tail_chars(&error, state.config.output_tail_chars).to_string();
            state
                .store
                .upsert_tool(key, ToolStatus::Error, output.clone(), None)
                .await;
            let run_id = state.store.prepend_run(name, prompt, RunStatus::Failed).await;
            state
                .store
                .finish_run(&run_id, RunStatus::Failed, output)
                .await;

            StartResponse {
                message: format!("{name} failed to start"),
                error: Some(error),
                ..StartResponse::default()
            }
        }
    }
}

/// Best-effort stop. Always ends with the tool recorded as idle.
///
/// The recorded pid is signalled whether or not it still looks alive; a
/// vanished group just makes the signal a no-op.
pub(crate) async fn stop_tool(
    state: &AppState,
    key: ToolKey,
    patterns: &[&str],
    port: Option<u16>,
) -> MessageResponse {
    let recorded = state.store.load().await.tool(key).and_then(|t| t.pid);
    if let Some(pid) = recorded {
        let sent = state.probe.terminate_group(pid);
        tracing::info!(tool = %key, pid, sent, "sent SIGTERM to process group");
    }

    for pattern in patterns {
        state.probe.kill_matching(pattern).await;
    }
    if let Some(port) = port {
        state.probe.free_port(port).await;
    }

    state
        .store
        .upsert_tool(key, ToolStatus::Idle, "Stopped by user", None)
        .await;

    MessageResponse {
        message: format!("{} stopped", key.display_name()),
    }
}
