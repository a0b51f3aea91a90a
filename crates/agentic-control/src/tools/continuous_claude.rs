use std::collections::BTreeMap;

use agentic_process::ToolKey;
use agentic_supervisor::{ExitReport, SpawnSpec};
use axum::{Json, extract::State, extract::rejection::JsonRejection};
use serde::Deserialize;

use super::{MessageResponse, StartResponse, launch, required, stop_tool};
use crate::{error::ApiError, state::AppState};

const DEFAULT_MAX_RUNS: u32 = 5;
const STOP_PATTERNS: &[&str] = &["continuous-claude"];

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartRequest {
    pub prompt: Option<String>,
    pub max_runs: Option<i64>,
    pub repo: Option<String>,
    pub owner: Option<String>,
}

fn non_empty(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}

/// `--prompt <p> --max-runs <n> [--owner <o>] [--repo <r>]`.
///
/// `repo` may be given as `owner/name`, which wins over `owner`.
pub fn build_args(prompt: &str, req: &StartRequest) -> Vec<String> {
    let max_runs = req
        .max_runs
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_MAX_RUNS);
    let mut args = vec![
        "--prompt".to_string(),
        prompt.to_string(),
        "--max-runs".to_string(),
        max_runs.to_string(),
    ];

    if let Some(repo) = non_empty(req.repo.as_deref()) {
        let (owner, name) = if repo.contains('/') {
            let mut parts = repo.split('/');
            (parts.next(), parts.next())
        } else {
            (non_empty(req.owner.as_deref()), Some(repo))
        };
        if let Some(owner) = owner.filter(|s| !s.is_empty()) {
            args.push("--owner".to_string());
            args.push(owner.to_string());
        }
        if let Some(name) = name.filter(|s| !s.is_empty()) {
            args.push("--repo".to_string());
            args.push(name.to_string());
        }
    }
    args
}

pub async fn start(
    State(state): State<AppState>,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<StartResponse>, ApiError> {
    let Json(req) = body?;
    let prompt = required("prompt", req.prompt.as_deref(), "Prompt is required")?;

    let cwd = std::env::current_dir()
        .map_err(|e| ApiError::Internal(format!("cannot resolve working directory: {e}")))?;
    let spec = SpawnSpec {
        tool: ToolKey::ContinuousClaude,
        program: state.config.continuous_claude_bin.clone(),
        args: build_args(prompt, &req),
        cwd,
        env: BTreeMap::new(),
        exit_report: ExitReport::Outcome {
            success_message: None,
        },
    };

    let resp = launch(&state, spec, prompt, format!("Started with prompt: {prompt}")).await;
    Ok(Json(resp))
}

pub async fn stop(State(state): State<AppState>) -> Json<MessageResponse> {
    Json(stop_tool(&state, ToolKey::ContinuousClaude, STOP_PATTERNS, None).await)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use agentic_process::ToolStatus;
    use axum::{http::StatusCode, response::IntoResponse};

    use super::*;
    use crate::tools::test_support::*;

    fn req(json: serde_json::Value) -> StartRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn args_default_max_runs_to_five() {
        let r = req(serde_json::json!({ "prompt": "p" }));
        assert_eq!(build_args("p", &r), ["--prompt", "p", "--max-runs", "5"]);

        let r = req(serde_json::json!({ "prompt": "p", "maxRuns": 0 }));
        assert_eq!(build_args("p", &r)[3], "5");
    }

    #[test]
    fn negative_max_runs_falls_back_to_default() {
        let r = req(serde_json::json!({ "prompt": "fix lint", "maxRuns": -1 }));
        assert_eq!(r.max_runs, Some(-1));
        assert_eq!(build_args("fix lint", &r), ["--prompt", "fix lint", "--max-runs", "5"]);
    }

    #[test]
    fn args_split_owner_slash_repo() {
        let r = req(serde_json::json!({ "repo": "acme/widgets", "owner": "ignored", "maxRuns": 3 }));
        assert_eq!(
            build_args("fix lint", &r),
            ["--prompt", "fix lint", "--max-runs", "3", "--owner", "acme", "--repo", "widgets"]
        );
    }

    #[test]
    fn args_use_owner_field_for_bare_repo() {
        let r = req(serde_json::json!({ "repo": "widgets", "owner": "acme" }));
        let args = build_args("p", &r);
        assert_eq!(&args[4..], ["--owner", "acme", "--repo", "widgets"]);

        let r = req(serde_json::json!({ "repo": "widgets" }));
        assert_eq!(&build_args("p", &r)[4..], ["--repo", "widgets"]);

        let r = req(serde_json::json!({ "owner": "acme" }));
        assert_eq!(build_args("p", &r).len(), 4);
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected_without_touching_state() {
        let dir = temp_dir_for("cc-empty");
        let state = app_state(&dir, Arc::new(FakeProbe::default()));

        let err = start(
            State(state.clone()),
            Ok(Json(req(serde_json::json!({ "prompt": "", "maxRuns": 3 })))),
        )
        .await
        .unwrap_err();
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "Prompt is required");

        assert!(!state.store.path().exists());
        assert!(!state.config.log_dir.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_reports_pid_and_log_then_status_shows_running() {
        let dir = temp_dir_for("cc-start");
        let bin = fake_bin(&dir.join("bin"), "fake-cc", "sleep 5");
        let mut config = crate::config::Config::rooted_at(&dir);
        config.continuous_claude_bin = bin.display().to_string();
        let state = AppState::new(config);

        let resp = start(
            State(state.clone()),
            Ok(Json(req(
                serde_json::json!({ "prompt": "fix lint", "maxRuns": 3 }),
            ))),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        let pid = v["pid"].as_u64().unwrap() as u32;
        assert!(v["logFile"].as_str().unwrap().contains("continuous-claude"));

        let doc = crate::status::aggregate(&state.store, state.probe.as_ref(), &[]).await;
        let tool = doc.tool(ToolKey::ContinuousClaude).unwrap();
        assert_eq!(tool.status, ToolStatus::Running);
        assert_eq!(tool.pid, Some(pid));
        assert_eq!(doc.runs[0].prompt, "fix lint");
        assert_eq!(doc.runs[0].tool, "Continuous Claude");

        agentic_supervisor::probe::terminate_group(pid);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn stop_with_nothing_running_still_succeeds() {
        let dir = temp_dir_for("cc-stop");
        let probe = Arc::new(FakeProbe::default());
        let state = app_state(&dir, probe.clone());

        let resp = stop(State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["message"], "Continuous Claude stopped");
        assert_eq!(
            state.store.load().await.tool(ToolKey::ContinuousClaude).unwrap().status,
            ToolStatus::Idle
        );
        assert_eq!(*probe.killed_patterns.lock().unwrap(), ["continuous-claude"]);
        assert!(probe.terminated.lock().unwrap().is_empty());
        assert!(probe.freed_ports.lock().unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
