use std::collections::BTreeMap;

use agentic_process::ToolKey;
use agentic_supervisor::{ExitReport, ProcessProbe, SpawnSpec};
use axum::{Json, extract::State, extract::rejection::JsonRejection};
use serde::Deserialize;

use super::{MessageResponse, StartResponse, ensure_dir, launch, stop_tool};
use crate::{error::ApiError, state::AppState};

/// Command lines of a running web dev server, whoever started it.
pub(crate) const PROBE_PATTERNS: &[&str] = &["automaker.*dev:web", "npm.*dev:web.*automaker"];
const STOP_PATTERNS: &[&str] = &["automaker.*dev", "npm.*run.*dev.*automaker"];
const RUN_PROMPT: &str = "dev:web server";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StartRequest {
    pub action: Option<String>,
}

/// First pid of a server matching any of `patterns`.
pub(crate) async fn running_server(probe: &dyn ProcessProbe, patterns: &[&str]) -> Option<u32> {
    for pattern in patterns {
        if let Some(pid) = probe.find_pids(pattern).await.into_iter().next() {
            return Some(pid);
        }
    }
    None
}

pub async fn start(
    State(state): State<AppState>,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<StartResponse>, ApiError> {
    let Json(req) = body?;
    if req.action.as_deref().map(str::trim) != Some("start") {
        return Err(ApiError::validation("action", "Invalid action"));
    }

    if let Some(pid) = running_server(state.probe.as_ref(), PROBE_PATTERNS).await {
        tracing::info!(pid, "automaker already running; not spawning another");
        return Ok(Json(StartResponse {
            message: "Automaker is already running".to_string(),
            pid: Some(pid),
            url: Some(state.config.automaker_url()),
            ..StartResponse::default()
        }));
    }

    let dir = state.config.automaker_dir();
    ensure_dir(
        &dir,
        "Automaker not found. Run setup first.",
        "Clone automaker into the tools root and run npm install",
    )
    .await?;

    let url = state.config.automaker_url();
    let mut env = BTreeMap::new();
    env.insert("PORT".to_string(), state.config.automaker_port.to_string());
    let spec = SpawnSpec {
        tool: ToolKey::Automaker,
        program: state.config.npm_bin.clone(),
        args: vec!["run".to_string(), "dev:web".to_string()],
        cwd: dir,
        env,
        exit_report: ExitReport::Idle,
    };

    let mut resp = launch(&state, spec, RUN_PROMPT, format!("Server starting on {url}")).await;
    if resp.error.is_none() {
        resp.message = format!("Automaker started on {url}");
        resp.url = Some(url);
    }
    Ok(Json(resp))
}

pub async fn stop(State(state): State<AppState>) -> Json<MessageResponse> {
    let port = state.config.automaker_port;
    Json(stop_tool(&state, ToolKey::Automaker, STOP_PATTERNS, Some(port)).await)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use agentic_process::ToolStatus;
    use axum::{http::StatusCode, response::IntoResponse};

    use super::*;
    use crate::tools::test_support::*;

    fn req(action: &str) -> StartRequest {
        StartRequest {
            action: Some(action.to_string()),
        }
    }

    #[tokio::test]
    async fn only_start_is_accepted() {
        let dir = temp_dir_for("am-action");
        let state = app_state(&dir, Arc::new(FakeProbe::default()));

        let err = start(State(state.clone()), Ok(Json(req("restart"))))
            .await
            .unwrap_err();
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "Invalid action");

        let err = start(State(state.clone()), Ok(Json(StartRequest::default())))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn existing_server_is_reported_instead_of_spawning() {
        let dir = temp_dir_for("am-running");
        let probe = Arc::new(FakeProbe::default());
        probe.set_match("npm.*dev:web.*automaker", &[4242]);
        let state = app_state(&dir, probe);

        let resp = start(State(state.clone()), Ok(Json(req("start"))))
            .await
            .unwrap()
            .0;
        assert_eq!(resp.message, "Automaker is already running");
        assert_eq!(resp.pid, Some(4242));
        assert!(resp.log_file.is_none());
        assert!(!state.config.log_dir.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn missing_checkout_is_a_precondition_failure() {
        let dir = temp_dir_for("am-missing");
        let state = app_state(&dir, Arc::new(FakeProbe::default()));

        let err = start(State(state.clone()), Ok(Json(req("start"))))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!state.store.path().exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn server_exit_returns_tool_to_idle() {
        let dir = temp_dir_for("am-exit");
        let bin = fake_bin(&dir.join("bin"), "npm", "echo \"port=$PORT $*\"; exit 3");
        let mut config = crate::config::Config::rooted_at(&dir);
        config.npm_bin = bin.display().to_string();
        std::fs::create_dir_all(config.automaker_dir()).unwrap();
        let state = AppState::with_probe(config, Arc::new(FakeProbe::default()));

        let resp = start(State(state.clone()), Ok(Json(req("start"))))
            .await
            .unwrap()
            .0;
        assert_eq!(resp.message, "Automaker started on http://localhost:3007");
        assert_eq!(resp.url.as_deref(), Some("http://localhost:3007"));
        assert!(resp.pid.is_some());

        let mut idle = None;
        for _ in 0..200 {
            let doc = state.store.load().await;
            let t = doc.tool(ToolKey::Automaker).unwrap().clone();
            if t.status == ToolStatus::Idle {
                idle = Some(doc);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        let doc = idle.expect("server exit recorded");
        let tool = doc.tool(ToolKey::Automaker).unwrap();
        assert_eq!(tool.output, "Process exited with code 3");
        assert_eq!(tool.pid, None);
        assert_eq!(doc.runs[0].prompt, RUN_PROMPT);
        assert!(doc.runs[0].output.contains("port=3007 run dev:web"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn running_server_checks_patterns_in_order() {
        let probe = FakeProbe::default();
        assert_eq!(running_server(&probe, PROBE_PATTERNS).await, None);
        probe.set_match("automaker.*dev:web", &[7, 8]);
        probe.set_match("npm.*dev:web.*automaker", &[9]);
        assert_eq!(running_server(&probe, PROBE_PATTERNS).await, Some(7));
    }

    #[tokio::test]
    async fn stop_kills_dev_server_patterns_and_frees_port() {
        let dir = temp_dir_for("am-stop");
        let probe = Arc::new(FakeProbe::default());
        let state = app_state(&dir, probe.clone());

        let resp = stop(State(state.clone())).await.0;
        assert_eq!(resp.message, "Automaker stopped");
        assert_eq!(*probe.killed_patterns.lock().unwrap(), STOP_PATTERNS);
        assert_eq!(*probe.freed_ports.lock().unwrap(), [3007]);
        let tool = state.store.load().await.tool(ToolKey::Automaker).unwrap().clone();
        assert_eq!(tool.status, ToolStatus::Idle);
        assert_eq!(tool.output, "Stopped by user");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
