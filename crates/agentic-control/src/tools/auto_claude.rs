use std::{collections::BTreeMap, path::PathBuf};

use agentic_process::ToolKey;
use agentic_supervisor::{ExitReport, SpawnSpec};
use axum::{Json, extract::State, extract::rejection::JsonRejection};
use serde::Deserialize;

use super::{MessageResponse, StartResponse, ensure_dir, launch, required, stop_tool};
use crate::{error::ApiError, state::AppState};

const SPEC_RUNNER: &str = "spec_runner.py";
const STOP_PATTERNS: &[&str] = &["python.*spec_runner.py", "python.*run.py"];
const COMPLEXITY_TIERS: &[&str] = &["simple", "standard", "complex"];

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartRequest {
    pub task: Option<String>,
    pub project_dir: Option<String>,
    pub complexity: Option<String>,
}

fn parse_complexity(raw: Option<&str>) -> Result<Option<&str>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(c) if COMPLEXITY_TIERS.contains(&c) => Ok(Some(c)),
        Some(c) => Err(ApiError::validation(
            "complexity",
            format!("Complexity must be one of simple, standard, complex (got {c:?})"),
        )),
    }
}

/// `spec_runner.py --task <t> [--complexity <tier>]`.
pub fn build_args(task: &str, complexity: Option<&str>) -> Vec<String> {
    let mut args = vec![SPEC_RUNNER.to_string(), "--task".to_string(), task.to_string()];
    if let Some(c) = complexity {
        args.push("--complexity".to_string());
        args.push(c.to_string());
    }
    args
}

pub async fn start(
    State(state): State<AppState>,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<StartResponse>, ApiError> {
    let Json(req) = body?;
    let task = required("task", req.task.as_deref(), "Task description is required")?;
    let complexity = parse_complexity(req.complexity.as_deref())?;

    let backend_dir = state.config.auto_claude_backend_dir();
    ensure_dir(
        &backend_dir,
        "Auto-Claude backend not found. Run setup first.",
        "Clone Auto-Claude into the tools root and install its backend",
    )
    .await?;

    let project_dir = match req.project_dir.as_deref().map(str::trim) {
        Some(p) if !p.is_empty() => PathBuf::from(p),
        _ => std::env::current_dir()
            .map_err(|e| ApiError::Internal(format!("cannot resolve working directory: {e}")))?,
    };
    let mut env = BTreeMap::new();
    env.insert(
        "PROJECT_DIR".to_string(),
        project_dir.display().to_string(),
    );

    let spec = SpawnSpec {
        tool: ToolKey::AutoClaude,
        program: state.config.python_bin.clone(),
        args: build_args(task, complexity),
        cwd: backend_dir,
        env,
        exit_report: ExitReport::Outcome {
            success_message: Some("Spec created successfully".to_string()),
        },
    };

    let resp = launch(&state, spec, task, format!("Creating spec for: {task}")).await;
    Ok(Json(resp))
}

pub async fn stop(State(state): State<AppState>) -> Json<MessageResponse> {
    Json(stop_tool(&state, ToolKey::AutoClaude, STOP_PATTERNS, None).await)
}
