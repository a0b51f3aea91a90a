//! Environment health checks and NTM (tmux-backed multi-agent) sessions.
//!
//! Everything here runs synchronously inside the request through the
//! configured user's shell, with the configured timeout.

use std::{collections::BTreeMap, str::FromStr};

use agentic_process::{ToolKey, ToolStatus};
use agentic_supervisor::{
    format_error_chain,
    shell::{self, ScriptEnv},
};
use axum::{
    Json,
    extract::{Query, State, rejection::JsonRejection},
};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use super::MessageResponse;
use crate::{error::ApiError, state::AppState};

pub const ACFS_VERSION: &str = "0.1.0";
const SESSION_NAME_MAX: usize = 64;

/// `(name, version command)` pairs reported by the environment GET.
const TOOL_CHECKS: &[(&str, &str)] = &[
    ("bun", "bun --version"),
    ("cargo", "cargo --version"),
    ("go", "go version"),
    ("uv", "uv --version"),
    ("claude", "claude --version"),
    ("ntm", "ntm --version 2>/dev/null || echo installed"),
    ("bat", "bat --version"),
    ("rg", "rg --version"),
    ("fd", "fd --version"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCheck {
    pub version: String,
    pub installed: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentStatus {
    pub tools: BTreeMap<String, ToolCheck>,
    pub ntm_sessions: Vec<String>,
    pub acfs_version: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvAction {
    Doctor,
    NtmSpawn,
    NtmAttach,
    NtmKill,
    Onboard,
}

impl FromStr for EnvAction {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "doctor" => Ok(EnvAction::Doctor),
            "ntm-spawn" => Ok(EnvAction::NtmSpawn),
            "ntm-attach" => Ok(EnvAction::NtmAttach),
            "ntm-kill" => Ok(EnvAction::NtmKill),
            "onboard" => Ok(EnvAction::Onboard),
            other => Err(ApiError::UnknownAction(other.to_string())),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AgentCounts {
    pub claude: Option<i64>,
    pub codex: Option<i64>,
}

/// Positive counts only; anything else counts as "not asked for".
fn positive(n: Option<i64>) -> Option<u32> {
    n.and_then(|n| u32::try_from(n).ok()).filter(|n| *n > 0)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionRequest {
    pub action: Option<String>,
    pub session_name: Option<String>,
    pub agents: Option<AgentCounts>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct KillQuery {
    pub session: Option<String>,
}

/// Session names end up inside shell commands, so only a conservative
/// character set gets through.
pub fn validate_session_name(raw: &str) -> Result<&str, ApiError> {
    let name = raw.trim();
    let ok = !name.is_empty()
        && name.len() <= SESSION_NAME_MAX
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(name)
    } else {
        Err(ApiError::validation(
            "sessionName",
            format!(
                "Invalid session name {name:?}: use 1-{SESSION_NAME_MAX} letters, digits, '.', '_' or '-'"
            ),
        ))
    }
}

/// `ntm spawn <name> --cc=<n>`, plus `--cod=<n>` only when codex agents
/// were asked for.
pub fn ntm_spawn_command(name: &str, claude: u32, codex: u32) -> String {
    let mut cmd = format!("ntm spawn {name} --cc={claude}");
    if codex > 0 {
        cmd.push_str(&format!(" --cod={codex}"));
    }
    cmd
}

fn parse_sessions(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

async fn check_tool(sh: &ScriptEnv, name: &'static str, cmd: &str) -> (String, ToolCheck) {
    let check = match sh.run(cmd).await {
        Ok(out) if out.success() => ToolCheck {
            version: shell::first_line(&out.stdout).to_string(),
            installed: true,
        },
        _ => ToolCheck {
            version: "not found".to_string(),
            installed: false,
        },
    };
    (name.to_string(), check)
}

pub async fn status(State(state): State<AppState>) -> Json<EnvironmentStatus> {
    let sh = state.config.user_shell();
    let checks = join_all(
        TOOL_CHECKS
            .iter()
            .map(|&(name, cmd)| check_tool(&sh, name, cmd)),
    );
    let sessions = sh.run("tmux list-sessions -F \"#{session_name}\" 2>/dev/null || echo \"\"");
    let (tools, sessions) = tokio::join!(checks, sessions);

    let ntm_sessions = match sessions {
        Ok(out) => parse_sessions(&out.stdout),
        Err(e) => {
            tracing::debug!(error = %format_error_chain(&e), "tmux session listing failed");
            Vec::new()
        }
    };

    Json(EnvironmentStatus {
        tools: tools.into_iter().collect(),
        ntm_sessions,
        acfs_version: ACFS_VERSION,
    })
}

pub async fn action(
    State(state): State<AppState>,
    body: Result<Json<ActionRequest>, JsonRejection>,
) -> Result<Json<ActionResponse>, ApiError> {
    let Json(req) = body?;
    let action: EnvAction = req.action.as_deref().unwrap_or_default().trim().parse()?;
    tracing::info!(?action, "environment action");

    let resp = match action {
        EnvAction::Doctor => doctor(&state).await,
        EnvAction::NtmSpawn => ntm_spawn(&state, &req).await?,
        EnvAction::NtmAttach => {
            let name = required_session(req.session_name.as_deref())?;
            ActionResponse {
                success: true,
                message: Some(format!(
                    "To attach, run: ssh {} -t \"tmux attach -t {name}\"",
                    state.config.ssh_target()
                )),
                command: Some(format!("tmux attach -t {name}")),
                ..ActionResponse::default()
            }
        }
        EnvAction::NtmKill => {
            let name = required_session(req.session_name.as_deref())?;
            match kill_tmux_session(&state, name).await {
                Ok(()) => ActionResponse {
                    success: true,
                    message: Some(format!("Session \"{name}\" killed")),
                    ..ActionResponse::default()
                },
                Err(e) => ActionResponse {
                    success: false,
                    error: Some(format_error_chain(&e)),
                    ..ActionResponse::default()
                },
            }
        }
        EnvAction::Onboard => onboard(&state).await,
    };
    Ok(Json(resp))
}

/// DELETE `?session=<name>`.
pub async fn kill_session(
    State(state): State<AppState>,
    Query(q): Query<KillQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    let Some(raw) = q.session.as_deref().filter(|s| !s.trim().is_empty()) else {
        return Err(ApiError::validation("session", "No session specified"));
    };
    let name = validate_session_name(raw)?;
    kill_tmux_session(&state, name).await.map_err(|e| {
        tracing::warn!(session = name, error = %format_error_chain(&e), "tmux kill-session failed");
        ApiError::Internal("Failed to kill session".to_string())
    })?;
    Ok(Json(MessageResponse {
        message: format!("Session \"{name}\" killed"),
    }))
}

fn required_session(raw: Option<&str>) -> Result<&str, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(name) => validate_session_name(name),
        None => Err(ApiError::validation("sessionName", "Session name is required")),
    }
}

async fn kill_tmux_session(state: &AppState, name: &str) -> anyhow::Result<()> {
    state
        .config
        .user_shell()
        .run_checked(&format!("tmux kill-session -t {}", shell::quote(name)))
        .await?;
    Ok(())
}

async fn doctor(state: &AppState) -> ActionResponse {
    match state.config.user_shell().run("acfs doctor 2>&1").await {
        Ok(out) if out.success() => ActionResponse {
            success: true,
            output: Some(out.combined().to_string()),
            message: Some("ACFS doctor completed".to_string()),
            ..ActionResponse::default()
        },
        Ok(out) => {
            let output = out.combined();
            ActionResponse {
                success: false,
                output: Some(if output.trim().is_empty() {
                    "Unknown error".to_string()
                } else {
                    output.to_string()
                }),
                error: Some("Doctor check failed".to_string()),
                ..ActionResponse::default()
            }
        }
        Err(e) => ActionResponse {
            success: false,
            output: Some(format_error_chain(&e)),
            error: Some("Doctor check failed".to_string()),
            ..ActionResponse::default()
        },
    }
}

async fn ntm_spawn(state: &AppState, req: &ActionRequest) -> Result<ActionResponse, ApiError> {
    let name = match req.session_name.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => validate_session_name(raw)?.to_string(),
        _ => format!("session-{}", chrono::Utc::now().timestamp_millis()),
    };
    let counts = req.agents.as_ref();
    let claude = positive(counts.and_then(|a| a.claude)).unwrap_or(1);
    let codex = positive(counts.and_then(|a| a.codex)).unwrap_or(0);

    let sh = state.config.user_shell();
    let project_dir = state.config.project_dir(&name);
    let spawned: anyhow::Result<shell::CommandOutput> = async {
        sh.run_checked(&format!(
            "mkdir -p {}",
            shell::quote(&project_dir.display().to_string())
        ))
        .await?;
        sh.run_checked(&ntm_spawn_command(&name, claude, codex)).await
    }
    .await;

    match spawned {
        Ok(out) => {
            state
                .store
                .upsert_tool(
                    ToolKey::Acfs,
                    ToolStatus::Running,
                    format!("NTM session \"{name}\" spawned"),
                    None,
                )
                .await;
            Ok(ActionResponse {
                success: true,
                message: Some(format!("NTM session \"{name}\" created")),
                output: Some(out.stdout),
                session_name: Some(name),
                ..ActionResponse::default()
            })
        }
        Err(e) => {
            let error = format_error_chain(&e);
            tracing::warn!(session = %name, error = %error, "ntm spawn failed");
            Ok(ActionResponse {
                success: false,
                error: Some(error),
                ..ActionResponse::default()
            })
        }
    }
}

async fn onboard(state: &AppState) -> ActionResponse {
    let target = state.config.ssh_target();
    let script = format!(
        "cat ~/.acfs/onboard/00_welcome.md 2>/dev/null || echo \"Run: ssh {target} then: onboard\""
    );
    match state.config.user_shell().run(&script).await {
        Ok(out) => ActionResponse {
            success: true,
            output: Some(out.stdout),
            message: Some(format!(
                "To run onboard interactively: ssh {target} then run \"onboard\""
            )),
            ..ActionResponse::default()
        },
        Err(_) => ActionResponse {
            success: true,
            message: Some(format!("To run onboard: ssh {target} then run \"onboard\"")),
            ..ActionResponse::default()
        },
    }
}
