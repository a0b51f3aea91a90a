use agentic_supervisor::format_error_chain;
use axum::{Json, extract::State};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub claude_version: String,
    pub node_version: String,
    pub python_version: String,
}

impl SystemInfo {
    fn all(v: &str) -> Self {
        Self {
            claude_version: v.to_string(),
            node_version: v.to_string(),
            python_version: v.to_string(),
        }
    }
}

fn python_version(stdout: &str) -> String {
    let v = stdout.trim();
    v.strip_prefix("Python ").unwrap_or(v).to_string()
}

/// Versions of the host runtimes. Any failing probe reports `error` for all.
pub async fn get_system(State(state): State<AppState>) -> Json<SystemInfo> {
    let sh = state.config.local_shell();
    let (claude, node, python) = tokio::join!(
        sh.run_checked("claude --version 2>/dev/null || echo \"not installed\""),
        sh.run_checked("node --version"),
        sh.run_checked("python3 --version"),
    );

    let info = match (claude, node, python) {
        (Ok(claude), Ok(node), Ok(python)) => SystemInfo {
            claude_version: claude.stdout.trim().to_string(),
            node_version: node.stdout.trim().to_string(),
            python_version: python_version(&python.stdout),
        },
        (claude, node, python) => {
            for e in [claude.err(), node.err(), python.err()].into_iter().flatten() {
                tracing::warn!(error = %format_error_chain(&e), "system probe failed");
            }
            SystemInfo::all("error")
        }
    };
    Json(info)
}
