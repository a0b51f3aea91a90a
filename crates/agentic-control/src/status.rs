use agentic_process::{DashboardState, ToolKey, ToolStatus};
use agentic_supervisor::{ProcessProbe, StateStore};
use axum::{Json, extract::State};

use crate::{state::AppState, tools::automaker};

const COMPLETED: &str = "Process completed";

/// Loads the document and reconciles it against the process table.
///
/// The adjusted view is returned only; nothing is written back.
pub async fn aggregate(
    store: &StateStore,
    probe: &dyn ProcessProbe,
    server_patterns: &[&str],
) -> DashboardState {
    let mut doc = store.load().await;

    for tool in doc.tools.values_mut() {
        if tool.status != ToolStatus::Running {
            continue;
        }
        if let Some(pid) = tool.pid
            && !probe.is_alive(pid)
        {
            tracing::debug!(tool = %tool.name, pid, "recorded pid is gone; reporting idle");
            tool.status = ToolStatus::Idle;
            tool.output = COMPLETED.to_string();
            tool.pid = None;
        }
    }

    // The task-board server may have been started by hand.
    if let Some(pid) = automaker::running_server(probe, server_patterns).await {
        let current = doc.tool(ToolKey::Automaker).cloned();
        let output = match current {
            Some(t) if t.status == ToolStatus::Running && !t.output.is_empty() => t.output,
            _ => "Server running".to_string(),
        };
        doc.set_tool(ToolKey::Automaker, ToolStatus::Running, output, Some(pid));
    }

    doc
}

pub async fn get_status(State(state): State<AppState>) -> Json<DashboardState> {
    Json(aggregate(&state.store, state.probe.as_ref(), automaker::PROBE_PATTERNS).await)
}
