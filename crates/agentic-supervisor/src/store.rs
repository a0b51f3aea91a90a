use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use agentic_process::{DashboardState, RunStatus, ToolKey, ToolState, ToolStatus};
use chrono::Utc;
use tokio::{io::AsyncWriteExt, sync::Mutex};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state file {op} failed ({path}): {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file is not a dashboard document: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug)]
struct StoreInner {
    path: PathBuf,
    // Serializes read-modify-write cycles issued from this process. Other
    // processes writing the same file stay last-writer-wins.
    write_lock: Mutex<()>,
}

/// Whole-document JSON store for tool status and run history.
///
/// Reads never fail: a missing or corrupt file yields the default document.
/// Write failures are logged and swallowed by the mutating helpers because a
/// started process matters more than its bookkeeping.
#[derive(Debug, Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                path: path.into(),
                write_lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub async fn load(&self) -> DashboardState {
        match self.try_load().await {
            Ok(state) => state,
            Err(StoreError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                DashboardState::default()
            }
            Err(e) => {
                tracing::warn!(error = %e, "state file unreadable; starting fresh");
                DashboardState::default()
            }
        }
    }

    async fn try_load(&self) -> Result<DashboardState, StoreError> {
        let path = self.path();
        let data = tokio::fs::read(path).await.map_err(|source| StoreError::Io {
            op: "read",
            path: path.to_path_buf(),
            source,
        })?;
        let mut state: DashboardState = serde_json::from_slice(&data)?;
        // Documents written by older versions may lack some tools.
        for key in ToolKey::ALL {
            state
                .tools
                .entry(key.as_str().to_string())
                .or_insert_with(|| ToolState::idle(key));
        }
        Ok(state)
    }

    /// Overwrites the backing file with `state`.
    pub async fn save(&self, state: &DashboardState) -> Result<(), StoreError> {
        let path = self.path();
        let io_err = |op: &'static str, p: &Path| {
            let p = p.to_path_buf();
            move |source| StoreError::Io {
                op,
                path: p,
                source,
            }
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_err("create dir", parent))?;
        }

        let data = serde_json::to_vec_pretty(state)?;
        let tmp = PathBuf::from(format!("{}.{}.tmp", path.display(), std::process::id()));
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .map_err(io_err("create", &tmp))?;
        f.write_all(&data).await.map_err(io_err("write", &tmp))?;
        f.flush().await.ok();
        drop(f);
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(io_err("rename", path))?;
        Ok(())
    }

    /// Loads, applies `f`, and writes back. A failed write is logged only.
    pub async fn update<R>(&self, f: impl FnOnce(&mut DashboardState) -> R) -> R {
        let _guard = self.inner.write_lock.lock().await;
        let mut state = self.load().await;
        let out = f(&mut state);
        if let Err(e) = self.save(&state).await {
            tracing::warn!(error = %e, "failed to persist dashboard state");
        }
        out
    }

    /// Replaces the tool's entry wholesale.
    pub async fn upsert_tool(
        &self,
        key: ToolKey,
        status: ToolStatus,
        output: impl Into<String>,
        pid: Option<u32>,
    ) {
        let output = output.into();
        self.update(|s| s.set_tool(key, status, output, pid)).await;
    }

    /// Inserts a run at the head of the history and returns its id.
    pub async fn prepend_run(&self, tool: &str, prompt: &str, status: RunStatus) -> String {
        self.update(|s| s.prepend_run(tool, prompt, status, Utc::now()))
            .await
    }

    pub async fn finish_run(&self, id: &str, status: RunStatus, output: impl Into<String>) {
        let output = output.into();
        self.update(|s| {
            if !s.finish_run(id, status, output) {
                tracing::debug!(run_id = id, "run aged out before completion");
            }
        })
        .await;
    }
}
